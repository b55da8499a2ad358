//! Property tests for the ranges the executor hands out.

use std::sync::Arc;

use keysweep::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;

fn executed_ranges(total: u64, devices: usize, workgroup: u64, multiplier: u32) -> Vec<TaskRange> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    runtime.block_on(async move {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let callbacks = CallbackSet::builder()
            .get_code(|_| Some(b"kernel void sweep() {}".to_vec()))
            .get_num_tasks(move |_| total)
            .get_task_range_multiplier(move |_| multiplier)
            .on_device_range_exec(move |_, _, _, range| {
                recorder.lock().push(range);
                Ok(DeviceEvent::completed("sync"))
            })
            .build()
            .expect("valid callback set");

        let mut sweep = Keysweep::builder()
            .cpu_config(
                CpuConfig::default()
                    .with_devices(devices)
                    .with_geometry(workgroup, 1),
            )
            .build()
            .await
            .expect("init");
        sweep.setup(callbacks).await.expect("setup");
        sweep.run(None).await.expect("run");
        sweep.destroy().await.expect("destroy");

        let ranges = seen.lock().clone();
        ranges
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn ranges_tile_the_task_interval(
        total in 1u64..5_000,
        devices in 1usize..5,
        workgroup in 1u64..64,
        multiplier in 1u32..4,
    ) {
        let ranges = executed_ranges(total, devices, workgroup, multiplier);
        let chunk = workgroup * devices as u64 * u64::from(multiplier);

        let mut next = 0;
        for range in &ranges {
            prop_assert_eq!(range.start, next);
            prop_assert!(!range.is_empty());
            prop_assert!(range.len() <= chunk);
            next = range.end;
        }
        prop_assert_eq!(next, total);

        // Only the final range may be short.
        for range in ranges.iter().rev().skip(1) {
            prop_assert_eq!(range.len(), chunk);
        }
    }
}
