//! Integration tests for the run path on the CPU backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keysweep::prelude::*;
use parking_lot::Mutex;

/// Everything the hooks saw during a run.
#[derive(Default)]
struct Trace {
    calls: Mutex<Vec<&'static str>>,
    done: Mutex<Vec<(usize, TaskRange)>>,
    progress: Mutex<Vec<f32>>,
    tasks_run: AtomicU64,
}

impl Trace {
    fn record(&self, name: &'static str) {
        self.calls.lock().push(name);
    }

    fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == name).count()
    }

    fn ranges(&self) -> Vec<(u64, u64)> {
        self.done.lock().iter().map(|(_, r)| (r.start, r.end)).collect()
    }
}

/// A callback set with every hook recording into `trace`.
///
/// Tests override individual hooks by setting them again.
fn traced(trace: &Arc<Trace>, total: u64) -> CallbackSetBuilder {
    let builder = CallbackSet::builder();

    let t = Arc::clone(trace);
    let builder = builder.on_start(move |_| {
        t.record("on_start");
        Ok(())
    });
    let t = Arc::clone(trace);
    let builder = builder.get_code(move |_| {
        t.record("get_code");
        Some(b"kernel void sweep(ulong start, ulong end) {}".to_vec())
    });
    let t = Arc::clone(trace);
    let builder = builder.get_build_options(move |_| {
        t.record("get_build_options");
        Some("-DCHARSET=62".to_string())
    });
    let t = Arc::clone(trace);
    let builder = builder.on_code_compile(move |_, ok| {
        t.record(if ok { "compiled" } else { "compile_failed" });
    });
    let t = Arc::clone(trace);
    let builder = builder.get_num_tasks(move |_| {
        t.record("get_num_tasks");
        total
    });
    let t = Arc::clone(trace);
    let builder = builder.on_device_start(move |_, _, _| {
        t.record("on_device_start");
        Ok(())
    });
    let t = Arc::clone(trace);
    let builder = builder.on_device_range_exec(move |_, device, _, range| {
        t.record("exec");
        let t = Arc::clone(&t);
        device.queue().submit(
            "sweep",
            Box::new(move || {
                t.tasks_run.fetch_add(range.len(), Ordering::SeqCst);
                Ok(())
            }),
        )
    });
    let t = Arc::clone(trace);
    let builder = builder.on_device_range_done(move |_, device, _, range| {
        t.done.lock().push((device.index(), range));
        Ok(Control::Continue)
    });
    let t = Arc::clone(trace);
    let builder = builder.on_device_finish(move |_, _, _| {
        t.record("on_device_finish");
        Ok(())
    });
    let t = Arc::clone(trace);
    let builder = builder.on_finish(move |_| {
        t.record("on_finish");
        Ok(())
    });
    let t = Arc::clone(trace);
    builder.progress(move |pct| t.progress.lock().push(pct))
}

/// Executor on `devices` CPU devices with capacity `workgroup_size` each.
async fn sweep(devices: usize, workgroup_size: u64) -> Keysweep {
    Keysweep::builder()
        .cpu_config(
            CpuConfig::default()
                .with_devices(devices)
                .with_geometry(workgroup_size, 1),
        )
        .build()
        .await
        .expect("init")
}

/// Test the single-device scenario: 1000 tasks in chunks of 300.
#[tokio::test]
async fn test_single_device_ranges_and_progress() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 300).await;
    sweep.setup(traced(&trace, 1000).build().unwrap()).await.unwrap();

    let outcome = sweep.run(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    assert_eq!(
        trace.ranges(),
        vec![(0, 300), (300, 600), (600, 900), (900, 1000)]
    );
    assert_eq!(*trace.progress.lock(), vec![30.0, 60.0, 90.0, 100.0]);
    assert_eq!(trace.tasks_run.load(Ordering::SeqCst), 1000);

    let report = sweep.last_report().unwrap().clone();
    assert_eq!(report.waves, 4);
    assert_eq!(report.tasks_dispatched, 1000);
    assert_eq!(report.outcome, Some(RunOutcome::Completed));
    assert_eq!(report.final_state, RunState::Finished);

    sweep.destroy().await.unwrap();
}

/// Test hook order over one run.
#[tokio::test]
async fn test_hook_order() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(2, 10).await;
    sweep.setup(traced(&trace, 35).build().unwrap()).await.unwrap();
    sweep.run(None).await.unwrap();

    assert_eq!(
        *trace.calls.lock(),
        vec![
            "on_start",
            "get_code",
            "get_build_options",
            "compiled",
            "get_num_tasks",
            "on_device_start",
            "on_device_start",
            "exec",
            "exec",
            "on_device_finish",
            "on_device_finish",
            "on_finish",
        ]
    );
    sweep.destroy().await.unwrap();
}

/// Test that ranges across devices and waves partition the task interval.
#[tokio::test]
async fn test_multi_device_partition() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(3, 1).await;
    let callbacks = traced(&trace, 40)
        .get_task_range_multiplier(|_| 2)
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();
    sweep.run(None).await.unwrap();

    let done = trace.done.lock().clone();
    let devices: Vec<usize> = done.iter().map(|(d, _)| *d).collect();
    assert_eq!(devices, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(
        trace.ranges(),
        vec![
            (0, 6),
            (6, 12),
            (12, 18),
            (18, 24),
            (24, 30),
            (30, 36),
            (36, 40)
        ]
    );
    assert_eq!(trace.tasks_run.load(Ordering::SeqCst), 40);
    assert_eq!(sweep.last_report().unwrap().waves, 3);
    assert_eq!(sweep.executor().snapshot().capacity_per_peer, vec![3]);

    sweep.destroy().await.unwrap();
}

/// Test that zero tasks fails sizing before any dispatch.
#[tokio::test]
async fn test_zero_tasks() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(2, 8).await;
    sweep.setup(traced(&trace, 0).build().unwrap()).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.is_invalid_value());
    assert_eq!(err.stage(), Some(Stage::Sizing));

    assert_eq!(trace.count("exec"), 0);
    assert_eq!(trace.count("on_device_start"), 0);
    assert_eq!(trace.count("on_finish"), 1);
    assert!(trace.progress.lock().is_empty());

    let report = sweep.last_report().unwrap();
    assert_eq!(report.waves, 0);
    assert!(!report.is_ok());

    sweep.destroy().await.unwrap();
}

/// Test that an empty source fails before compilation and still finishes.
#[tokio::test]
async fn test_empty_source() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 8).await;
    let callbacks = traced(&trace, 100)
        .get_code(|_| Some(Vec::new()))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.is_missing_callback());
    assert_eq!(err.stage(), Some(Stage::PreRun));

    assert_eq!(trace.count("compiled"), 0);
    assert_eq!(trace.count("compile_failed"), 0);
    assert_eq!(trace.count("get_num_tasks"), 0);
    assert_eq!(trace.count("on_finish"), 1);

    sweep.destroy().await.unwrap();
}

/// Test that a failing on_start aborts before the source is fetched.
#[tokio::test]
async fn test_on_start_failure() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 8).await;
    let callbacks = traced(&trace, 100)
        .on_start(|_| Err(ExecError::callback("wordlist missing")))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(matches!(err, ExecError::Callback(ref m) if m == "wordlist missing"));
    assert_eq!(trace.count("get_code"), 0);
    assert_eq!(trace.count("on_finish"), 1);

    sweep.destroy().await.unwrap();
}

/// Test that an abort on wave k stops before wave k+1.
#[tokio::test]
async fn test_abort_stops_after_wave() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 300).await;
    let t = Arc::clone(&trace);
    let callbacks = traced(&trace, 1000)
        .on_device_range_done(move |_, device, _, range| {
            t.done.lock().push((device.index(), range));
            if range.start >= 300 {
                Ok(Control::Abort)
            } else {
                Ok(Control::Continue)
            }
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let outcome = sweep.run(None).await.unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);

    assert_eq!(trace.ranges(), vec![(0, 300), (300, 600)]);
    assert_eq!(trace.count("exec"), 2);
    assert_eq!(trace.count("on_device_finish"), 1);
    assert_eq!(trace.count("on_finish"), 1);
    assert_eq!(*trace.progress.lock(), vec![30.0, 60.0]);
    assert_eq!(
        sweep.last_report().unwrap().outcome,
        Some(RunOutcome::Aborted)
    );

    sweep.destroy().await.unwrap();
}

/// Test that a failing range executor stops the run after draining the wave.
#[tokio::test]
async fn test_range_exec_failure() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(2, 10).await;
    let t = Arc::clone(&trace);
    let callbacks = traced(&trace, 100)
        .on_device_range_exec(move |_, device, _, _| {
            t.record("exec");
            if device.index() == 1 {
                return Err(ExecError::callback("kernel launch failed"));
            }
            Ok(DeviceEvent::completed("sync"))
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.to_string().contains("kernel launch failed"));

    // Device 0 was dispatched and still gets its completion call.
    assert_eq!(trace.ranges(), vec![(0, 20)]);
    assert_eq!(trace.count("on_device_finish"), 2);
    assert_eq!(trace.count("on_finish"), 1);
    assert!(trace.progress.lock().is_empty());

    sweep.destroy().await.unwrap();
}

/// Test that a range-completion error becomes a bad-state error.
#[tokio::test]
async fn test_range_done_error() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 10).await;
    let callbacks = traced(&trace, 100)
        .on_device_range_done(|_, _, _, _| Err(ExecError::callback("result table full")))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.is_bad_state());
    assert_eq!(err.stage(), Some(Stage::Dispatch));
    assert!(err.to_string().contains("result table full"));
    assert_eq!(trace.count("exec"), 1);

    sweep.destroy().await.unwrap();
}

/// Test that a device job failure fails the run after its wave completes.
#[tokio::test]
async fn test_device_job_failure() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(2, 10).await;
    let callbacks = traced(&trace, 100)
        .on_device_range_exec(|_, device, _, range| {
            let index = device.index();
            device.queue().submit(
                "sweep",
                Box::new(move || {
                    if index == 1 && range.start == 20 {
                        Err(ExecError::callback("out of device memory"))
                    } else {
                        Ok(())
                    }
                }),
            )
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(matches!(err, ExecError::RuntimeOp { stage: Stage::Dispatch, .. }));
    assert!(err.to_string().contains("out of device memory"));
    // Both devices of the failed wave were reported before failing.
    assert_eq!(trace.ranges(), vec![(0, 20), (20, 40)]);

    sweep.destroy().await.unwrap();
}

/// Test that a failed device start only unwinds the devices already started.
#[tokio::test]
async fn test_device_start_failure_unwinds_partially() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(3, 10).await;
    let t = Arc::clone(&trace);
    let callbacks = traced(&trace, 100)
        .on_device_start(move |_, device, _| {
            t.record("on_device_start");
            if device.index() == 1 {
                Err(ExecError::callback("cannot pin buffers"))
            } else {
                Ok(())
            }
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.to_string().contains("cannot pin buffers"));
    assert_eq!(trace.count("on_device_start"), 2);
    assert_eq!(trace.count("on_device_finish"), 1);
    assert_eq!(trace.count("exec"), 0);
    assert_eq!(trace.count("on_finish"), 1);

    sweep.destroy().await.unwrap();
}

/// Test that on_finish errors are chained to an earlier error.
#[tokio::test]
async fn test_on_finish_error_is_chained() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 10).await;
    let callbacks = traced(&trace, 0)
        .on_finish(|_| Err(ExecError::callback("report not written")))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(err.is_invalid_value());
    assert!(matches!(err, ExecError::Compound { .. }));
    let message = err.to_string();
    assert!(message.contains("task count cannot be 0"));
    assert!(message.contains("report not written"));

    sweep.destroy().await.unwrap();
}

/// Test that an on_finish error alone fails an otherwise good run.
#[tokio::test]
async fn test_on_finish_error_alone() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(1, 10).await;
    let callbacks = traced(&trace, 20)
        .on_finish(|_| Err(ExecError::callback("report not written")))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(matches!(err, ExecError::Callback(_)));
    assert_eq!(trace.ranges(), vec![(0, 10), (10, 20)]);

    sweep.destroy().await.unwrap();
}

/// Test global data flow and release.
#[tokio::test]
async fn test_global_data_and_build_options() {
    let trace = Arc::new(Trace::default());
    let freed = Arc::new(Mutex::new(None));
    let mut sweep = sweep(2, 5).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_exec = Arc::clone(&seen);
    let freed_in_hook = Arc::clone(&freed);
    let callbacks = traced(&trace, 20)
        .get_global_data(|_| Ok(GlobalData::from(b"5f4dcc3b".to_vec())))
        .free_global_data(move |_, data| *freed_in_hook.lock() = Some(data.into_inner()))
        .on_device_range_exec(move |_, device, data, _| {
            let charset = device
                .program()
                .and_then(|p| p.define("CHARSET").map(str::to_string));
            seen_in_exec
                .lock()
                .push((data.map(|d| d.to_vec()), charset));
            Ok(DeviceEvent::completed("sync"))
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();
    sweep.run(None).await.unwrap();

    let expected = (Some(b"5f4dcc3b".to_vec()), Some("62".to_string()));
    assert_eq!(*seen.lock(), vec![expected.clone(), expected]);
    assert_eq!(freed.lock().as_deref(), Some(&b"5f4dcc3b"[..]));
    assert_eq!(
        sweep.snapshot().build_options.as_deref(),
        Some("-DCHARSET=62")
    );

    sweep.destroy().await.unwrap();
}

/// Test that a build failure ends the run in pre-run and still unwinds.
#[tokio::test]
async fn test_compile_failure() {
    let trace = Arc::new(Trace::default());
    let mut sweep = sweep(2, 8).await;
    let callbacks = traced(&trace, 100)
        .get_build_options(|_| Some("-D".to_string()))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(
        matches!(err, ExecError::RuntimeOp { stage: Stage::PreRun, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(trace.count("compile_failed"), 1);
    assert_eq!(trace.count("compiled"), 0);
    assert_eq!(trace.count("get_num_tasks"), 0);
    assert_eq!(trace.count("exec"), 0);
    assert_eq!(trace.count("on_finish"), 1);
    assert!(sweep.executor().runtime_ready());

    sweep.destroy().await.unwrap();
}

/// Test that an unbounded run needs no tokio timer.
#[test]
fn test_unbounded_run_without_time_driver() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime");

    runtime.block_on(async {
        let trace = Arc::new(Trace::default());
        let mut sweep = sweep(2, 16).await;
        sweep.setup(traced(&trace, 100).build().unwrap()).await.unwrap();

        assert_eq!(sweep.run(None).await.unwrap(), RunOutcome::Completed);
        assert_eq!(trace.tasks_run.load(Ordering::SeqCst), 100);

        sweep.destroy().await.unwrap();
    });
}

/// Test that a stuck device times the wave out and still unwinds.
///
/// The event is never completed: teardown must not wait on it.
#[tokio::test]
async fn test_wave_timeout() {
    let trace = Arc::new(Trace::default());
    let provider = Arc::new(CpuProvider::new(
        CpuConfig::default().with_devices(1).with_geometry(10, 1),
    ));
    let mut sweep = Keysweep::builder()
        .provider(Arc::clone(&provider))
        .build()
        .await
        .unwrap();
    let stuck = DeviceEvent::new("stuck");
    let handed_out = stuck.clone();
    let callbacks = traced(&trace, 100)
        .on_device_range_exec(move |_, _, _, _| Ok(handed_out.clone()))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep
        .run(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    match err {
        ExecError::Timeout {
            stage,
            wave,
            pending,
            ..
        } => {
            assert_eq!(stage, Stage::Dispatch);
            assert_eq!(wave, 0);
            assert_eq!(pending, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(trace.done.lock().is_empty());
    assert_eq!(trace.count("on_device_finish"), 1);
    assert_eq!(trace.count("on_finish"), 1);

    // The runtime with the stuck device is gone.
    assert!(!sweep.executor().runtime_ready());
    assert_eq!(provider.runtimes_finalized(), 1);

    tokio::time::timeout(Duration::from_secs(5), sweep.destroy())
        .await
        .expect("destroy must not hang on a stuck device")
        .unwrap();
    assert!(!stuck.is_complete());
}

/// Test that the run after a timed-out one gets a fresh runtime.
#[tokio::test]
async fn test_run_after_wave_timeout() {
    let trace = Arc::new(Trace::default());
    let provider = Arc::new(CpuProvider::new(
        CpuConfig::default().with_devices(1).with_geometry(25, 1),
    ));
    let mut sweep = Keysweep::builder()
        .provider(Arc::clone(&provider))
        .wave_timeout(Duration::from_millis(30))
        .build()
        .await
        .unwrap();

    let stuck = DeviceEvent::new("stuck");
    let first = Arc::new(AtomicU64::new(0));
    let t = Arc::clone(&trace);
    let callbacks = traced(&trace, 50)
        .on_device_range_exec(move |_, _, _, range| {
            if first.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(stuck.clone());
            }
            t.tasks_run.fetch_add(range.len(), Ordering::SeqCst);
            Ok(DeviceEvent::completed("sync"))
        })
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));
    assert!(!sweep.executor().runtime_ready());

    assert_eq!(sweep.run(None).await.unwrap(), RunOutcome::Completed);
    assert_eq!(trace.tasks_run.load(Ordering::SeqCst), 50);
    assert_eq!(trace.count("compiled"), 2);
    assert_eq!(provider.runtimes_created(), 2);
    assert_eq!(provider.runtimes_finalized(), 1);

    sweep.destroy().await.unwrap();
    assert_eq!(provider.runtimes_finalized(), 2);
}

/// Test that the configured wave timeout applies when run gets none.
#[tokio::test]
async fn test_configured_wave_timeout() {
    let trace = Arc::new(Trace::default());
    let mut sweep = Keysweep::builder()
        .cpu_devices(1)
        .wave_timeout(Duration::from_millis(30))
        .build()
        .await
        .unwrap();
    let stuck = DeviceEvent::new("stuck");
    let callbacks = traced(&trace, 100)
        .on_device_range_exec(move |_, _, _, _| Ok(stuck.clone()))
        .build()
        .unwrap();
    sweep.setup(callbacks).await.unwrap();

    let err = sweep.run(None).await.unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));

    sweep.destroy().await.unwrap();
}

/// Test that a second run starts from scratch on the same runtime.
#[tokio::test]
async fn test_repeated_runs() {
    let trace = Arc::new(Trace::default());
    let provider = Arc::new(CpuProvider::new(
        CpuConfig::default().with_devices(1).with_geometry(25, 1),
    ));
    let mut sweep = Keysweep::builder()
        .provider(Arc::clone(&provider))
        .build()
        .await
        .unwrap();
    sweep.setup(traced(&trace, 50).build().unwrap()).await.unwrap();

    assert_eq!(sweep.run(None).await.unwrap(), RunOutcome::Completed);
    assert_eq!(sweep.run(None).await.unwrap(), RunOutcome::Completed);

    assert_eq!(trace.count("on_start"), 2);
    assert_eq!(trace.count("on_finish"), 2);
    assert_eq!(trace.ranges(), vec![(0, 25), (25, 50), (0, 25), (25, 50)]);
    assert_eq!(provider.runtimes_created(), 1);
    assert_eq!(sweep.executor().run_state(), RunState::Finished);

    sweep.destroy().await.unwrap();
}
