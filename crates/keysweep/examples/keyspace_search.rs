//! Keyspace Search Example
//!
//! Recovers a short lowercase secret from its FNV-1a hash by sweeping every
//! candidate of the given length on the CPU backend. The run is aborted as
//! soon as a device reports a match.
//!
//! Usage:
//!   cargo run --example keyspace_search -- --secret rusty --devices 4

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use keysweep::prelude::*;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Brute-force a lowercase secret from its hash
#[derive(Parser, Debug)]
#[command(name = "keyspace_search")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secret whose hash is searched for
    #[arg(short, long, default_value = "rusty")]
    secret: String,

    /// Number of CPU devices
    #[arg(short, long, default_value_t = 4)]
    devices: usize,

    /// Tasks per device per wave, before the multiplier
    #[arg(short, long, default_value_t = 4096)]
    workgroup: u64,

    /// Range multiplier
    #[arg(short, long, default_value_t = 4)]
    multiplier: u32,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Decode a task index into its candidate string.
fn candidate(mut index: u64, length: usize, out: &mut Vec<u8>) {
    out.clear();
    let base = ALPHABET.len() as u64;
    for _ in 0..length {
        out.push(ALPHABET[(index % base) as usize]);
        index /= base;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.secret.is_empty() || !args.secret.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(ExecError::InvalidParameter(
            "secret must be non-empty lowercase ASCII".to_string(),
        ));
    }
    let length = args.secret.len();
    let tasks = (ALPHABET.len() as u64)
        .checked_pow(length as u32)
        .ok_or_else(|| ExecError::InvalidParameter("secret is too long".to_string()))?;
    let target = fnv1a(args.secret.as_bytes());

    println!("=== Keysweep Keyspace Search ===\n");
    println!("Target hash: {:016x}", target);
    println!("Keyspace:    {} candidates of length {}", tasks, length);
    println!();

    let mut sweep = Keysweep::builder()
        .cpu_config(
            CpuConfig::default()
                .with_devices(args.devices)
                .with_geometry(args.workgroup, 1),
        )
        .build()
        .await?;

    let found: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let found_in_job = Arc::clone(&found);
    let found_in_done = Arc::clone(&found);
    let multiplier = args.multiplier;

    let callbacks = CallbackSet::builder()
        .get_code(|_| Some(b"kernel void fnv1a_sweep(ulong start, ulong end) {}".to_vec()))
        .get_build_options(move |_| Some(format!("-DLENGTH={}", length)))
        .get_num_tasks(move |_| tasks)
        .get_task_range_multiplier(move |_| multiplier)
        .get_global_data(move |_| Ok(GlobalData::new(target.to_le_bytes().to_vec())))
        .on_device_range_exec(move |_, device, data, range| {
            let mut hash = [0u8; 8];
            if let Some(data) = data {
                hash.copy_from_slice(&data[..8]);
            }
            let target = u64::from_le_bytes(hash);
            let length = device
                .program()
                .and_then(|p| p.define("LENGTH").and_then(|v| v.parse().ok()))
                .unwrap_or(length);
            let found = Arc::clone(&found_in_job);

            device.queue().submit(
                "fnv1a_sweep",
                Box::new(move || {
                    let mut buf = Vec::with_capacity(length);
                    for task in range.iter() {
                        candidate(task, length, &mut buf);
                        if fnv1a(&buf) == target {
                            *found.lock() = Some(String::from_utf8_lossy(&buf).into_owned());
                            break;
                        }
                    }
                    Ok(())
                }),
            )
        })
        .on_device_range_done(move |_, _, _, _| {
            if found_in_done.lock().is_some() {
                Ok(Control::Abort)
            } else {
                Ok(Control::Continue)
            }
        })
        .progress(|pct| tracing::debug!("{:.1}% swept", pct))
        .build()?;

    sweep.setup(callbacks).await?;

    let start = Instant::now();
    let outcome = sweep.run(None).await;
    let elapsed = start.elapsed();

    if let Some(report) = sweep.last_report() {
        println!(
            "Swept {} of {} candidates in {} wave(s), {:?}",
            report.tasks_dispatched, report.task_total, report.waves, elapsed
        );
    }
    match (&outcome, found.lock().as_deref()) {
        (Ok(_), Some(secret)) => println!("Found: {}", secret),
        (Ok(_), None) => println!("No candidate matched"),
        (Err(e), _) => println!("Search failed: {}", e),
    }

    sweep.destroy().await?;
    outcome.map(|_| ())
}
