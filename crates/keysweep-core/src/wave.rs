//! Wave completion synchronizer.
//!
//! One [`WaveSynchronizer`] exists per dispatch wave. It is a countdown latch
//! whose count starts at one: the dispatcher's own guard. Every observed
//! device event adds one before its observer is attached, and
//! [`WaveSynchronizer::seal`] drops the guard once dispatching is over. The
//! count can therefore only reach zero after the last dispatch has been
//! issued *and* every dispatched device has reported, regardless of how
//! completions interleave with dispatch.
//!
//! Completion observers run on device-runtime threads; the control thread
//! blocks once per wave in [`WaveSynchronizer::wait`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{ExecError, Result, Stage};
use crate::event::{DeviceEvent, EventStatus};

struct WaveShared {
    /// Outstanding completions plus the dispatcher guard.
    pending: AtomicUsize,
    /// Set exactly once, when `pending` hits zero.
    signaled: AtomicBool,
    /// Devices whose event completed with a failure status.
    failures: Mutex<Vec<(usize, String)>>,
    notify: Notify,
}

impl WaveShared {
    fn arrive(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "wave latch underflow");
        if prev == 1 && !self.signaled.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit when nobody is waiting yet.
            self.notify.notify_one();
        }
    }
}

/// Outcome of a completed wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveReport {
    /// Zero-based wave number.
    pub wave: u64,
    /// Devices dispatched in this wave.
    pub dispatched: usize,
    /// `(device_index, reason)` for each device whose event failed.
    pub failures: Vec<(usize, String)>,
    /// Time spent blocked in [`WaveSynchronizer::wait`].
    pub waited: Duration,
}

impl WaveReport {
    /// Whether every device completed normally.
    pub fn all_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Countdown latch signalled when every device of one wave has completed.
pub struct WaveSynchronizer {
    wave: u64,
    shared: Arc<WaveShared>,
    dispatched: usize,
    sealed: bool,
}

impl WaveSynchronizer {
    /// Create the synchronizer for a wave, before any dispatch.
    pub fn new(wave: u64) -> Self {
        Self {
            wave,
            shared: Arc::new(WaveShared {
                pending: AtomicUsize::new(1),
                signaled: AtomicBool::new(false),
                failures: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
            dispatched: 0,
            sealed: false,
        }
    }

    /// Wave number.
    pub fn wave(&self) -> u64 {
        self.wave
    }

    /// Count `event` towards this wave and attach the completion observer.
    ///
    /// Fails once the wave has been sealed.
    pub fn observe(&mut self, device_index: usize, event: &DeviceEvent) -> Result<()> {
        if self.sealed {
            return Err(ExecError::bad_state(
                Stage::Dispatch,
                format!(
                    "device {} dispatched after wave {} was sealed",
                    device_index, self.wave
                ),
            ));
        }

        // Count first: the observer may fire inline if the event is done.
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.dispatched += 1;

        let shared = Arc::clone(&self.shared);
        let wave = self.wave;
        event.on_complete(move |status| {
            if let EventStatus::Failed(reason) = status {
                shared.failures.lock().push((device_index, reason.clone()));
            }
            trace!(wave, device = device_index, "device completion observed");
            shared.arrive();
        });
        Ok(())
    }

    /// Declare that no further devices will be dispatched in this wave.
    pub fn seal(&mut self) {
        if !self.sealed {
            self.sealed = true;
            self.shared.arrive();
        }
    }

    /// Devices dispatched so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Devices that have not reported yet (excluding the guard).
    pub fn pending(&self) -> usize {
        let raw = self.shared.pending.load(Ordering::Acquire);
        if self.sealed {
            raw
        } else {
            raw.saturating_sub(1)
        }
    }

    /// Whether the wave-complete flag has been signalled.
    pub fn is_signaled(&self) -> bool {
        self.shared.signaled.load(Ordering::Acquire)
    }

    /// Seal the wave and block until it is signalled.
    ///
    /// With `timeout` set, gives up after that long with
    /// [`ExecError::Timeout`]; device work still in flight is left to finish
    /// on its own. A bounded wait needs the tokio time driver.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<WaveReport> {
        self.seal();
        let started = Instant::now();

        if !self.is_signaled() {
            let notified = self.shared.notify.notified();
            match timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, notified).await.is_err() {
                        return Err(ExecError::Timeout {
                            stage: Stage::Dispatch,
                            wave: self.wave,
                            waited: started.elapsed(),
                            pending: self.pending(),
                        });
                    }
                }
                None => notified.await,
            }
        }

        let waited = started.elapsed();
        debug!(
            wave = self.wave,
            devices = self.dispatched,
            ?waited,
            "wave complete"
        );

        Ok(WaveReport {
            wave: self.wave,
            dispatched: self.dispatched,
            failures: std::mem::take(&mut *self.shared.failures.lock()),
            waited,
        })
    }
}

impl std::fmt::Debug for WaveSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveSynchronizer")
            .field("wave", &self.wave)
            .field("dispatched", &self.dispatched)
            .field("pending", &self.pending())
            .field("sealed", &self.sealed)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
