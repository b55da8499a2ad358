//! In-order command queue backed by a worker thread.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use keysweep_core::device::{CommandQueue, HostJob};
use keysweep_core::error::{ExecError, Result, Stage};
use keysweep_core::event::{DeviceEvent, EventStatus};

/// How often a worker blocked on a foreign event checks for shutdown.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// How long [`CpuQueue::shutdown`] waits for the worker before detaching it.
pub(crate) const JOIN_GRACE: Duration = Duration::from_secs(1);

enum Command {
    Run {
        label: String,
        job: HostJob,
        event: DeviceEvent,
    },
    Wait(DeviceEvent),
    Shutdown,
}

impl Command {
    /// Complete the command's event without running it.
    fn fail(self, reason: &str, depth: &AtomicUsize) {
        if let Command::Run { event, .. } = self {
            depth.fetch_sub(1, Ordering::AcqRel);
            event.complete(EventStatus::Failed(reason.to_string()));
        }
    }
}

/// Command queue of one CPU device.
///
/// Submitted jobs are staged until [`flush`](CommandQueue::flush) and then
/// run one at a time, in submission order, on the device's worker thread.
/// A job that errors or panics completes its event with a failure status.
pub struct CpuQueue {
    device_index: usize,
    staged: Mutex<Vec<Command>>,
    sender: Sender<Command>,
    depth: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpuQueue {
    /// Start the worker thread for device `device_index`.
    pub fn spawn(device_index: usize) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let depth = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let worker_depth = Arc::clone(&depth);
        let worker_closed = Arc::clone(&closed);

        let worker = thread::Builder::new()
            .name(format!("keysweep-cpu-{}", device_index))
            .spawn(move || worker_loop(device_index, receiver, worker_depth, worker_closed))
            .map_err(|e| {
                ExecError::runtime_init(
                    Stage::Setup,
                    format!("cannot spawn worker for cpu device {}: {}", device_index, e),
                )
            })?;

        debug!("CPU device {} worker started", device_index);
        Ok(Self {
            device_index,
            staged: Mutex::new(Vec::new()),
            sender,
            depth,
            closed,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Index of the device this queue belongs to.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Whether [`close`](Self::close) or [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the worker and wait up to a second for it to exit.
    ///
    /// See [`close`](Self::close) for what happens to pending commands.
    pub fn shutdown(&self) {
        self.close();
        if let Some(worker) = self.take_worker() {
            reap(self.device_index, worker, JOIN_GRACE);
        }
    }

    /// Signal the worker to stop without waiting for it.
    ///
    /// Staged, unflushed jobs are failed. Flushed jobs still run, except
    /// those queued behind a wait on an event that is still pending: the
    /// wait is abandoned and they are failed. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for command in mem::take(&mut *self.staged.lock()) {
            command.fail("queue shut down before flush", &self.depth);
        }
        let _ = self.sender.send(Command::Shutdown);
    }

    /// Take the worker's join handle, if it has not been taken yet.
    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ExecError::runtime_op(
                Stage::Dispatch,
                format!("queue of cpu device {} is shut down", self.device_index),
            ))
        } else {
            Ok(())
        }
    }
}

impl CommandQueue for CpuQueue {
    fn submit(&self, label: &str, job: HostJob) -> Result<DeviceEvent> {
        self.check_open()?;
        let event = DeviceEvent::new(format!("cpu{}:{}", self.device_index, label));
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.staged.lock().push(Command::Run {
            label: label.to_string(),
            job,
            event: event.clone(),
        });
        trace!("CPU device {} staged '{}'", self.device_index, label);
        Ok(event)
    }

    fn enqueue_wait(&self, event: &DeviceEvent) -> Result<()> {
        self.check_open()?;
        if !event.is_complete() {
            self.staged.lock().push(Command::Wait(event.clone()));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        let staged = mem::take(&mut *self.staged.lock());
        let mut pending = staged.into_iter();
        while let Some(command) = pending.next() {
            if let Err(err) = self.sender.send(command) {
                let reason = format!("worker of cpu device {} is gone", self.device_index);
                err.into_inner().fail(&reason, &self.depth);
                for rest in pending {
                    rest.fail(&reason, &self.depth);
                }
                return Err(ExecError::runtime_op(Stage::Dispatch, reason));
            }
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl Drop for CpuQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CpuQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuQueue")
            .field("device_index", &self.device_index)
            .field("depth", &self.depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Join a closed queue's worker, detaching it if it is still busy after
/// `grace`.
pub(crate) fn reap(device_index: usize, worker: JoinHandle<()>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !worker.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "CPU device {} worker still busy after {:?}; detaching it",
                device_index, grace
            );
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if worker.join().is_err() {
        warn!("CPU device {} worker panicked", device_index);
    }
    debug!("CPU device {} worker stopped", device_index);
}

fn worker_loop(
    device_index: usize,
    receiver: Receiver<Command>,
    depth: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    let mut abandoned = false;
    for command in receiver.iter() {
        match command {
            Command::Run { event, .. } if abandoned => {
                depth.fetch_sub(1, Ordering::AcqRel);
                event.complete(EventStatus::Failed(
                    "queue shut down while waiting on a dependency".to_string(),
                ));
            }
            Command::Run { label, job, event } => {
                let status = match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(())) => EventStatus::Complete,
                    Ok(Err(e)) => EventStatus::Failed(e.to_string()),
                    Err(_) => EventStatus::Failed(format!("job '{}' panicked", label)),
                };
                if let EventStatus::Failed(reason) = &status {
                    warn!("CPU device {} job '{}' failed: {}", device_index, label, reason);
                }
                depth.fetch_sub(1, Ordering::AcqRel);
                event.complete(status);
            }
            Command::Wait(event) => {
                while event.wait_timeout(WAIT_POLL).is_none() {
                    if closed.load(Ordering::Acquire) {
                        debug!(
                            "CPU device {} abandoned wait on '{}'",
                            device_index,
                            event.label()
                        );
                        abandoned = true;
                        break;
                    }
                }
            }
            Command::Shutdown => break,
        }
    }
}
