//! Device completion events.
//!
//! A [`DeviceEvent`] is the asynchronous completion handle returned for a
//! piece of device work. Observers registered with
//! [`DeviceEvent::on_complete`] run exactly once, on whichever thread
//! completes the event (or inline, if the event had already completed).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Final status of a device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// The work finished normally.
    Complete,
    /// The work failed on the device.
    Failed(String),
}

impl EventStatus {
    /// Whether the work finished normally.
    pub fn is_ok(&self) -> bool {
        matches!(self, EventStatus::Complete)
    }
}

type Observer = Box<dyn FnOnce(&EventStatus) + Send + 'static>;

enum EventState {
    Pending(Vec<Observer>),
    Done(EventStatus),
}

struct EventInner {
    label: String,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion handle for asynchronous device work.
///
/// Cloning yields another handle to the same event.
#[derive(Clone)]
pub struct DeviceEvent {
    inner: Arc<EventInner>,
}

impl DeviceEvent {
    /// Create a pending event.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                label: label.into(),
                state: Mutex::new(EventState::Pending(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    /// Create an event that has already completed successfully.
    ///
    /// Useful for device callbacks that finish their work synchronously.
    pub fn completed(label: impl Into<String>) -> Self {
        let event = Self::new(label);
        event.complete(EventStatus::Complete);
        event
    }

    /// Event label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Mark the event as finished and run its observers.
    ///
    /// Returns `false` if the event had already completed; the first status
    /// wins.
    pub fn complete(&self, status: EventStatus) -> bool {
        let observers = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                EventState::Done(_) => return false,
                EventState::Pending(observers) => {
                    let observers = std::mem::take(observers);
                    *state = EventState::Done(status.clone());
                    observers
                }
            }
        };
        self.inner.done.notify_all();

        // Observers run outside the lock so they may touch the event again.
        for observer in observers {
            observer(&status);
        }
        true
    }

    /// Register an observer.
    ///
    /// Runs inline if the event is already complete.
    pub fn on_complete<F>(&self, observer: F)
    where
        F: FnOnce(&EventStatus) + Send + 'static,
    {
        let status = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                EventState::Pending(observers) => {
                    observers.push(Box::new(observer));
                    return;
                }
                EventState::Done(status) => status.clone(),
            }
        };
        observer(&status);
    }

    /// Status if the event has completed.
    pub fn status(&self) -> Option<EventStatus> {
        match &*self.inner.state.lock() {
            EventState::Pending(_) => None,
            EventState::Done(status) => Some(status.clone()),
        }
    }

    /// Whether the event has completed.
    pub fn is_complete(&self) -> bool {
        self.status().is_some()
    }

    /// Block the calling thread until the event completes.
    ///
    /// Never called on the executor's control path.
    pub fn wait(&self) -> EventStatus {
        let mut state = self.inner.state.lock();
        loop {
            if let EventState::Done(status) = &*state {
                return status.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until the event completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EventStatus> {
        let mut state = self.inner.state.lock();
        if let EventState::Done(status) = &*state {
            return Some(status.clone());
        }
        let _ = self.inner.done.wait_for(&mut state, timeout);
        match &*state {
            EventState::Done(status) => Some(status.clone()),
            EventState::Pending(_) => None,
        }
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEvent")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}
