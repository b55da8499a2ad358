//! Run phases, outcomes and reports.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::DeviceRequest;
use crate::device::DeviceInfo;

/// Phase reached by the current (or last) run.
///
/// Ordered: a run only ever moves forward through these, and every
/// [`Executor::run`](super::Executor::run) starts again at `NotStarted`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum RunState {
    /// Nothing has happened yet.
    #[default]
    NotStarted,
    /// The device runtime is up and usable.
    RuntimeReady,
    /// `on_start` returned.
    Started,
    /// Program source retrieved.
    GotCode,
    /// Build options retrieved.
    GotBuildOptions,
    /// Program compiled.
    CompiledCode,
    /// Task count retrieved.
    GotTaskCount,
    /// Range multiplier retrieved.
    GotRangeMultiplier,
    /// Peer capacity computed.
    GotCapacity,
    /// Global data retrieved.
    GotGlobalData,
    /// Every device passed `on_device_start`.
    DevicesStarted,
    /// The wave loop ended.
    DevicesDoneRunning,
    /// `on_device_finish` ran.
    DevicesFinished,
    /// Global data released.
    FreedGlobalData,
    /// Run complete.
    Finished,
}

impl RunState {
    /// Phase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not-started",
            RunState::RuntimeReady => "runtime-ready",
            RunState::Started => "started",
            RunState::GotCode => "got-code",
            RunState::GotBuildOptions => "got-build-options",
            RunState::CompiledCode => "compiled-code",
            RunState::GotTaskCount => "got-task-count",
            RunState::GotRangeMultiplier => "got-range-multiplier",
            RunState::GotCapacity => "got-capacity",
            RunState::GotGlobalData => "got-global-data",
            RunState::DevicesStarted => "devices-started",
            RunState::DevicesDoneRunning => "devices-done-running",
            RunState::DevicesFinished => "devices-finished",
            RunState::FreedGlobalData => "freed-global-data",
            RunState::Finished => "finished",
        }
    }

    /// Move to `next` unless the run is already past it.
    pub(crate) fn advance(&mut self, next: RunState) {
        if next > *self {
            trace!("Run state {} -> {}", self, next);
            *self = next;
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every task was dispatched and completed.
    Completed,
    /// A range-completion hook asked to stop.
    Aborted,
    /// Non-coordinator peer: pre-run and post-run only.
    Standby,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Standby => "standby",
        };
        f.write_str(s)
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Waves whose completion was observed.
    pub waves: u64,
    /// Tasks handed to devices.
    pub tasks_dispatched: u64,
    /// Task total of the run (0 if sizing never happened).
    pub task_total: u64,
    /// Outcome, when the run succeeded.
    pub outcome: Option<RunOutcome>,
    /// Error message, when the run failed.
    pub error: Option<String>,
    /// Last phase reached.
    pub final_state: RunState,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl RunReport {
    /// Whether the run succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Serializable picture of the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    /// This peer's id.
    pub peer_id: u32,
    /// Number of peers.
    pub peer_count: u32,
    /// Device request agreed during setup.
    pub negotiated: Option<DeviceRequest>,
    /// Backend name of the live runtime.
    pub backend: Option<String>,
    /// Devices of the live runtime.
    pub devices: Vec<DeviceInfo>,
    /// Current run phase.
    pub run_state: RunState,
    /// Task total of the current run.
    pub task_total: u64,
    /// Range multiplier of the current run.
    pub range_multiplier: u32,
    /// Capacity table, indexed by peer id.
    pub capacity_per_peer: Vec<u64>,
    /// Length of the retrieved program source.
    pub source_len: usize,
    /// Retrieved build options.
    pub build_options: Option<String>,
    /// Registered hooks.
    pub hooks: Vec<String>,
    /// Report of the last run.
    pub last_report: Option<RunReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = RunState::NotStarted;
        state.advance(RunState::GotCode);
        assert_eq!(state, RunState::GotCode);

        state.advance(RunState::Started);
        assert_eq!(state, RunState::GotCode);

        state.advance(RunState::Finished);
        assert_eq!(state, RunState::Finished);
    }

    #[test]
    fn test_phase_order() {
        assert!(RunState::NotStarted < RunState::RuntimeReady);
        assert!(RunState::CompiledCode < RunState::GotTaskCount);
        assert!(RunState::DevicesFinished < RunState::FreedGlobalData);
        assert_eq!(RunState::GotGlobalData.to_string(), "got-global-data");
    }
}
