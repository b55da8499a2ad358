//! Error types for keysweep.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// The executor stage an error was raised in.
///
/// Multi-peer failures are hard to read without knowing where each peer
/// stopped, so every runtime error carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Joining the process group.
    Init,
    /// Callback registration and device negotiation.
    Setup,
    /// Runtime bring-up, source retrieval and compilation.
    PreRun,
    /// Coordinator-side task sizing.
    Sizing,
    /// Device brackets and the dispatch-wave loop.
    Dispatch,
    /// Global-data release and `on_finish`.
    PostRun,
    /// Runtime and process-group teardown.
    Teardown,
}

impl Stage {
    /// Lowercase stage name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Setup => "setup",
            Stage::PreRun => "pre-run",
            Stage::Sizing => "sizing",
            Stage::Dispatch => "dispatch",
            Stage::PostRun => "post-run",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor error type.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Invalid argument passed to an API entry point.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A required hook is absent or produced nothing.
    #[error("[{stage}] Missing callback `{name}`: {reason}")]
    MissingCallback {
        /// Stage that needed the hook.
        stage: Stage,
        /// Hook name.
        name: &'static str,
        /// What was missing.
        reason: String,
    },

    /// Allocation failure for an internal buffer.
    #[error("[{stage}] Out of memory: could not reserve {requested} bytes")]
    OutOfMemory {
        /// Stage that attempted the allocation.
        stage: Stage,
        /// Requested size in bytes.
        requested: usize,
    },

    /// Device runtime could not be brought up.
    #[error("[{stage}] Device runtime initialization failed: {reason}")]
    RuntimeInit {
        /// Stage that attempted bring-up.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },

    /// A device runtime operation failed.
    #[error("[{stage}] Device runtime operation failed: {reason}")]
    RuntimeOp {
        /// Stage of the failing operation.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },

    /// Process-group join, broadcast or finalize failed.
    #[error("[{stage}] Process group error: {reason}")]
    Group {
        /// Stage of the failing group operation.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },

    /// An executor invariant was violated.
    #[error("[{stage}] Bad state: {reason}")]
    BadState {
        /// Stage in which the invariant broke.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },

    /// A callback returned a semantically invalid value.
    #[error("[{stage}] Invalid value: {reason}")]
    InvalidValue {
        /// Stage that consumed the value.
        stage: Stage,
        /// Failure detail.
        reason: String,
    },

    /// A wave did not complete within the configured bound.
    #[error("[{stage}] Wave {wave} timed out after {waited:?} with {pending} device(s) pending")]
    Timeout {
        /// Always [`Stage::Dispatch`] today.
        stage: Stage,
        /// Zero-based wave number.
        wave: u64,
        /// Time waited.
        waited: Duration,
        /// Devices that had not reported completion.
        pending: usize,
    },

    /// Error raised by user hook code.
    #[error("Callback error: {0}")]
    Callback(String),

    /// A post-run failure that followed an earlier failure.
    #[error("{primary}; then: {secondary}")]
    Compound {
        /// The first error of the run.
        primary: Box<ExecError>,
        /// The error raised while cleaning up.
        secondary: Box<ExecError>,
    },
}

impl ExecError {
    /// Create an error from user hook code.
    pub fn callback(msg: impl Into<String>) -> Self {
        ExecError::Callback(msg.into())
    }

    /// Create a bad-state error.
    pub fn bad_state(stage: Stage, reason: impl Into<String>) -> Self {
        ExecError::BadState {
            stage,
            reason: reason.into(),
        }
    }

    /// Create an invalid-value error.
    pub fn invalid_value(stage: Stage, reason: impl Into<String>) -> Self {
        ExecError::InvalidValue {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a runtime-operation error.
    pub fn runtime_op(stage: Stage, reason: impl Into<String>) -> Self {
        ExecError::RuntimeOp {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a runtime-initialization error.
    pub fn runtime_init(stage: Stage, reason: impl Into<String>) -> Self {
        ExecError::RuntimeInit {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a process-group error.
    pub fn group(stage: Stage, reason: impl Into<String>) -> Self {
        ExecError::Group {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a missing-callback error.
    pub fn missing(stage: Stage, name: &'static str, reason: impl Into<String>) -> Self {
        ExecError::MissingCallback {
            stage,
            name,
            reason: reason.into(),
        }
    }

    /// Stage the error was raised in, if it carries one.
    ///
    /// For [`ExecError::Compound`] this is the stage of the primary error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExecError::MissingCallback { stage, .. }
            | ExecError::OutOfMemory { stage, .. }
            | ExecError::RuntimeInit { stage, .. }
            | ExecError::RuntimeOp { stage, .. }
            | ExecError::Group { stage, .. }
            | ExecError::BadState { stage, .. }
            | ExecError::InvalidValue { stage, .. }
            | ExecError::Timeout { stage, .. } => Some(*stage),
            ExecError::Compound { primary, .. } => primary.stage(),
            ExecError::InvalidParameter(_) | ExecError::Callback(_) => None,
        }
    }

    /// The first error of a chain.
    pub fn primary(&self) -> &ExecError {
        match self {
            ExecError::Compound { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Combine an earlier result with a later one without discarding either
    /// error.
    pub fn combine(first: Result<()>, then: Result<()>) -> Result<()> {
        match first {
            Ok(()) => then,
            Err(e) => Err(e.chain(then)),
        }
    }

    /// Attach a later result to this error.
    pub fn chain(self, later: Result<()>) -> ExecError {
        match later {
            Ok(()) => self,
            Err(secondary) => ExecError::Compound {
                primary: Box::new(self),
                secondary: Box::new(secondary),
            },
        }
    }

    /// Whether this is a missing-callback error.
    pub fn is_missing_callback(&self) -> bool {
        matches!(self.primary(), ExecError::MissingCallback { .. })
    }

    /// Whether this is an invalid-value error.
    pub fn is_invalid_value(&self) -> bool {
        matches!(self.primary(), ExecError::InvalidValue { .. })
    }

    /// Whether this is a bad-state error.
    pub fn is_bad_state(&self) -> bool {
        matches!(self.primary(), ExecError::BadState { .. })
    }
}
