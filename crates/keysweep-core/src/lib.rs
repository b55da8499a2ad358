//! # Keysweep Core
//!
//! Core traits and types for the keysweep distributed task executor.
//!
//! A run splits the task interval `[0, total)` into per-device ranges and
//! dispatches them in waves: every local device gets one range, the
//! executor waits once for all of them, reports completions and progress,
//! and moves on until the interval is consumed or the application aborts.
//!
//! ## Core Abstractions
//!
//! - [`Executor`](executor::Executor) - Lifecycle and run state machine
//! - [`CallbackSet`](callbacks::CallbackSet) - Application hooks
//! - [`ProcessGroup`](group::ProcessGroup) - Peer membership and broadcast
//! - [`RuntimeProvider`](device::RuntimeProvider) /
//!   [`DeviceRuntime`](device::DeviceRuntime) - Device backends
//! - [`WaveSynchronizer`](wave::WaveSynchronizer) - Per-wave completion latch
//! - [`RangeCursor`](partition::RangeCursor) - Task-range decomposition
//!
//! ## Example
//!
//! ```ignore
//! use keysweep_core::prelude::*;
//!
//! let mut executor = Executor::init(group, provider, ExecutorConfig::default()).await?;
//! executor.setup(callbacks).await?;
//! let outcome = executor.run(None).await?;
//! executor.destroy().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod executor;
pub mod group;
pub mod partition;
pub mod wave;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callbacks::{CallbackSet, CallbackSetBuilder, Control, GlobalData, HookContext};
    pub use crate::config::{DeviceClass, DeviceRequest, ExecutorConfig};
    pub use crate::device::{
        CommandQueue, Device, DeviceInfo, DeviceRuntime, HostJob, Program, ProgramSlot,
        RuntimeProvider,
    };
    pub use crate::error::*;
    pub use crate::event::{DeviceEvent, EventStatus};
    pub use crate::executor::{Executor, ExecutorSnapshot, RunOutcome, RunReport, RunState};
    pub use crate::group::{GroupError, GroupResult, LocalGroup, ProcessGroup, SoloGroup};
    pub use crate::partition::{chunk_size, peer_capacity, RangeCursor, TaskRange};
    pub use crate::wave::{WaveReport, WaveSynchronizer};
}
