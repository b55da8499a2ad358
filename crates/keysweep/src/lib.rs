//! # Keysweep
//!
//! Distributed, device-parallel task-range executor.
//!
//! Keysweep drives a large, subdividable task range (a keyspace search, a
//! parameter sweep) to completion across a group of cooperating processes,
//! each driving one or more compute devices. The application supplies hooks
//! for what program to run, how many tasks exist and how to launch a range
//! on a device; keysweep handles peers, devices, decomposition and
//! completion tracking.
//!
//! ## Quick Start
//!
//! ```ignore
//! use keysweep::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut sweep = Keysweep::builder().cpu_devices(2).build().await?;
//!
//!     let callbacks = CallbackSet::builder()
//!         .get_code(|_| Some(b"kernel void sweep() {}".to_vec()))
//!         .get_num_tasks(|_| 1 << 20)
//!         .on_device_range_exec(|_, device, _, range| {
//!             device.queue().submit("sweep", Box::new(move || {
//!                 for _task in range.iter() {}
//!                 Ok(())
//!             }))
//!         })
//!         .progress(|pct| println!("{:.1}%", pct))
//!         .build()?;
//!
//!     sweep.setup(callbacks).await?;
//!     let outcome = sweep.run(None).await?;
//!     println!("{}", outcome);
//!     sweep.destroy().await
//! }
//! ```
//!
//! ## Crates
//!
//! - `keysweep-core` - executor, traits and decomposition
//! - `keysweep-cpu` - host backend (always available)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

use std::sync::Arc;
use std::time::Duration;

pub use keysweep_core::*;
pub use keysweep_cpu::{CpuConfig, CpuProvider, CpuQueue, CpuRuntime};

use keysweep_core::callbacks::CallbackSet;
use keysweep_core::config::{DeviceRequest, ExecutorConfig};
use keysweep_core::device::RuntimeProvider;
use keysweep_core::error::Result;
use keysweep_core::executor::{Executor, ExecutorSnapshot, RunOutcome, RunReport};
use keysweep_core::group::{ProcessGroup, SoloGroup};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Keysweep, KeysweepBuilder};
    pub use keysweep_core::prelude::*;
    pub use keysweep_cpu::{CpuConfig, CpuProvider};
}

/// Main keysweep facade.
///
/// Owns one [`Executor`] wired to a process group and a runtime provider.
pub struct Keysweep {
    executor: Executor,
}

impl Keysweep {
    /// Create a new builder.
    pub fn builder() -> KeysweepBuilder {
        KeysweepBuilder::new()
    }

    /// Single-process executor on the CPU backend with default settings.
    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    /// Register hooks and agree on the device request.
    pub async fn setup(&mut self, callbacks: CallbackSet) -> Result<DeviceRequest> {
        self.executor.setup(callbacks).await
    }

    /// Execute one full run.
    pub async fn run(&mut self, timeout: Option<Duration>) -> Result<RunOutcome> {
        self.executor.run(timeout).await
    }

    /// Tear down runtime and process-group membership.
    pub async fn destroy(&mut self) -> Result<()> {
        self.executor.destroy().await
    }

    /// This peer's id.
    pub fn peer_id(&self) -> u32 {
        self.executor.peer_id()
    }

    /// Number of peers.
    pub fn peer_count(&self) -> u32 {
        self.executor.peer_count()
    }

    /// Report of the last run.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.executor.last_report()
    }

    /// Serializable picture of the executor.
    pub fn snapshot(&self) -> ExecutorSnapshot {
        self.executor.snapshot()
    }

    /// Log the executor state.
    pub fn dump(&self) {
        self.executor.dump()
    }

    /// The underlying executor.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The underlying executor, mutably.
    pub fn executor_mut(&mut self) -> &mut Executor {
        &mut self.executor
    }

    /// Unwrap into the executor.
    pub fn into_inner(self) -> Executor {
        self.executor
    }
}

/// Builder for [`Keysweep`].
pub struct KeysweepBuilder {
    group: Option<Box<dyn ProcessGroup>>,
    provider: Option<Arc<dyn RuntimeProvider>>,
    config: ExecutorConfig,
    cpu: CpuConfig,
}

impl KeysweepBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            group: None,
            provider: None,
            config: ExecutorConfig::default(),
            cpu: CpuConfig::default(),
        }
    }

    /// Process group to join. Defaults to [`SoloGroup`].
    pub fn group(mut self, group: impl ProcessGroup + 'static) -> Self {
        self.group = Some(Box::new(group));
        self
    }

    /// Runtime provider. Defaults to a [`CpuProvider`].
    pub fn provider<P: RuntimeProvider + 'static>(mut self, provider: Arc<P>) -> Self {
        let provider: Arc<dyn RuntimeProvider> = provider;
        self.provider = Some(provider);
        self
    }

    /// Executor configuration.
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on each wave's wait.
    pub fn wave_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_wave_timeout(timeout);
        self
    }

    /// Geometry of the default CPU provider.
    pub fn cpu_config(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }

    /// Number of devices of the default CPU provider.
    pub fn cpu_devices(mut self, devices: usize) -> Self {
        self.cpu.devices = devices;
        self
    }

    /// Join the group and create the executor.
    pub async fn build(self) -> Result<Keysweep> {
        let group: Box<dyn ProcessGroup> = match self.group {
            Some(group) => group,
            None => Box::new(SoloGroup::new()),
        };
        let provider: Arc<dyn RuntimeProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                tracing::info!("Using CPU backend with {} device(s)", self.cpu.devices);
                Arc::new(CpuProvider::new(self.cpu))
            }
        };
        let executor = Executor::init(group, provider, self.config).await?;
        Ok(Keysweep { executor })
    }
}

impl Default for KeysweepBuilder {
    fn default() -> Self {
        Self::new()
    }
}
