//! The executor.
//!
//! One [`Executor`] exists per process. It owns the process-group
//! membership, the device runtime and the application's [`CallbackSet`],
//! and drives each run through pre-run, coordinator sizing, the dispatch
//! waves and post-run.
//!
//! Lifecycle:
//!
//! 1. [`Executor::init`] joins the process group. The device runtime is not
//!    brought up yet.
//! 2. [`Executor::setup`] agrees on the device request with every peer and
//!    brings the runtime up, reusing it when the request is unchanged. May be
//!    called any number of times.
//! 3. [`Executor::run`] executes one full run. May be called any number of
//!    times.
//! 4. [`Executor::destroy`] tears down the runtime, releases buffers and
//!    leaves the group.

mod run;
mod state;

pub use state::{ExecutorSnapshot, RunOutcome, RunReport, RunState};

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackSet, GlobalData, HookContext};
use crate::config::{DeviceRequest, ExecutorConfig};
use crate::device::{DeviceRuntime, RuntimeProvider};
use crate::error::{ExecError, Result, Stage};
use crate::group::ProcessGroup;

/// Abort code used when initialization fails after joining the group.
const INIT_ABORT_CODE: i32 = -1;

/// Distributed, device-parallel task executor.
pub struct Executor {
    group: Box<dyn ProcessGroup>,
    group_joined: bool,
    provider: Arc<dyn RuntimeProvider>,
    config: ExecutorConfig,
    peer_count: u32,
    peer_id: u32,
    negotiated: Option<DeviceRequest>,
    runtime: Option<Box<dyn DeviceRuntime>>,
    callbacks: Option<CallbackSet>,
    source: Option<Vec<u8>>,
    build_options: Option<String>,
    global_data: Option<GlobalData>,
    task_total: u64,
    range_multiplier: u32,
    capacity_per_peer: Vec<u64>,
    run_state: RunState,
    last_report: Option<RunReport>,
    destroyed: bool,
}

impl Executor {
    /// Join the process group and create the executor.
    ///
    /// If anything fails after the group was joined, the group is aborted
    /// once and no executor is returned.
    pub async fn init(
        mut group: Box<dyn ProcessGroup>,
        provider: Arc<dyn RuntimeProvider>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;

        if let Err(e) = group.join().await {
            error!("Failed to join the process group: {}", e);
            return Err(ExecError::group(Stage::Init, e.to_string()));
        }

        let membership = group
            .peer_count()
            .and_then(|count| group.peer_id().map(|id| (count, id)));
        let (peer_count, peer_id) = match membership {
            Ok((count, id)) if id < count => (count, id),
            Ok((count, id)) => {
                error!("Peer id {} is outside a group of {}", id, count);
                group.abort(INIT_ABORT_CODE);
                return Err(ExecError::bad_state(
                    Stage::Init,
                    format!("peer id {} outside a group of {}", id, count),
                ));
            }
            Err(e) => {
                error!("Failed to query process-group membership: {}", e);
                group.abort(INIT_ABORT_CODE);
                return Err(ExecError::group(Stage::Init, e.to_string()));
            }
        };

        info!(
            "Executor initialized: peer {} of {} (runtime provider '{}')",
            peer_id,
            peer_count,
            provider.name()
        );

        Ok(Self {
            group,
            group_joined: true,
            provider,
            config,
            peer_count,
            peer_id,
            negotiated: None,
            runtime: None,
            callbacks: None,
            source: None,
            build_options: None,
            global_data: None,
            task_total: 0,
            range_multiplier: 1,
            capacity_per_peer: Vec::new(),
            run_state: RunState::NotStarted,
            last_report: None,
            destroyed: false,
        })
    }

    /// Tear everything down: runtime, buffers, then the process group.
    ///
    /// Idempotent. Every step is attempted even if an earlier one fails; the
    /// first error is returned with later ones chained to it.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        info!("Destroying executor on peer {}", self.peer_id);

        let mut result = self.teardown_runtime().await;

        self.callbacks = None;
        self.source = None;
        self.build_options = None;
        self.global_data = None;
        self.capacity_per_peer = Vec::new();
        self.negotiated = None;
        self.task_total = 0;

        if self.group_joined {
            self.group_joined = false;
            let left = self
                .group
                .finalize()
                .await
                .map_err(|e| ExecError::group(Stage::Teardown, e.to_string()));
            result = ExecError::combine(result, left);
        }

        if let Err(e) = &result {
            warn!("Executor teardown finished with errors: {}", e);
        }
        result
    }

    /// Register the application's hooks and agree on the device request.
    ///
    /// The request is broadcast from peer 0 and its value wins on every
    /// peer, peer 0 included. A live runtime is reused when the agreed
    /// request matches the one it was created for, and recreated otherwise.
    pub async fn setup(&mut self, mut callbacks: CallbackSet) -> Result<DeviceRequest> {
        self.ensure_live(Stage::Setup)?;

        let mut wire = callbacks.device_request().to_wire();
        self.group
            .broadcast(&mut wire, 0)
            .await
            .map_err(|e| {
                error!("Unable to share the device request: {}", e);
                ExecError::group(Stage::Setup, format!("device request broadcast: {}", e))
            })?;
        let request = DeviceRequest::from_wire(wire)
            .map_err(|e| ExecError::group(Stage::Setup, e.to_string()))?;

        let reusable = self
            .runtime
            .as_ref()
            .is_some_and(|rt| rt.request() == request);
        if reusable {
            debug!("Reusing device runtime for {}", request);
        } else {
            if self.runtime.is_some() {
                debug!("Device request changed to {}; recreating the runtime", request);
                self.teardown_runtime().await?;
            }
            self.bring_up(request, Stage::Setup).await?;
        }

        callbacks.set_device_request(request);
        debug!("Registered hooks: {:?}", callbacks.hook_names());
        self.callbacks = Some(callbacks);
        self.negotiated = Some(request);
        Ok(request)
    }

    /// Number of peers in the group.
    pub fn peer_count(&self) -> u32 {
        self.peer_count
    }

    /// This peer's id.
    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    /// Whether this peer is the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.peer_id == 0
    }

    /// Task total of the current or last run.
    pub fn task_total(&self) -> u64 {
        self.task_total
    }

    /// Devices of the live runtime (0 when it is down).
    pub fn device_count(&self) -> usize {
        self.runtime.as_ref().map_or(0, |rt| rt.devices().len())
    }

    /// Phase reached by the current or last run.
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Device request agreed during the last setup.
    pub fn negotiated(&self) -> Option<DeviceRequest> {
        self.negotiated
    }

    /// Process-local configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether the device runtime is up.
    pub fn runtime_ready(&self) -> bool {
        self.runtime.is_some()
    }

    /// Report of the last run.
    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Serializable picture of the executor.
    pub fn snapshot(&self) -> ExecutorSnapshot {
        let (backend, devices) = match &self.runtime {
            Some(rt) => (
                Some(rt.backend_name().to_string()),
                rt.devices().iter().map(|d| d.info().clone()).collect(),
            ),
            None => (None, Vec::new()),
        };
        ExecutorSnapshot {
            peer_id: self.peer_id,
            peer_count: self.peer_count,
            negotiated: self.negotiated,
            backend,
            devices,
            run_state: self.run_state,
            task_total: self.task_total,
            range_multiplier: self.range_multiplier,
            capacity_per_peer: self.capacity_per_peer.clone(),
            source_len: self.source.as_ref().map_or(0, Vec::len),
            build_options: self.build_options.clone(),
            hooks: self
                .callbacks
                .as_ref()
                .map(|cbs| cbs.hook_names().into_iter().map(String::from).collect())
                .unwrap_or_default(),
            last_report: self.last_report.clone(),
        }
    }

    /// Log the executor state at `info` level.
    pub fn dump(&self) {
        let snap = self.snapshot();
        info!("Executor peer {} of {}", snap.peer_id, snap.peer_count);
        match snap.negotiated {
            Some(request) => info!("  device request: {}", request),
            None => info!("  device request: not negotiated"),
        }
        match &snap.backend {
            Some(name) => info!("  runtime: {} with {} device(s)", name, snap.devices.len()),
            None => info!("  runtime: down"),
        }
        for device in &snap.devices {
            info!("    {}", device);
        }
        info!("  run state: {}", snap.run_state);
        info!(
            "  tasks: {} (multiplier {}, capacity {:?})",
            snap.task_total, snap.range_multiplier, snap.capacity_per_peer
        );
        info!(
            "  source: {} bytes, build options: {}",
            snap.source_len,
            snap.build_options.as_deref().unwrap_or("<none>")
        );
        info!("  hooks: {}", snap.hooks.join(", "));
        if let Some(report) = &snap.last_report {
            info!(
                "  last run: {} wave(s), {} task(s), {:?}",
                report.waves, report.tasks_dispatched, report.elapsed
            );
        }
    }

    pub(crate) fn context(&self) -> HookContext {
        HookContext {
            peer_id: self.peer_id,
            peer_count: self.peer_count,
            task_total: self.task_total,
            device_count: self.device_count(),
        }
    }

    fn ensure_live(&self, stage: Stage) -> Result<()> {
        if self.destroyed {
            Err(ExecError::bad_state(stage, "executor has been destroyed"))
        } else {
            Ok(())
        }
    }

    async fn bring_up(&mut self, request: DeviceRequest, stage: Stage) -> Result<()> {
        let runtime = self.provider.create(request).await.map_err(|e| {
            error!("Failed to create the device runtime for {}: {}", request, e);
            match e {
                ExecError::RuntimeInit { reason, .. } => ExecError::runtime_init(stage, reason),
                other => ExecError::runtime_init(stage, other.to_string()),
            }
        })?;
        info!(
            "Device runtime '{}' up with {} device(s) for {}",
            runtime.backend_name(),
            runtime.devices().len(),
            request
        );
        self.runtime = Some(runtime);
        Ok(())
    }

    async fn teardown_runtime(&mut self) -> Result<()> {
        match self.runtime.take() {
            Some(mut runtime) => {
                debug!("Finalizing device runtime '{}'", runtime.backend_name());
                runtime.finalize().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!(
                "Executor on peer {} dropped without destroy(); the process group was not finalized",
                self.peer_id
            );
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("peer_id", &self.peer_id)
            .field("peer_count", &self.peer_count)
            .field("negotiated", &self.negotiated)
            .field("devices", &self.device_count())
            .field("run_state", &self.run_state)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
