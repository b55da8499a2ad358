//! CPU runtime implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keysweep_core::config::{DeviceClass, DeviceRequest};
use keysweep_core::device::{
    CommandQueue, Device, DeviceInfo, DeviceRuntime, Program, ProgramSlot, RuntimeProvider,
};
use keysweep_core::error::{ExecError, Result, Stage};

use crate::queue::{reap, CpuQueue, JOIN_GRACE};

/// Geometry of the simulated CPU devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Number of devices to expose.
    pub devices: usize,
    /// Reported workgroup size.
    pub workgroup_size: u64,
    /// Reported compute units per device.
    pub compute_units: u64,
    /// Device name prefix.
    pub name: String,
}

impl Default for CpuConfig {
    fn default() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        Self {
            devices: 1,
            workgroup_size: 64,
            compute_units,
            name: "Host CPU".to_string(),
        }
    }
}

impl CpuConfig {
    /// Set the number of devices.
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Set workgroup size and compute units.
    pub fn with_geometry(mut self, workgroup_size: u64, compute_units: u64) -> Self {
        self.workgroup_size = workgroup_size;
        self.compute_units = compute_units;
        self
    }
}

/// Creates [`CpuRuntime`]s.
///
/// Counts runtimes created and finalized, which makes runtime reuse
/// observable.
#[derive(Debug, Default)]
pub struct CpuProvider {
    config: CpuConfig,
    created: AtomicUsize,
    finalized: Arc<AtomicUsize>,
}

impl CpuProvider {
    /// Create a provider.
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            created: AtomicUsize::new(0),
            finalized: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Device geometry.
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Runtimes created so far.
    pub fn runtimes_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Runtimes finalized so far.
    pub fn runtimes_finalized(&self) -> usize {
        self.finalized.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RuntimeProvider for CpuProvider {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn create(&self, request: DeviceRequest) -> Result<Box<dyn DeviceRuntime>> {
        if !request.class.accepts(DeviceClass::Cpu) {
            return Err(ExecError::runtime_init(
                Stage::Setup,
                format!("cpu backend has no {} devices", request.class),
            ));
        }
        let count = request.cap(self.config.devices);
        if count == 0 {
            return Err(ExecError::runtime_init(
                Stage::Setup,
                "cpu backend configured with zero devices",
            ));
        }

        let runtime = CpuRuntime::start(&self.config, request, count, Arc::clone(&self.finalized))?;
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(runtime))
    }
}

/// CPU-based implementation of [`DeviceRuntime`].
///
/// Each device is a worker thread with an in-order [`CpuQueue`].
pub struct CpuRuntime {
    request: DeviceRequest,
    devices: Vec<Device>,
    queues: Vec<Arc<CpuQueue>>,
    program: ProgramSlot,
    finalized: bool,
    finalize_count: Arc<AtomicUsize>,
}

impl CpuRuntime {
    fn start(
        config: &CpuConfig,
        request: DeviceRequest,
        count: usize,
        finalize_count: Arc<AtomicUsize>,
    ) -> Result<Self> {
        info!("Initializing CPU runtime with {} device(s)", count);

        let program: ProgramSlot = Arc::new(RwLock::new(None));
        let mut devices = Vec::with_capacity(count);
        let mut queues = Vec::with_capacity(count);
        for index in 0..count {
            let queue = Arc::new(CpuQueue::spawn(index)?);
            let info = DeviceInfo::new(
                index,
                format!("{} #{}", config.name, index),
                DeviceClass::Cpu,
            )
            .with_geometry(config.workgroup_size, config.compute_units);
            debug!("CPU device {}", info);

            let shared: Arc<dyn CommandQueue> = queue.clone();
            devices.push(Device::new(info, shared, Arc::clone(&program)));
            queues.push(queue);
        }

        Ok(Self {
            request,
            devices,
            queues,
            program,
            finalized: false,
            finalize_count,
        })
    }

    /// Whether [`finalize`](DeviceRuntime::finalize) has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn stop_workers(&self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}

#[async_trait]
impl DeviceRuntime for CpuRuntime {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn request(&self) -> DeviceRequest {
        self.request
    }

    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn is_usable(&self) -> bool {
        !self.finalized && !self.devices.is_empty() && !self.queues.iter().any(|q| q.is_closed())
    }

    async fn load_program(&mut self, source: &[u8], options: Option<&str>) -> Result<()> {
        if self.finalized {
            return Err(ExecError::runtime_op(
                Stage::PreRun,
                "cpu runtime is finalized",
            ));
        }
        let program = Program::build(source, options)?;
        debug!(
            "Built program: {} bytes, {} define(s)",
            program.source().len(),
            program.defines().len()
        );
        *self.program.write() = Some(Arc::new(program));
        Ok(())
    }

    fn program(&self) -> Option<Arc<Program>> {
        self.program.read().clone()
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        info!("Shutting down CPU runtime");
        for queue in &self.queues {
            queue.close();
        }
        let workers: Vec<_> = self
            .queues
            .iter()
            .filter_map(|q| q.take_worker().map(|w| (q.device_index(), w)))
            .collect();
        // Reaping blocks for up to JOIN_GRACE per worker.
        tokio::task::spawn_blocking(move || {
            for (index, worker) in workers {
                reap(index, worker, JOIN_GRACE);
            }
        })
        .await
        .map_err(|e| {
            ExecError::runtime_op(Stage::Teardown, format!("worker reap failed: {}", e))
        })?;
        *self.program.write() = None;
        self.finalized = true;
        self.finalize_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for CpuRuntime {
    fn drop(&mut self) {
        if !self.finalized {
            self.stop_workers();
        }
    }
}
