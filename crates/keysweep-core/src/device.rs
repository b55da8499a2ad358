//! Device-runtime capability traits.
//!
//! The executor never talks to a concrete backend. It asks a
//! [`RuntimeProvider`] for a [`DeviceRuntime`] matching the negotiated
//! [`DeviceRequest`], loads the application's program through it, and hands
//! each [`Device`] to the application's range callbacks. Backends live in
//! their own crates (`keysweep-cpu` ships the host backend).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{DeviceClass, DeviceRequest};
use crate::error::{ExecError, Result, Stage};
use crate::event::DeviceEvent;

/// Information about one compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the peer's device list.
    pub index: usize,
    /// Device name.
    pub name: String,
    /// Device class.
    pub class: DeviceClass,
    /// Maximum work-items per workgroup.
    pub workgroup_size: u64,
    /// Number of compute units.
    pub compute_units: u64,
    /// Global memory in bytes (0 if unknown).
    pub global_memory: u64,
}

impl DeviceInfo {
    /// Create a new device info with unit geometry.
    pub fn new(index: usize, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            index,
            name: name.into(),
            class,
            workgroup_size: 1,
            compute_units: 1,
            global_memory: 0,
        }
    }

    /// Set workgroup size and compute-unit count.
    pub fn with_geometry(mut self, workgroup_size: u64, compute_units: u64) -> Self {
        self.workgroup_size = workgroup_size;
        self.compute_units = compute_units;
        self
    }

    /// Set global memory size.
    pub fn with_global_memory(mut self, bytes: u64) -> Self {
        self.global_memory = bytes;
        self
    }

    /// Throughput proxy: `workgroup_size * compute_units`.
    pub fn capacity(&self) -> u64 {
        self.workgroup_size.saturating_mul(self.compute_units)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}, wg={}, cu={})",
            self.index, self.name, self.class, self.workgroup_size, self.compute_units
        )
    }
}

/// A loaded program.
///
/// Holds the source and the build options it was built with, plus the
/// `-D NAME[=VALUE]` defines parsed out of those options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    source: Arc<[u8]>,
    options: Option<String>,
    defines: BTreeMap<String, String>,
}

impl Program {
    /// Parse build options and wrap the source.
    ///
    /// Fails on empty source or a malformed `-D` flag.
    pub fn build(source: &[u8], options: Option<&str>) -> Result<Self> {
        if source.is_empty() {
            return Err(ExecError::runtime_op(Stage::PreRun, "program source is empty"));
        }

        let mut defines = BTreeMap::new();
        if let Some(opts) = options {
            let mut tokens = opts.split_whitespace();
            while let Some(token) = tokens.next() {
                let def = if token == "-D" {
                    tokens.next().ok_or_else(|| {
                        ExecError::runtime_op(Stage::PreRun, "build option -D without a name")
                    })?
                } else if let Some(rest) = token.strip_prefix("-D") {
                    rest
                } else {
                    continue;
                };
                let (name, value) = match def.split_once('=') {
                    Some((n, v)) => (n, v),
                    None => (def, "1"),
                };
                if name.is_empty() {
                    return Err(ExecError::runtime_op(
                        Stage::PreRun,
                        format!("malformed define '{}'", token),
                    ));
                }
                defines.insert(name.to_string(), value.to_string());
            }
        }

        Ok(Self {
            source: Arc::from(source),
            options: options.map(str::to_string),
            defines,
        })
    }

    /// Program source.
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// Source as UTF-8, if it is valid text.
    pub fn source_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.source).ok()
    }

    /// Build options the program was built with.
    pub fn options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    /// Value of a `-D` define.
    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    /// All defines.
    pub fn defines(&self) -> &BTreeMap<String, String> {
        &self.defines
    }
}

/// Shared slot holding the currently loaded program.
pub type ProgramSlot = Arc<RwLock<Option<Arc<Program>>>>;

/// Unit of host-side work submitted to a command queue.
pub type HostJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// In-order command queue of one device.
pub trait CommandQueue: Send + Sync {
    /// Stage a job; it starts no later than the next [`flush`](Self::flush).
    fn submit(&self, label: &str, job: HostJob) -> Result<DeviceEvent>;

    /// Make later commands on this queue wait for `event`.
    fn enqueue_wait(&self, event: &DeviceEvent) -> Result<()>;

    /// Issue all staged commands to the device.
    fn flush(&self) -> Result<()>;

    /// Commands staged or running.
    fn depth(&self) -> usize;
}

/// A device as handed to application callbacks.
#[derive(Clone)]
pub struct Device {
    info: DeviceInfo,
    queue: Arc<dyn CommandQueue>,
    program: ProgramSlot,
}

impl Device {
    /// Assemble a device from its parts. Called by backends.
    pub fn new(info: DeviceInfo, queue: Arc<dyn CommandQueue>, program: ProgramSlot) -> Self {
        Self {
            info,
            queue,
            program,
        }
    }

    /// Device info.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device index.
    pub fn index(&self) -> usize {
        self.info.index
    }

    /// The device's command queue.
    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    /// The program currently loaded on the runtime.
    pub fn program(&self) -> Option<Arc<Program>> {
        self.program.read().clone()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}

/// A brought-up device runtime exposing one or more devices.
#[async_trait]
pub trait DeviceRuntime: Send + Sync {
    /// Backend name, for diagnostics.
    fn backend_name(&self) -> &str;

    /// The request this runtime was created for.
    fn request(&self) -> DeviceRequest;

    /// Devices in dispatch order.
    fn devices(&self) -> &[Device];

    /// Whether the runtime can accept work.
    fn is_usable(&self) -> bool;

    /// Build `source` with `options` and make it the current program.
    async fn load_program(&mut self, source: &[u8], options: Option<&str>) -> Result<()>;

    /// The currently loaded program.
    fn program(&self) -> Option<Arc<Program>>;

    /// Tear the runtime down. Called exactly once.
    async fn finalize(&mut self) -> Result<()>;
}

/// Factory for device runtimes.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Provider name, for diagnostics.
    fn name(&self) -> &str;

    /// Bring up a runtime for `request`.
    async fn create(&self, request: DeviceRequest) -> Result<Box<dyn DeviceRuntime>>;
}
