//! Application hooks.
//!
//! A [`CallbackSet`] is the whole contract between the executor and the
//! application: what program to load, how many tasks exist, how to run a
//! task range on a device, and what to do with the results. Three hooks are
//! required (`get_code`, `get_num_tasks`, `on_device_range_exec`); the
//! builder refuses to produce a set without them, so the run path never has
//! to check.
//!
//! User state lives in the closures' captures.
//!
//! # Example
//!
//! ```
//! use keysweep_core::prelude::*;
//!
//! let callbacks = CallbackSet::builder()
//!     .get_code(|_| Some(b"kernel void k() {}".to_vec()))
//!     .get_num_tasks(|_| 1_000)
//!     .on_device_range_exec(|_, device, _, range| {
//!         let len = range.len();
//!         device.queue().submit("count", Box::new(move || {
//!             let _ = len;
//!             Ok(())
//!         }))
//!     })
//!     .device_class(DeviceClass::Cpu)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(callbacks.device_request().class, DeviceClass::Cpu);
//! ```

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::config::{DeviceClass, DeviceRequest};
use crate::device::Device;
use crate::error::{ExecError, Result, Stage};
use crate::event::DeviceEvent;
use crate::partition::TaskRange;

/// Read-only view of the executor passed to every hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HookContext {
    /// This peer's id.
    pub peer_id: u32,
    /// Number of peers.
    pub peer_count: u32,
    /// Total tasks of the current run (0 until sized).
    pub task_total: u64,
    /// Devices on this peer (0 while the runtime is down).
    pub device_count: usize,
}

impl HookContext {
    /// Whether this peer is the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.peer_id == 0
    }
}

/// Decision returned by the range-completion hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    /// Keep going.
    #[default]
    Continue,
    /// Stop after this wave. Not an error.
    Abort,
}

/// Application data shared by all device callbacks of a run.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct GlobalData {
    bytes: Vec<u8>,
}

impl GlobalData {
    /// Wrap a buffer.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Unwrap the buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl Deref for GlobalData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for GlobalData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for GlobalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalData({} bytes)", self.bytes.len())
    }
}

/// Hook run at a lifecycle edge (`on_start`, `on_finish`).
pub type LifecycleHook = Box<dyn FnMut(&HookContext) -> Result<()> + Send>;
/// Hook returning program source.
pub type CodeHook = Box<dyn FnMut(&HookContext) -> Option<Vec<u8>> + Send>;
/// Hook returning build options.
pub type BuildOptionsHook = Box<dyn FnMut(&HookContext) -> Option<String> + Send>;
/// Hook returning the task count.
pub type TaskCountHook = Box<dyn FnMut(&HookContext) -> u64 + Send>;
/// Hook returning the range multiplier.
pub type MultiplierHook = Box<dyn FnMut(&HookContext) -> u32 + Send>;
/// Hook producing global data.
pub type GlobalDataHook = Box<dyn FnMut(&HookContext) -> Result<GlobalData> + Send>;
/// Hook consuming global data at the end of a run.
pub type FreeGlobalDataHook = Box<dyn FnMut(&HookContext, GlobalData) + Send>;
/// Hook told whether compilation succeeded.
pub type CompileHook = Box<dyn FnMut(&HookContext, bool) + Send>;
/// Hook bracketing a device's participation in a run.
pub type DeviceHook = Box<dyn FnMut(&HookContext, &Device, Option<&GlobalData>) -> Result<()> + Send>;
/// Hook launching a task range on a device.
pub type RangeExecHook =
    Box<dyn FnMut(&HookContext, &Device, Option<&GlobalData>, TaskRange) -> Result<DeviceEvent> + Send>;
/// Hook told that a device finished a task range.
pub type RangeDoneHook =
    Box<dyn FnMut(&HookContext, &Device, Option<&GlobalData>, TaskRange) -> Result<Control> + Send>;
/// Hook receiving progress in percent.
pub type ProgressHook = Box<dyn FnMut(f32) + Send>;

/// Validated set of application hooks plus the device request.
pub struct CallbackSet {
    pub(crate) on_start: Option<LifecycleHook>,
    pub(crate) get_code: CodeHook,
    pub(crate) get_build_options: Option<BuildOptionsHook>,
    pub(crate) get_num_tasks: TaskCountHook,
    pub(crate) get_task_range_multiplier: Option<MultiplierHook>,
    pub(crate) get_global_data: Option<GlobalDataHook>,
    pub(crate) free_global_data: Option<FreeGlobalDataHook>,
    pub(crate) on_code_compile: Option<CompileHook>,
    pub(crate) on_device_start: Option<DeviceHook>,
    pub(crate) on_device_range_exec: RangeExecHook,
    pub(crate) on_device_range_done: Option<RangeDoneHook>,
    pub(crate) on_device_finish: Option<DeviceHook>,
    pub(crate) on_finish: Option<LifecycleHook>,
    pub(crate) progress: Option<ProgressHook>,
    pub(crate) device: DeviceRequest,
}

impl CallbackSet {
    /// Start building a callback set.
    pub fn builder() -> CallbackSetBuilder {
        CallbackSetBuilder::new()
    }

    /// Requested device class and cap.
    pub fn device_request(&self) -> DeviceRequest {
        self.device
    }

    pub(crate) fn set_device_request(&mut self, request: DeviceRequest) {
        self.device = request;
    }

    /// Names of the hooks that are set.
    pub fn hook_names(&self) -> Vec<&'static str> {
        let mut names = vec!["get_code", "get_num_tasks", "on_device_range_exec"];
        let optional = [
            ("on_start", self.on_start.is_some()),
            ("get_build_options", self.get_build_options.is_some()),
            ("get_task_range_multiplier", self.get_task_range_multiplier.is_some()),
            ("get_global_data", self.get_global_data.is_some()),
            ("free_global_data", self.free_global_data.is_some()),
            ("on_code_compile", self.on_code_compile.is_some()),
            ("on_device_start", self.on_device_start.is_some()),
            ("on_device_range_done", self.on_device_range_done.is_some()),
            ("on_device_finish", self.on_device_finish.is_some()),
            ("on_finish", self.on_finish.is_some()),
            ("progress", self.progress.is_some()),
        ];
        names.extend(optional.iter().filter(|(_, set)| *set).map(|(n, _)| *n));
        names
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet")
            .field("hooks", &self.hook_names())
            .field("device", &self.device)
            .finish()
    }
}

/// Builder for [`CallbackSet`].
#[derive(Default)]
pub struct CallbackSetBuilder {
    on_start: Option<LifecycleHook>,
    get_code: Option<CodeHook>,
    get_build_options: Option<BuildOptionsHook>,
    get_num_tasks: Option<TaskCountHook>,
    get_task_range_multiplier: Option<MultiplierHook>,
    get_global_data: Option<GlobalDataHook>,
    free_global_data: Option<FreeGlobalDataHook>,
    on_code_compile: Option<CompileHook>,
    on_device_start: Option<DeviceHook>,
    on_device_range_exec: Option<RangeExecHook>,
    on_device_range_done: Option<RangeDoneHook>,
    on_device_finish: Option<DeviceHook>,
    on_finish: Option<LifecycleHook>,
    progress: Option<ProgressHook>,
    device: DeviceRequest,
}

impl CallbackSetBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per run before the source is fetched.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> Result<()> + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Program source. Required; `None` or empty fails the run.
    pub fn get_code<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> Option<Vec<u8>> + Send + 'static,
    {
        self.get_code = Some(Box::new(f));
        self
    }

    /// Compiler flags.
    pub fn get_build_options<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> Option<String> + Send + 'static,
    {
        self.get_build_options = Some(Box::new(f));
        self
    }

    /// Total task count. Required; zero fails the run.
    pub fn get_num_tasks<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> u64 + Send + 'static,
    {
        self.get_num_tasks = Some(Box::new(f));
        self
    }

    /// Chunk-size scale factor; values below 1 clamp to 1.
    pub fn get_task_range_multiplier<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> u32 + Send + 'static,
    {
        self.get_task_range_multiplier = Some(Box::new(f));
        self
    }

    /// Data shared across device callbacks.
    pub fn get_global_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> Result<GlobalData> + Send + 'static,
    {
        self.get_global_data = Some(Box::new(f));
        self
    }

    /// Takes the global data back at the end of a run.
    pub fn free_global_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, GlobalData) + Send + 'static,
    {
        self.free_global_data = Some(Box::new(f));
        self
    }

    /// Told whether compilation succeeded.
    pub fn on_code_compile<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, bool) + Send + 'static,
    {
        self.on_code_compile = Some(Box::new(f));
        self
    }

    /// Per-device setup before the first wave.
    pub fn on_device_start<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, &Device, Option<&GlobalData>) -> Result<()> + Send + 'static,
    {
        self.on_device_start = Some(Box::new(f));
        self
    }

    /// Launch `[start, end)` on a device. Required.
    pub fn on_device_range_exec<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, &Device, Option<&GlobalData>, TaskRange) -> Result<DeviceEvent>
            + Send
            + 'static,
    {
        self.on_device_range_exec = Some(Box::new(f));
        self
    }

    /// Told that a device finished `[start, end)`.
    pub fn on_device_range_done<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, &Device, Option<&GlobalData>, TaskRange) -> Result<Control>
            + Send
            + 'static,
    {
        self.on_device_range_done = Some(Box::new(f));
        self
    }

    /// Per-device teardown after the last wave.
    pub fn on_device_finish<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext, &Device, Option<&GlobalData>) -> Result<()> + Send + 'static,
    {
        self.on_device_finish = Some(Box::new(f));
        self
    }

    /// Called once at the end of every run that got started.
    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: FnMut(&HookContext) -> Result<()> + Send + 'static,
    {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Progress in percent after each wave.
    pub fn progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.progress = Some(Box::new(f));
        self
    }

    /// Device class filter.
    pub fn device_class(mut self, class: DeviceClass) -> Self {
        self.device.class = class;
        self
    }

    /// Device cap (0 = all).
    pub fn max_devices(mut self, max: u32) -> Self {
        self.device.max_devices = max;
        self
    }

    /// Device class and cap together.
    pub fn device_request(mut self, request: DeviceRequest) -> Self {
        self.device = request;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<CallbackSet> {
        let get_code = self
            .get_code
            .ok_or_else(|| ExecError::missing(Stage::Setup, "get_code", "required hook not set"))?;
        let get_num_tasks = self.get_num_tasks.ok_or_else(|| {
            ExecError::missing(Stage::Setup, "get_num_tasks", "required hook not set")
        })?;
        let on_device_range_exec = self.on_device_range_exec.ok_or_else(|| {
            ExecError::missing(Stage::Setup, "on_device_range_exec", "required hook not set")
        })?;

        Ok(CallbackSet {
            on_start: self.on_start,
            get_code,
            get_build_options: self.get_build_options,
            get_num_tasks,
            get_task_range_multiplier: self.get_task_range_multiplier,
            get_global_data: self.get_global_data,
            free_global_data: self.free_global_data,
            on_code_compile: self.on_code_compile,
            on_device_start: self.on_device_start,
            on_device_range_exec,
            on_device_range_done: self.on_device_range_done,
            on_device_finish: self.on_device_finish,
            on_finish: self.on_finish,
            progress: self.progress,
            device: self.device,
        })
    }
}
