//! Host (CPU) backend for keysweep.
//!
//! Every device is a worker thread behind an in-order command queue. Useful
//! on machines without accelerators, and as the backend the executor is
//! tested against.
//!
//! ```
//! use keysweep_core::device::RuntimeProvider;
//! use keysweep_cpu::{CpuConfig, CpuProvider};
//!
//! let provider = CpuProvider::new(CpuConfig::default().with_devices(2));
//! assert_eq!(provider.name(), "cpu");
//! ```

#![warn(missing_docs)]

mod queue;
mod runtime;

pub use queue::CpuQueue;
pub use runtime::{CpuConfig, CpuProvider, CpuRuntime};
