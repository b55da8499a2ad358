//! Configuration for the executor.
//!
//! Device selection (`DeviceRequest`) has to agree across every peer, so it
//! is negotiated once by broadcast from the coordinator during setup. The
//! rest of [`ExecutorConfig`] is local to each process.
//!
//! # Example
//!
//! ```
//! use keysweep_core::config::{DeviceClass, ExecutorConfig};
//!
//! let config = ExecutorConfig::from_toml_str(
//!     r#"
//!     wave_timeout_ms = 30000
//!
//!     [device]
//!     class = "gpu"
//!     max_devices = 4
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.device.class, DeviceClass::Gpu);
//! assert_eq!(config.device.max_devices, 4);
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};

/// Class of compute device to request from the device runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Host processors only.
    Cpu,
    /// Accelerators only.
    Gpu,
    /// Whatever the runtime exposes.
    #[default]
    Any,
}

impl DeviceClass {
    /// Wire encoding used by the setup broadcast.
    pub const fn to_wire(self) -> u32 {
        match self {
            DeviceClass::Cpu => 1,
            DeviceClass::Gpu => 2,
            DeviceClass::Any => 0,
        }
    }

    /// Decode the wire value received from the coordinator.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(DeviceClass::Any),
            1 => Some(DeviceClass::Cpu),
            2 => Some(DeviceClass::Gpu),
            _ => None,
        }
    }

    /// Whether a device of class `other` satisfies this request.
    pub fn accepts(self, other: DeviceClass) -> bool {
        self == DeviceClass::Any || self == other
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Cpu => "cpu",
            DeviceClass::Gpu => "gpu",
            DeviceClass::Any => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceClass {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            "any" | "all" => Ok(DeviceClass::Any),
            other => Err(ExecError::InvalidParameter(format!(
                "unknown device class '{}'",
                other
            ))),
        }
    }
}

/// Device class and cap requested from the runtime.
///
/// `max_devices == 0` means no cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRequest {
    /// Device class filter.
    pub class: DeviceClass,
    /// Maximum number of devices to use (0 = all).
    pub max_devices: u32,
}

impl DeviceRequest {
    /// Create a new request.
    pub fn new(class: DeviceClass, max_devices: u32) -> Self {
        Self { class, max_devices }
    }

    /// Encode for broadcast.
    pub fn to_wire(self) -> [u32; 2] {
        [self.class.to_wire(), self.max_devices]
    }

    /// Decode a broadcast payload.
    pub fn from_wire(data: [u32; 2]) -> Result<Self> {
        let class = DeviceClass::from_wire(data[0]).ok_or_else(|| {
            ExecError::InvalidParameter(format!("invalid device class on the wire: {}", data[0]))
        })?;
        Ok(Self {
            class,
            max_devices: data[1],
        })
    }

    /// Apply the cap to a number of available devices.
    pub fn cap(&self, available: usize) -> usize {
        if self.max_devices == 0 {
            available
        } else {
            available.min(self.max_devices as usize)
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max_devices == 0 {
            write!(f, "{} (all devices)", self.class)
        } else {
            write!(f, "{} (max {})", self.class, self.max_devices)
        }
    }
}

/// Process-local executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default device request for callback sets built from this config.
    pub device: DeviceRequest,
    /// Upper bound on a single wave's wait, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_timeout_ms: Option<u64>,
    /// Range multiplier used when the application supplies none.
    pub default_range_multiplier: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            device: DeviceRequest::default(),
            wave_timeout_ms: None,
            default_range_multiplier: 1,
        }
    }
}

impl ExecutorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| ExecError::InvalidParameter(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExecError::InvalidParameter(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ExecError::InvalidParameter(format!("cannot encode config: {}", e)))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.wave_timeout_ms == Some(0) {
            return Err(ExecError::InvalidParameter(
                "wave_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the device request.
    pub fn with_device(mut self, class: DeviceClass, max_devices: u32) -> Self {
        self.device = DeviceRequest::new(class, max_devices);
        self
    }

    /// Set the wave timeout.
    pub fn with_wave_timeout(mut self, timeout: Duration) -> Self {
        self.wave_timeout_ms = Some(timeout.as_millis().max(1) as u64);
        self
    }

    /// Set the fallback range multiplier.
    pub fn with_default_range_multiplier(mut self, multiplier: u32) -> Self {
        self.default_range_multiplier = multiplier;
        self
    }

    /// Wave timeout as a duration.
    pub fn wave_timeout(&self) -> Option<Duration> {
        self.wave_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_device_class_wire() {
        for class in [DeviceClass::Cpu, DeviceClass::Gpu, DeviceClass::Any] {
            assert_eq!(DeviceClass::from_wire(class.to_wire()), Some(class));
        }
        assert_eq!(DeviceClass::from_wire(7), None);
    }

    #[test]
    fn test_device_class_parse() {
        assert_eq!("GPU".parse::<DeviceClass>().unwrap(), DeviceClass::Gpu);
        assert_eq!("all".parse::<DeviceClass>().unwrap(), DeviceClass::Any);
        assert!("fpga".parse::<DeviceClass>().is_err());
        assert!(DeviceClass::Any.accepts(DeviceClass::Gpu));
        assert!(!DeviceClass::Cpu.accepts(DeviceClass::Gpu));
    }

    #[test]
    fn test_request_cap() {
        assert_eq!(DeviceRequest::new(DeviceClass::Any, 0).cap(8), 8);
        assert_eq!(DeviceRequest::new(DeviceClass::Any, 2).cap(8), 2);
        assert_eq!(DeviceRequest::new(DeviceClass::Any, 16).cap(8), 8);
    }

    #[test]
    fn test_request_bad_wire() {
        assert!(DeviceRequest::from_wire([9, 1]).is_err());
        let req = DeviceRequest::from_wire([2, 3]).unwrap();
        assert_eq!(req, DeviceRequest::new(DeviceClass::Gpu, 3));
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = ExecutorConfig::from_toml_str("").unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(config.wave_timeout(), None);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(ExecutorConfig::from_toml_str("wave_timeout_ms = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_range_multiplier = 4").unwrap();
        writeln!(file, "[device]").unwrap();
        writeln!(file, "class = \"cpu\"").unwrap();

        let config = ExecutorConfig::load(file.path()).unwrap();
        assert_eq!(config.default_range_multiplier, 4);
        assert_eq!(config.device.class, DeviceClass::Cpu);
        assert_eq!(config.device.max_devices, 0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ExecutorConfig::default()
            .with_device(DeviceClass::Gpu, 2)
            .with_wave_timeout(Duration::from_secs(5));
        let text = config.to_toml_string().unwrap();
        assert_eq!(ExecutorConfig::from_toml_str(&text).unwrap(), config);
    }
}
