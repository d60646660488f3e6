use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Compute device for tensor storage and operations.
///
/// Note that this only covers devices computation can actually run on.
/// Disk is a memory *tier*, not a device; it lives in `strata-dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host CPU
    #[default]
    Cpu,
    /// CUDA GPU with device index
    Cuda(usize),
}

impl Device {
    /// Whether this is the CPU device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the CUDA device index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(idx) = s.strip_prefix("cuda:") {
            let idx = idx
                .parse::<usize>()
                .map_err(|_| CoreError::InvalidDevice(s.to_string()))?;
            return Ok(Device::Cuda(idx));
        }
        // Bare integers are accepted as accelerator indices.
        if let Ok(idx) = s.parse::<usize>() {
            return Ok(Device::Cuda(idx));
        }
        Err(CoreError::InvalidDevice(s.to_string()))
    }
}
