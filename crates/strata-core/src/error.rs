use crate::{DType, Device};

/// Errors from the tensor substrate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("cannot cast {from} to {to}")]
    UnsupportedCast { from: DType, to: DType },

    #[error("operation requires allocated storage, but the tensor is a meta placeholder")]
    MetaTensor,

    #[error("invalid device spec '{0}'")]
    InvalidDevice(String),

    #[error("device {0} is not available: {1}")]
    DeviceUnavailable(Device, String),
}
