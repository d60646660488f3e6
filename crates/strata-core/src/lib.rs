//! # strata-core
//!
//! Tensor substrate for the strata dispatch framework.
//!
//! Provides the foundational `Tensor` type with:
//! - Float and index dtypes (F16, BF16, F32, F64, I64)
//! - CPU and CUDA device support
//! - Reference-counted storage with a stable identity address
//! - Symbolic *meta* tensors: shape/dtype metadata with no allocated backing
//!   memory, used as placeholders for offloaded parameters

pub mod device;
pub mod dtype;
pub mod error;
pub mod storage;
pub mod tensor;

pub use device::Device;
pub use dtype::DType;
pub use error::CoreError;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, CoreError>;
