//! Scoped placement for freshly created parameters.
//!
//! Model builders take an [`InitScope`] saying where the tensors they create
//! should live. [`InitScope::Meta`] builds shape/dtype placeholders without
//! allocating anything, so an arbitrarily large architecture can be
//! constructed first and materialized later from a checkpoint. The scope is
//! an explicit argument, not ambient state: whoever creates tensors receives
//! it and applies it.

use strata_core::{DType, Device, Result, Tensor};

use crate::module::Module;

/// Where tensors created during model construction land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitScope {
    /// Allocate in host memory.
    #[default]
    Allocated,
    /// Create meta placeholders carrying shape and dtype only.
    Meta,
    /// Allocate directly on a device.
    OnDevice(Device),
}

impl InitScope {
    /// Place a freshly built tensor according to the scope.
    ///
    /// Under `Meta` the tensor's data is discarded; only its metadata
    /// survives.
    pub fn place(&self, tensor: Tensor) -> Result<Tensor> {
        match self {
            InitScope::Allocated => Ok(tensor),
            InitScope::Meta => Ok(tensor.to_meta()),
            InitScope::OnDevice(device) => tensor.to_device(*device, false),
        }
    }

    /// A zero tensor in this scope. `Meta` skips the allocation entirely.
    pub fn zeros(&self, shape: &[usize], dtype: DType) -> Result<Tensor> {
        match self {
            InitScope::Meta => Ok(Tensor::meta(shape, dtype)),
            _ => self.place(Tensor::zeros(shape, dtype)),
        }
    }

    /// Re-place every parameter and buffer of a freshly built tree.
    ///
    /// For builders that allocate eagerly before the scope is applied.
    pub fn apply(&self, module: &Module) -> Result<()> {
        for (_, slot, _) in module.named_tensors() {
            let placed = self.place(slot.get())?;
            slot.set(placed);
        }
        Ok(())
    }
}
