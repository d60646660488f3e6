//! Sequential pipeline offload: chained models take turns on the execution
//! device.
//!
//! Each model in the chain keeps its full weights in host memory and moves
//! wholesale to the execution device when called. Its hook first evicts the
//! previous model in the chain, so at most one chained model is resident at
//! a time. The last model stays resident after its call until the caller
//! releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strata_core::{Device, Tensor};
use strata_nn::{Args, Module, ModuleHook};

use crate::error::Result;
use crate::hooks::to_core_err;

/// Residency state shared between a model's hook and its handle.
struct SequentialOffloadState {
    model: Arc<Module>,
    execution_device: Device,
    resident: AtomicBool,
}

impl SequentialOffloadState {
    fn materialize(&self) -> Result<()> {
        self.model.to_device(self.execution_device, false)?;
        self.resident.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn evict(&self) -> Result<()> {
        if self.resident.swap(false, Ordering::SeqCst) {
            tracing::debug!("evicting pipeline model from {}", self.execution_device);
            self.model.to_device(Device::Cpu, false)?;
        }
        Ok(())
    }
}

struct SequentialOffloadHook {
    state: Arc<SequentialOffloadState>,
    prev: Option<Arc<SequentialOffloadState>>,
}

impl ModuleHook for SequentialOffloadHook {
    fn pre_forward(&self, _module: &Module, mut args: Args) -> strata_core::Result<Args> {
        if let Some(prev) = &self.prev {
            prev.evict().map_err(to_core_err)?;
        }
        self.state.materialize().map_err(to_core_err)?;

        let device = self.state.execution_device;
        args.try_map_tensors(|_, tensor| {
            if tensor.is_meta() || tensor.is_on(device) {
                Ok(None)
            } else {
                tensor.to_device(device, false).map(Some)
            }
        })?;
        Ok(args)
    }

    fn post_forward(&self, _module: &Module, output: Tensor) -> strata_core::Result<Tensor> {
        // Stays resident; the next model in the chain (or the handle)
        // evicts it.
        Ok(output)
    }
}

/// Handle to one chained model's residency.
pub struct OffloadHandle {
    state: Arc<SequentialOffloadState>,
}

impl OffloadHandle {
    /// Evict the model back to host memory now.
    pub fn release(&self) -> Result<()> {
        self.state.evict()
    }

    pub fn is_resident(&self) -> bool {
        self.state.resident.load(Ordering::SeqCst)
    }
}

/// Add `model` to a take-turns offload chain.
///
/// `prev` is the handle of the model called before this one in the
/// pipeline; its weights are evicted when this model is called. Pass the
/// returned handle as `prev` of the next model, and call
/// [`OffloadHandle::release`] on the final one when the pipeline is done.
pub fn cpu_offload_with_hook(
    model: Arc<Module>,
    execution_device: Option<Device>,
    prev: Option<&OffloadHandle>,
) -> Result<(Arc<Module>, OffloadHandle)> {
    let execution_device = execution_device
        .or_else(|| model.first_tensor_device())
        .unwrap_or(Device::Cpu);

    let state = Arc::new(SequentialOffloadState {
        model: model.clone(),
        execution_device,
        resident: AtomicBool::new(false),
    });
    model.add_hook(Arc::new(SequentialOffloadHook {
        state: state.clone(),
        prev: prev.map(|handle| handle.state.clone()),
    }));
    Ok((model, OffloadHandle { state }))
}
