//! Capability wrapper around a dispatched model.

use std::sync::Arc;

use strata_core::{Device, Tensor};
use strata_nn::{Args, Module};

use crate::device_map::DeviceMap;
use crate::error::{DispatchError, Result};

/// A model placed across tiers, plus the resolved map for introspection.
///
/// Whole-model moves go through [`DispatchedModel::to_device`], which knows
/// the placement and refuses to scramble an offloaded model.
#[derive(Debug)]
pub struct DispatchedModel {
    model: Arc<Module>,
    device_map: DeviceMap,
    main_device: Device,
}

impl DispatchedModel {
    pub(crate) fn new(model: Arc<Module>, device_map: DeviceMap, main_device: Device) -> Self {
        Self {
            model,
            device_map,
            main_device,
        }
    }

    pub fn model(&self) -> &Arc<Module> {
        &self.model
    }

    pub fn device_map(&self) -> &DeviceMap {
        &self.device_map
    }

    pub fn main_device(&self) -> Device {
        self.main_device
    }

    pub fn forward(&self, args: Args) -> strata_core::Result<Tensor> {
        self.model.forward(args)
    }

    /// Whether any parameter or buffer currently rests as a meta placeholder.
    pub fn has_offloaded_tensors(&self) -> bool {
        self.model
            .named_tensors()
            .iter()
            .any(|(_, slot, _)| slot.get().is_meta())
    }

    /// Move every tensor of the model to one device.
    ///
    /// This defeats the placement the model was dispatched with, so it
    /// always warns. It fails without mutating anything when offloaded
    /// (meta) tensors are present: those have no bytes to move.
    pub fn to_device(&self, device: Device) -> Result<()> {
        tracing::warn!(
            "moving a dispatched model to {device}; its device map no longer applies"
        );
        if self.has_offloaded_tensors() {
            return Err(DispatchError::OffloadedModelMoved);
        }
        for (_, slot, _) in self.model.named_tensors() {
            let tensor = slot.get();
            slot.set(tensor.to_device(device, false)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata_core::{DType, Tensor};

    fn wrapped(meta: bool) -> DispatchedModel {
        let mut leaf = Module::new("Leaf");
        if meta {
            leaf.add_param("weight", Tensor::meta(&[2], DType::F32));
        } else {
            leaf.add_param("weight", Tensor::from_f32(&[1.0, 2.0], &[2]));
        }
        let model = Arc::new(Module::new("Root").with_child("leaf", leaf));
        DispatchedModel::new(model, BTreeMap::new(), Device::Cpu)
    }

    #[test]
    fn test_move_fully_placed_model_succeeds() {
        let model = wrapped(false);
        assert!(!model.has_offloaded_tensors());
        model.to_device(Device::Cpu).unwrap();
    }

    #[test]
    fn test_move_offloaded_model_fails() {
        let model = wrapped(true);
        assert!(model.has_offloaded_tensors());
        assert!(matches!(
            model.to_device(Device::Cpu),
            Err(DispatchError::OffloadedModelMoved)
        ));
    }
}
