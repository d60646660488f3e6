//! Device-alignment hooks: materialize weights before a module's computation,
//! evict offloaded weights after it.
//!
//! One hook is attached per module that directly owns tensors (plus one
//! whole-subtree hook per preload class). Offloaded slots rest as meta
//! placeholders between calls; the hook writes real tensors into them during
//! `pre_forward` and restores meta in `post_forward`. Tied weights go through
//! the shared [`TiedParamMap`] so each allocation materializes at most once
//! per device.

use std::sync::Arc;

use parking_lot::Mutex;

use strata_core::{CoreError, Device, Tensor};
use strata_nn::{join_path, Args, Module, ModuleHook, Param};

use crate::device_map::NormalizedDeviceMap;
use crate::error::{DispatchError, Result};
use crate::tied::TiedParamMap;
use crate::weights::WeightsMap;

/// Collapse a dispatch error into the core error hooks must return.
pub(crate) fn to_core_err(err: DispatchError) -> CoreError {
    match err {
        DispatchError::Core(core) => core,
        other => CoreError::Storage(other.to_string()),
    }
}

/// Forward hook that aligns a module's weights and inputs with its
/// execution device.
pub struct AlignDeviceHook {
    path: String,
    execution_device: Option<Device>,
    offload: bool,
    offload_buffers: bool,
    place_submodules: bool,
    io_same_device: bool,
    skip_keys: Vec<String>,
    non_blocking: bool,
    weights: Option<Arc<WeightsMap>>,
    tied: Option<Arc<TiedParamMap>>,
    input_device: Mutex<Option<Device>>,
}

impl AlignDeviceHook {
    pub fn new(path: impl Into<String>, execution_device: Option<Device>) -> Self {
        Self {
            path: path.into(),
            execution_device,
            offload: false,
            offload_buffers: false,
            place_submodules: false,
            io_same_device: false,
            skip_keys: Vec::new(),
            non_blocking: false,
            weights: None,
            tied: None,
            input_device: Mutex::new(None),
        }
    }

    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    pub fn with_offload_buffers(mut self, offload_buffers: bool) -> Self {
        self.offload_buffers = offload_buffers;
        self
    }

    pub fn with_place_submodules(mut self, place_submodules: bool) -> Self {
        self.place_submodules = place_submodules;
        self
    }

    pub fn with_io_same_device(mut self, io_same_device: bool) -> Self {
        self.io_same_device = io_same_device;
        self
    }

    pub fn with_skip_keys(mut self, skip_keys: Vec<String>) -> Self {
        self.skip_keys = skip_keys;
        self
    }

    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    pub fn with_weights(mut self, weights: Arc<WeightsMap>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_tied(mut self, tied: Arc<TiedParamMap>) -> Self {
        self.tied = Some(tied);
        self
    }

    pub fn execution_device(&self) -> Option<Device> {
        self.execution_device
    }

    pub fn is_offload(&self) -> bool {
        self.offload
    }

    /// The slots this hook manages, with module-relative names.
    fn covered(&self, module: &Module) -> Vec<(String, Param, bool)> {
        if self.place_submodules {
            module.named_tensors()
        } else {
            let mut out: Vec<(String, Param, bool)> = Vec::new();
            for (name, slot) in module.params() {
                out.push((name.clone(), slot.clone(), false));
            }
            for (name, slot) in module.buffers() {
                out.push((name.clone(), slot.clone(), true));
            }
            out
        }
    }

    /// Ensure one slot holds a real tensor on `device`.
    ///
    /// Resident data is moved; meta placeholders are filled from the tied
    /// cache first, then the weights source.
    fn place_slot(&self, full_name: &str, slot: &Param, device: Device) -> Result<()> {
        let current = slot.get();
        if !current.is_meta() {
            if !current.is_on(device) {
                slot.set(current.to_device(device, self.non_blocking)?);
            }
            return Ok(());
        }

        if let Some(tied) = &self.tied {
            if let Some(cached) = tied.get(full_name, device) {
                slot.set(cached);
                return Ok(());
            }
        }

        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| DispatchError::MetaParameter(full_name.to_string()))?;
        let value = weights.get(full_name)?;
        let placed = value.to_device(device, self.non_blocking)?;
        if let Some(tied) = &self.tied {
            tied.populate(full_name, device, &placed);
        }
        slot.set(placed);
        Ok(())
    }

    fn materialize_all(&self, module: &Module, device: Device) -> Result<()> {
        for (rel, slot, _) in self.covered(module) {
            let full = join_path(&self.path, &rel);
            self.place_slot(&full, &slot, device)?;
        }
        Ok(())
    }

    fn evict_all(&self, module: &Module) {
        for (_, slot, is_buffer) in self.covered(module) {
            if is_buffer && !self.offload_buffers {
                continue;
            }
            let tensor = slot.get();
            if !tensor.is_meta() {
                slot.set(tensor.to_meta());
            }
        }
    }

    /// Attach-time placement.
    ///
    /// Offload hooks evict their slots to meta right away (buffers stay
    /// resident unless `offload_buffers`); plain alignment hooks place
    /// everything on the execution device now.
    pub fn init(&self, module: &Module) -> Result<()> {
        let Some(device) = self.execution_device else {
            return Ok(());
        };
        if self.offload {
            for (rel, slot, is_buffer) in self.covered(module) {
                if is_buffer && !self.offload_buffers {
                    let full = join_path(&self.path, &rel);
                    self.place_slot(&full, &slot, device)?;
                    continue;
                }
                let tensor = slot.get();
                if !tensor.is_meta() {
                    slot.set(tensor.to_meta());
                }
            }
        } else {
            self.materialize_all(module, device)?;
        }
        Ok(())
    }
}

impl ModuleHook for AlignDeviceHook {
    fn pre_forward(&self, module: &Module, mut args: Args) -> strata_core::Result<Args> {
        if self.io_same_device {
            *self.input_device.lock() = args.input().and_then(|t| t.device());
        }
        let Some(device) = self.execution_device else {
            return Ok(args);
        };

        if self.offload {
            self.materialize_all(module, device).map_err(to_core_err)?;
        } else {
            // An offloaded sibling sharing a tied slot evicts it to meta
            // even though this module is not offloaded itself.
            for (rel, slot, _) in self.covered(module) {
                if slot.get().is_meta() {
                    let full = join_path(&self.path, &rel);
                    self.place_slot(&full, &slot, device).map_err(to_core_err)?;
                }
            }
        }

        args.try_map_tensors(|key, tensor| {
            if self.skip_keys.iter().any(|k| k == key)
                || tensor.is_meta()
                || tensor.is_on(device)
            {
                Ok(None)
            } else {
                tensor.to_device(device, self.non_blocking).map(Some)
            }
        })?;
        Ok(args)
    }

    fn post_forward(&self, module: &Module, mut output: Tensor) -> strata_core::Result<Tensor> {
        if self.offload {
            self.evict_all(module);
        }
        if self.io_same_device {
            if let Some(device) = self.input_device.lock().take() {
                if !output.is_meta() && !output.is_on(device) {
                    output = output.to_device(device, self.non_blocking)?;
                }
            }
        }
        Ok(output)
    }
}

/// Shared knobs for hook installation.
#[derive(Clone, Default)]
pub struct AttachOptions {
    pub execution_device: Option<Device>,
    pub offload: bool,
    pub offload_buffers: bool,
    pub weights: Option<Arc<WeightsMap>>,
    pub tied: Option<Arc<TiedParamMap>>,
    pub skip_keys: Vec<String>,
    pub preload_classes: Vec<String>,
    pub non_blocking: bool,
}

fn build_hook(
    path: &str,
    execution_device: Option<Device>,
    offload: bool,
    place_submodules: bool,
    opts: &AttachOptions,
) -> AlignDeviceHook {
    let mut hook = AlignDeviceHook::new(path, execution_device)
        .with_offload(offload)
        .with_offload_buffers(opts.offload_buffers)
        .with_place_submodules(place_submodules)
        .with_skip_keys(opts.skip_keys.clone())
        .with_non_blocking(opts.non_blocking);
    if let Some(weights) = &opts.weights {
        hook = hook.with_weights(weights.clone());
    }
    if let Some(tied) = &opts.tied {
        hook = hook.with_tied(tied.clone());
    }
    hook
}

/// Attach an alignment hook to the root so outputs come back on the input's
/// device.
pub fn attach_io_hook(module: &Arc<Module>) {
    module.add_hook(Arc::new(
        AlignDeviceHook::new("", None).with_io_same_device(true),
    ));
}

/// Recursively attach offload-style hooks with one shared execution device.
///
/// Every module that directly owns tensors gets a hook. A module whose class
/// is in `preload_classes` gets a single whole-subtree hook instead, and
/// recursion stops there.
pub fn attach_align_device_hook(module: &Arc<Module>, opts: &AttachOptions) -> Result<()> {
    attach_recursive(module, "", opts)
}

fn attach_recursive(module: &Arc<Module>, path: &str, opts: &AttachOptions) -> Result<()> {
    let preload = opts
        .preload_classes
        .iter()
        .any(|class| class == module.class_name());
    if module.has_own_tensors() || preload {
        let hook = build_hook(path, opts.execution_device, opts.offload, preload, opts);
        hook.init(module)?;
        module.add_hook(Arc::new(hook));
    }
    if preload {
        return Ok(());
    }
    for (name, child) in module.children() {
        attach_recursive(child, &join_path(path, name), opts)?;
    }
    Ok(())
}

/// Attach per-module hooks resolved through a normalized device map.
///
/// The root gets the io-alignment hook first so its `post_forward` runs
/// last. Each tensor-owning module then gets a hook with its resolved
/// execution device and offload flag.
pub fn attach_hooks_on_blocks(
    module: &Arc<Module>,
    normalized: &NormalizedDeviceMap,
    opts: &AttachOptions,
) -> Result<()> {
    attach_io_hook(module);
    attach_blocks_recursive(module, "", normalized, opts)
}

fn attach_blocks_recursive(
    module: &Arc<Module>,
    path: &str,
    normalized: &NormalizedDeviceMap,
    opts: &AttachOptions,
) -> Result<()> {
    let preload = opts
        .preload_classes
        .iter()
        .any(|class| class == module.class_name());
    if module.has_own_tensors() || preload {
        let device = normalized.execution_device(path);
        let offload = normalized.is_offloaded(path);
        let hook = build_hook(path, Some(device), offload, preload, opts);
        hook.init(module)?;
        module.add_hook(Arc::new(hook));
    }
    if preload {
        return Ok(());
    }
    for (name, child) in module.children() {
        attach_blocks_recursive(child, &join_path(path, name), normalized, opts)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata_core::Tensor;
    use strata_nn::linear_from_weights;

    fn chain_model() -> Arc<Module> {
        let w0 = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let w1 = Tensor::from_f32(&[2.0, 0.0, 0.0, 2.0], &[2, 2]);
        Arc::new(
            Module::new("Sequential")
                .with_child("0", linear_from_weights(w0, None))
                .with_child("1", linear_from_weights(w1, None)),
        )
    }

    fn all_meta(model: &Module) -> bool {
        model
            .named_tensors()
            .iter()
            .all(|(_, slot, _)| slot.get().is_meta())
    }

    #[test]
    fn test_offload_hooks_evict_and_restore() {
        let model = chain_model();
        let expected = model
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2])))
            .unwrap();

        let weights = Arc::new(WeightsMap::from_state(model.state_dict()));
        let opts = AttachOptions {
            execution_device: Some(Device::Cpu),
            offload: true,
            weights: Some(weights),
            ..Default::default()
        };
        attach_align_device_hook(&model, &opts).unwrap();

        // Attach evicts immediately.
        assert!(all_meta(&model));

        let out = model
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2])))
            .unwrap();
        assert_eq!(out.as_f32_slice().unwrap(), expected.as_f32_slice().unwrap());

        // Weights rest as meta again after the pass.
        assert!(all_meta(&model));
    }

    #[test]
    fn test_buffers_stay_resident_by_default() {
        let mut leaf = Module::new("Leaf");
        leaf.add_param("weight", Tensor::from_f32(&[1.0], &[1]));
        leaf.add_buffer("scale", Tensor::from_f32(&[2.0], &[1]));
        let model = Arc::new(Module::new("Root").with_child("leaf", leaf));

        let weights = Arc::new(WeightsMap::from_state(model.state_dict()));
        let opts = AttachOptions {
            execution_device: Some(Device::Cpu),
            offload: true,
            weights: Some(weights),
            ..Default::default()
        };
        attach_align_device_hook(&model, &opts).unwrap();

        assert!(model.find_tensor("leaf.weight").unwrap().get().is_meta());
        assert!(!model.find_tensor("leaf.scale").unwrap().get().is_meta());
    }

    #[test]
    fn test_tied_weights_read_once_across_forwards() {
        let shared = Tensor::from_f32(&[3.0, 0.0, 0.0, 3.0], &[2, 2]);
        let model = Arc::new(
            Module::new("Sequential")
                .with_child("a", linear_from_weights(shared.clone(), None))
                .with_child("b", linear_from_weights(shared, None)),
        );

        let groups = crate::tied::find_tied_parameters(&model);
        assert_eq!(groups.len(), 1);
        let tied = Arc::new(TiedParamMap::from_groups(&groups));
        let weights = Arc::new(WeightsMap::from_state(model.state_dict()));

        let opts = AttachOptions {
            execution_device: Some(Device::Cpu),
            offload: true,
            weights: Some(weights.clone()),
            tied: Some(tied),
            ..Default::default()
        };
        attach_align_device_hook(&model, &opts).unwrap();

        for _ in 0..3 {
            model
                .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 1.0], &[2])))
                .unwrap();
        }

        // One read for the whole group, ever.
        let total: usize = groups[0]
            .names
            .iter()
            .map(|name| weights.read_count(name))
            .sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_preload_class_gets_single_subtree_hook() {
        let w = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let block = Module::new("Block").with_child("inner", linear_from_weights(w, None));
        let model = Arc::new(Module::new("Root").with_child("block", block));

        let weights = Arc::new(WeightsMap::from_state(model.state_dict()));
        let opts = AttachOptions {
            execution_device: Some(Device::Cpu),
            offload: true,
            weights: Some(weights),
            preload_classes: vec!["Block".to_string()],
            ..Default::default()
        };
        attach_align_device_hook(&model, &opts).unwrap();

        // The subtree hook lives on the block; the inner linear got none.
        let block = model.find("block").unwrap();
        assert!(block.has_hooks());
        assert!(!model.find("block.inner").unwrap().has_hooks());

        assert!(all_meta(&model));
        let out = model
            .forward(Args::from_tensor(Tensor::from_f32(&[4.0, 5.0], &[2])))
            .unwrap();
        assert_eq!(out.as_f32_slice().unwrap(), &[4.0, 5.0]);
        assert!(all_meta(&model));
    }

    #[test]
    fn test_blocks_attach_follows_device_map() {
        let model = chain_model();
        let map: BTreeMap<String, crate::Tier> = [
            ("0".to_string(), crate::Tier::Cpu),
            ("1".to_string(), crate::Tier::Disk),
        ]
        .into_iter()
        .collect();
        let normalized = NormalizedDeviceMap::normalize(&map, None);

        let weights = Arc::new(WeightsMap::from_state(model.state_dict()));
        let opts = AttachOptions {
            weights: Some(weights),
            ..Default::default()
        };
        attach_hooks_on_blocks(&model, &normalized, &opts).unwrap();

        // Cpu main device: module 0 stays resident, module 1 is offloaded.
        assert!(!model.find_tensor("0.weight").unwrap().get().is_meta());
        assert!(model.find_tensor("1.weight").unwrap().get().is_meta());

        let out = model
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 1.0], &[2])))
            .unwrap();
        assert_eq!(out.as_f32_slice().unwrap(), &[2.0, 2.0]);
        assert!(model.find_tensor("1.weight").unwrap().get().is_meta());
    }
}
