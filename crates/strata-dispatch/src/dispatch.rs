//! Top-level orchestration: whole-model offload, device-map dispatch, and
//! checkpoint-and-dispatch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use strata_core::{DType, Device, Tensor};
use strata_nn::Module;

use crate::auto::{infer_auto_device_map, model_size_bytes, MemoryBudget};
use crate::checkpoint::load_checkpoint_in_model;
use crate::device_map::{check_device_map, DeviceMap, NormalizedDeviceMap};
use crate::error::{DispatchError, Result};
use crate::hooks::{
    attach_align_device_hook, attach_hooks_on_blocks, attach_io_hook, AttachOptions,
};
use crate::model::DispatchedModel;
use crate::placement::set_module_tensor_to_device;
use crate::tied::{find_tied_parameters, retie_parameters, TiedParamMap};
use crate::weights::{extract_submodule_state, offload_state_dict, OffloadIndex, WeightsMap};

/// How to obtain a device map.
#[derive(Debug, Clone)]
pub enum DeviceMapSpec {
    /// Infer from memory budgets, filling tiers greedily in tree order.
    Auto,
    /// Infer with accelerator budgets capped at equal shares.
    Balanced,
    /// Balanced, with the first accelerator left empty.
    BalancedLowZero,
    /// Fill devices strictly in order until each is full.
    Sequential,
    /// Use this exact map.
    Explicit(DeviceMap),
}

impl FromStr for DeviceMapSpec {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DeviceMapSpec::Auto),
            "balanced" => Ok(DeviceMapSpec::Balanced),
            "balanced_low_0" => Ok(DeviceMapSpec::BalancedLowZero),
            "sequential" => Ok(DeviceMapSpec::Sequential),
            other => Err(DispatchError::InvalidDeviceMapSpec(other.to_string())),
        }
    }
}

/// Knobs for [`dispatch_model`].
#[derive(Default)]
pub struct DispatchOptions {
    /// Override for the main execution device.
    pub main_device: Option<Device>,
    /// Weight values for parameters currently resting as meta placeholders.
    pub state: Option<BTreeMap<String, Tensor>>,
    /// Where to persist disk-tier weights that are not in an index yet.
    pub offload_dir: Option<PathBuf>,
    /// Existing offload layout holding the disk-tier weights.
    pub offload_index: Option<OffloadIndex>,
    /// Evict buffers along with parameters.
    pub offload_buffers: bool,
    /// Arg keys hooks must never move between devices.
    pub skip_keys: Vec<String>,
    /// Classes whose whole subtree materializes at the start of their call.
    pub preload_classes: Vec<String>,
    /// Install hooks even when a single-tier map would allow a plain move.
    pub force_hooks: bool,
}

/// Place `model` across tiers according to `device_map`.
///
/// Single-tier maps without `force_hooks` take the fast path: one bulk move
/// (or per-tensor placement when meta parameters are present) and no hooks.
/// Anything else installs alignment hooks per tensor-owning module.
pub fn dispatch_model(
    model: Arc<Module>,
    device_map: &DeviceMap,
    opts: DispatchOptions,
) -> Result<DispatchedModel> {
    if model.is_dispatched() {
        return Err(DispatchError::AlreadyDispatched);
    }
    check_device_map(&model, device_map)?;
    let normalized = NormalizedDeviceMap::normalize(device_map, opts.main_device);

    if !opts.force_hooks {
        let tiers = normalized.distinct_tiers();
        let mut iter = tiers.iter();
        if let (Some(&tier), None) = (iter.next(), iter.next()) {
            let Some(device) = tier.as_device() else {
                return Err(DispatchError::DiskOnlyFastPath);
            };
            let has_meta = model
                .named_tensors()
                .iter()
                .any(|(_, slot, _)| slot.get().is_meta());
            if has_meta {
                // Conservative per-tensor placement: meta slots are filled
                // from the provided state, resident ones just move.
                for (name, slot, _) in model.named_tensors() {
                    let value = if slot.get().is_meta() {
                        Some(opts.state.as_ref().and_then(|s| s.get(&name)).ok_or_else(
                            || DispatchError::MetaParameter(name.clone()),
                        )?)
                    } else {
                        None
                    };
                    set_module_tensor_to_device(&model, &name, device, value, None)?;
                }
            } else {
                model.to_device(device, false)?;
            }
            tracing::info!("dispatched model to {device} without hooks");
            return Ok(DispatchedModel::new(model, device_map.clone(), device));
        }
    }

    let tie_groups = find_tied_parameters(&model);
    let tied = Arc::new(TiedParamMap::from_groups(&tie_groups));

    let mut full_state = model.state_dict();
    full_state.retain(|_, tensor| !tensor.is_meta());
    if let Some(state) = opts.state {
        for (name, tensor) in state {
            full_state.insert(name, tensor);
        }
    }

    let offloaded_paths: Vec<String> = device_map
        .keys()
        .filter(|path| normalized.is_offloaded(path))
        .cloned()
        .collect();
    let disk_paths = normalized.disk_modules().to_vec();

    let index = if disk_paths.is_empty() {
        opts.offload_index
    } else if let Some(index) = opts.offload_index {
        Some(index)
    } else {
        let Some(dir) = &opts.offload_dir else {
            return Err(DispatchError::OffloadDirRequired { paths: disk_paths });
        };
        let disk_state = extract_submodule_state(&full_state, &disk_paths);
        Some(offload_state_dict(dir, &disk_state)?)
    };

    // Disk-tier weights are served by the index; keeping a memory copy too
    // would defeat the offload.
    let host_offloaded: Vec<String> = offloaded_paths
        .iter()
        .filter(|path| !disk_paths.contains(path))
        .cloned()
        .collect();
    let mut mem_state = extract_submodule_state(&full_state, &host_offloaded);
    // An offloaded module's eviction empties every slot it shares, so the
    // resident members of its tie groups need a weights entry as well.
    for group in &tie_groups {
        if group.names.iter().any(|name| normalized.is_offloaded(name)) {
            for name in &group.names {
                if !normalized.is_offloaded(name) {
                    if let Some(tensor) = full_state.get(name) {
                        mem_state.insert(name.clone(), tensor.clone());
                    }
                }
            }
        }
    }
    // The retained copies rest in host memory.
    for tensor in mem_state.values_mut() {
        if !tensor.is_on(Device::Cpu) {
            *tensor = tensor.to_device(Device::Cpu, false)?;
        }
    }
    let weights = if mem_state.is_empty() && index.is_none() {
        None
    } else {
        Some(Arc::new(WeightsMap::new(Some(mem_state), index, None)?))
    };

    let attach = AttachOptions {
        execution_device: None,
        offload: false,
        offload_buffers: opts.offload_buffers,
        weights,
        tied: Some(tied),
        skip_keys: opts.skip_keys,
        preload_classes: opts.preload_classes,
        non_blocking: false,
    };
    attach_hooks_on_blocks(&model, &normalized, &attach)?;
    retie_parameters(&model, &tie_groups)?;
    model.mark_dispatched();

    tracing::info!(
        "dispatched model across {} map entries (main device {})",
        device_map.len(),
        normalized.main_device(),
    );
    Ok(DispatchedModel::new(
        model,
        device_map.clone(),
        normalized.main_device(),
    ))
}

/// Offload every weight of `model` to host memory.
///
/// Weights materialize on the execution device per submodule call and rest
/// in host RAM between calls.
pub fn cpu_offload(
    model: Arc<Module>,
    execution_device: Option<Device>,
    state: Option<BTreeMap<String, Tensor>>,
    offload_buffers: bool,
    preload_classes: Vec<String>,
) -> Result<Arc<Module>> {
    if model.is_dispatched() {
        return Err(DispatchError::AlreadyDispatched);
    }
    let execution_device = execution_device
        .or_else(|| model.first_tensor_device())
        .unwrap_or(Device::Cpu);

    let mut full_state = model.state_dict();
    full_state.retain(|_, tensor| !tensor.is_meta());
    if let Some(state) = state {
        for (name, tensor) in state {
            full_state.insert(name, tensor);
        }
    }
    // The saved copy rests in host memory.
    for tensor in full_state.values_mut() {
        if !tensor.is_on(Device::Cpu) {
            *tensor = tensor.to_device(Device::Cpu, false)?;
        }
    }

    let tie_groups = find_tied_parameters(&model);
    let attach = AttachOptions {
        execution_device: Some(execution_device),
        offload: true,
        offload_buffers,
        weights: Some(Arc::new(WeightsMap::from_state(full_state))),
        tied: Some(Arc::new(TiedParamMap::from_groups(&tie_groups))),
        skip_keys: Vec::new(),
        preload_classes,
        non_blocking: false,
    };
    attach_io_hook(&model);
    attach_align_device_hook(&model, &attach)?;
    model.mark_dispatched();
    Ok(model)
}

/// Offload every weight of `model` to an offload layout under `offload_dir`.
pub fn disk_offload(
    model: Arc<Module>,
    offload_dir: &Path,
    execution_device: Option<Device>,
    offload_buffers: bool,
    preload_classes: Vec<String>,
) -> Result<Arc<Module>> {
    if model.is_dispatched() {
        return Err(DispatchError::AlreadyDispatched);
    }
    let execution_device = execution_device
        .or_else(|| model.first_tensor_device())
        .unwrap_or(Device::Cpu);

    let mut full_state = model.state_dict();
    full_state.retain(|_, tensor| !tensor.is_meta());
    let index = offload_state_dict(offload_dir, &full_state)?;

    let tie_groups = find_tied_parameters(&model);
    let attach = AttachOptions {
        execution_device: Some(execution_device),
        offload: true,
        offload_buffers,
        weights: Some(Arc::new(WeightsMap::new(None, Some(index), None)?)),
        tied: Some(Arc::new(TiedParamMap::from_groups(&tie_groups))),
        skip_keys: Vec::new(),
        preload_classes,
        non_blocking: false,
    };
    attach_io_hook(&model);
    attach_align_device_hook(&model, &attach)?;
    model.mark_dispatched();
    Ok(model)
}

/// Knobs for [`load_checkpoint_and_dispatch`].
#[derive(Default)]
pub struct LoadOptions {
    pub main_device: Option<Device>,
    /// Memory budgets for symbolic device-map specs. Probed when absent.
    pub budget: Option<MemoryBudget>,
    /// Classes auto inference must never split across tiers.
    pub atomic_classes: Vec<String>,
    pub offload_dir: Option<PathBuf>,
    pub offload_buffers: bool,
    /// Cast float weights to this dtype while loading.
    pub dtype: Option<DType>,
    pub strict: bool,
    /// Spill host-tier weights through disk during the load.
    /// Defaults to on when the map has disk entries.
    pub spill_to_disk: Option<bool>,
    pub skip_keys: Vec<String>,
    pub preload_classes: Vec<String>,
    pub force_hooks: bool,
}

/// Load a checkpoint into `model` and dispatch it in one step.
///
/// Without a device-map spec the checkpoint is simply loaded and the model
/// returned undispatched. A symbolic spec infers the map from memory
/// budgets first; tensors then stream from the checkpoint straight to their
/// tiers before hooks are installed.
pub fn load_checkpoint_and_dispatch(
    model: Arc<Module>,
    checkpoint: &Path,
    spec: Option<DeviceMapSpec>,
    opts: LoadOptions,
) -> Result<DispatchedModel> {
    let Some(spec) = spec else {
        load_checkpoint_in_model(
            &model,
            checkpoint,
            &DeviceMap::new(),
            None,
            opts.dtype,
            opts.strict,
            false,
        )?;
        return Ok(DispatchedModel::new(model, DeviceMap::new(), Device::Cpu));
    };

    let device_map = match spec {
        DeviceMapSpec::Explicit(map) => map,
        DeviceMapSpec::Auto | DeviceMapSpec::Sequential => {
            let budget = opts.budget.clone().unwrap_or_else(MemoryBudget::detect);
            infer_auto_device_map(&model, &budget, &opts.atomic_classes)
        }
        DeviceMapSpec::Balanced => {
            let budget = opts.budget.clone().unwrap_or_else(MemoryBudget::detect);
            let budget = budget.balanced(model_size_bytes(&model));
            infer_auto_device_map(&model, &budget, &opts.atomic_classes)
        }
        DeviceMapSpec::BalancedLowZero => {
            let budget = opts.budget.clone().unwrap_or_else(MemoryBudget::detect);
            let budget = budget.balanced_low_zero(model_size_bytes(&model));
            infer_auto_device_map(&model, &budget, &opts.atomic_classes)
        }
    };
    check_device_map(&model, &device_map)?;

    let has_disk = device_map.values().any(|tier| tier.is_disk());
    let spill = opts.spill_to_disk.unwrap_or(has_disk);
    let index = load_checkpoint_in_model(
        &model,
        checkpoint,
        &device_map,
        opts.offload_dir.as_deref(),
        opts.dtype,
        opts.strict,
        spill,
    )?;

    dispatch_model(
        model,
        &device_map,
        DispatchOptions {
            main_device: opts.main_device,
            state: None,
            offload_dir: opts.offload_dir,
            offload_index: index,
            offload_buffers: opts.offload_buffers,
            skip_keys: opts.skip_keys,
            preload_classes: opts.preload_classes,
            force_hooks: opts.force_hooks,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_map::Tier;
    use strata_nn::{linear_from_weights, Args, LinearOp};

    fn chain_model() -> Arc<Module> {
        let w0 = Tensor::from_f32(&[1.0, 1.0, 0.0, 1.0], &[2, 2]);
        let w1 = Tensor::from_f32(&[0.5, 0.0, 0.0, 2.0], &[2, 2]);
        Arc::new(
            Module::new("Sequential")
                .with_child("0", linear_from_weights(w0, None))
                .with_child("1", linear_from_weights(w1, None)),
        )
    }

    fn map_of(entries: &[(&str, Tier)]) -> DeviceMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_spec_parsing() {
        assert!(matches!(
            "auto".parse::<DeviceMapSpec>(),
            Ok(DeviceMapSpec::Auto)
        ));
        assert!(matches!(
            "balanced_low_0".parse::<DeviceMapSpec>(),
            Ok(DeviceMapSpec::BalancedLowZero)
        ));
        assert!(matches!(
            "everything".parse::<DeviceMapSpec>(),
            Err(DispatchError::InvalidDeviceMapSpec(_))
        ));
    }

    #[test]
    fn test_fast_path_matches_hook_path() {
        let input = || Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2]));
        let map = map_of(&[("", Tier::Cpu)]);

        let fast = dispatch_model(chain_model(), &map, DispatchOptions::default()).unwrap();
        let hooked = dispatch_model(
            chain_model(),
            &map,
            DispatchOptions {
                force_hooks: true,
                ..Default::default()
            },
        )
        .unwrap();

        let a = fast.forward(input()).unwrap();
        let b = hooked.forward(input()).unwrap();
        assert_eq!(
            a.as_f32_slice().unwrap(),
            b.as_f32_slice().unwrap()
        );

        // The fast path left no hooks behind; the forced path did.
        assert!(!fast.model().find("0").unwrap().has_hooks());
        assert!(hooked.model().find("0").unwrap().has_hooks());
    }

    #[test]
    fn test_fast_path_disk_only_rejected() {
        let err = dispatch_model(
            chain_model(),
            &map_of(&[("", Tier::Disk)]),
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::DiskOnlyFastPath));
    }

    #[test]
    fn test_incomplete_map_rejected_before_mutation() {
        let model = chain_model();
        let err = dispatch_model(
            model.clone(),
            &map_of(&[("0", Tier::Cpu)]),
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::IncompleteDeviceMap { .. }));
        // Nothing was placed or hooked.
        assert!(!model.find_tensor("1.weight").unwrap().get().is_meta());
        assert!(!model.find("1").unwrap().has_hooks());
    }

    #[test]
    fn test_redispatch_rejected() {
        let map = map_of(&[("", Tier::Cpu)]);
        let dispatched = dispatch_model(
            chain_model(),
            &map,
            DispatchOptions {
                force_hooks: true,
                ..Default::default()
            },
        )
        .unwrap();
        let err = dispatch_model(
            dispatched.model().clone(),
            &map,
            DispatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyDispatched));
    }

    #[test]
    fn test_dispatch_with_disk_tier() {
        let dir = tempfile::tempdir().unwrap();
        let model = chain_model();
        let baseline = model
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2])))
            .unwrap();

        let map = map_of(&[("0", Tier::Cpu), ("1", Tier::Disk)]);
        let dispatched = dispatch_model(
            model,
            &map,
            DispatchOptions {
                offload_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();

        // Disk-tier weights rest as meta between calls.
        assert!(dispatched.model().find_tensor("1.weight").unwrap().get().is_meta());

        let out = dispatched
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2])))
            .unwrap();
        assert_eq!(
            out.as_f32_slice().unwrap(),
            baseline.as_f32_slice().unwrap()
        );
        assert!(dispatched.model().find_tensor("1.weight").unwrap().get().is_meta());
    }

    #[test]
    fn test_tied_slot_across_mixed_tiers() {
        let dir = tempfile::tempdir().unwrap();

        // Embedding and head share one slot; only the head is offloaded.
        let embed = linear_from_weights(Tensor::from_f32(&[1.0, 1.0, 0.0, 1.0], &[2, 2]), None);
        let slot = embed.own_tensor("weight").unwrap();
        let mut head = Module::new("Linear").with_op(Box::new(LinearOp));
        head.add_shared_param("weight", slot);
        let model = Arc::new(
            Module::new("Tied")
                .with_child("embed", embed)
                .with_child("head", head),
        );

        let input = || Args::from_tensor(Tensor::from_f32(&[1.0, 2.0], &[2]));
        let expected = model.forward(input()).unwrap();

        let map = map_of(&[("embed", Tier::Cpu), ("head", Tier::Disk)]);
        let dispatched = dispatch_model(
            model,
            &map,
            DispatchOptions {
                offload_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();

        // The head's eviction leaves the shared slot meta between calls;
        // the embedding must still compute.
        for _ in 0..2 {
            let out = dispatched.forward(input()).unwrap();
            assert_eq!(
                out.as_f32_slice().unwrap(),
                expected.as_f32_slice().unwrap()
            );
        }
    }

    #[test]
    fn test_disk_tier_without_destination_rejected() {
        let err = dispatch_model(
            chain_model(),
            &map_of(&[("0", Tier::Cpu), ("1", Tier::Disk)]),
            DispatchOptions::default(),
        )
        .unwrap_err();
        match err {
            DispatchError::OffloadDirRequired { paths } => {
                assert_eq!(paths, vec!["1".to_string()]);
            }
            other => panic!("expected OffloadDirRequired, got {other:?}"),
        }
    }

    #[test]
    fn test_movement_guard() {
        let dir = tempfile::tempdir().unwrap();

        // Fully placed model: move warns but succeeds.
        let placed = dispatch_model(
            chain_model(),
            &map_of(&[("", Tier::Cpu)]),
            DispatchOptions {
                force_hooks: true,
                ..Default::default()
            },
        )
        .unwrap();
        placed.to_device(Device::Cpu).unwrap();

        // Partially offloaded model: move is fatal.
        let offloaded = dispatch_model(
            chain_model(),
            &map_of(&[("0", Tier::Cpu), ("1", Tier::Disk)]),
            DispatchOptions {
                offload_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            offloaded.to_device(Device::Cpu),
            Err(DispatchError::OffloadedModelMoved)
        ));
    }

    #[test]
    fn test_cpu_offload_round_trip() {
        let model = chain_model();
        let input = || Args::from_tensor(Tensor::from_f32(&[3.0, -1.0], &[2]));
        let baseline = model.forward(input()).unwrap();

        let model = cpu_offload(model, None, None, false, Vec::new()).unwrap();
        assert!(model.find_tensor("0.weight").unwrap().get().is_meta());

        let out = model.forward(input()).unwrap();
        assert_eq!(
            out.as_f32_slice().unwrap(),
            baseline.as_f32_slice().unwrap()
        );
        assert!(model.find_tensor("0.weight").unwrap().get().is_meta());
    }

    #[test]
    fn test_disk_offload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let model = chain_model();
        let input = || Args::from_tensor(Tensor::from_f32(&[3.0, -1.0], &[2]));
        let baseline = model.forward(input()).unwrap();

        let model = disk_offload(model, dir.path(), None, false, Vec::new()).unwrap();
        assert!(model.find_tensor("0.weight").unwrap().get().is_meta());
        assert!(dir.path().join("index.json").exists());

        let out = model.forward(input()).unwrap();
        assert_eq!(
            out.as_f32_slice().unwrap(),
            baseline.as_f32_slice().unwrap()
        );
    }
}
