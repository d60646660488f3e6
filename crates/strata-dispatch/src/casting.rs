//! Layerwise casting: store weights in a low-precision dtype, compute in a
//! higher-precision one.
//!
//! Hooks attach at eligible-layer granularity. An attached layer's float
//! weights are downcast to the storage dtype at rest; its hook upcasts them
//! to the compute dtype around each call and downcasts again afterwards.

use std::sync::Arc;

use strata_core::{DType, Device, Tensor};
use strata_nn::{join_path, Args, Module, ModuleHook};

use crate::error::Result;
use crate::hooks::to_core_err;

/// Layer classes eligible for casting by default.
pub const DEFAULT_CASTABLE_CLASSES: &[&str] =
    &["Linear", "Conv1d", "Conv2d", "Conv3d", "Embedding"];

/// Per-node decision of the attach walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastAction {
    /// Attach a casting hook here; do not recurse further.
    Attach,
    /// Leave this subtree at full precision.
    Skip,
    /// Keep walking into the children.
    Recurse,
}

/// Classify one module of the walk.
///
/// Skip wins over attach: a matching name pattern (plain substring) or a
/// skipped class exempts the whole subtree.
pub fn classify(
    module: &Module,
    path: &str,
    skip_name_patterns: &[String],
    skip_classes: &[String],
) -> CastAction {
    let skip_by_name = skip_name_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()));
    if skip_by_name || skip_classes.iter().any(|c| c == module.class_name()) {
        return CastAction::Skip;
    }
    if DEFAULT_CASTABLE_CLASSES.contains(&module.class_name()) {
        return CastAction::Attach;
    }
    CastAction::Recurse
}

struct LayerwiseCastHook {
    storage_dtype: DType,
    compute_dtype: DType,
    non_blocking: bool,
}

impl LayerwiseCastHook {
    fn cast_all(&self, module: &Module, dtype: DType) -> Result<()> {
        for (_, slot, _) in module.named_tensors() {
            let tensor = slot.get();
            if !tensor.dtype().is_float() || tensor.dtype() == dtype {
                continue;
            }
            // Casting runs on the host; `non_blocking` applies to the copy
            // returning the cast tensor to its device.
            let cast = match tensor.device() {
                Some(Device::Cpu) | None => tensor.to_dtype(dtype)?,
                Some(device) => tensor
                    .to_device(Device::Cpu, false)?
                    .to_dtype(dtype)?
                    .to_device(device, self.non_blocking)?,
            };
            slot.set(cast);
        }
        Ok(())
    }
}

impl ModuleHook for LayerwiseCastHook {
    fn pre_forward(&self, module: &Module, args: Args) -> strata_core::Result<Args> {
        self.cast_all(module, self.compute_dtype)
            .map_err(to_core_err)?;
        Ok(args)
    }

    fn post_forward(&self, module: &Module, output: Tensor) -> strata_core::Result<Tensor> {
        self.cast_all(module, self.storage_dtype)
            .map_err(to_core_err)?;
        Ok(output)
    }
}

/// Walk the tree and attach casting hooks to eligible layers.
///
/// Attached layers are downcast to `storage_dtype` immediately. Returns
/// the paths that got a hook, in walk order; the set is deterministic for
/// a fixed tree and fixed skip lists.
pub fn attach_layerwise_casting_hooks(
    module: &Arc<Module>,
    storage_dtype: DType,
    compute_dtype: DType,
    skip_name_patterns: &[String],
    skip_classes: &[String],
    non_blocking: bool,
) -> Result<Vec<String>> {
    let mut attached = Vec::new();
    attach_recursive(
        module,
        "",
        storage_dtype,
        compute_dtype,
        skip_name_patterns,
        skip_classes,
        non_blocking,
        &mut attached,
    )?;
    tracing::debug!("layerwise casting attached to {} layers", attached.len());
    Ok(attached)
}

#[allow(clippy::too_many_arguments)]
fn attach_recursive(
    module: &Arc<Module>,
    path: &str,
    storage_dtype: DType,
    compute_dtype: DType,
    skip_name_patterns: &[String],
    skip_classes: &[String],
    non_blocking: bool,
    attached: &mut Vec<String>,
) -> Result<()> {
    match classify(module, path, skip_name_patterns, skip_classes) {
        CastAction::Skip => Ok(()),
        CastAction::Attach => {
            let hook = LayerwiseCastHook {
                storage_dtype,
                compute_dtype,
                non_blocking,
            };
            hook.cast_all(module, storage_dtype)?;
            module.add_hook(Arc::new(hook));
            attached.push(path.to_string());
            Ok(())
        }
        CastAction::Recurse => {
            for (name, child) in module.children() {
                attach_recursive(
                    child,
                    &join_path(path, name),
                    storage_dtype,
                    compute_dtype,
                    skip_name_patterns,
                    skip_classes,
                    non_blocking,
                    attached,
                )?;
            }
            Ok(())
        }
    }
}
