//! Checkpoint loading aimed at a device map.
//!
//! Tensors stream from safetensors files straight to their mapped tier:
//! accelerator tensors move there one at a time, host tensors land in their
//! slots (optionally spilling through disk to bound peak host usage), and
//! disk-tier tensors are re-persisted into an offload layout without ever
//! being held resident. The whole checkpoint is never materialized at once.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::{CoreError, DType, Device, Tensor};
use strata_nn::Module;

use crate::device_map::{resolve_tier, DeviceMap, Tier};
use crate::error::{DispatchError, Result};
use crate::placement::set_module_tensor_to_device;
use crate::tied::{find_tied_parameters, retie_parameters};
use crate::weights::{from_st_dtype, OffloadIndex, OffloadIndexWriter};

const HOST_SPILL_DIR: &str = "host_spill";

/// Resolve a checkpoint argument into an ordered list of safetensors files.
fn checkpoint_files(checkpoint: &Path) -> Result<Vec<PathBuf>> {
    if checkpoint.is_file() {
        return Ok(vec![checkpoint.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(checkpoint)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "safetensors")
                .unwrap_or(false)
        })
        .collect();
    if files.is_empty() {
        return Err(DispatchError::Index(format!(
            "no .safetensors files in {}",
            checkpoint.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Load a checkpoint into `model`, placing each tensor on its mapped tier.
///
/// `checkpoint` is a single `.safetensors` file or a directory of shards.
/// Disk-tier tensors require `offload_dir`; the offload index written there
/// is returned. With `strict`, missing or unexpected checkpoint keys are
/// errors; otherwise they are logged and missing weights stay meta.
/// `spill_to_disk` routes host-tier tensors through `offload_dir` during the
/// load and restores them afterwards, so peak host memory stays bounded by
/// one shard plus one tensor.
pub fn load_checkpoint_in_model(
    model: &Arc<Module>,
    checkpoint: &Path,
    device_map: &DeviceMap,
    offload_dir: Option<&Path>,
    dtype: Option<DType>,
    strict: bool,
    spill_to_disk: bool,
) -> Result<Option<OffloadIndex>> {
    let files = checkpoint_files(checkpoint)?;
    let expected: BTreeSet<String> = model
        .named_tensors()
        .into_iter()
        .map(|(name, _, _)| name)
        .collect();
    let tie_groups = find_tied_parameters(model);

    let needs_disk = expected
        .iter()
        .any(|name| resolve_tier(device_map, name) == Some(Tier::Disk));
    if needs_disk && offload_dir.is_none() {
        let paths: Vec<String> = device_map
            .iter()
            .filter(|(_, tier)| tier.is_disk())
            .map(|(path, _)| path.clone())
            .collect();
        return Err(DispatchError::OffloadDirRequired { paths });
    }
    let mut disk_writer = match (needs_disk, offload_dir) {
        (true, Some(dir)) => Some(OffloadIndexWriter::new(dir)?),
        _ => None,
    };

    if spill_to_disk && offload_dir.is_none() {
        tracing::debug!("host spill disabled: no offload directory given");
    }
    let mut spill_writer = match offload_dir {
        Some(dir) if spill_to_disk => {
            let dir = dir.join(HOST_SPILL_DIR);
            Some((dir.clone(), OffloadIndexWriter::new(&dir)?))
        }
        _ => None,
    };
    let mut spilled: Vec<String> = Vec::new();

    let mut loaded: BTreeSet<String> = BTreeSet::new();
    let mut unexpected: Vec<String> = Vec::new();

    for file in &files {
        let bytes = std::fs::read(file)?;
        let tensors = safetensors::SafeTensors::deserialize(&bytes)
            .map_err(|e| DispatchError::Index(format!("cannot parse {}: {e}", file.display())))?;
        tracing::debug!("loading {} tensors from {}", tensors.len(), file.display());

        for (name, view) in tensors.tensors() {
            if !expected.contains(&name) {
                unexpected.push(name);
                continue;
            }
            let src_dtype = from_st_dtype(view.dtype())?;
            let mut tensor = Tensor::from_le_bytes(src_dtype, view.shape(), view.data().to_vec())?;
            if let Some(target) = dtype {
                if tensor.dtype().is_float() && target.is_float() {
                    tensor = tensor.to_dtype(target)?;
                }
            }

            match resolve_tier(device_map, &name).unwrap_or(Tier::Cpu) {
                Tier::Disk => {
                    // Shape check against the slot, then persist and keep
                    // the slot as a matching meta placeholder.
                    let slot = model
                        .find_tensor(&name)
                        .ok_or_else(|| DispatchError::ModuleNotFound(name.clone()))?;
                    if slot.get().dims() != tensor.dims() {
                        return Err(CoreError::ShapeMismatch {
                            expected: slot.get().dims().to_vec(),
                            got: tensor.dims().to_vec(),
                        }
                        .into());
                    }
                    if let Some(writer) = &mut disk_writer {
                        writer.write_tensor(&name, &tensor)?;
                    }
                    slot.set(tensor.to_meta());
                }
                Tier::Cpu => {
                    if let Some((_, writer)) = &mut spill_writer {
                        writer.write_tensor(&name, &tensor)?;
                        spilled.push(name.clone());
                    } else {
                        set_module_tensor_to_device(
                            model,
                            &name,
                            Device::Cpu,
                            Some(&tensor),
                            None,
                        )?;
                    }
                }
                Tier::Cuda(index) => {
                    set_module_tensor_to_device(
                        model,
                        &name,
                        Device::Cuda(index),
                        Some(&tensor),
                        None,
                    )?;
                }
            }
            loaded.insert(name);
        }
    }

    // Bring spilled host-tier tensors back now that every shard is done.
    if let Some((dir, writer)) = spill_writer {
        let index = writer.finish()?;
        for name in &spilled {
            let tensor = index.read_tensor(name)?;
            set_module_tensor_to_device(model, name, Device::Cpu, Some(&tensor), None)?;
        }
        std::fs::remove_dir_all(&dir)?;
    }

    // Checkpoints store each tied allocation once; propagate to siblings
    // and count the whole group as loaded.
    retie_parameters(model, &tie_groups)?;
    let mut covered = loaded.clone();
    for group in &tie_groups {
        if group.names.iter().any(|name| loaded.contains(name)) {
            covered.extend(group.names.iter().cloned());
        }
    }

    let missing: Vec<String> = expected.difference(&covered).cloned().collect();
    if strict {
        if !missing.is_empty() {
            return Err(DispatchError::MissingCheckpointKeys { keys: missing });
        }
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(DispatchError::UnexpectedCheckpointKeys { keys: unexpected });
        }
    } else {
        if !missing.is_empty() {
            tracing::warn!(
                "checkpoint is missing {} keys; those weights stay unmaterialized",
                missing.len()
            );
        }
        if !unexpected.is_empty() {
            tracing::warn!("ignoring {} unexpected checkpoint keys", unexpected.len());
        }
    }

    disk_writer.map(OffloadIndexWriter::finish).transpose()
}
