//! Weight sources: in-memory state, the on-disk offload index, and the
//! unified lazy lookup over both.
//!
//! A disk offload layout is a directory holding `index.json` (name → file,
//! dtype, shape) plus one single-tensor safetensors payload file per entry.
//! Reads are lazy and exact: looking up a name touches only that name's
//! payload file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use strata_core::{DType, Device, Tensor};

use crate::error::{DispatchError, Result};

const INDEX_FILE: &str = "index.json";

pub(crate) fn to_st_dtype(dtype: DType) -> safetensors::Dtype {
    match dtype {
        DType::F16 => safetensors::Dtype::F16,
        DType::BF16 => safetensors::Dtype::BF16,
        DType::F32 => safetensors::Dtype::F32,
        DType::F64 => safetensors::Dtype::F64,
        DType::I64 => safetensors::Dtype::I64,
    }
}

pub(crate) fn from_st_dtype(dtype: safetensors::Dtype) -> Result<DType> {
    match dtype {
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F64 => Ok(DType::F64),
        safetensors::Dtype::I64 => Ok(DType::I64),
        other => Err(DispatchError::Index(format!(
            "unsupported tensor dtype {other:?}"
        ))),
    }
}

/// Turn a dotted tensor name into a filesystem-safe file stem.
fn sanitize_tensor_name(name: &str) -> String {
    name.replace('.', "_")
}

/// One entry of `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

/// A loaded disk offload index: metadata in memory, payloads on disk.
#[derive(Debug, Clone)]
pub struct OffloadIndex {
    dir: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl OffloadIndex {
    /// Read `index.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(dir.join(INDEX_FILE))?;
        let entries: BTreeMap<String, IndexEntry> = serde_json::from_slice(&bytes)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Metadata (dtype, shape) for `name` without touching its payload.
    pub fn metadata(&self, name: &str) -> Result<(DType, Vec<usize>)> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| DispatchError::MissingWeight(name.to_string()))?;
        let dtype: DType = entry
            .dtype
            .parse()
            .map_err(|_| DispatchError::Index(format!("bad dtype '{}' for '{name}'", entry.dtype)))?;
        Ok((dtype, entry.shape.clone()))
    }

    /// Read exactly the named tensor's payload file.
    pub fn read_tensor(&self, name: &str) -> Result<Tensor> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| DispatchError::MissingWeight(name.to_string()))?;
        let (dtype, shape) = self.metadata(name)?;

        let path = self.dir.join(&entry.file);
        let bytes = std::fs::read(&path)?;
        let tensors = safetensors::SafeTensors::deserialize(&bytes)
            .map_err(|e| DispatchError::Index(format!("cannot parse {}: {e}", path.display())))?;
        let view = tensors
            .tensor(name)
            .map_err(|e| DispatchError::Index(format!("'{name}' not in {}: {e}", path.display())))?;
        Ok(Tensor::from_le_bytes(dtype, &shape, view.data().to_vec())?)
    }
}

/// Incremental writer for a disk offload layout.
///
/// Tensors are streamed out one file at a time; `finish` writes the index
/// and returns the readable [`OffloadIndex`].
pub struct OffloadIndexWriter {
    dir: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl OffloadIndexWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            entries: BTreeMap::new(),
        })
    }

    pub fn write_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let bytes = tensor.to_le_bytes()?;
        let view =
            safetensors::tensor::TensorView::new(to_st_dtype(tensor.dtype()), tensor.dims().to_vec(), &bytes)
                .map_err(|e| DispatchError::Index(format!("invalid tensor '{name}': {e}")))?;
        let payload = safetensors::tensor::serialize([(name.to_string(), view)], &None)
            .map_err(|e| DispatchError::Index(format!("cannot serialize '{name}': {e}")))?;

        let file = format!("{}.safetensors", sanitize_tensor_name(name));
        std::fs::write(self.dir.join(&file), payload)?;

        tracing::debug!("offloaded '{}' ({} bytes) to {}", name, tensor.size_bytes(), file);
        self.entries.insert(
            name.to_string(),
            IndexEntry {
                file,
                dtype: tensor.dtype().to_string(),
                shape: tensor.dims().to_vec(),
            },
        );
        Ok(())
    }

    pub fn finish(self) -> Result<OffloadIndex> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        std::fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(OffloadIndex {
            dir: self.dir,
            entries: self.entries,
        })
    }
}

/// Persist a state dict as a disk offload layout under `dir`.
pub fn offload_state_dict(dir: &Path, state: &BTreeMap<String, Tensor>) -> Result<OffloadIndex> {
    let mut writer = OffloadIndexWriter::new(dir)?;
    for (name, tensor) in state {
        writer.write_tensor(name, tensor)?;
    }
    let index = writer.finish()?;
    tracing::info!("offloaded {} tensors to {}", index.len(), dir.display());
    Ok(index)
}

/// Carve the subset of `state` rooted at any of `paths`.
///
/// A name matches a path when it equals the path or sits underneath it
/// (dotted prefix). The empty path matches everything.
pub fn extract_submodule_state(
    state: &BTreeMap<String, Tensor>,
    paths: &[String],
) -> BTreeMap<String, Tensor> {
    state
        .iter()
        .filter(|(name, _)| {
            paths.iter().any(|path| {
                path.is_empty()
                    || *name == path
                    || name.starts_with(&format!("{path}."))
            })
        })
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect()
}

/// Unified lazy weight lookup over an in-memory state and a disk index.
///
/// In-memory names shadow disk names. Per-name read counts are kept so
/// callers can observe how often a source was actually touched.
#[derive(Debug)]
pub struct WeightsMap {
    state: BTreeMap<String, Tensor>,
    index: Option<OffloadIndex>,
    device: Option<Device>,
    reads: Mutex<HashMap<String, usize>>,
}

impl WeightsMap {
    /// Build from any nonempty combination of sources.
    ///
    /// `device`, when given, is where disk reads land after loading.
    pub fn new(
        state: Option<BTreeMap<String, Tensor>>,
        index: Option<OffloadIndex>,
        device: Option<Device>,
    ) -> Result<Self> {
        if state.is_none() && index.is_none() {
            return Err(DispatchError::EmptyWeightsMap);
        }
        Ok(Self {
            state: state.unwrap_or_default(),
            index,
            device,
            reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_state(state: BTreeMap<String, Tensor>) -> Self {
        Self {
            state,
            index: None,
            device: None,
            reads: Mutex::new(HashMap::new()),
        }
    }

    /// Load the index under `dir` as the only source.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::new(None, Some(OffloadIndex::load(dir)?), None)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.contains_key(name)
            || self.index.as_ref().is_some_and(|idx| idx.contains(name))
    }

    /// All known names: in-memory first, then disk-only names, deduped.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.keys().cloned().collect();
        if let Some(index) = &self.index {
            for name in index.names() {
                if !self.state.contains_key(name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// Fetch a tensor by name, reading from disk lazily when needed.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        *self.reads.lock().entry(name.to_string()).or_insert(0) += 1;

        if let Some(tensor) = self.state.get(name) {
            return Ok(tensor.clone());
        }
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| DispatchError::MissingWeight(name.to_string()))?;
        let mut tensor = index.read_tensor(name)?;
        if let Some(device) = self.device {
            tensor = tensor.to_device(device, false)?;
        }
        Ok(tensor)
    }

    /// How many times `get` was called for `name`.
    pub fn read_count(&self, name: &str) -> usize {
        self.reads.lock().get(name).copied().unwrap_or(0)
    }
}
