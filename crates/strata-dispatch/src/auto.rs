//! Automatic device-map inference from per-tier memory budgets.

use std::collections::{BTreeMap, HashSet};

use strata_nn::Module;

use crate::device_map::{DeviceMap, Tier};

/// Per-tier byte budgets for placement.
///
/// Disk is always unbounded. Accelerator budgets come from the caller;
/// the host budget defaults to currently available RAM.
#[derive(Debug, Clone, Default)]
pub struct MemoryBudget {
    accelerators: BTreeMap<usize, u64>,
    host: u64,
}

/// Available host RAM in bytes.
pub fn available_ram_bytes() -> u64 {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.available_memory()
}

impl MemoryBudget {
    /// Probe the host budget; accelerator budgets start empty.
    pub fn detect() -> Self {
        Self {
            accelerators: BTreeMap::new(),
            host: available_ram_bytes(),
        }
    }

    pub fn with_accelerator(mut self, index: usize, bytes: u64) -> Self {
        self.accelerators.insert(index, bytes);
        self
    }

    pub fn with_host(mut self, bytes: u64) -> Self {
        self.host = bytes;
        self
    }

    pub fn accelerators(&self) -> &BTreeMap<usize, u64> {
        &self.accelerators
    }

    pub fn host(&self) -> u64 {
        self.host
    }

    /// Cap each accelerator at an equal share of `total` bytes.
    pub fn balanced(&self, total: u64) -> Self {
        let n = self.accelerators.len() as u64;
        if n == 0 {
            return self.clone();
        }
        let share = total.div_ceil(n);
        let mut out = self.clone();
        for budget in out.accelerators.values_mut() {
            *budget = (*budget).min(share);
        }
        out
    }

    /// Balanced shares with the first accelerator excluded.
    ///
    /// Keeps the first device free for workloads that concentrate there
    /// (generation caches, gathered outputs).
    pub fn balanced_low_zero(&self, total: u64) -> Self {
        let Some((&first, _)) = self.accelerators.iter().next() else {
            return self.clone();
        };
        let n = (self.accelerators.len() - 1) as u64;
        let mut out = self.clone();
        if n == 0 {
            out.accelerators.insert(first, 0);
            return out;
        }
        let share = total.div_ceil(n);
        for (index, budget) in out.accelerators.iter_mut() {
            *budget = if *index == first {
                0
            } else {
                (*budget).min(share)
            };
        }
        out
    }
}

/// Total unique tensor bytes in a model (tied allocations counted once).
pub fn model_size_bytes(model: &Module) -> u64 {
    let mut seen = HashSet::new();
    unique_tensor_bytes(model, &mut seen)
}

fn unique_tensor_bytes(module: &Module, seen: &mut HashSet<usize>) -> u64 {
    module
        .named_tensors()
        .iter()
        .filter_map(|(_, slot, _)| {
            let tensor = slot.get();
            let key = tensor.storage_addr().unwrap_or_else(|| slot.addr());
            seen.insert(key).then(|| tensor.size_bytes() as u64)
        })
        .sum()
}

/// Greedy in-order tier assignment of whole placement units.
///
/// A placement unit is a subtree that must land on one tier: a leaf
/// module, a module that directly owns tensors, or any module whose class
/// is in `atomic_classes`. Units are assigned in tree order, moving to the
/// next tier once the current one is full and never backtracking;
/// accelerators fill first, then host, then disk.
pub fn infer_auto_device_map(
    model: &Module,
    budget: &MemoryBudget,
    atomic_classes: &[String],
) -> DeviceMap {
    let mut units = Vec::new();
    let mut seen = HashSet::new();
    collect_units(model, "", atomic_classes, &mut seen, &mut units);

    let mut tiers: Vec<(Tier, u64)> = budget
        .accelerators
        .iter()
        .map(|(index, bytes)| (Tier::Cuda(*index), *bytes))
        .collect();
    tiers.push((Tier::Cpu, budget.host));

    let mut map = DeviceMap::new();
    let mut cursor = 0usize;
    for (path, size) in units {
        while cursor < tiers.len() && tiers[cursor].1 < size {
            cursor += 1;
        }
        let tier = match tiers.get_mut(cursor) {
            Some((tier, remaining)) => {
                *remaining -= size;
                *tier
            }
            None => Tier::Disk,
        };
        tracing::debug!("assigning '{}' ({} bytes) to {}", path, size, tier);
        map.insert(path, tier);
    }
    map
}

fn collect_units(
    module: &Module,
    path: &str,
    atomic_classes: &[String],
    seen: &mut HashSet<usize>,
    out: &mut Vec<(String, u64)>,
) {
    let atomic = atomic_classes.iter().any(|c| c == module.class_name())
        || module.children().is_empty()
        || module.has_own_tensors();
    if atomic {
        out.push((path.to_string(), unique_tensor_bytes(module, seen)));
        return;
    }
    for (name, child) in module.children() {
        collect_units(child, &strata_nn::join_path(path, name), atomic_classes, seen, out);
    }
}
