//! Device maps: per-subtree tier assignment and its normalized form.
//!
//! A device map is a `BTreeMap` from dotted module paths to [`Tier`]s. The
//! empty path addresses the root. A module without an entry of its own
//! inherits the nearest mapped ancestor's tier.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use strata_core::Device;
use strata_nn::Module;

use crate::error::{DispatchError, Result};

/// A memory tier a subtree can rest on.
///
/// `Cuda` and `Cpu` are computation devices; `Disk` is storage only, so
/// disk-tier modules always execute on the map's main device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Cuda(usize),
    Cpu,
    Disk,
}

impl Tier {
    /// The computation device this tier corresponds to, if any.
    pub fn as_device(&self) -> Option<Device> {
        match self {
            Tier::Cuda(idx) => Some(Device::Cuda(*idx)),
            Tier::Cpu => Some(Device::Cpu),
            Tier::Disk => None,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self, Tier::Disk)
    }
}

impl From<Device> for Tier {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => Tier::Cpu,
            Device::Cuda(idx) => Tier::Cuda(idx),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Cuda(idx) => write!(f, "cuda:{idx}"),
            Tier::Cpu => write!(f, "cpu"),
            Tier::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for Tier {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "disk" {
            return Ok(Tier::Disk);
        }
        let device: Device = s
            .parse()
            .map_err(|_| DispatchError::InvalidDeviceMapSpec(s.to_string()))?;
        Ok(device.into())
    }
}

impl Serialize for Tier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-subtree tier assignment, keyed by dotted module path.
pub type DeviceMap = BTreeMap<String, Tier>;

/// Resolve the tier for `path`: exact entry, nearest mapped ancestor, or the
/// root entry.
pub fn resolve_tier(map: &DeviceMap, path: &str) -> Option<Tier> {
    if let Some(tier) = map.get(path) {
        return Some(*tier);
    }
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('.') {
        if let Some(tier) = map.get(parent) {
            return Some(*tier);
        }
        current = parent;
    }
    map.get("").copied()
}

/// Verify the map places every parameter and buffer of `model`.
///
/// Runs before any mutation so an incomplete map never leaves the model
/// half-placed. Unplaced tensor names are reported sorted.
pub fn check_device_map(model: &Module, map: &DeviceMap) -> Result<()> {
    let mut unplaced: Vec<String> = model
        .named_tensors()
        .into_iter()
        .map(|(name, _, _)| name)
        .filter(|name| resolve_tier(map, name).is_none())
        .collect();
    if unplaced.is_empty() {
        Ok(())
    } else {
        unplaced.sort();
        Err(DispatchError::IncompleteDeviceMap { paths: unplaced })
    }
}

/// A device map resolved into execution devices and offload flags.
#[derive(Debug, Clone)]
pub struct NormalizedDeviceMap {
    map: DeviceMap,
    main_device: Device,
    execution: BTreeMap<String, Device>,
    offloaded: BTreeMap<String, Tier>,
    cpu_modules: Vec<String>,
    disk_modules: Vec<String>,
}

impl NormalizedDeviceMap {
    /// Resolve a raw device map.
    ///
    /// The main device is the first accelerator in map order, or Cpu when
    /// the map only uses the Cpu and Disk tiers. A caller override wins.
    /// Offloaded tiers are Disk alone under a Cpu main device, and both Cpu
    /// and Disk under an accelerator main device.
    pub fn normalize(map: &DeviceMap, main_override: Option<Device>) -> Self {
        let main_device = main_override.unwrap_or_else(|| {
            map.values()
                .find_map(|tier| match tier {
                    Tier::Cuda(idx) => Some(Device::Cuda(*idx)),
                    _ => None,
                })
                .unwrap_or(Device::Cpu)
        });
        let cpu_is_offloaded = main_device != Device::Cpu;

        let mut execution = BTreeMap::new();
        let mut offloaded = BTreeMap::new();
        let mut cpu_modules = Vec::new();
        let mut disk_modules = Vec::new();

        for (path, tier) in map {
            let (exec, is_offloaded) = match tier {
                Tier::Cuda(idx) => (Device::Cuda(*idx), false),
                Tier::Cpu if cpu_is_offloaded => (main_device, true),
                Tier::Cpu => (Device::Cpu, false),
                Tier::Disk => (main_device, true),
            };
            execution.insert(path.clone(), exec);
            if is_offloaded {
                offloaded.insert(path.clone(), *tier);
            }
            match tier {
                Tier::Cpu => cpu_modules.push(path.clone()),
                Tier::Disk => disk_modules.push(path.clone()),
                Tier::Cuda(_) => {}
            }
        }
        execution.entry(String::new()).or_insert(main_device);

        Self {
            map: map.clone(),
            main_device,
            execution,
            offloaded,
            cpu_modules,
            disk_modules,
        }
    }

    pub fn map(&self) -> &DeviceMap {
        &self.map
    }

    pub fn main_device(&self) -> Device {
        self.main_device
    }

    /// Execution device for `path` (nearest mapped ancestor, root fallback).
    pub fn execution_device(&self, path: &str) -> Device {
        if let Some(device) = self.execution.get(path) {
            return *device;
        }
        let mut current = path;
        while let Some((parent, _)) = current.rsplit_once('.') {
            if let Some(device) = self.execution.get(parent) {
                return *device;
            }
            current = parent;
        }
        self.main_device
    }

    /// The offloaded tier for `path`, if its resolved tier is offloaded.
    pub fn offload_tier(&self, path: &str) -> Option<Tier> {
        if let Some(tier) = self.offloaded.get(path) {
            return Some(*tier);
        }
        // Inherited placement: resolve through the raw map, then check the
        // resolved owner's offload status.
        let tier = resolve_tier(&self.map, path)?;
        match tier {
            Tier::Disk => Some(Tier::Disk),
            Tier::Cpu if self.main_device != Device::Cpu => Some(Tier::Cpu),
            _ => None,
        }
    }

    pub fn is_offloaded(&self, path: &str) -> bool {
        self.offload_tier(path).is_some()
    }

    /// Paths explicitly mapped to the Cpu tier.
    pub fn cpu_modules(&self) -> &[String] {
        &self.cpu_modules
    }

    /// Paths explicitly mapped to the Disk tier.
    pub fn disk_modules(&self) -> &[String] {
        &self.disk_modules
    }

    /// The set of distinct tiers the map uses.
    pub fn distinct_tiers(&self) -> BTreeSet<Tier> {
        self.map.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_core::{DType, Tensor};

    fn map_of(entries: &[(&str, Tier)]) -> DeviceMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn leaf_with_weight() -> Module {
        let mut m = Module::new("Leaf");
        m.add_param("weight", Tensor::zeros(&[2], DType::F32));
        m
    }

    #[test]
    fn test_tier_parse_roundtrip() {
        for tier in [Tier::Cpu, Tier::Disk, Tier::Cuda(1)] {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
        assert!("floppy".parse::<Tier>().is_err());
        assert_eq!(Tier::Disk.as_device(), None);
        assert_eq!(Tier::Cuda(2).as_device(), Some(Device::Cuda(2)));
    }

    #[test]
    fn test_tier_serde() {
        let map = map_of(&[("a", Tier::Cuda(0)), ("b", Tier::Disk)]);
        let json = serde_json::to_string(&map).unwrap();
        let back: DeviceMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_resolve_tier_ancestors() {
        let map = map_of(&[("block.0", Tier::Cpu), ("", Tier::Disk)]);
        assert_eq!(resolve_tier(&map, "block.0.linear.weight"), Some(Tier::Cpu));
        assert_eq!(resolve_tier(&map, "block.1.weight"), Some(Tier::Disk));

        let no_root = map_of(&[("block.0", Tier::Cpu)]);
        assert_eq!(resolve_tier(&no_root, "other"), None);
    }

    #[test]
    fn test_check_device_map_incomplete() {
        let model = Arc::new(
            Module::new("Root")
                .with_child("a", leaf_with_weight())
                .with_child("b", leaf_with_weight()),
        );
        let map = map_of(&[("a", Tier::Cpu)]);
        match check_device_map(&model, &map) {
            Err(DispatchError::IncompleteDeviceMap { paths }) => {
                assert_eq!(paths, vec!["b.weight".to_string()]);
            }
            other => panic!("expected IncompleteDeviceMap, got {other:?}"),
        }

        let full = map_of(&[("a", Tier::Cpu), ("", Tier::Disk)]);
        assert!(check_device_map(&model, &full).is_ok());
    }

    #[test]
    fn test_main_device_selection() {
        let cpu_disk = NormalizedDeviceMap::normalize(
            &map_of(&[("a", Tier::Cpu), ("b", Tier::Disk)]),
            None,
        );
        assert_eq!(cpu_disk.main_device(), Device::Cpu);

        let with_accel = NormalizedDeviceMap::normalize(
            &map_of(&[("a", Tier::Cpu), ("b", Tier::Cuda(1))]),
            None,
        );
        assert_eq!(with_accel.main_device(), Device::Cuda(1));

        let overridden = NormalizedDeviceMap::normalize(
            &map_of(&[("a", Tier::Cpu)]),
            Some(Device::Cuda(0)),
        );
        assert_eq!(overridden.main_device(), Device::Cuda(0));
    }

    #[test]
    fn test_offloaded_tiers_depend_on_main_device() {
        // Cpu main device: only Disk is offloaded.
        let cpu_main = NormalizedDeviceMap::normalize(
            &map_of(&[("a", Tier::Cpu), ("b", Tier::Disk)]),
            None,
        );
        assert!(!cpu_main.is_offloaded("a"));
        assert!(cpu_main.is_offloaded("b"));
        assert_eq!(cpu_main.execution_device("a"), Device::Cpu);
        assert_eq!(cpu_main.execution_device("b"), Device::Cpu);

        // Accelerator main device: Cpu and Disk are both offloaded.
        let accel_main = NormalizedDeviceMap::normalize(
            &map_of(&[("a", Tier::Cuda(0)), ("b", Tier::Cpu), ("c", Tier::Disk)]),
            None,
        );
        assert!(!accel_main.is_offloaded("a"));
        assert!(accel_main.is_offloaded("b"));
        assert!(accel_main.is_offloaded("c"));
        assert_eq!(accel_main.execution_device("b"), Device::Cuda(0));
        assert_eq!(accel_main.execution_device("b.child.weight"), Device::Cuda(0));
    }

    #[test]
    fn test_root_execution_fallback() {
        let norm = NormalizedDeviceMap::normalize(&map_of(&[("a", Tier::Cpu)]), None);
        assert_eq!(norm.execution_device(""), Device::Cpu);
        assert_eq!(norm.execution_device("unmapped"), Device::Cpu);
    }
}
