//! Tied-parameter discovery and the per-device materialization cache.
//!
//! Two parameter names are *tied* when they alias the same allocation: either
//! they share one slot, or their slots share one storage. Discovery must run
//! before any eviction, while identity is still observable; the name-keyed
//! map it produces stays valid afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use strata_core::{Device, Tensor};
use strata_nn::Module;

use crate::error::Result;

/// A group of two or more names aliasing one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieGroup {
    /// Identity key: storage address when allocated, slot address otherwise.
    pub key: usize,
    /// Member names, in tree walk order.
    pub names: Vec<String>,
}

/// Find all tied parameter/buffer groups in `model`.
///
/// Groups are ordered by their first member name so the result is stable
/// across runs even though identity keys are allocation addresses.
pub fn find_tied_parameters(model: &Module) -> Vec<TieGroup> {
    let mut by_key: HashMap<usize, TieGroup> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();

    for (name, slot, _) in model.named_tensors() {
        let key = slot.get().storage_addr().unwrap_or_else(|| slot.addr());
        let group = by_key.entry(key).or_insert_with(|| {
            order.push(key);
            TieGroup {
                key,
                names: Vec::new(),
            }
        });
        group.names.push(name);
    }

    let mut groups: Vec<TieGroup> = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .filter(|group| group.names.len() >= 2)
        .collect();
    groups.sort_by(|a, b| a.names[0].cmp(&b.names[0]));
    groups
}

/// Per-(tie group, device) cache of materialized tensors.
///
/// Hooks consult the cache before reading a tied weight from its source, so
/// each underlying allocation is materialized at most once per device no
/// matter how many names reference it or how many forward passes run. The
/// cache is never cleared while the model stays dispatched.
#[derive(Debug, Default)]
pub struct TiedParamMap {
    keys: HashMap<String, usize>,
    cache: Mutex<HashMap<(usize, Device), Tensor>>,
}

impl TiedParamMap {
    pub fn from_groups(groups: &[TieGroup]) -> Self {
        let mut keys = HashMap::new();
        for group in groups {
            for name in &group.names {
                keys.insert(name.clone(), group.key);
            }
        }
        Self {
            keys,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `name` belongs to any tie group.
    pub fn is_tied(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    /// The cached tensor for `name`'s group on `device`, if materialized.
    pub fn get(&self, name: &str, device: Device) -> Option<Tensor> {
        let key = *self.keys.get(name)?;
        self.cache.lock().get(&(key, device)).cloned()
    }

    /// Record a materialized tensor for `name`'s group on `device`.
    ///
    /// Idempotent: a second populate of a filled entry is a no-op, keeping
    /// the first materialization authoritative. Untied names are ignored.
    pub fn populate(&self, name: &str, device: Device, tensor: &Tensor) {
        if let Some(key) = self.keys.get(name) {
            self.cache
                .lock()
                .entry((*key, device))
                .or_insert_with(|| tensor.clone());
        }
    }
}

/// Re-link every tie group so all member slots hold the identical tensor.
///
/// After per-name placement, members of a group may have been written
/// independently; this restores storage sharing using the first allocated
/// member as the authority.
pub fn retie_parameters(model: &Arc<Module>, groups: &[TieGroup]) -> Result<()> {
    for group in groups {
        let authority = group.names.iter().find_map(|name| {
            let tensor = model.find_tensor(name)?.get();
            (!tensor.is_meta()).then_some(tensor)
        });
        let Some(authority) = authority else {
            continue;
        };
        for name in &group.names {
            if let Some(slot) = model.find_tensor(name) {
                slot.set(authority.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tied_model() -> Arc<Module> {
        let mut embed = Module::new("Embedding");
        let shared = embed.add_param("weight", Tensor::from_f32(&[1.0, 2.0], &[2]));
        let mut head = Module::new("Linear");
        head.add_shared_param("weight", shared);
        head.add_param("bias", Tensor::from_f32(&[0.0], &[1]));
        Arc::new(
            Module::new("Root")
                .with_child("embed", embed)
                .with_child("head", head),
        )
    }

    #[test]
    fn test_find_tied_parameters() {
        let model = tied_model();
        let groups = find_tied_parameters(&model);
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].names,
            vec!["embed.weight".to_string(), "head.weight".to_string()]
        );
    }

    #[test]
    fn test_find_tied_by_shared_storage() {
        // Distinct slots, one storage.
        let base = Tensor::from_f32(&[1.0], &[1]);
        let mut a = Module::new("Leaf");
        a.add_param("weight", base.clone());
        let mut b = Module::new("Leaf");
        b.add_param("weight", base);
        let model = Arc::new(Module::new("Root").with_child("a", a).with_child("b", b));

        let groups = find_tied_parameters(&model);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].names.len(), 2);
    }

    #[test]
    fn test_no_ties() {
        let mut a = Module::new("Leaf");
        a.add_param("weight", Tensor::from_f32(&[1.0], &[1]));
        let model = Arc::new(Module::new("Root").with_child("a", a));
        assert!(find_tied_parameters(&model).is_empty());
    }

    #[test]
    fn test_tied_map_populate_idempotent() {
        let model = tied_model();
        let groups = find_tied_parameters(&model);
        let map = TiedParamMap::from_groups(&groups);

        assert!(map.is_tied("embed.weight"));
        assert!(map.is_tied("head.weight"));
        assert!(!map.is_tied("head.bias"));
        assert!(map.get("embed.weight", Device::Cpu).is_none());

        let first = Tensor::from_f32(&[9.0, 9.0], &[2]);
        map.populate("embed.weight", Device::Cpu, &first);

        // Visible under the sibling name, second populate ignored.
        let second = Tensor::from_f32(&[0.0, 0.0], &[2]);
        map.populate("head.weight", Device::Cpu, &second);
        let cached = map.get("head.weight", Device::Cpu).unwrap();
        assert_eq!(cached.storage_addr(), first.storage_addr());
    }

    #[test]
    fn test_retie_restores_sharing() {
        // Distinct slots tied through one storage, so per-name placement can
        // break the aliasing.
        let base = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let mut a = Module::new("Leaf");
        a.add_param("weight", base.clone());
        let mut b = Module::new("Leaf");
        b.add_param("weight", base);
        let model = Arc::new(Module::new("Root").with_child("a", a).with_child("b", b));
        let groups = find_tied_parameters(&model);

        model
            .find_tensor("b.weight")
            .unwrap()
            .set(Tensor::from_f32(&[5.0, 5.0], &[2]));
        let ta = model.find_tensor("a.weight").unwrap().get();
        let tb = model.find_tensor("b.weight").unwrap().get();
        assert_ne!(ta.storage_addr(), tb.storage_addr());

        retie_parameters(&model, &groups).unwrap();
        let ta = model.find_tensor("a.weight").unwrap().get();
        let tb = model.find_tensor("b.weight").unwrap().get();
        assert_eq!(ta.storage_addr(), tb.storage_addr());
    }
}
