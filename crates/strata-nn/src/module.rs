use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use strata_core::{CoreError, Device, Result, Tensor};

use crate::args::Args;

/// A live parameter/buffer slot.
///
/// Hooks write materialized tensors into slots before a module's computation
/// and restore meta placeholders afterwards. Tied parameters share one slot
/// across several names, so the slot's identity address is a valid aliasing
/// key even while the tensor inside is meta.
pub struct ParamSlot {
    tensor: RwLock<Tensor>,
}

/// Shared handle to a parameter/buffer slot.
pub type Param = Arc<ParamSlot>;

impl ParamSlot {
    pub fn new(tensor: Tensor) -> Param {
        Arc::new(Self {
            tensor: RwLock::new(tensor),
        })
    }

    /// Snapshot the current tensor (cheap: shares storage).
    pub fn get(&self) -> Tensor {
        self.tensor.read().clone()
    }

    /// Replace the current tensor.
    pub fn set(&self, tensor: Tensor) {
        *self.tensor.write() = tensor;
    }

    /// Stable identity address of the slot itself.
    pub fn addr(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl std::fmt::Debug for ParamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.tensor.read();
        f.debug_struct("ParamSlot")
            .field("dims", &t.dims())
            .field("dtype", &t.dtype())
            .field("meta", &t.is_meta())
            .finish()
    }
}

/// A module's computation.
pub trait Op: Send + Sync {
    /// Run the computation, reading weights from the module's live slots.
    fn forward(&self, module: &Module, args: &Args) -> Result<Tensor>;
}

/// Pre/post interceptors around a module's forward pass.
///
/// `pre_forward` runs in attachment order before the computation;
/// `post_forward` runs in reverse order after it.
pub trait ModuleHook: Send + Sync {
    fn pre_forward(&self, module: &Module, args: Args) -> Result<Args>;
    fn post_forward(&self, module: &Module, output: Tensor) -> Result<Tensor>;
}

/// A node in a tree of named computational units.
///
/// Modules with an [`Op`] compute; modules without one fold their input
/// through their children in order. Paths are dotted names from the root
/// (the root itself is `""`).
pub struct Module {
    class_name: String,
    children: Vec<(String, Arc<Module>)>,
    params: Vec<(String, Param)>,
    buffers: Vec<(String, Param)>,
    op: Option<Box<dyn Op>>,
    hooks: Mutex<Vec<Arc<dyn ModuleHook>>>,
    dispatched: AtomicBool,
}

/// Join a dotted path prefix with a child name.
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl Module {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            children: Vec::new(),
            params: Vec::new(),
            buffers: Vec::new(),
            op: None,
            hooks: Mutex::new(Vec::new()),
            dispatched: AtomicBool::new(false),
        }
    }

    pub fn with_op(mut self, op: Box<dyn Op>) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_child(mut self, name: impl Into<String>, child: Module) -> Self {
        self.children.push((name.into(), Arc::new(child)));
        self
    }

    pub fn with_shared_child(mut self, name: impl Into<String>, child: Arc<Module>) -> Self {
        self.children.push((name.into(), child));
        self
    }

    /// Register a parameter, returning its slot for sharing (tying).
    pub fn add_param(&mut self, name: impl Into<String>, tensor: Tensor) -> Param {
        let slot = ParamSlot::new(tensor);
        self.params.push((name.into(), slot.clone()));
        slot
    }

    /// Register an existing slot under a new name, tying the two names.
    pub fn add_shared_param(&mut self, name: impl Into<String>, slot: Param) {
        self.params.push((name.into(), slot));
    }

    pub fn add_buffer(&mut self, name: impl Into<String>, tensor: Tensor) -> Param {
        let slot = ParamSlot::new(tensor);
        self.buffers.push((name.into(), slot.clone()));
        slot
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn children(&self) -> &[(String, Arc<Module>)] {
        &self.children
    }

    pub fn params(&self) -> &[(String, Param)] {
        &self.params
    }

    pub fn buffers(&self) -> &[(String, Param)] {
        &self.buffers
    }

    /// Whether this module directly owns parameters or buffers.
    pub fn has_own_tensors(&self) -> bool {
        !self.params.is_empty() || !self.buffers.is_empty()
    }

    /// Look up a directly-owned parameter or buffer by name.
    pub fn own_tensor(&self, name: &str) -> Option<Param> {
        self.params
            .iter()
            .chain(self.buffers.iter())
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }

    /// All parameters and buffers in the tree, depth-first.
    ///
    /// Yields `(full_name, slot, is_buffer)`. Tied names each appear once,
    /// sharing the same slot.
    pub fn named_tensors(&self) -> Vec<(String, Param, bool)> {
        let mut out = Vec::new();
        self.collect_tensors("", &mut out);
        out
    }

    fn collect_tensors(&self, prefix: &str, out: &mut Vec<(String, Param, bool)>) {
        for (name, slot) in &self.params {
            out.push((join_path(prefix, name), slot.clone(), false));
        }
        for (name, slot) in &self.buffers {
            out.push((join_path(prefix, name), slot.clone(), true));
        }
        for (name, child) in &self.children {
            child.collect_tensors(&join_path(prefix, name), out);
        }
    }

    pub fn named_parameters(&self) -> Vec<(String, Param)> {
        self.named_tensors()
            .into_iter()
            .filter(|(_, _, is_buffer)| !is_buffer)
            .map(|(n, p, _)| (n, p))
            .collect()
    }

    pub fn named_buffers(&self) -> Vec<(String, Param)> {
        self.named_tensors()
            .into_iter()
            .filter(|(_, _, is_buffer)| *is_buffer)
            .map(|(n, p, _)| (n, p))
            .collect()
    }

    /// Visit every module in the tree depth-first, root first.
    pub fn visit<F: FnMut(&str, &Module)>(&self, f: &mut F) {
        self.visit_inner("", f);
    }

    fn visit_inner<F: FnMut(&str, &Module)>(&self, prefix: &str, f: &mut F) {
        f(prefix, self);
        for (name, child) in &self.children {
            child.visit_inner(&join_path(prefix, name), f);
        }
    }

    /// Paths of modules without children.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.visit(&mut |path, module| {
            if module.children.is_empty() {
                out.push(path.to_string());
            }
        });
        out
    }

    /// Paths of modules that directly own parameters or buffers.
    pub fn tensor_owner_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.visit(&mut |path, module| {
            if module.has_own_tensors() {
                out.push(path.to_string());
            }
        });
        out
    }

    /// Find a module by dotted path (`""` is the root).
    pub fn find(self: &Arc<Self>, path: &str) -> Option<Arc<Module>> {
        if path.is_empty() {
            return Some(self.clone());
        }
        let mut current = self.clone();
        for segment in path.split('.') {
            let next = current
                .children
                .iter()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| child.clone())?;
            current = next;
        }
        Some(current)
    }

    /// Find a parameter/buffer slot by its full dotted name.
    pub fn find_tensor(self: &Arc<Self>, name: &str) -> Option<Param> {
        match name.rsplit_once('.') {
            None => self.own_tensor(name),
            Some((module_path, tensor_name)) => {
                self.find(module_path)?.own_tensor(tensor_name)
            }
        }
    }

    /// Snapshot every parameter and buffer (meta placeholders included).
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        self.named_tensors()
            .into_iter()
            .map(|(name, slot, _)| (name, slot.get()))
            .collect()
    }

    /// Device of the first parameter/buffer with allocated storage.
    pub fn first_tensor_device(&self) -> Option<Device> {
        self.named_tensors()
            .iter()
            .find_map(|(_, slot, _)| slot.get().device())
    }

    /// Bulk-move every tensor in the tree to `device`.
    ///
    /// Fails on the first meta placeholder: meta tensors have no bytes to
    /// move and must be materialized through a weights source instead.
    pub fn to_device(&self, device: Device, non_blocking: bool) -> Result<()> {
        for (name, slot, _) in self.named_tensors() {
            let tensor = slot.get();
            if tensor.is_meta() {
                return Err(CoreError::Storage(format!(
                    "cannot move meta tensor '{name}': it has no allocated storage"
                )));
            }
            slot.set(tensor.to_device(device, non_blocking)?);
        }
        Ok(())
    }

    /// Append a forward hook.
    pub fn add_hook(&self, hook: Arc<dyn ModuleHook>) {
        self.hooks.lock().push(hook);
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.lock().is_empty()
    }

    /// Mark the root as dispatched. Returns false if it already was.
    pub fn mark_dispatched(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Run the forward pass: pre-hooks, computation, post-hooks.
    ///
    /// Modules without an op fold the input through their children in order,
    /// propagating auxiliary args unchanged.
    pub fn forward(&self, args: Args) -> Result<Tensor> {
        let hooks: Vec<Arc<dyn ModuleHook>> = self.hooks.lock().clone();

        let mut args = args;
        for hook in &hooks {
            args = hook.pre_forward(self, args)?;
        }

        let mut output = match &self.op {
            Some(op) => op.forward(self, &args)?,
            None => {
                let mut current = args.clone();
                let mut out = current
                    .input()
                    .cloned()
                    .ok_or_else(|| CoreError::Storage("forward requires an 'input' tensor".into()))?;
                for (_, child) in &self.children {
                    current.set_tensor("input", out);
                    out = child.forward(current.clone())?;
                }
                out
            }
        };

        for hook in hooks.iter().rev() {
            output = hook.post_forward(self, output)?;
        }
        Ok(output)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("class", &self.class_name)
            .field("children", &self.children.len())
            .field("params", &self.params.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DType;

    struct DoubleOp;
    impl Op for DoubleOp {
        fn forward(&self, _module: &Module, args: &Args) -> Result<Tensor> {
            let input = args
                .input()
                .ok_or_else(|| CoreError::Storage("missing input".into()))?;
            let values: Vec<f32> = input.to_f32_vec()?.iter().map(|v| v * 2.0).collect();
            Ok(Tensor::from_f32(&values, input.dims()))
        }
    }

    fn two_leaf_tree() -> Arc<Module> {
        let mut a = Module::new("Leaf").with_op(Box::new(DoubleOp));
        a.add_param("weight", Tensor::from_f32(&[1.0, 2.0], &[2]));
        let mut b = Module::new("Leaf").with_op(Box::new(DoubleOp));
        b.add_param("weight", Tensor::from_f32(&[3.0, 4.0], &[2]));
        b.add_buffer("scale", Tensor::from_f32(&[1.0], &[1]));
        Arc::new(
            Module::new("Sequential")
                .with_child("a", a)
                .with_child("b", b),
        )
    }

    #[test]
    fn test_named_walks() {
        let model = two_leaf_tree();
        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.weight".to_string(), "b.weight".to_string()]);

        let buffers: Vec<String> = model.named_buffers().into_iter().map(|(n, _)| n).collect();
        assert_eq!(buffers, vec!["b.scale".to_string()]);

        assert_eq!(model.leaf_paths(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            model.tensor_owner_paths(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_find_and_find_tensor() {
        let model = two_leaf_tree();
        assert!(model.find("").is_some());
        assert_eq!(model.find("a").unwrap().class_name(), "Leaf");
        assert!(model.find("c").is_none());

        let slot = model.find_tensor("b.weight").unwrap();
        assert_eq!(slot.get().as_f32_slice().unwrap(), &[3.0, 4.0]);
        assert!(model.find_tensor("b.missing").is_none());
    }

    #[test]
    fn test_tied_names_share_slot() {
        let mut a = Module::new("Leaf");
        let shared = a.add_param("weight", Tensor::from_f32(&[1.0], &[1]));
        let mut b = Module::new("Leaf");
        b.add_shared_param("weight", shared.clone());
        let model = Arc::new(
            Module::new("Sequential")
                .with_child("a", a)
                .with_child("b", b),
        );

        let sa = model.find_tensor("a.weight").unwrap();
        let sb = model.find_tensor("b.weight").unwrap();
        assert_eq!(sa.addr(), sb.addr());

        // Writing through one name is visible through the other.
        sa.set(Tensor::from_f32(&[9.0], &[1]));
        assert_eq!(sb.get().as_f32_slice().unwrap(), &[9.0]);
    }

    #[test]
    fn test_container_forward_folds_children() {
        let model = two_leaf_tree();
        let out = model
            .forward(Args::from_tensor(Tensor::from_f32(&[1.0, 1.0], &[2])))
            .unwrap();
        // Two DoubleOps in sequence: x * 2 * 2
        assert_eq!(out.as_f32_slice().unwrap(), &[4.0, 4.0]);
    }

    #[test]
    fn test_hook_ordering() {
        struct TagHook {
            tag: f32,
        }
        impl ModuleHook for TagHook {
            fn pre_forward(&self, _m: &Module, args: Args) -> Result<Args> {
                Ok(args)
            }
            fn post_forward(&self, _m: &Module, output: Tensor) -> Result<Tensor> {
                let mut v = output.to_f32_vec()?;
                v.push(self.tag);
                let n = v.len();
                Ok(Tensor::from_f32(&v, &[n]))
            }
        }

        let model = Arc::new(Module::new("Identity"));
        model.add_hook(Arc::new(TagHook { tag: 1.0 }));
        model.add_hook(Arc::new(TagHook { tag: 2.0 }));

        let out = model
            .forward(Args::from_tensor(Tensor::from_f32(&[0.0], &[1])))
            .unwrap();
        // Post hooks run in reverse attachment order: tag 2 first, then 1.
        assert_eq!(out.as_f32_slice().unwrap(), &[0.0, 2.0, 1.0]);
    }

    #[test]
    fn test_to_device_rejects_meta() {
        let mut leaf = Module::new("Leaf");
        leaf.add_param("weight", Tensor::meta(&[2], DType::F32));
        let model = Arc::new(Module::new("Root").with_child("leaf", leaf));
        let err = model.to_device(Device::Cpu, false).unwrap_err();
        assert!(err.to_string().contains("leaf.weight"));
    }

    #[test]
    fn test_mark_dispatched_once() {
        let model = Module::new("Root");
        assert!(!model.is_dispatched());
        assert!(model.mark_dispatched());
        assert!(!model.mark_dispatched());
        assert!(model.is_dispatched());
    }
}
