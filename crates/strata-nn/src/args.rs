use strata_core::{Result, Tensor};

/// A forward-pass input value.
///
/// Non-tensor values are never moved between devices; tensor values may be
/// aligned to a module's execution device by hooks unless their key is
/// declared device-transparent.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Ordered keyword-style arguments for a module's forward pass.
///
/// The main input tensor goes under the key `"input"`; additional entries
/// carry auxiliary values (masks, position offsets, bookkeeping scalars).
#[derive(Debug, Clone, Default)]
pub struct Args {
    entries: Vec<(String, Value)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a single tensor as the main input.
    pub fn from_tensor(tensor: Tensor) -> Self {
        let mut args = Self::new();
        args.set("input", Value::Tensor(tensor));
        args
    }

    /// Insert or replace a value under `key`.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    /// Insert or replace a tensor under `key`.
    pub fn set_tensor(&mut self, key: &str, tensor: Tensor) {
        self.set(key, Value::Tensor(tensor));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn tensor(&self, key: &str) -> Option<&Tensor> {
        self.get(key).and_then(Value::as_tensor)
    }

    /// The main input tensor, if present.
    pub fn input(&self) -> Option<&Tensor> {
        self.tensor("input")
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    /// Apply `f` to every tensor value in place, passing each entry's key.
    ///
    /// Used by device-alignment hooks; `f` can inspect the key to leave
    /// device-transparent entries untouched.
    pub fn try_map_tensors<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &Tensor) -> Result<Option<Tensor>>,
    {
        for (key, value) in &mut self.entries {
            if let Value::Tensor(t) = value {
                if let Some(replaced) = f(key, t)? {
                    *value = Value::Tensor(replaced);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DType;

    #[test]
    fn test_set_get() {
        let mut args = Args::from_tensor(Tensor::zeros(&[2], DType::F32));
        args.set("offset", Value::Int(7));

        assert!(args.input().is_some());
        assert!(matches!(args.get("offset"), Some(Value::Int(7))));
        assert!(args.get("missing").is_none());
    }

    #[test]
    fn test_set_replaces() {
        let mut args = Args::new();
        args.set("x", Value::Int(1));
        args.set("x", Value::Int(2));
        assert_eq!(args.entries().len(), 1);
        assert!(matches!(args.get("x"), Some(Value::Int(2))));
    }

    #[test]
    fn test_map_tensors_sees_keys() {
        let mut args = Args::from_tensor(Tensor::zeros(&[2], DType::F32));
        args.set_tensor("mask", Tensor::zeros(&[2], DType::F32));
        args.set("flag", Value::Bool(true));

        let mut seen = Vec::new();
        args.try_map_tensors(|key, _| {
            seen.push(key.to_string());
            Ok(None)
        })
        .unwrap();
        assert_eq!(seen, vec!["input".to_string(), "mask".to_string()]);
    }
}
