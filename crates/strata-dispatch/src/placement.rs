//! Single-tensor placement primitive.

use std::sync::Arc;

use strata_core::{CoreError, DType, Device, Tensor};
use strata_nn::Module;

use crate::error::{DispatchError, Result};

/// Place one named parameter/buffer of `model` onto `device`.
///
/// When the slot holds a meta placeholder, `value` supplies the data; a
/// meta slot with no value is an error. When the slot already holds data,
/// `value` (if given) replaces it after a shape check. An optional float
/// dtype cast is applied before the move. Transfer failures propagate
/// unmodified.
pub fn set_module_tensor_to_device(
    model: &Arc<Module>,
    name: &str,
    device: Device,
    value: Option<&Tensor>,
    dtype: Option<DType>,
) -> Result<()> {
    let slot = model
        .find_tensor(name)
        .ok_or_else(|| DispatchError::ModuleNotFound(name.to_string()))?;
    let current = slot.get();

    let mut tensor = match value {
        Some(value) => {
            if value.dims() != current.dims() {
                return Err(CoreError::ShapeMismatch {
                    expected: current.dims().to_vec(),
                    got: value.dims().to_vec(),
                }
                .into());
            }
            value.clone()
        }
        None if !current.is_meta() => current,
        None => return Err(DispatchError::MetaParameter(name.to_string())),
    };

    if let Some(dtype) = dtype {
        if tensor.dtype().is_float() && dtype.is_float() {
            tensor = tensor.to_dtype(dtype)?;
        }
    }

    slot.set(tensor.to_device(device, false)?);
    Ok(())
}
