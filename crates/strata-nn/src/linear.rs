use strata_core::{CoreError, DType, Result, Tensor};

use crate::args::Args;
use crate::init::InitScope;
use crate::module::{Module, Op};

/// Fully connected linear layer computation: y = x @ W^T + b.
///
/// Weights are read from the owning module's live slots at call time, so
/// hooks that swap slot contents (materialize, evict, cast) take effect
/// without the op's cooperation.
pub struct LinearOp;

impl Op for LinearOp {
    fn forward(&self, module: &Module, args: &Args) -> Result<Tensor> {
        let input = args
            .input()
            .ok_or_else(|| CoreError::Storage("linear forward requires an 'input' tensor".into()))?;
        let weight = module
            .own_tensor("weight")
            .ok_or_else(|| CoreError::Storage("linear module has no 'weight' slot".into()))?
            .get();
        let bias = module.own_tensor("bias").map(|slot| slot.get());

        let wdims = weight.dims().to_vec();
        if wdims.len() != 2 {
            return Err(CoreError::Storage(format!(
                "linear weight must be 2-d, got shape {wdims:?}"
            )));
        }
        let (out_features, in_features) = (wdims[0], wdims[1]);

        let x = input.to_f32_vec()?;
        let w = weight.to_f32_vec()?;
        let b = bias.map(|t| t.to_f32_vec()).transpose()?;

        let (rows, out_shape) = match input.dims() {
            [n] if *n == in_features => (1, vec![out_features]),
            [r, n] if *n == in_features => (*r, vec![*r, out_features]),
            dims => {
                return Err(CoreError::ShapeMismatch {
                    expected: vec![in_features],
                    got: dims.to_vec(),
                })
            }
        };

        let mut out = vec![0.0f32; rows * out_features];
        for r in 0..rows {
            let x_row = &x[r * in_features..(r + 1) * in_features];
            for o in 0..out_features {
                let w_row = &w[o * in_features..(o + 1) * in_features];
                let mut acc = 0.0f32;
                for (xv, wv) in x_row.iter().zip(w_row.iter()) {
                    acc += xv * wv;
                }
                if let Some(b) = &b {
                    acc += b[o];
                }
                out[r * out_features + o] = acc;
            }
        }

        Ok(Tensor::from_f32(&out, &out_shape))
    }
}

/// Build a Linear module with deterministic Xavier-style initialization.
pub fn linear(in_features: usize, out_features: usize, bias: bool) -> Module {
    // Xavier uniform limit: sqrt(6/(in+out)), filled with a deterministic
    // low-discrepancy sequence for reproducibility.
    let limit = (6.0 / (in_features + out_features) as f32).sqrt();
    let weight_data: Vec<f32> = (0..in_features * out_features)
        .map(|i| {
            let x = ((i as f32 * 0.618034) % 1.0) * 2.0 - 1.0;
            x * limit
        })
        .collect();

    let weight = Tensor::from_f32(&weight_data, &[out_features, in_features]);
    let bias_tensor = bias.then(|| Tensor::zeros(&[out_features], DType::F32));
    linear_from_weights(weight, bias_tensor)
}

/// Build a Linear module with its tensors placed by `scope`.
///
/// Under [`InitScope::Meta`] no weight data is ever allocated; the module
/// carries placeholders for a later checkpoint load.
pub fn linear_with(
    scope: &InitScope,
    in_features: usize,
    out_features: usize,
    bias: bool,
) -> Result<Module> {
    if matches!(scope, InitScope::Meta) {
        let weight = Tensor::meta(&[out_features, in_features], DType::F32);
        let bias_tensor = bias.then(|| Tensor::meta(&[out_features], DType::F32));
        return Ok(linear_from_weights(weight, bias_tensor));
    }
    let module = linear(in_features, out_features, bias);
    scope.apply(&module)?;
    Ok(module)
}

/// Build a Linear module around existing weight/bias tensors.
pub fn linear_from_weights(weight: Tensor, bias: Option<Tensor>) -> Module {
    let mut module = Module::new("Linear").with_op(Box::new(LinearOp));
    module.add_param("weight", weight);
    if let Some(bias) = bias {
        module.add_param("bias", bias);
    }
    module
}
