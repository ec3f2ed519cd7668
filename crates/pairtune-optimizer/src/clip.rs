//! Global gradient norm and clipping

use candle_core::{DType, Result};

use crate::NamedGrads;

/// L2 norm across every gradient, accumulated in f64.
pub fn global_grad_norm(grads: &NamedGrads) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for grad in grads.values() {
        let norm_sq = grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
        total_norm_sq += norm_sq as f64;
    }
    Ok(total_norm_sq.sqrt())
}

/// Rescale `grads` so their global norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut NamedGrads, max_norm: f64) -> Result<f64> {
    let total_norm = global_grad_norm(grads)?;

    if total_norm.is_finite() && total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for grad in grads.values_mut() {
            *grad = (&*grad * clip_coef)?;
        }
    }
    Ok(total_norm)
}
