//! Optimizer construction and gradient clipping.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use thinkchat_core::Result;

/// L2 norm over every gradient that belongs to `vars`.
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` disables clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = compute_grad_norm(grads, vars)?;
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

/// AdamW over `vars`.
pub fn adamw(
    vars: Vec<Var>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        beta1,
        beta2,
        eps,
        weight_decay,
    };
    Ok(AdamW::new(vars, params)?)
}

/// Backward, clip and step. Returns the pre-clip gradient norm.
pub fn clipped_step(
    optimizer: &mut AdamW,
    loss: &candle_core::Tensor,
    vars: &[Var],
    max_grad_norm: f64,
) -> Result<f64> {
    let mut grads = loss.backward()?;
    let norm = clip_grad_norm(&mut grads, vars, max_grad_norm)?;
    optimizer.step(&grads)?;
    Ok(norm)
}
