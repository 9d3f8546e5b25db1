//! Straight-through gradient primitives.
//!
//! The synthesis path contains two non-differentiable transforms: the snap
//! of each latent vector to its nearest codebook entry, and the clamp of
//! the decoded image into `[0, 1]`. Both are made trainable by taking the
//! forward value from the transformed tensor while routing the gradient
//! through the untransformed one.

use candle_core::{Result, Tensor, D};

/// Value of `fwd`, gradient of `bwd`.
///
/// `bwd + (fwd - bwd).detach()` evaluates to `fwd`, but only `bwd` stays on
/// the autograd tape.
pub fn replace_grad(fwd: &Tensor, bwd: &Tensor) -> Result<Tensor> {
    bwd.add(&fwd.sub(bwd)?.detach())
}

/// Element-wise clamp with an identity gradient.
pub fn clamp_with_grad(x: &Tensor, min: f64, max: f64) -> Result<Tensor> {
    let clamped = x.clamp(min, max)?;
    replace_grad(&clamped, x)
}

/// Straight-through vector quantization.
///
/// Snaps each vector along the last dimension of `x` to its Euclidean
/// nearest neighbor among the rows of `codebook` (`[num_codes, dim]`).
/// The forward value is the quantized tensor; the gradient passes through
/// as if no quantization occurred.
pub fn vector_quantize(x: &Tensor, codebook: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let dim = *dims.last().ok_or_else(|| {
        candle_core::Error::Msg("vector_quantize: input must have at least one dim".to_string())
    })?;

    let flat = x.reshape(((), dim))?.contiguous()?; // [m, dim]

    // Squared Euclidean distance: |x|^2 + |e|^2 - 2 x.e
    let x_sq = flat.sqr()?.sum_keepdim(D::Minus1)?; // [m, 1]
    let e_sq = codebook.sqr()?.sum(D::Minus1)?.unsqueeze(0)?; // [1, n]
    let xe = flat.matmul(&codebook.t()?.contiguous()?)?; // [m, n]
    let dist = x_sq.broadcast_add(&e_sq)?.sub(&(xe * 2.0)?)?;

    let indices = dist.argmin(D::Minus1)?; // [m] u32
    let quantized = codebook.index_select(&indices, 0)?.reshape(dims)?;

    replace_grad(&quantized, x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn clamp_with_grad_matches_clamp() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-1.5f32, -0.2, 0.4, 1.7], &device)?;
        let clamped = clamp_with_grad(&x, 0.0, 1.0)?;
        assert_eq!(clamped.to_vec1::<f32>()?, vec![0.0, 0.0, 0.4, 1.0]);
        Ok(())
    }

    #[test]
    fn clamp_with_grad_passes_gradient_through() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[-2.0f32, 0.5, 3.0], &device)?;
        let clamped = clamp_with_grad(&var, 0.0, 1.0)?;
        let loss = clamped.sum_all()?;
        let grads = loss.backward()?;
        let grad = grads.get(&var).expect("gradient for var");
        // Identity gradient even where the forward value was clamped.
        assert_eq!(grad.to_vec1::<f32>()?, vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn quantize_snaps_to_nearest_row() -> Result<()> {
        let device = Device::Cpu;
        let codebook = Tensor::new(&[[0.0f32, 0.0], [1.0, 1.0]], &device)?;
        let x = Tensor::new(&[[0.1f32, 0.2], [0.8, 0.9]], &device)?;
        let q = vector_quantize(&x, &codebook)?;
        assert_eq!(q.to_vec2::<f32>()?, vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn quantize_gradient_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let codebook = Tensor::new(&[[0.0f32, 0.0], [1.0, 1.0]], &device)?;
        let var = Var::new(&[[0.1f32, 0.2], [0.8, 0.9]], &device)?;
        let q = vector_quantize(&var, &codebook)?;
        let loss = q.sum_all()?;
        let grads = loss.backward()?;
        let grad = grads.get(&var).expect("gradient for var");
        assert_eq!(grad.to_vec2::<f32>()?, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        Ok(())
    }
}
