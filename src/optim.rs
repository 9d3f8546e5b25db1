//! First-order optimizers for the latent code.
//!
//! The latent is the run's only trainable parameter, so each algorithm is
//! specialized to a single [`Var`] with its moment buffers held inline.
//! The algorithm is resolved once from its configured name; unknown names
//! fall back to Adam with a warning, by design.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use tracing::warn;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;
const ADAMW_WEIGHT_DECAY: f64 = 1e-2;
const DIFFGRAD_EPS: f64 = 1e-9;
const DIFFGRAD_WEIGHT_DECAY: f64 = 1e-9;
const RMSPROP_ALPHA: f64 = 0.99;
const ADAMP_DELTA: f64 = 0.1;

/// The supported gradient-descent algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Adam,
    AdamW,
    Adagrad,
    Adamax,
    DiffGrad,
    AdamP,
    RAdam,
    RmsProp,
}

impl Algorithm {
    /// Resolve an algorithm from its configured name.
    ///
    /// Unknown names warn and fall back to [`Algorithm::Adam`]; this is a
    /// configuration error class and intentionally non-fatal.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Adam" => Self::Adam,
            "AdamW" => Self::AdamW,
            "Adagrad" => Self::Adagrad,
            "Adamax" => Self::Adamax,
            "DiffGrad" => Self::DiffGrad,
            "AdamP" => Self::AdamP,
            "RAdam" => Self::RAdam,
            "RMSprop" => Self::RmsProp,
            other => {
                warn!("unknown optimiser {other:?}, falling back to Adam");
                Self::Adam
            }
        }
    }
}

/// One optimizer bound to one latent tensor.
///
/// Must be re-created whenever the latent is replaced: the moment buffers
/// are only meaningful for the tensor they were accumulated against.
pub struct LatentOptimizer {
    var: Var,
    algorithm: Algorithm,
    lr: f64,
    step_t: usize,
    /// First moment (Adam family) or gradient accumulator (Adagrad).
    m: Tensor,
    /// Second moment, infinity norm (Adamax) or mean square (RMSprop).
    v: Tensor,
    /// Previous gradient, used by DiffGrad's friction term.
    prev_grad: Tensor,
}

impl LatentOptimizer {
    pub fn new(var: Var, algorithm: Algorithm, lr: f64) -> Result<Self> {
        let zeros = var.as_tensor().zeros_like()?;
        Ok(Self {
            var,
            algorithm,
            lr,
            step_t: 0,
            m: zeros.clone(),
            v: zeros.clone(),
            prev_grad: zeros,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Apply one update from the given gradient store.
    ///
    /// A missing gradient (e.g. every prompt detached by its stop
    /// threshold) leaves the latent untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let grad = match grads.get(&self.var) {
            Some(grad) => grad.clone(),
            None => return Ok(()),
        };
        self.step_t += 1;

        let update = match self.algorithm {
            Algorithm::Adam => self.adam_update(&grad)?,
            Algorithm::AdamW => self.adamw_update(&grad)?,
            Algorithm::Adagrad => self.adagrad_update(&grad)?,
            Algorithm::Adamax => self.adamax_update(&grad)?,
            Algorithm::DiffGrad => self.diffgrad_update(&grad)?,
            Algorithm::AdamP => self.adamp_update(&grad)?,
            Algorithm::RAdam => self.radam_update(&grad)?,
            Algorithm::RmsProp => self.rmsprop_update(&grad)?,
        };

        self.var.set(&self.var.sub(&update)?)
    }

    fn update_moments(&mut self, grad: &Tensor, beta1: f64, beta2: f64) -> Result<()> {
        self.m = ((&self.m * beta1)? + (grad * (1.0 - beta1))?)?;
        self.v = ((&self.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
        Ok(())
    }

    fn bias_corrections(&self) -> (f64, f64) {
        let t = self.step_t as i32;
        (1.0 - BETA1.powi(t), 1.0 - BETA2.powi(t))
    }

    fn adam_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.update_moments(grad, BETA1, BETA2)?;
        let (b1, b2) = self.bias_corrections();
        let m_hat = (&self.m / b1)?;
        let v_hat = (&self.v / b2)?;
        let denom = (v_hat.sqrt()? + EPS)?;
        m_hat.div(&denom)? * self.lr
    }

    fn adamw_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        let update = self.adam_update(grad)?;
        // Decoupled weight decay.
        update + (self.var.as_tensor() * (self.lr * ADAMW_WEIGHT_DECAY))?
    }

    fn adagrad_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.v = (&self.v + grad.sqr()?)?;
        let denom = (self.v.sqrt()? + EPS)?;
        grad.div(&denom)? * self.lr
    }

    fn adamax_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.m = ((&self.m * BETA1)? + (grad * (1.0 - BETA1))?)?;
        // Infinity norm in place of the second moment.
        self.v = (&self.v * BETA2)?.maximum(&grad.abs()?)?;
        let (b1, _) = self.bias_corrections();
        let denom = (&self.v + EPS)?;
        self.m.div(&denom)? * (self.lr / b1)
    }

    fn diffgrad_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.update_moments(grad, BETA1, BETA2)?;
        let (b1, b2) = self.bias_corrections();
        // Friction: sigmoid of the gradient change, damping oscillating
        // coordinates.
        let diff = self.prev_grad.sub(grad)?.abs()?;
        let friction = (diff.neg()?.exp()? + 1.0)?.recip()?;
        let m_hat = (&self.m / b1)?;
        let v_hat = (&self.v / b2)?;
        let denom = (v_hat.sqrt()? + DIFFGRAD_EPS)?;
        let update = (m_hat.mul(&friction)?.div(&denom)? * self.lr)?;
        let update = (update + (self.var.as_tensor() * (self.lr * DIFFGRAD_WEIGHT_DECAY))?)?;
        self.prev_grad = grad.clone();
        Ok(update)
    }

    fn adamp_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.update_moments(grad, BETA1, BETA2)?;
        let (b1, b2) = self.bias_corrections();
        let m_hat = (&self.m / b1)?;
        let v_hat = (&self.v / b2)?;
        let denom = (v_hat.sqrt()? + EPS)?;
        let perturb = m_hat.div(&denom)?;

        let p_flat = self.var.as_tensor().flatten_all()?;
        let g_flat = grad.flatten_all()?;
        let p_norm = p_flat.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
        let g_norm = g_flat.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
        let dot = p_flat.mul(&g_flat)?.sum_all()?.to_scalar::<f32>()? as f64;
        let cosine = dot.abs() / (p_norm * g_norm + 1e-12);
        let dim = p_flat.elem_count() as f64;

        let perturb = if cosine < ADAMP_DELTA / dim.sqrt() {
            // Scale-invariant parameter: project out the radial component
            // so the update does not inflate the latent's norm.
            let unit = (self.var.as_tensor() / (p_norm + 1e-12))?;
            let radial = unit.mul(&perturb)?.sum_all()?;
            perturb.sub(&unit.broadcast_mul(&radial)?)?
        } else {
            perturb
        };

        perturb * self.lr
    }

    fn radam_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.update_moments(grad, BETA1, BETA2)?;
        let (b1, b2) = self.bias_corrections();
        let t = self.step_t as f64;
        let rho_inf = 2.0 / (1.0 - BETA2) - 1.0;
        let b2_pow = BETA2.powi(self.step_t as i32);
        let rho_t = rho_inf - 2.0 * t * b2_pow / (1.0 - b2_pow);
        let m_hat = (&self.m / b1)?;

        if rho_t > 5.0 {
            // Variance is tractable: rectified adaptive step.
            let rect = (((rho_t - 4.0) * (rho_t - 2.0) * rho_inf)
                / ((rho_inf - 4.0) * (rho_inf - 2.0) * rho_t))
                .sqrt();
            let v_hat = (&self.v / b2)?;
            let denom = (v_hat.sqrt()? + EPS)?;
            m_hat.div(&denom)? * (self.lr * rect)
        } else {
            // Warmup: un-adapted SGD-with-momentum step.
            m_hat * self.lr
        }
    }

    fn rmsprop_update(&mut self, grad: &Tensor) -> Result<Tensor> {
        self.v = ((&self.v * RMSPROP_ALPHA)? + (grad.sqr()? * (1.0 - RMSPROP_ALPHA))?)?;
        let denom = (self.v.sqrt()? + EPS)?;
        grad.div(&denom)? * self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_loss(var: &Var) -> Result<Tensor> {
        // (x - 3)^2 summed over elements
        (var.as_tensor() - 3.0)?.sqr()?.sum_all()
    }

    fn run_descent(algorithm: Algorithm) -> Result<(f32, f32)> {
        let device = Device::Cpu;
        let var = Var::new(&[5.0f32, -1.0], &device)?;
        let initial = quadratic_loss(&var)?.to_scalar::<f32>()?;
        let mut optimizer = LatentOptimizer::new(var.clone(), algorithm, 0.1)?;
        let mut last = initial;
        for _ in 0..50 {
            let loss = quadratic_loss(&var)?;
            last = loss.to_scalar::<f32>()?;
            let grads = loss.backward()?;
            optimizer.step(&grads)?;
        }
        Ok((initial, last))
    }

    #[test]
    fn every_algorithm_descends_a_quadratic() -> Result<()> {
        for algorithm in [
            Algorithm::Adam,
            Algorithm::AdamW,
            Algorithm::Adagrad,
            Algorithm::Adamax,
            Algorithm::DiffGrad,
            Algorithm::AdamP,
            Algorithm::RAdam,
            Algorithm::RmsProp,
        ] {
            let (initial, last) = run_descent(algorithm)?;
            assert!(
                last < initial,
                "{algorithm:?} did not descend: {initial} -> {last}"
            );
        }
        Ok(())
    }

    #[test]
    fn unknown_name_falls_back_to_adam() {
        assert_eq!(Algorithm::from_name("Banana"), Algorithm::Adam);
        assert_eq!(Algorithm::from_name("RMSprop"), Algorithm::RmsProp);
        assert_eq!(Algorithm::from_name("DiffGrad"), Algorithm::DiffGrad);
    }

    #[test]
    fn missing_gradient_is_a_no_op() -> Result<()> {
        let device = Device::Cpu;
        let var = Var::new(&[1.0f32], &device)?;
        let unrelated = Var::new(&[2.0f32], &device)?;
        let before = var.as_tensor().to_vec1::<f32>()?;
        let loss = unrelated.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        let mut optimizer = LatentOptimizer::new(var.clone(), Algorithm::Adam, 0.1)?;
        optimizer.step(&grads)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, before);
        Ok(())
    }
}
