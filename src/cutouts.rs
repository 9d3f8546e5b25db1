//! Cutout sampling: randomly placed, randomly sized square views of the
//! synthesized image, resized to the perceptor's input resolution and
//! optionally augmented.
//!
//! Scoring many stochastic views instead of the full frame regularizes
//! the similarity signal. Five interchangeable strategies are supported,
//! differing in crop placement and augmentation chain; all yield a batch
//! of shape `(N, 3, R, R)` built from differentiable ops so gradients
//! reach the latent.

use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::utils::Pcg32;

/// Crop-placement strategy, resolved once from its configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutMethod {
    Latest,
    Original,
    Updated,
    NrUpdated,
    UpdatedPooling,
}

impl CutMethod {
    /// Unknown names warn and fall back to the pooling variant.
    pub fn from_name(name: &str) -> Self {
        match name {
            "latest" => Self::Latest,
            "original" => Self::Original,
            "updated" => Self::Updated,
            "nrupdated" => Self::NrUpdated,
            "updatedpooling" => Self::UpdatedPooling,
            other => {
                warn!("unknown cut method {other:?}, falling back to updatedpooling");
                Self::UpdatedPooling
            }
        }
    }
}

/// One stochastic augmentation in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugmentKind {
    /// `Ji`: brightness/contrast/saturation jitter.
    ColorJitter,
    /// `Gn`: additive gaussian noise.
    Noise,
    /// `Af`: horizontal flip plus integer translation.
    Affine,
    /// `Pe`: margin crop re-scaled back, a mild perspective stand-in.
    Perspective,
    /// `Er`: a random rectangle erased to zero.
    Erase,
    /// `Hf`: horizontal flip only.
    HFlip,
}

impl AugmentKind {
    /// Parse one configured chain; unsupported identifiers warn and are
    /// skipped.
    pub fn parse_chain(chain: &[String]) -> Vec<AugmentKind> {
        chain
            .iter()
            .filter_map(|name| match name.as_str() {
                "Ji" => Some(Self::ColorJitter),
                "Gn" => Some(Self::Noise),
                "Af" => Some(Self::Affine),
                "Pe" => Some(Self::Perspective),
                "Er" => Some(Self::Erase),
                "Hf" => Some(Self::HFlip),
                other => {
                    warn!("unsupported augmentation {other:?}, skipping");
                    None
                }
            })
            .collect()
    }
}

const DEFAULT_CHAIN: [AugmentKind; 4] = [
    AugmentKind::Affine,
    AugmentKind::Perspective,
    AugmentKind::ColorJitter,
    AugmentKind::Erase,
];

/// The sampler. Owns its RNG so a seeded engine replays the same views.
pub struct CutoutSampler {
    method: CutMethod,
    cut_size: usize,
    num_cuts: usize,
    cut_pow: f32,
    chain: Vec<AugmentKind>,
    rng: StdRng,
    pcg: Pcg32,
    deterministic: bool,
    noise_fac: f32,
}

impl CutoutSampler {
    pub fn new(
        method: CutMethod,
        cut_size: usize,
        num_cuts: usize,
        cut_pow: f32,
        chains: &[Vec<String>],
        deterministic: bool,
    ) -> Self {
        let chain = match method {
            CutMethod::Latest | CutMethod::NrUpdated => chains
                .first()
                .map(|c| AugmentKind::parse_chain(c))
                .unwrap_or_else(|| DEFAULT_CHAIN.to_vec()),
            CutMethod::Updated | CutMethod::UpdatedPooling => DEFAULT_CHAIN.to_vec(),
            CutMethod::Original => Vec::new(),
        };
        Self {
            method,
            cut_size,
            num_cuts,
            cut_pow,
            chain,
            rng: StdRng::seed_from_u64(0),
            pcg: Pcg32::new(0, 2),
            deterministic,
            noise_fac: 0.1,
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        self.pcg = Pcg32::new(seed, 2);
    }

    pub fn cut_size(&self) -> usize {
        self.cut_size
    }

    pub fn method(&self) -> CutMethod {
        self.method
    }

    /// Produce the `(N, 3, R, R)` batch of augmented views.
    pub fn sample(&mut self, input: &Tensor) -> Result<Tensor> {
        let batch = match self.method {
            CutMethod::Original => self.random_crops(input)?,
            CutMethod::Updated | CutMethod::NrUpdated | CutMethod::Latest => {
                let crops = self.random_crops(input)?;
                let chain = self.chain.clone();
                self.apply_chain(crops, &chain)?
            }
            CutMethod::UpdatedPooling => {
                let pooled = self.pooled_view(input)?;
                let batch = pooled.repeat((self.num_cuts, 1, 1, 1))?;
                let chain = self.chain.clone();
                self.apply_chain(batch, &chain)?
            }
        };
        if self.method == CutMethod::Latest {
            self.add_view_noise(batch)
        } else {
            Ok(batch)
        }
    }

    fn random_crops(&mut self, input: &Tensor) -> Result<Tensor> {
        let (_b, _c, side_y, side_x) = input.dims4()?;
        let max_size = side_x.min(side_y);
        let min_size = max_size.min(self.cut_size);
        let mut cuts = Vec::with_capacity(self.num_cuts);
        for _ in 0..self.num_cuts {
            // Power-law bias: cut_pow > 1 favors small close-ups,
            // < 1 favors near-full-frame context.
            let r = self.rng.gen::<f32>().powf(self.cut_pow);
            let size = ((r * (max_size - min_size) as f32) as usize + min_size).min(max_size);
            let off_x = self.rng.gen_range(0..=side_x - size);
            let off_y = self.rng.gen_range(0..=side_y - size);
            let cut = input.narrow(2, off_y, size)?.narrow(3, off_x, size)?;
            cuts.push(self.resize_square(&cut)?);
        }
        Tensor::cat(&cuts, 0)
    }

    fn resize_square(&self, cut: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = cut.dims4()?;
        if h == self.cut_size && w == self.cut_size {
            Ok(cut.clone())
        } else {
            cut.contiguous()?
                .upsample_nearest2d(self.cut_size, self.cut_size)
        }
    }

    /// Blend of adaptive average and max pooling down to the cut size.
    fn pooled_view(&self, input: &Tensor) -> Result<Tensor> {
        let avg = self.adaptive_pool(input, false)?;
        let max = self.adaptive_pool(input, true)?;
        (avg + max)? * 0.5
    }

    fn adaptive_pool(&self, input: &Tensor, take_max: bool) -> Result<Tensor> {
        let (_b, _c, h, w) = input.dims4()?;
        let kh = (h / self.cut_size).max(1);
        let kw = (w / self.cut_size).max(1);
        let pooled = if take_max {
            input.max_pool2d((kh, kw))?
        } else {
            input.avg_pool2d((kh, kw))?
        };
        self.resize_square(&pooled)
    }

    fn apply_chain(&mut self, batch: Tensor, chain: &[AugmentKind]) -> Result<Tensor> {
        let mut batch = batch;
        for kind in chain {
            batch = match kind {
                AugmentKind::ColorJitter => self.color_jitter(batch)?,
                AugmentKind::Noise => self.add_view_noise(batch)?,
                AugmentKind::Affine => self.affine_jitter(batch)?,
                AugmentKind::Perspective => self.perspective_jitter(batch)?,
                AugmentKind::Erase => self.erase(batch)?,
                AugmentKind::HFlip => self.maybe_hflip(batch, 0.5)?,
            };
        }
        Ok(batch)
    }

    fn chance(&mut self, p: f32) -> bool {
        self.rng.gen::<f32>() < p
    }

    fn uniform(&mut self, lo: f32, hi: f32) -> f32 {
        self.rng.gen_range(lo..hi)
    }

    fn noise_like(&mut self, batch: &Tensor) -> Result<Tensor> {
        if self.deterministic {
            self.pcg.randn(batch.shape().clone(), batch.device())
        } else {
            Tensor::randn(0f32, 1.0, batch.shape(), batch.device())
        }
    }

    fn color_jitter(&mut self, batch: Tensor) -> Result<Tensor> {
        if !self.chance(0.7) {
            return Ok(batch);
        }
        let brightness = self.uniform(-0.1, 0.1) as f64;
        let contrast = self.uniform(0.9, 1.1) as f64;
        let saturation = self.uniform(0.9, 1.1) as f64;

        // Contrast around the per-view spatial mean.
        let mean = batch.mean_keepdim(2)?.mean_keepdim(3)?;
        let x = (batch.broadcast_sub(&mean)? * contrast)?.broadcast_add(&mean)?;
        let x = (x + brightness)?;
        // Saturation around the per-pixel gray value.
        let gray = x.mean_keepdim(1)?;
        (x.broadcast_sub(&gray)? * saturation)?.broadcast_add(&gray)
    }

    fn add_view_noise(&mut self, batch: Tensor) -> Result<Tensor> {
        let fac = self.uniform(0.0, self.noise_fac) as f64;
        if fac == 0.0 {
            return Ok(batch);
        }
        let noise = (self.noise_like(&batch)? * fac)?;
        batch + noise
    }

    fn maybe_hflip(&mut self, batch: Tensor, p: f32) -> Result<Tensor> {
        if !self.chance(p) {
            return Ok(batch);
        }
        let (_b, _c, _h, w) = batch.dims4()?;
        let reversed: Vec<u32> = (0..w as u32).rev().collect();
        let index = Tensor::from_vec(reversed, w, batch.device())?;
        batch.index_select(&index, 3)
    }

    fn translate(&self, batch: &Tensor, dx: i64, dy: i64) -> Result<Tensor> {
        let (_b, _c, h, w) = batch.dims4()?;
        let x = match dx.cmp(&0) {
            std::cmp::Ordering::Greater => batch
                .pad_with_zeros(3, dx as usize, 0)?
                .narrow(3, 0, w)?,
            std::cmp::Ordering::Less => batch
                .pad_with_zeros(3, 0, (-dx) as usize)?
                .narrow(3, (-dx) as usize, w)?,
            std::cmp::Ordering::Equal => batch.clone(),
        };
        match dy.cmp(&0) {
            std::cmp::Ordering::Greater => x.pad_with_zeros(2, dy as usize, 0)?.narrow(2, 0, h),
            std::cmp::Ordering::Less => x
                .pad_with_zeros(2, 0, (-dy) as usize)?
                .narrow(2, (-dy) as usize, h),
            std::cmp::Ordering::Equal => Ok(x),
        }
    }

    fn affine_jitter(&mut self, batch: Tensor) -> Result<Tensor> {
        if !self.chance(0.8) {
            return Ok(batch);
        }
        let batch = self.maybe_hflip(batch, 0.5)?;
        let max_shift = (self.cut_size / 8) as i64;
        let dx = self.rng.gen_range(-max_shift..=max_shift);
        let dy = self.rng.gen_range(-max_shift..=max_shift);
        self.translate(&batch, dx, dy)
    }

    fn perspective_jitter(&mut self, batch: Tensor) -> Result<Tensor> {
        if !self.chance(0.7) {
            return Ok(batch);
        }
        let margin = (self.cut_size as f32 * self.uniform(0.0, 0.15)) as usize;
        if margin == 0 {
            return Ok(batch);
        }
        let x0 = self.rng.gen_range(0..=margin);
        let y0 = self.rng.gen_range(0..=margin);
        let size = self.cut_size - margin;
        let cropped = batch.narrow(2, y0, size)?.narrow(3, x0, size)?;
        self.resize_square(&cropped)
    }

    fn erase(&mut self, batch: Tensor) -> Result<Tensor> {
        if !self.chance(0.7) {
            return Ok(batch);
        }
        let r = self.cut_size;
        let area = self.uniform(0.1, 0.4) * (r * r) as f32;
        let ratio = self.uniform(0.5, 2.0);
        let h = ((area * ratio).sqrt() as usize).clamp(1, r);
        let w = ((area / ratio).sqrt() as usize).clamp(1, r);
        let y0 = self.rng.gen_range(0..=r - h);
        let x0 = self.rng.gen_range(0..=r - w);

        let mut mask = vec![1.0f32; r * r];
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                mask[y * r + x] = 0.0;
            }
        }
        let mask = Tensor::from_vec(mask, (1, 1, r, r), batch.device())?;
        batch.broadcast_mul(&mask)
    }
}
