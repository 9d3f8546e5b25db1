//! The training loop engine.
//!
//! An [`Engine`] owns the trainable latent, the two frozen models, the
//! cutout sampler, the active prompt set, and the optimizer. One call to
//! [`Engine::train`] is the atomic unit of progress: synthesize, score,
//! backpropagate, step, clamp. Engines are not reentrant; callers
//! serialize calls into one instance, but independent instances can
//! coexist.

use candle_core::{DType, Device, Result as CandleResult, Tensor, Var};
use image::DynamicImage;
use std::path::Path;
use tracing::{info, warn};

use crate::config::VqganClipConfig;
use crate::cutouts::{CutMethod, CutoutSampler};
use crate::image_io::{self, ImageIoError};
use crate::loader::LoaderError;
use crate::models::vqgan::VqganModel;
use crate::ops;
use crate::optim::{Algorithm, LatentOptimizer};
use crate::perceptor::Perceptor;
use crate::prompt::{split_prompt, ParsedPrompts, Prompt};
use crate::utils::Pcg32;

/// Errors surfaced by engine construction and I/O paths.
///
/// Tensor-math failures inside `train` (device out-of-memory, backend
/// errors) stay `candle_core::Error` and propagate unmodified; they are
/// fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    ImageIo(#[from] ImageIoError),

    #[error("invalid prompt {prompt:?}: {message}")]
    InvalidPrompt { prompt: String, message: String },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

fn parse_device(spec: &str) -> Device {
    if spec == "cpu" {
        return Device::Cpu;
    }
    let ordinal = spec
        .strip_prefix("cuda")
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    match Device::cuda_if_available(ordinal) {
        Ok(device) => device,
        Err(e) => {
            warn!("CUDA not available: {e}, falling back to CPU");
            Device::Cpu
        }
    }
}

pub(crate) fn fidelity_scale(init_weight: f32, iteration: usize) -> f64 {
    // Decays as 1/(2(2i+1)): strong on the first iterations, near zero
    // within a few dozen.
    init_weight as f64 / (2.0 * (2.0 * iteration as f64 + 1.0))
}

pub struct Engine {
    config: VqganClipConfig,
    device: Device,
    model: VqganModel,
    perceptor: Perceptor,
    cutouts: CutoutSampler,
    /// The trainable latent, exclusively owned by this engine.
    z: Var,
    /// Snapshot of the latent at initialization; not trainable.
    z_orig: Tensor,
    /// Per-channel codebook bounds, enforced after every step.
    z_min: Tensor,
    z_max: Tensor,
    prompts: Vec<Prompt>,
    optimizer: Option<LatentOptimizer>,
    /// The synthesized image from the most recent train/synthesis call.
    output: Option<Tensor>,
    seed: u64,
    noise_rng: Pcg32,
    /// Text embedded into saved PNGs, taken from the first text prompt.
    comment: Option<String>,
}

impl Engine {
    /// Load both frozen models, build the cutout sampler, and initialize
    /// the latent from the configured source.
    ///
    /// Missing or incompatible weight files are fatal.
    pub fn new(config: VqganClipConfig) -> Result<Self, EngineError> {
        let device = parse_device(&config.device);
        let model =
            VqganModel::from_files(&config.vqgan_config, &config.vqgan_checkpoint, &device)?;
        let perceptor = Perceptor::load(
            &config.clip_model,
            config.clip_model_path.as_deref(),
            &device,
        )?;
        let cutouts = CutoutSampler::new(
            CutMethod::from_name(&config.cut_method),
            perceptor.input_resolution(),
            config.num_cuts,
            config.cut_power,
            &config.augments,
            config.deterministic,
        );
        let (z_min, z_max) = model.codebook().value_range()?;
        let seed = config.seed.unwrap_or_else(rand::random::<u64>);

        let placeholder = Var::from_tensor(&Tensor::zeros(
            (1, model.codebook().code_dim(), 1, 1),
            DType::F32,
            &device,
        )?)?;
        let mut engine = Self {
            config,
            device,
            model,
            perceptor,
            cutouts,
            z: placeholder.clone(),
            z_orig: placeholder.as_tensor().clone(),
            z_min,
            z_max,
            prompts: Vec::new(),
            optimizer: None,
            output: None,
            seed: 0,
            noise_rng: Pcg32::new(0, 1),
            comment: None,
        };
        engine.set_seed(seed)?;
        engine.initialize_latent()?;
        Ok(engine)
    }

    /// Seed every random source owned by this engine.
    ///
    /// This alone does not guarantee bit-identical runs on accelerator
    /// backends; combine with the `deterministic` config flag for that.
    pub fn set_seed(&mut self, seed: u64) -> CandleResult<()> {
        self.seed = seed;
        self.device.set_seed(seed)?;
        self.cutouts.reseed(seed);
        self.noise_rng = Pcg32::new(seed, 1);
        Ok(())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &VqganClipConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Output dimensions floored to the VQGAN stride.
    pub fn calculate_output_image_size(&self) -> (usize, usize) {
        self.model.aligned_size(
            self.config.output_image_size[0],
            self.config.output_image_size[1],
        )
    }

    // =========================================================================
    // Latent initialization
    // =========================================================================

    fn initialize_latent(&mut self) -> Result<(), EngineError> {
        if let Some(source) = self.config.init_image.clone() {
            let img = image_io::load_image(&source)?;
            self.convert_image_to_init_image(&img)?;
        } else if let Some(noise) = self.config.init_noise.clone() {
            let (width, height) = self.calculate_output_image_size();
            let img = match noise.as_str() {
                "gradient" => {
                    image_io::make_random_gradient_image(width, height, &mut self.noise_rng)
                }
                "pixels" => image_io::make_random_noise_image(width, height, &mut self.noise_rng),
                other => {
                    warn!("unknown init_noise {other:?}, using pixels");
                    image_io::make_random_noise_image(width, height, &mut self.noise_rng)
                }
            };
            self.convert_image_to_init_image(&DynamicImage::ImageRgb8(img))?;
        } else {
            self.initialize_latent_from_tokens()?;
        }
        Ok(())
    }

    /// Random one-hot codebook tokens over the downsampled grid, embedded
    /// into code space.
    fn initialize_latent_from_tokens(&mut self) -> CandleResult<()> {
        let (width, height) = self.calculate_output_image_size();
        let f = self.model.downsample_factor();
        let (toks_x, toks_y) = (width / f, height / f);
        let num_codes = self.model.codebook().num_codes() as u32;
        let code_dim = self.model.codebook().code_dim();

        let indices: Vec<u32> = (0..toks_x * toks_y)
            .map(|_| self.noise_rng.next_u32_below(num_codes))
            .collect();
        let indices = Tensor::from_vec(indices, toks_x * toks_y, &self.device)?;
        let z = self.model.codebook().lookup(&indices)?;
        let z = z
            .reshape((1, toks_y, toks_x, code_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        self.replace_latent(z)
    }

    /// Re-seed the optimization from a pixel image: resize to the aligned
    /// output size, encode, and replace the latent and its origin copy.
    ///
    /// The caller must run [`Engine::configure_optimizer`] again before
    /// the next `train`: moment buffers accumulated against the old
    /// latent are meaningless for the new one.
    pub fn convert_image_to_init_image(&mut self, img: &DynamicImage) -> Result<(), EngineError> {
        let (width, height) = self.calculate_output_image_size();
        let img = image_io::resize_lanczos(img, width, height);
        let pixels = image_io::image_to_tensor01(&img, &self.device)?;
        let z = self.model.encode(&pixels)?;
        self.replace_latent(z)?;
        Ok(())
    }

    fn replace_latent(&mut self, z: Tensor) -> CandleResult<()> {
        let z = z.detach();
        self.z_orig = z.clone();
        self.z = Var::from_tensor(&z)?;
        self.output = None;
        // Stale moment buffers must not survive a latent swap.
        self.optimizer = None;
        Ok(())
    }

    // =========================================================================
    // Optimizer
    // =========================================================================

    /// Bind the configured optimizer to the current latent.
    ///
    /// Must be called after the latent exists and before the first
    /// `train`, and again after any latent replacement.
    pub fn configure_optimizer(&mut self) -> CandleResult<()> {
        let algorithm = Algorithm::from_name(&self.config.optimiser);
        self.optimizer = Some(LatentOptimizer::new(
            self.z.clone(),
            algorithm,
            self.config.learning_rate,
        )?);
        Ok(())
    }

    // =========================================================================
    // The atomic step
    // =========================================================================

    /// One optimization step.
    ///
    /// Synthesizes the current image, scores it against every active
    /// prompt, backpropagates the summed loss into the latent, applies
    /// one optimizer step, and clamps the latent back into the codebook
    /// range. Returns the unsummed loss vector (fidelity term first when
    /// configured, then one value per prompt) for logging.
    pub fn train(&mut self, iteration: usize) -> CandleResult<Vec<f32>> {
        if self.optimizer.is_none() {
            candle_core::bail!("configure_optimizer must be called before train");
        }

        // Gradients are accumulated into a fresh store by each backward
        // pass; nothing persists between steps.
        let (terms, report) = self.evaluate_losses(iteration)?;
        if terms.is_empty() {
            return Ok(report);
        }

        let total = Tensor::stack(&terms, 0)?.sum_all()?;
        let grads = total.backward()?;
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.step(&grads)?;
        }

        // Hard clamp into the codebook's value range, outside the tape.
        let clamped = self
            .z
            .detach()
            .broadcast_maximum(&self.z_min)?
            .broadcast_minimum(&self.z_max)?;
        self.z.set(&clamped)?;

        Ok(report)
    }

    fn evaluate_losses(&mut self, iteration: usize) -> CandleResult<(Vec<Tensor>, Vec<f32>)> {
        let output = self.synthesize()?;
        let mut terms = Vec::new();
        let mut report = Vec::new();

        if self.config.init_weight != 0.0 {
            let mse = self.z.as_tensor().sqr()?.mean_all()?;
            let term = (mse * fidelity_scale(self.config.init_weight, iteration))?;
            report.push(term.to_scalar::<f32>()?);
            terms.push(term);
        }

        if !self.prompts.is_empty() {
            let views = self.cutouts.sample(&output)?;
            let views = self.perceptor.normalize(&views)?;
            let image_embed = self.perceptor.encode_image_batch(&views)?;
            for prompt in &self.prompts {
                let (loss, _similarity) = prompt.loss(&image_embed)?;
                report.push(loss.to_scalar::<f32>()?);
                terms.push(loss);
            }
        }

        self.output = Some(output.detach());
        Ok((terms, report))
    }

    /// Decode the current latent to pixels in `[0, 1]`.
    ///
    /// Straight-through vector quantization snaps each latent vector to
    /// its nearest codebook entry on the forward pass while the gradient
    /// flows as if unquantized; the final clamp keeps its gradient alive
    /// the same way.
    fn synthesize(&self) -> CandleResult<Tensor> {
        let z_view = self.z.as_tensor().permute((0, 2, 3, 1))?;
        let z_q = ops::vector_quantize(&z_view, self.model.codebook().weight())?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let decoded = self.model.decode(&z_q)?;
        ops::clamp_with_grad(&decoded.affine(0.5, 0.5)?, 0.0, 1.0)
    }

    /// The synthesized image cached by the last `train` call, if any.
    pub fn output_image(&self) -> Option<&Tensor> {
        self.output.as_ref()
    }

    /// The immutable snapshot taken when the latent was last initialized.
    pub fn origin_latent(&self) -> &Tensor {
        &self.z_orig
    }

    /// Write the current output as a lossless PNG.
    ///
    /// Synthesizes on demand when no cached output exists yet, so this is
    /// safe to call at any point after initialization.
    pub fn save_current_output(&mut self, path: &Path) -> Result<(), EngineError> {
        let output = match &self.output {
            Some(cached) => cached.clone(),
            None => {
                let fresh = self.synthesize()?.detach();
                self.output = Some(fresh.clone());
                fresh
            }
        };
        let img = image_io::tensor01_to_image(&output)?;
        image_io::save_png_with_comment(&img, path, self.comment.as_deref())?;
        Ok(())
    }

    // =========================================================================
    // Prompts
    // =========================================================================

    /// Drop every active prompt, e.g. before rotating to the next story
    /// segment.
    pub fn clear_all_prompts(&mut self) {
        self.prompts.clear();
        self.comment = None;
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.len()
    }

    /// Encode a `"text:weight[:stop]"` prompt through the text tower.
    pub fn encode_and_append_text_prompt(&mut self, prompt: &str) -> CandleResult<()> {
        let (text, weight, stop) = split_prompt(prompt);
        let embed = self.perceptor.encode_text(&text)?.detach();
        if self.comment.is_none() {
            self.comment = Some(text);
        }
        self.prompts.push(Prompt::new(embed, weight, stop));
        Ok(())
    }

    /// Encode an `"image_path:weight[:stop]"` prompt: load, resize to the
    /// output aspect, and score its cutout views through the image tower.
    pub fn encode_and_append_image_prompt(&mut self, prompt: &str) -> Result<(), EngineError> {
        let (path, weight, stop) = split_prompt(prompt);
        let img = image_io::load_image(&path)?;
        self.encode_and_append_image(&img, weight, stop)?;
        Ok(())
    }

    /// Append an already-loaded image as a prompt. Used by the blended
    /// restyle driver to steer toward source and previously generated
    /// frames.
    pub fn encode_and_append_image(
        &mut self,
        img: &DynamicImage,
        weight: f32,
        stop: Option<f32>,
    ) -> CandleResult<()> {
        let (width, height) = self.calculate_output_image_size();
        let img = image_io::resize_lanczos(img, width, height);
        let pixels = image_io::image_to_tensor01(&img, &self.device)?;
        let views = self.cutouts.sample(&pixels)?;
        let views = self.perceptor.normalize(&views)?;
        let embed = self.perceptor.encode_image_batch(&views)?.detach();
        self.prompts.push(Prompt::new(embed, weight, stop));
        Ok(())
    }

    /// Encode a `"seed:weight[:stop]"` noise prompt: a standard-normal
    /// embedding drawn from a dedicated generator, no model inference.
    pub fn encode_and_append_noise_prompt(&mut self, prompt: &str) -> Result<(), EngineError> {
        let (seed_text, weight, stop) = split_prompt(prompt);
        let seed: u64 = seed_text
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidPrompt {
                prompt: prompt.to_string(),
                message: "noise prompts take an integer seed payload".to_string(),
            })?;
        let mut generator = Pcg32::new(seed, 3);
        let embed = generator.randn((1, self.perceptor.embedding_dim()), &self.device)?;
        self.prompts.push(Prompt::new(embed, weight, stop));
        Ok(())
    }

    /// Encode the selected story segment from each prompt kind.
    ///
    /// `prompt_number` indexes segments and wraps independently per kind,
    /// so shorter stories loop while longer ones advance.
    pub fn encode_and_append_prompts(
        &mut self,
        prompt_number: usize,
        parsed: &ParsedPrompts,
    ) -> Result<(), EngineError> {
        if !parsed.text.is_empty() {
            let segment = parsed.text[prompt_number % parsed.text.len()].clone();
            for prompt in &segment {
                info!("text prompt {prompt_number}: {prompt}");
                self.encode_and_append_text_prompt(prompt)?;
            }
        }
        if !parsed.image.is_empty() {
            let segment = parsed.image[prompt_number % parsed.image.len()].clone();
            for prompt in &segment {
                info!("image prompt {prompt_number}: {prompt}");
                self.encode_and_append_image_prompt(prompt)?;
            }
        }
        if !parsed.noise.is_empty() {
            let segment = parsed.noise[prompt_number % parsed.noise.len()].clone();
            for prompt in &segment {
                info!("noise prompt {prompt_number}: {prompt}");
                self.encode_and_append_noise_prompt(prompt)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_device_parses() {
        assert!(matches!(parse_device("cpu"), Device::Cpu));
    }

    #[test]
    fn fidelity_schedule_is_front_loaded() {
        assert_eq!(fidelity_scale(1.0, 0), 0.5);
        assert!((fidelity_scale(1.0, 1) - 1.0 / 6.0).abs() < 1e-12);
        assert!((fidelity_scale(2.0, 10) - 2.0 / 42.0).abs() < 1e-12);
        assert!(fidelity_scale(1.0, 100) < fidelity_scale(1.0, 10));
    }
}
