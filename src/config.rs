//! Run configuration for VQGAN+CLIP synthesis.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A set of parameters controlling one synthesis run.
///
/// Immutable once handed to an [`crate::Engine`]; swap configurations by
/// constructing a new engine. Output dimensions are floored to the VQGAN's
/// stride factor before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VqganClipConfig {
    /// Output image dimensions in pixels (width, height).
    pub output_image_size: [usize; 2],
    /// Seed image to start the optimization from: a local path or an
    /// http(s) URL. Without one, the latent starts from random codebook
    /// tokens.
    pub init_image: Option<String>,
    /// Seed the latent from a generated noise image instead:
    /// "pixels" or "gradient".
    pub init_noise: Option<String>,
    /// Weight of the fidelity-to-initial-latent term. 0 disables it.
    pub init_weight: f32,
    /// Seed for the random number generators. None picks one from entropy.
    pub seed: Option<u64>,
    /// CLIP perceptor: "ViT-B/32", "ViT-B/16", or a HuggingFace repo id.
    pub clip_model: String,
    /// Local directory holding `model.safetensors` + `tokenizer.json` for
    /// the CLIP perceptor; overrides the hub fetch.
    pub clip_model_path: Option<PathBuf>,
    /// Path to the VQGAN model config (JSON).
    pub vqgan_config: PathBuf,
    /// Path to the VQGAN weights (safetensors).
    pub vqgan_checkpoint: PathBuf,
    pub learning_rate: f64,
    /// Cutout strategy: "latest", "original", "updated", "nrupdated" or
    /// "updatedpooling". Unknown names fall back to the pooling variant.
    pub cut_method: String,
    /// Number of cutouts scored per iteration.
    pub num_cuts: usize,
    /// Power-law exponent biasing cutout sizes toward the extremes.
    pub cut_power: f32,
    /// Route all noise tensors through a seeded CPU generator. Slower, but
    /// bit-reproducible across devices.
    pub deterministic: bool,
    /// Optimizer name: Adam, AdamW, Adagrad, Adamax, DiffGrad, AdamP,
    /// RAdam or RMSprop. Unknown names fall back to Adam.
    pub optimiser: String,
    /// Augmentation chains for the cutout sampler; the first chain is used.
    pub augments: Vec<Vec<String>>,
    /// Compute device: "cpu", "cuda" or "cuda:N". Falls back to CPU with a
    /// warning when CUDA is unavailable.
    pub device: String,
}

impl Default for VqganClipConfig {
    fn default() -> Self {
        Self {
            output_image_size: [256, 256],
            init_image: None,
            init_noise: None,
            init_weight: 0.0,
            seed: None,
            clip_model: "ViT-B/32".to_string(),
            clip_model_path: None,
            vqgan_config: PathBuf::from("models/vqgan_imagenet_f16_16384.json"),
            vqgan_checkpoint: PathBuf::from("models/vqgan_imagenet_f16_16384.safetensors"),
            learning_rate: 0.1,
            cut_method: "latest".to_string(),
            num_cuts: 32,
            cut_power: 1.0,
            deterministic: false,
            optimiser: "Adam".to_string(),
            augments: vec![vec![
                "Af".to_string(),
                "Pe".to_string(),
                "Ji".to_string(),
                "Er".to_string(),
            ]],
            device: "cuda:0".to_string(),
        }
    }
}
