//! The frozen CLIP perceptual scorer.
//!
//! Wraps the candle-transformers CLIP implementation (both towers) behind
//! the three operations the engine needs: encode a text prompt, encode a
//! batch of image views, and report the model's input resolution and
//! embedding width. Weights are plain tensors, never `Var`s, so gradients
//! flow through the towers but never into them.

use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::models::clip::text_model::{Activation, ClipTextConfig};
use candle_transformers::models::clip::vision_model::ClipVisionConfig;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use tokenizers::Tokenizer;
use tracing::info;

use crate::loader::{self, LoaderError};

/// CLIP channel statistics applied before either image tower.
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f32; 3] = [0.268_629_5, 0.261_302_6, 0.275_777_1];

fn vit_base_patch16_config() -> ClipConfig {
    let text_config = ClipTextConfig {
        vocab_size: 49408,
        embed_dim: 512,
        activation: Activation::QuickGelu,
        intermediate_size: 2048,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 8,
        projection_dim: 512,
    };
    let vision_config = ClipVisionConfig {
        embed_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        projection_dim: 512,
        num_channels: 3,
        image_size: 224,
        patch_size: 16,
    };
    ClipConfig {
        text_config,
        vision_config,
        logit_scale_init_value: 2.6592,
        image_size: 224,
    }
}

/// Map a model identifier to (config, hub repo).
///
/// Identifiers other than the two ViT-B names are treated as raw repo ids
/// with the patch32 architecture.
fn resolve_model(spec: &str) -> (ClipConfig, String) {
    match spec {
        "ViT-B/32" => (
            ClipConfig::vit_base_patch32(),
            "openai/clip-vit-base-patch32".to_string(),
        ),
        "ViT-B/16" => (
            vit_base_patch16_config(),
            "openai/clip-vit-base-patch16".to_string(),
        ),
        other => (ClipConfig::vit_base_patch32(), other.to_string()),
    }
}

/// The loaded scorer.
pub struct Perceptor {
    model: ClipModel,
    tokenizer: Tokenizer,
    input_resolution: usize,
    embedding_dim: usize,
    max_position_embeddings: usize,
    pad_token: u32,
    device: Device,
}

impl Perceptor {
    /// Load a perceptor by identifier, fetching weights from the hub
    /// unless a local directory is supplied.
    pub fn load(
        spec: &str,
        local: Option<&std::path::Path>,
        device: &Device,
    ) -> std::result::Result<Self, LoaderError> {
        let (config, repo_id) = resolve_model(spec);
        let (weights, tokenizer_path) = loader::fetch_clip_files(&repo_id, local)?;

        let vb = loader::mmap_safetensors(&weights, DType::F32, device)?;
        let model = ClipModel::new(vb, &config)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| LoaderError::Fetch {
            what: tokenizer_path.display().to_string(),
            message: e.to_string(),
        })?;
        let pad_token = tokenizer
            .token_to_id("<|endoftext|>")
            .unwrap_or(config.text_config.vocab_size as u32 - 1);
        info!("loaded CLIP perceptor {spec} ({repo_id})");

        Ok(Self {
            model,
            tokenizer,
            input_resolution: config.vision_config.image_size,
            embedding_dim: config.vision_config.projection_dim,
            max_position_embeddings: config.text_config.max_position_embeddings,
            pad_token,
            device: device.clone(),
        })
    }

    /// Square edge length the image tower expects.
    pub fn input_resolution(&self) -> usize {
        self.input_resolution
    }

    /// Width of the shared embedding space.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Apply the CLIP channel statistics to a `[N, 3, R, R]` batch in
    /// `[0, 1]`.
    pub fn normalize(&self, images: &Tensor) -> Result<Tensor> {
        let mean = Tensor::new(&CLIP_MEAN, images.device())?
            .reshape((1, 3, 1, 1))?
            .to_dtype(images.dtype())?;
        let std = Tensor::new(&CLIP_STD, images.device())?
            .reshape((1, 3, 1, 1))?
            .to_dtype(images.dtype())?;
        images.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    /// Tokenize and encode a text prompt into `[1, D]`.
    pub fn encode_text(&self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenization failed: {e}")))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        ids.truncate(self.max_position_embeddings);
        while ids.len() < self.max_position_embeddings {
            ids.push(self.pad_token);
        }
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        self.model.get_text_features(&input_ids)
    }

    /// Encode a normalized batch of image views into `[N, D]`.
    pub fn encode_image_batch(&self, images: &Tensor) -> Result<Tensor> {
        self.model.get_image_features(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identifiers_resolve_to_openai_repos() {
        let (config, repo) = resolve_model("ViT-B/32");
        assert_eq!(repo, "openai/clip-vit-base-patch32");
        assert_eq!(config.vision_config.patch_size, 32);

        let (config, repo) = resolve_model("ViT-B/16");
        assert_eq!(repo, "openai/clip-vit-base-patch16");
        assert_eq!(config.vision_config.patch_size, 16);
        assert_eq!(config.vision_config.image_size, 224);
        assert_eq!(config.vision_config.projection_dim, 512);
    }

    #[test]
    fn unknown_identifier_is_a_repo_id() {
        let (_, repo) = resolve_model("acme/clip-custom");
        assert_eq!(repo, "acme/clip-custom");
    }
}
