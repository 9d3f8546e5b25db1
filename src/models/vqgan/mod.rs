//! The frozen VQGAN generative model.
//!
//! Consumed through three operations: `encode` (pixels to quantized
//! latent), `decode` (latent to pixels), and codebook metadata. Weights
//! are loaded once from a safetensors checkpoint and never updated.

pub mod decoder;
pub mod encoder;
pub mod quantize;

use candle_core::{Device, DType, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, VarBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::loader::{self, LoaderError};
use crate::ops;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use quantize::Codebook;

/// Architecture of the encoder/decoder towers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdConfig {
    /// Latent channels produced by the encoder's final conv.
    pub z_channels: usize,
    /// Training resolution; together with `attn_resolutions` it decides
    /// where attention blocks sit.
    pub resolution: usize,
    pub in_channels: usize,
    pub out_ch: usize,
    /// Base channel count.
    pub ch: usize,
    /// Channel multiplier per resolution level. One x2 down/upsampling
    /// sits between adjacent levels, so the pixel stride of a latent cell
    /// is `2^(len - 1)`.
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub double_z: bool,
}

/// Full VQGAN model config, matching the JSON shipped next to a
/// checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VqganConfig {
    /// Dimensionality of one codebook entry.
    pub embed_dim: usize,
    /// Number of codebook entries.
    pub n_embed: usize,
    /// Categorical (gumbel) codebook variant; changes which weight tensor
    /// is read, nothing else.
    #[serde(default)]
    pub gumbel: bool,
    pub ddconfig: DdConfig,
}

impl VqganConfig {
    /// The f16 ImageNet configuration most published checkpoints use.
    pub fn imagenet_f16_16384() -> Self {
        Self {
            embed_dim: 256,
            n_embed: 16384,
            gumbel: false,
            ddconfig: DdConfig {
                z_channels: 256,
                resolution: 256,
                in_channels: 3,
                out_ch: 3,
                ch: 128,
                ch_mult: vec![1, 1, 2, 2, 4],
                num_res_blocks: 2,
                attn_resolutions: vec![16],
                dropout: 0.0,
                double_z: false,
            },
        }
    }
}

/// The assembled model: encoder, decoder, codebook, and the two 1x1
/// projection convs between them.
#[derive(Debug)]
pub struct VqganModel {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    codebook: Codebook,
    config: VqganConfig,
}

impl VqganModel {
    pub fn new(vb: VarBuilder, config: VqganConfig) -> Result<Self> {
        let encoder = Encoder::new(vb.pp("encoder"), &config.ddconfig)?;
        let decoder = Decoder::new(vb.pp("decoder"), &config.ddconfig)?;
        let quant_conv = conv2d(
            config.ddconfig.z_channels,
            config.embed_dim,
            1,
            Default::default(),
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = conv2d(
            config.embed_dim,
            config.ddconfig.z_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        let codebook = Codebook::new(vb.clone(), &config)?;
        Ok(Self {
            encoder,
            decoder,
            quant_conv,
            post_quant_conv,
            codebook,
            config,
        })
    }

    /// Load config and weights from disk.
    ///
    /// A missing or incompatible checkpoint is fatal; there is no
    /// fallback model.
    pub fn from_files(
        config_path: &Path,
        checkpoint_path: &Path,
        device: &Device,
    ) -> std::result::Result<Self, LoaderError> {
        let config: VqganConfig = loader::load_json_config(config_path)?;
        let vb = loader::mmap_safetensors(checkpoint_path, DType::F32, device)?;
        Ok(Self::new(vb, config)?)
    }

    pub fn config(&self) -> &VqganConfig {
        &self.config
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    /// Pixel stride of one latent cell.
    pub fn downsample_factor(&self) -> usize {
        1 << (self.config.ddconfig.ch_mult.len() - 1)
    }

    /// Floor pixel dimensions to the stride factor.
    pub fn aligned_size(&self, width: usize, height: usize) -> (usize, usize) {
        let f = self.downsample_factor();
        ((width / f) * f, (height / f) * f)
    }

    /// Encode `[B, 3, H, W]` pixels in `[0, 1]` to a quantized latent
    /// `[B, embed_dim, H/f, W/f]`.
    pub fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let x = pixels.affine(2.0, -1.0)?;
        let h = self.encoder.forward(&x)?;
        let h = self.quant_conv.forward(&h)?;
        let z = ops::vector_quantize(&h.permute((0, 2, 3, 1))?, self.codebook.weight())?;
        z.permute((0, 3, 1, 2))?.contiguous()
    }

    /// Decode a latent to pixels in the decoder's native `[-1, 1]` range.
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.post_quant_conv.forward(z)?;
        self.decoder.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> VqganConfig {
        VqganConfig {
            embed_dim: 8,
            n_embed: 16,
            gumbel: false,
            ddconfig: DdConfig {
                z_channels: 8,
                resolution: 32,
                in_channels: 3,
                out_ch: 3,
                ch: 8,
                ch_mult: vec![1, 2],
                num_res_blocks: 1,
                attn_resolutions: vec![16],
                dropout: 0.0,
                double_z: false,
            },
        }
    }

    #[test]
    fn encode_decode_shapes() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = VqganModel::new(vb, tiny_config())?;
        assert_eq!(model.downsample_factor(), 2);

        let pixels = Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &device)?;
        let z = model.encode(&pixels)?;
        assert_eq!(z.dims(), &[1, 8, 16, 16]);

        let decoded = model.decode(&z)?;
        assert_eq!(decoded.dims(), &[1, 3, 32, 32]);
        Ok(())
    }

    #[test]
    fn aligned_size_floors_to_stride() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = VqganModel::new(vb, tiny_config())?;
        assert_eq!(model.aligned_size(33, 47), (32, 46));
        assert_eq!(model.aligned_size(32, 32), (32, 32));
        Ok(())
    }

    #[test]
    fn value_range_clamp_is_idempotent() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = VqganModel::new(vb, tiny_config())?;
        let (z_min, z_max) = model.codebook().value_range()?;

        let z = Tensor::rand(-2f32, 2.0, (1, 8, 4, 4), &device)?;
        let once = z.broadcast_maximum(&z_min)?.broadcast_minimum(&z_max)?;
        let twice = once.broadcast_maximum(&z_min)?.broadcast_minimum(&z_max)?;
        let diff = once
            .sub(&twice)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
