//! The VQGAN codebook.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::VqganConfig;

/// The fixed table of discrete embedding vectors the decoder understands.
///
/// Two checkpoint layouts exist: the standard nearest-neighbor quantizer
/// stores its table under `quantize.embedding.weight`, the categorical
/// gumbel variant under `quantize.embed.weight`. Which one is read is
/// selected by the config's `gumbel` flag; everything downstream is
/// identical.
#[derive(Debug)]
pub struct Codebook {
    weight: Tensor,
    num_codes: usize,
    code_dim: usize,
}

impl Codebook {
    pub fn new(vb: VarBuilder, config: &VqganConfig) -> Result<Self> {
        let num_codes = config.n_embed;
        let code_dim = config.embed_dim;
        let name = if config.gumbel {
            "embed.weight"
        } else {
            "embedding.weight"
        };
        let weight = vb.pp("quantize").get((num_codes, code_dim), name)?;
        Ok(Self {
            weight,
            num_codes,
            code_dim,
        })
    }

    /// The full embedding table, `[num_codes, code_dim]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn num_codes(&self) -> usize {
        self.num_codes
    }

    pub fn code_dim(&self) -> usize {
        self.code_dim
    }

    /// Embed a flat `u32` index tensor into code space, `[n, code_dim]`.
    pub fn lookup(&self, indices: &Tensor) -> Result<Tensor> {
        self.weight.index_select(indices, 0)
    }

    /// Per-channel (min, max) over the codebook entries, shaped
    /// `[1, code_dim, 1, 1]` for broadcasting against a latent.
    ///
    /// Constant for the lifetime of the model; the engine clamps the
    /// latent back into this range after every optimizer step.
    pub fn value_range(&self) -> Result<(Tensor, Tensor)> {
        let min = self.weight.min(0)?.reshape((1, self.code_dim, 1, 1))?;
        let max = self.weight.max(0)?.reshape((1, self.code_dim, 1, 1))?;
        Ok((min, max))
    }
}
