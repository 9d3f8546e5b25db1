//! VQGAN encoder: pixels to latent codes.
//!
//! Standard 2D convolutional encoder with downsampling blocks and a
//! single-head attention mid block.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::DdConfig;

fn norm(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(32, channels, 1e-6, vb)
}

fn conv3x3(in_ch: usize, out_ch: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(
        in_ch,
        out_ch,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )
}

/// Residual block: two norm/swish/conv stages plus a 1x1 shortcut when the
/// channel count changes.
#[derive(Debug)]
pub(crate) struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    pub(crate) fn new(vb: VarBuilder, in_ch: usize, out_ch: usize) -> Result<Self> {
        let norm1 = norm(in_ch, vb.pp("norm1"))?;
        let conv1 = conv3x3(in_ch, out_ch, vb.pp("conv1"))?;
        let norm2 = norm(out_ch, vb.pp("norm2"))?;
        let conv2 = conv3x3(out_ch, out_ch, vb.pp("conv2"))?;
        let nin_shortcut = if in_ch != out_ch {
            Some(conv2d(
                in_ch,
                out_ch,
                1,
                Default::default(),
                vb.pp("nin_shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(x)?;
        let h = candle_nn::ops::silu(&h)?;
        let h = self.conv1.forward(&h)?;
        let h = self.norm2.forward(&h)?;
        let h = candle_nn::ops::silu(&h)?;
        let h = self.conv2.forward(&h)?;

        let residual = match &self.nin_shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        h + residual
    }
}

/// Self-attention over spatial positions, 1x1-conv projections.
#[derive(Debug)]
pub(crate) struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    channels: usize,
}

impl AttnBlock {
    pub(crate) fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let norm = norm(channels, vb.pp("norm"))?;
        let q = conv2d(channels, channels, 1, Default::default(), vb.pp("q"))?;
        let k = conv2d(channels, channels, 1, Default::default(), vb.pp("k"))?;
        let v = conv2d(channels, channels, 1, Default::default(), vb.pp("v"))?;
        let proj_out = conv2d(channels, channels, 1, Default::default(), vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            q,
            k,
            v,
            proj_out,
            channels,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let hidden = self.norm.forward(x)?;
        let q = self.q.forward(&hidden)?;
        let k = self.k.forward(&hidden)?;
        let v = self.v.forward(&hidden)?;

        let q = q.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let k = k.reshape((b, c, h * w))?.contiguous()?;
        let v = v.reshape((b, c, h * w))?.contiguous()?;

        let scale = (self.channels as f64).powf(-0.5);
        let attn = (q.matmul(&k)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn.matmul(&v.transpose(1, 2)?.contiguous()?)?;
        let out = out.transpose(1, 2)?.reshape((b, c, h, w))?;
        let out = self.proj_out.forward(&out)?;

        out + x
    }
}

/// Strided-conv downsampling with asymmetric (right/bottom) padding.
#[derive(Debug)]
struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        Ok(Self { conv })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.pad_with_zeros(3, 0, 1)?;
        let x = x.pad_with_zeros(2, 0, 1)?;
        self.conv.forward(&x)
    }
}

#[derive(Debug)]
struct DownLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    downsample: Option<Downsample>,
}

/// The VQGAN encoder tower.
#[derive(Debug)]
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    pub fn new(vb: VarBuilder, config: &DdConfig) -> Result<Self> {
        let num_levels = config.ch_mult.len();
        let conv_in = conv3x3(config.in_channels, config.ch, vb.pp("conv_in"))?;

        let mut down = Vec::with_capacity(num_levels);
        let mut block_in = config.ch;
        let mut curr_res = config.resolution;
        for (i, &mult) in config.ch_mult.iter().enumerate() {
            let vb_level = vb.pp("down").pp(i);
            let block_out = config.ch * mult;
            let mut blocks = Vec::with_capacity(config.num_res_blocks);
            let mut attns = Vec::new();
            for j in 0..config.num_res_blocks {
                blocks.push(ResnetBlock::new(
                    vb_level.pp("block").pp(j),
                    block_in,
                    block_out,
                )?);
                block_in = block_out;
                if config.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(vb_level.pp("attn").pp(j), block_in)?);
                }
            }
            let downsample = if i != num_levels - 1 {
                curr_res /= 2;
                Some(Downsample::new(vb_level.pp("downsample"), block_in)?)
            } else {
                None
            };
            down.push(DownLevel {
                blocks,
                attns,
                downsample,
            });
        }

        let mid_block_1 = ResnetBlock::new(vb.pp("mid").pp("block_1"), block_in, block_in)?;
        let mid_attn_1 = AttnBlock::new(vb.pp("mid").pp("attn_1"), block_in)?;
        let mid_block_2 = ResnetBlock::new(vb.pp("mid").pp("block_2"), block_in, block_in)?;

        let norm_out = norm(block_in, vb.pp("norm_out"))?;
        let conv_out = conv3x3(block_in, config.z_channels, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            down,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(x)?;
        for level in &self.down {
            for (j, block) in level.blocks.iter().enumerate() {
                h = block.forward(&h)?;
                if let Some(attn) = level.attns.get(j) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(down) = &level.downsample {
                h = down.forward(&h)?;
            }
        }
        h = self.mid_block_1.forward(&h)?;
        h = self.mid_attn_1.forward(&h)?;
        h = self.mid_block_2.forward(&h)?;
        h = self.norm_out.forward(&h)?;
        h = candle_nn::ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}
