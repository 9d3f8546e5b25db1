//! VQGAN decoder: latent codes to pixels.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use super::encoder::{AttnBlock, ResnetBlock};
use super::DdConfig;

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

/// Nearest-neighbor x2 upsampling followed by a 3x3 conv.
#[derive(Debug)]
struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv3x3(channels, channels, vb.pp("conv"))?;
        Ok(Self { conv })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * 2, w * 2)?;
        self.conv.forward(&x)
    }
}

#[derive(Debug)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

/// The VQGAN decoder tower.
///
/// Output is in the decoder's native `[-1, 1]` range; the engine rescales
/// and clamps.
#[derive(Debug)]
pub struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(vb: VarBuilder, config: &DdConfig) -> Result<Self> {
        let num_levels = config.ch_mult.len();
        let mut block_in = config.ch * config.ch_mult[num_levels - 1];
        let mut curr_res = config.resolution >> (num_levels - 1);

        let conv_in = conv3x3(config.z_channels, block_in, vb.pp("conv_in"))?;

        let mid_block_1 = ResnetBlock::new(vb.pp("mid").pp("block_1"), block_in, block_in)?;
        let mid_attn_1 = AttnBlock::new(vb.pp("mid").pp("attn_1"), block_in)?;
        let mid_block_2 = ResnetBlock::new(vb.pp("mid").pp("block_2"), block_in, block_in)?;

        // Levels are stored at their ch_mult index but built from the
        // lowest resolution upward, mirroring the checkpoint layout.
        let mut up_rev = Vec::with_capacity(num_levels);
        for i in (0..num_levels).rev() {
            let vb_level = vb.pp("up").pp(i);
            let block_out = config.ch * config.ch_mult[i];
            let mut blocks = Vec::with_capacity(config.num_res_blocks + 1);
            let mut attns = Vec::new();
            for j in 0..=config.num_res_blocks {
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
            let upsample = if i != 0 {
                curr_res *= 2;
                Some(Upsample::new(vb_level.pp("upsample"), block_in)?)
            } else {
                None
            };
            up_rev.push(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }
        up_rev.reverse();

        let norm_out = candle_nn::group_norm(32, block_in, 1e-6, vb.pp("norm_out"))?;
        let conv_out = conv3x3(block_in, config.out_ch, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up: up_rev,
            norm_out,
            conv_out,
        })
    }

    /// Number of x2 upsampling stages, determining the pixel stride of one
    /// latent cell.
    pub fn num_resolutions(&self) -> usize {
        self.up.len()
    }

    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(z)?;
        h = self.mid_block_1.forward(&h)?;
        h = self.mid_attn_1.forward(&h)?;
        h = self.mid_block_2.forward(&h)?;

        for level in self.up.iter().rev() {
            for (j, block) in level.blocks.iter().enumerate() {
                h = block.forward(&h)?;
                if let Some(attn) = level.attns.get(j) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(upsample) = &level.upsample {
                h = upsample.forward(&h)?;
            }
        }

        h = self.norm_out.forward(&h)?;
        h = candle_nn::ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}
