//! VQGAN+CLIP command line driver.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin vqgan-clip -- \
//!     image --prompts "A painting of an apple in a fruit bowl" \
//!     --vqgan-checkpoint models/vqgan_imagenet_f16_16384.safetensors \
//!     --vqgan-config models/vqgan_imagenet_f16_16384.json \
//!     --output output/apple.png
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use candle_vqgan_clip::config::VqganClipConfig;
use candle_vqgan_clip::generate::{
    self, BatchOptions, Interrupt, RestyleOptions, StillOptions, VideoOptions, ZoomVideoOptions,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate images and videos from text prompts with VQGAN+CLIP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: ConfigArgs,
}

/// Engine configuration shared by every subcommand.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Output image width in pixels (floored to the VQGAN stride)
    #[arg(long, default_value_t = 256)]
    width: usize,

    /// Output image height in pixels (floored to the VQGAN stride)
    #[arg(long, default_value_t = 256)]
    height: usize,

    /// Initial image: local path or http(s) URL
    #[arg(long)]
    init_image: Option<String>,

    /// Start from a generated noise image: "pixels" or "gradient"
    #[arg(long)]
    init_noise: Option<String>,

    /// Weight of the fidelity-to-initial-image term
    #[arg(long, default_value_t = 0.0)]
    init_weight: f32,

    /// Random seed (picked from entropy when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// CLIP model: "ViT-B/32", "ViT-B/16" or a HuggingFace repo id
    #[arg(long, default_value = "ViT-B/32")]
    clip_model: String,

    /// Local directory with CLIP model.safetensors + tokenizer.json
    #[arg(long)]
    clip_model_path: Option<PathBuf>,

    /// Path to the VQGAN model config (JSON)
    #[arg(long, default_value = "models/vqgan_imagenet_f16_16384.json")]
    vqgan_config: PathBuf,

    /// Path to the VQGAN weights (safetensors)
    #[arg(long, default_value = "models/vqgan_imagenet_f16_16384.safetensors")]
    vqgan_checkpoint: PathBuf,

    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// Cutout strategy: latest, original, updated, nrupdated, updatedpooling
    #[arg(long, default_value = "latest")]
    cut_method: String,

    /// Number of cutouts scored per iteration
    #[arg(long, default_value_t = 32)]
    num_cuts: usize,

    /// Power-law exponent biasing cutout sizes
    #[arg(long, default_value_t = 1.0)]
    cut_power: f32,

    /// Trade speed for bit-reproducible output
    #[arg(long)]
    deterministic: bool,

    /// Optimizer: Adam, AdamW, Adagrad, Adamax, DiffGrad, AdamP, RAdam, RMSprop
    #[arg(long, default_value = "Adam")]
    optimiser: String,

    /// Augmentation chain identifiers
    #[arg(long, value_delimiter = ',', default_value = "Af,Pe,Ji,Er")]
    augments: Vec<String>,

    /// Compute device: "cpu", "cuda" or "cuda:N"
    #[arg(long, default_value = "cuda:0")]
    device: String,

    /// Shorthand for --device cpu
    #[arg(long)]
    cpu: bool,
}

impl ConfigArgs {
    fn to_config(&self) -> VqganClipConfig {
        VqganClipConfig {
            output_image_size: [self.width, self.height],
            init_image: self.init_image.clone(),
            init_noise: self.init_noise.clone(),
            init_weight: self.init_weight,
            seed: self.seed,
            clip_model: self.clip_model.clone(),
            clip_model_path: self.clip_model_path.clone(),
            vqgan_config: self.vqgan_config.clone(),
            vqgan_checkpoint: self.vqgan_checkpoint.clone(),
            learning_rate: self.learning_rate,
            cut_method: self.cut_method.clone(),
            num_cuts: self.num_cuts,
            cut_power: self.cut_power,
            deterministic: self.deterministic,
            optimiser: self.optimiser.clone(),
            augments: vec![self.augments.clone()],
            device: if self.cpu {
                "cpu".to_string()
            } else {
                self.device.clone()
            },
        }
    }
}

/// Prompt arguments shared by every subcommand.
#[derive(Args, Debug)]
struct PromptArgs {
    /// Text prompts: "a boat:1.0|the sea:0.5^a storm" (| parallel, ^ serial)
    #[arg(short, long, default_value = "")]
    prompts: String,

    /// Image prompts: "path_or_url:weight[:stop]" with the same separators
    #[arg(long, default_value = "")]
    image_prompts: String,

    /// Noise prompts: "seed:weight" with the same separators
    #[arg(long, default_value = "")]
    noise_prompts: String,
}

#[derive(Args, Debug)]
struct LoopArgs {
    /// Number of optimization iterations (per frame, for restyle modes)
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Save an interim image every N iterations (0 = only at the end)
    #[arg(long, default_value_t = 50)]
    save_every: usize,

    /// Rotate serial (^) prompts every N iterations (0 = never)
    #[arg(long, default_value_t = 0)]
    change_prompt_every: usize,
}

impl LoopArgs {
    fn save_every(&self) -> Option<usize> {
        (self.save_every > 0).then_some(self.save_every)
    }

    fn change_prompt_every(&self) -> Option<usize> {
        (self.change_prompt_every > 0).then_some(self.change_prompt_every)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a single image
    Image {
        #[command(flatten)]
        prompt_args: PromptArgs,
        #[command(flatten)]
        loop_args: LoopArgs,
        /// Output PNG path
        #[arg(short, long, default_value = "output/output.png")]
        output: PathBuf,
    },

    /// Generate many independent variants of the same prompts
    Batch {
        #[command(flatten)]
        prompt_args: PromptArgs,
        #[command(flatten)]
        loop_args: LoopArgs,
        /// Number of images to generate
        #[arg(short, long, default_value_t = 10)]
        num_images: usize,
        /// Directory for the generated images
        #[arg(short, long, default_value = "video_frames")]
        output_dir: PathBuf,
    },

    /// Generate a video from one continuing optimization
    Video {
        #[command(flatten)]
        prompt_args: PromptArgs,
        #[command(flatten)]
        loop_args: LoopArgs,
        #[command(flatten)]
        video_args: VideoArgs,
    },

    /// Generate a video where each frame pans/zooms from the previous one
    ZoomVideo {
        #[command(flatten)]
        prompt_args: PromptArgs,
        #[command(flatten)]
        loop_args: LoopArgs,
        #[command(flatten)]
        video_args: VideoArgs,
        /// Zoom factor applied between frames
        #[arg(long, default_value_t = 1.0)]
        zoom_scale: f64,
        /// Horizontal pixel shift between frames (wraps)
        #[arg(long, default_value_t = 0)]
        shift_x: i64,
        /// Vertical pixel shift between frames (wraps)
        #[arg(long, default_value_t = 0)]
        shift_y: i64,
    },

    /// Restyle an existing video with the given prompts
    RestyleVideo {
        #[command(flatten)]
        prompt_args: PromptArgs,
        #[command(flatten)]
        loop_args: LoopArgs,
        #[command(flatten)]
        video_args: VideoArgs,
        /// Source video to restyle
        #[arg(long)]
        input_video: PathBuf,
        /// Frames per second to extract from the source
        #[arg(long, default_value_t = 30)]
        extraction_framerate: u32,
        /// Directory for extracted source frames
        #[arg(long, default_value = "extracted_video_frames")]
        extracted_frames_path: PathBuf,
        /// Copy the source audio track onto the output
        #[arg(long)]
        copy_audio: bool,
        /// Use the naive per-frame restyle instead of the blended one
        #[arg(long)]
        naive: bool,
        /// Weight of the current source frame as an image prompt
        #[arg(long, default_value_t = 0.0)]
        source_frame_prompt_weight: f32,
        /// Weight of the previous generated frame as an image prompt
        #[arg(long, default_value_t = 0.0)]
        previous_frame_prompt_weight: f32,
        /// Blend of the previous generated frame into each init image
        #[arg(long, default_value_t = 0.2)]
        init_blend: f32,
    },
}

#[derive(Args, Debug)]
struct VideoArgs {
    /// Output video path
    #[arg(short, long, default_value = "output/output.mp4")]
    output: PathBuf,

    /// Directory for interim frames before assembly
    #[arg(long, default_value = "video_frames")]
    video_frames_path: PathBuf,

    /// Framerate of the assembled video
    #[arg(long, default_value_t = 30)]
    output_framerate: u32,

    /// Read the stills at this rate and interpolate to the output rate
    #[arg(long)]
    assumed_input_framerate: Option<u32>,
}

fn still_options(
    prompt_args: &PromptArgs,
    loop_args: &LoopArgs,
    output: PathBuf,
) -> StillOptions {
    StillOptions {
        text_prompts: prompt_args.prompts.clone(),
        image_prompts: prompt_args.image_prompts.clone(),
        noise_prompts: prompt_args.noise_prompts.clone(),
        iterations: loop_args.iterations,
        save_every: loop_args.save_every(),
        change_prompt_every: loop_args.change_prompt_every(),
        output,
    }
}

fn video_options(
    prompt_args: &PromptArgs,
    loop_args: &LoopArgs,
    video_args: &VideoArgs,
) -> VideoOptions {
    VideoOptions {
        still: still_options(prompt_args, loop_args, video_args.output.clone()),
        video_frames_path: video_args.video_frames_path.clone(),
        output_framerate: video_args.output_framerate,
        assumed_input_framerate: video_args.assumed_input_framerate,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_vqgan_clip=info".parse()?)
                .add_directive("vqgan_clip=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.to_config();

    let interrupt = Interrupt::new();
    interrupt.install_ctrlc_handler()?;

    match &cli.command {
        Command::Image {
            prompt_args,
            loop_args,
            output,
        } => {
            let opts = still_options(prompt_args, loop_args, output.clone());
            generate::single_image(config, &opts, &interrupt)?;
            info!("saved {}", output.display());
        }
        Command::Batch {
            prompt_args,
            loop_args,
            num_images,
            output_dir,
        } => {
            let opts = BatchOptions {
                still: still_options(prompt_args, loop_args, output_dir.join("output.png")),
                num_images: *num_images,
                output_dir: output_dir.clone(),
            };
            generate::multiple_images(config, &opts, &interrupt)?;
            info!("saved {} images to {}", num_images, output_dir.display());
        }
        Command::Video {
            prompt_args,
            loop_args,
            video_args,
        } => {
            let opts = video_options(prompt_args, loop_args, video_args);
            generate::video(config, &opts, &interrupt)?;
            info!("saved {}", video_args.output.display());
        }
        Command::ZoomVideo {
            prompt_args,
            loop_args,
            video_args,
            zoom_scale,
            shift_x,
            shift_y,
        } => {
            let opts = ZoomVideoOptions {
                video: video_options(prompt_args, loop_args, video_args),
                zoom_scale: *zoom_scale,
                shift_x: *shift_x,
                shift_y: *shift_y,
            };
            generate::zoom_video(config, &opts, &interrupt)?;
            info!("saved {}", video_args.output.display());
        }
        Command::RestyleVideo {
            prompt_args,
            loop_args,
            video_args,
            input_video,
            extraction_framerate,
            extracted_frames_path,
            copy_audio,
            naive,
            source_frame_prompt_weight,
            previous_frame_prompt_weight,
            init_blend,
        } => {
            let opts = RestyleOptions {
                video: video_options(prompt_args, loop_args, video_args),
                input_video: input_video.clone(),
                extraction_framerate: *extraction_framerate,
                extracted_frames_path: extracted_frames_path.clone(),
                copy_audio: *copy_audio,
                current_source_frame_prompt_weight: *source_frame_prompt_weight,
                previous_generated_frame_prompt_weight: *previous_frame_prompt_weight,
                generated_frame_init_blend: *init_blend,
            };
            if *naive {
                generate::restyle_video_naive(config, &opts, &interrupt)?;
            } else {
                generate::restyle_video(config, &opts, &interrupt)?;
            }
            info!("saved {}", video_args.output.display());
        }
    }

    Ok(())
}
