//! Orchestration drivers: stills, batches, and the video generation
//! modes.
//!
//! Each driver sequences `train` calls on one or more engines, rotates
//! story prompts, snapshots frames, and finalizes by saving whatever was
//! produced. A cooperative [`Interrupt`] is polled once per outer
//! iteration: on trigger the loop stops after the current step and the
//! driver proceeds straight to finalization (final save / video
//! assembly) instead of raising. Computation failures, by contrast,
//! propagate without finalizing.

use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::VqganClipConfig;
use crate::engine::{Engine, EngineError};
use crate::image_io::{self, ImageIoError};
use crate::prompt::parse_all_prompts;
use crate::video::{self, VideoError};

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Video(#[from] VideoError),

    #[error(transparent)]
    ImageIo(#[from] ImageIoError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cooperative cancellation flag, polled at iteration boundaries.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Wire this flag to Ctrl-C. The first signal requests an orderly
    /// stop; the process is not killed.
    pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, finishing current iteration");
            flag.trigger();
        })
    }
}

fn progress_bar(len: usize, unit: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} {msg} [{elapsed_precise}<{eta_precise}]",
        )
        .expect("static template"),
    );
    bar.set_message(unit.to_string());
    bar
}

fn log_losses(iteration: usize, frame: Option<usize>, losses: &[f32]) {
    let sum: f32 = losses.iter().sum();
    let each: Vec<String> = losses.iter().map(|l| format!("{l:7.3}")).collect();
    match frame {
        Some(frame) => info!(
            "iteration:{iteration:6}\tvideo frame:{frame:6}\tloss sum:{sum:8.3}\tloss for each prompt: {}",
            each.join(", ")
        ),
        None => info!(
            "iteration:{iteration:6}\tloss sum:{sum:8.3}\tloss for each prompt: {}",
            each.join(", ")
        ),
    }
}

fn due(every: Option<usize>, iteration: usize) -> bool {
    matches!(every, Some(n) if n > 0 && iteration % n == 0)
}

fn frame_path(dir: &Path, frame_num: usize) -> PathBuf {
    dir.join(format!("{frame_num}.png"))
}

// =============================================================================
// Still images
// =============================================================================

/// Options shared by the still-image drivers.
#[derive(Debug, Clone)]
pub struct StillOptions {
    pub text_prompts: String,
    pub image_prompts: String,
    pub noise_prompts: String,
    /// Number of `train` calls before stopping.
    pub iterations: usize,
    /// Save an interim image (and log loss statistics) every N iterations.
    pub save_every: Option<usize>,
    /// Rotate serial (`^`) prompts every N iterations.
    pub change_prompt_every: Option<usize>,
    /// Output path for the final PNG.
    pub output: PathBuf,
}

impl Default for StillOptions {
    fn default() -> Self {
        Self {
            text_prompts: String::new(),
            image_prompts: String::new(),
            noise_prompts: String::new(),
            iterations: 100,
            save_every: Some(50),
            change_prompt_every: None,
            output: PathBuf::from("output/output.png"),
        }
    }
}

/// Generate a single image.
pub fn single_image(
    config: VqganClipConfig,
    opts: &StillOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let parsed = parse_all_prompts(&opts.text_prompts, &opts.image_prompts, &opts.noise_prompts);
    let mut engine = Engine::new(config)?;
    engine.encode_and_append_prompts(0, &parsed)?;
    engine.configure_optimizer()?;

    let bar = progress_bar(opts.iterations, "iterations");
    let mut current_prompt_number = 0;
    for iteration in 1..=opts.iterations {
        if interrupt.is_triggered() {
            break;
        }
        let losses = engine.train(iteration)?;
        bar.inc(1);

        if due(opts.change_prompt_every, iteration) {
            current_prompt_number += 1;
            engine.clear_all_prompts();
            engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
        }
        if due(opts.save_every, iteration) {
            log_losses(iteration, None, &losses);
            engine.save_current_output(&opts.output)?;
        }
    }
    bar.finish_and_clear();

    // Always save the final state, interrupted or not.
    engine.save_current_output(&opts.output)?;
    Ok(())
}

/// Options for generating a folder of independent variants.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub still: StillOptions,
    pub num_images: usize,
    pub output_dir: PathBuf,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            still: StillOptions {
                save_every: None,
                ..Default::default()
            },
            num_images: 10,
            output_dir: PathBuf::from("video_frames"),
        }
    }
}

/// Generate many independent images of the same prompts, one fresh
/// engine (and seed) per image. Useful for picking keepers out of a
/// folder of variants.
pub fn multiple_images(
    config: VqganClipConfig,
    opts: &BatchOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let parsed = parse_all_prompts(
        &opts.still.text_prompts,
        &opts.still.image_prompts,
        &opts.still.noise_prompts,
    );
    video::prepare_frames_dir(&opts.output_dir)?;

    let bar = progress_bar(opts.num_images, "images");
    let mut current_prompt_number = 0;
    'files: for file_num in 1..=opts.num_images {
        let mut run_config = config.clone();
        // Distinct seed per image; explicit seeds advance predictably.
        if let Some(seed) = run_config.seed {
            run_config.seed = Some(seed + file_num as u64 - 1);
        }
        let mut engine = Engine::new(run_config)?;
        engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
        engine.configure_optimizer()?;

        let output = frame_path(&opts.output_dir, file_num);
        for iteration in 1..=opts.still.iterations {
            if interrupt.is_triggered() {
                engine.save_current_output(&output)?;
                break 'files;
            }
            let losses = engine.train(iteration)?;

            if due(opts.still.change_prompt_every, iteration) {
                current_prompt_number += 1;
                engine.clear_all_prompts();
                engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
            }
            if due(opts.still.save_every, iteration) {
                log_losses(iteration, Some(file_num), &losses);
                engine.save_current_output(&output)?;
            }
        }
        engine.save_current_output(&output)?;
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(())
}

// =============================================================================
// Video generation
// =============================================================================

/// Options for direct video generation from a continuing optimization.
#[derive(Debug, Clone)]
pub struct VideoOptions {
    pub still: StillOptions,
    /// Directory for interim frames before assembly.
    pub video_frames_path: PathBuf,
    pub output_framerate: u32,
    /// When set, stills are read at this rate and interpolated to the
    /// output rate.
    pub assumed_input_framerate: Option<u32>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            still: StillOptions {
                output: PathBuf::from("output/output.mp4"),
                ..Default::default()
            },
            video_frames_path: PathBuf::from("video_frames"),
            output_framerate: 30,
            assumed_input_framerate: None,
        }
    }
}

/// Generate a video from one continuing optimization: every
/// `save_every` iterations becomes one output frame.
pub fn video(
    config: VqganClipConfig,
    opts: &VideoOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let parsed = parse_all_prompts(
        &opts.still.text_prompts,
        &opts.still.image_prompts,
        &opts.still.noise_prompts,
    );
    let mut engine = Engine::new(config)?;
    engine.encode_and_append_prompts(0, &parsed)?;
    engine.configure_optimizer()?;
    video::prepare_frames_dir(&opts.video_frames_path)?;

    let bar = progress_bar(opts.still.iterations, "iterations");
    let mut current_prompt_number = 0;
    let mut video_frame_num = 1;
    for iteration in 1..=opts.still.iterations {
        if interrupt.is_triggered() {
            break;
        }
        let losses = engine.train(iteration)?;
        bar.inc(1);

        if due(opts.still.change_prompt_every, iteration) {
            current_prompt_number += 1;
            engine.clear_all_prompts();
            engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
        }
        if due(opts.still.save_every, iteration) {
            log_losses(iteration, Some(video_frame_num), &losses);
            engine.save_current_output(&frame_path(&opts.video_frames_path, video_frame_num))?;
            video_frame_num += 1;
        }
    }
    bar.finish_and_clear();
    info!("generating video...");

    // Assemble whatever frames exist, even after an interrupt.
    video::encode_video(
        &opts.still.output,
        &opts.video_frames_path,
        &opts.still.text_prompts,
        opts.output_framerate,
        opts.assumed_input_framerate,
    )?;
    Ok(())
}

/// Options for the pan/zoom video mode.
#[derive(Debug, Clone)]
pub struct ZoomVideoOptions {
    pub video: VideoOptions,
    /// Scale factor applied to each saved frame before it becomes the
    /// next init image. 1.0 disables zooming.
    pub zoom_scale: f64,
    /// Pixel shift (wrapping) applied between frames.
    pub shift_x: i64,
    pub shift_y: i64,
}

impl Default for ZoomVideoOptions {
    fn default() -> Self {
        Self {
            video: VideoOptions::default(),
            zoom_scale: 1.0,
            shift_x: 0,
            shift_y: 0,
        }
    }
}

/// Generate a video where each frame moves relative to the previous one:
/// at every frame boundary the current output is zoomed/shifted,
/// re-encoded as the new init image, and the optimizer is rebound.
pub fn zoom_video(
    config: VqganClipConfig,
    opts: &ZoomVideoOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let still = &opts.video.still;
    let parsed = parse_all_prompts(&still.text_prompts, &still.image_prompts, &still.noise_prompts);
    let mut engine = Engine::new(config)?;
    engine.encode_and_append_prompts(0, &parsed)?;
    engine.configure_optimizer()?;
    video::prepare_frames_dir(&opts.video.video_frames_path)?;

    let (width, height) = engine.calculate_output_image_size();
    let bar = progress_bar(still.iterations, "iterations");
    let mut current_prompt_number = 0;
    let mut video_frame_num = 1;
    for iteration in 1..=still.iterations {
        if interrupt.is_triggered() {
            break;
        }
        let losses = engine.train(iteration)?;
        bar.inc(1);

        if due(still.change_prompt_every, iteration) {
            current_prompt_number += 1;
            engine.clear_all_prompts();
            engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
        }
        if due(still.save_every, iteration) {
            log_losses(iteration, Some(video_frame_num), &losses);
            let path = frame_path(&opts.video.video_frames_path, video_frame_num);
            engine.save_current_output(&path)?;
            video_frame_num += 1;

            // Transform the frame just saved and restart from it.
            let frame = image_io::load_image(&path.display().to_string())?.to_rgb8();
            let transformed = transform_frame(&frame, width, height, opts);
            engine.convert_image_to_init_image(&DynamicImage::ImageRgb8(transformed))?;
            engine.configure_optimizer()?;
        }
    }
    bar.finish_and_clear();
    info!("generating video...");

    video::encode_video(
        &still.output,
        &opts.video.video_frames_path,
        &still.text_prompts,
        opts.video.output_framerate,
        opts.video.assumed_input_framerate,
    )?;
    Ok(())
}

fn transform_frame(
    frame: &image::RgbImage,
    width: usize,
    height: usize,
    opts: &ZoomVideoOptions,
) -> image::RgbImage {
    let mut img = frame.clone();
    if opts.zoom_scale != 1.0 {
        img = image_io::zoom_at(
            &DynamicImage::ImageRgb8(img),
            width as f64 / 2.0,
            height as f64 / 2.0,
            opts.zoom_scale,
        )
        .to_rgb8();
    }
    if opts.shift_x != 0 || opts.shift_y != 0 {
        img = image_io::wrap_offset(&img, opts.shift_x, opts.shift_y);
    }
    img
}

// =============================================================================
// Video restyling
// =============================================================================

/// Options for restyling an existing video.
#[derive(Debug, Clone)]
pub struct RestyleOptions {
    pub video: VideoOptions,
    /// Source video to restyle.
    pub input_video: PathBuf,
    /// Frames per second to extract from the source.
    pub extraction_framerate: u32,
    /// Where extracted source frames land.
    pub extracted_frames_path: PathBuf,
    /// Transplant the source audio onto the output.
    pub copy_audio: bool,
    /// Weight for using the current source frame as an image prompt.
    pub current_source_frame_prompt_weight: f32,
    /// Weight for using the previous generated frame as an image prompt.
    pub previous_generated_frame_prompt_weight: f32,
    /// Blend factor of the previous generated frame into each new init
    /// image (0 = source frame only).
    pub generated_frame_init_blend: f32,
}

impl Default for RestyleOptions {
    fn default() -> Self {
        Self {
            video: VideoOptions {
                still: StillOptions {
                    iterations: 30,
                    save_every: None,
                    output: PathBuf::from("output/output.mp4"),
                    ..Default::default()
                },
                ..Default::default()
            },
            input_video: PathBuf::from("input.mp4"),
            extraction_framerate: 30,
            extracted_frames_path: PathBuf::from("extracted_video_frames"),
            copy_audio: false,
            current_source_frame_prompt_weight: 0.0,
            previous_generated_frame_prompt_weight: 0.0,
            generated_frame_init_blend: 0.2,
        }
    }
}

fn restyle_setup(
    config: &mut VqganClipConfig,
    opts: &RestyleOptions,
) -> Result<Vec<PathBuf>, GenerateError> {
    video::prepare_frames_dir(&opts.video.video_frames_path)?;
    let frames = video::extract_video_frames(
        &opts.input_video,
        opts.extraction_framerate,
        &opts.extracted_frames_path,
    )?;
    // Match the source aspect ratio while keeping the configured pixel
    // budget.
    let (width, height) = image_io::aspect_matched_size(
        &frames[0],
        config.output_image_size[0],
        config.output_image_size[1],
    )?;
    config.output_image_size = [width, height];
    Ok(frames)
}

fn restyle_finalize(opts: &RestyleOptions) -> Result<(), GenerateError> {
    info!("generating video...");
    let output = &opts.video.still.output;
    video::encode_video(
        output,
        &opts.video.video_frames_path,
        &opts.video.still.text_prompts,
        opts.video.output_framerate,
        // Keep the output duration equal to the source by default.
        opts.video
            .assumed_input_framerate
            .or(Some(opts.extraction_framerate)),
    )?;

    if opts.copy_audio {
        let silent = output.with_extension("noaudio.mp4");
        std::fs::rename(output, &silent).map_err(|source| GenerateError::Io {
            path: output.display().to_string(),
            source,
        })?;
        video::copy_video_audio(&opts.input_video, &silent, output)?;
        std::fs::remove_file(&silent).map_err(|source| GenerateError::Io {
            path: silent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Naive restyle: each extracted source frame becomes the init image of a
/// continuing engine. Simple, but the result changes significantly from
/// frame to frame; superseded by [`restyle_video`].
pub fn restyle_video_naive(
    mut config: VqganClipConfig,
    opts: &RestyleOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let frames = restyle_setup(&mut config, opts)?;
    let still = &opts.video.still;
    let parsed = parse_all_prompts(&still.text_prompts, &still.image_prompts, &still.noise_prompts);

    let mut engine = Engine::new(config)?;
    engine.encode_and_append_prompts(0, &parsed)?;

    let bar = progress_bar(frames.len(), "frames");
    let mut current_prompt_number = 0;
    let mut video_frame_num = 1;
    'frames: for frame in &frames {
        if interrupt.is_triggered() {
            break;
        }
        let img = image_io::load_image(&frame.display().to_string())?;
        engine.convert_image_to_init_image(&img)?;
        engine.configure_optimizer()?;

        let mut losses = Vec::new();
        for iteration in 1..=still.iterations {
            if interrupt.is_triggered() {
                break 'frames;
            }
            losses = engine.train(iteration)?;

            if due(still.change_prompt_every, iteration) {
                current_prompt_number += 1;
                engine.clear_all_prompts();
                engine.encode_and_append_prompts(current_prompt_number, &parsed)?;
            }
            if due(still.save_every, iteration) {
                log_losses(iteration, Some(video_frame_num), &losses);
                engine
                    .save_current_output(&frame_path(&opts.video.video_frames_path, video_frame_num))?;
            }
        }

        log_losses(still.iterations, Some(video_frame_num), &losses);
        engine.save_current_output(&frame_path(&opts.video.video_frames_path, video_frame_num))?;
        video_frame_num += 1;
        bar.inc(1);
    }
    bar.finish_and_clear();

    restyle_finalize(opts)
}

/// Blended restyle: each new frame starts from a blend of the source
/// frame and the previous *generated* frame, which transitions far more
/// smoothly. The source and previous frames can additionally steer the
/// optimization as image prompts. A nonzero `init_weight` in the engine
/// config keeps the output closer to the source footage.
pub fn restyle_video(
    mut config: VqganClipConfig,
    opts: &RestyleOptions,
    interrupt: &Interrupt,
) -> Result<(), GenerateError> {
    let frames = restyle_setup(&mut config, opts)?;
    let still = &opts.video.still;
    let parsed = parse_all_prompts(&still.text_prompts, &still.image_prompts, &still.noise_prompts);
    let (width, height) = (config.output_image_size[0], config.output_image_size[1]);

    let bar = progress_bar(frames.len(), "frames");
    let mut video_frame_num = 1;
    let mut last_generated: PathBuf = frames[0].clone();
    'frames: for frame in &frames {
        if interrupt.is_triggered() {
            break;
        }
        // Fresh engine per frame: independent instances, no cross-talk.
        let mut engine = Engine::new(config.clone())?;

        let source_frame = image_io::resize_lanczos(
            &image_io::load_image(&frame.display().to_string())?,
            width,
            height,
        )
        .to_rgb8();
        let previous_frame = image_io::resize_lanczos(
            &image_io::load_image(&last_generated.display().to_string())?,
            width,
            height,
        )
        .to_rgb8();

        if opts.generated_frame_init_blend > 0.0 {
            let blended = image_io::blend(
                &source_frame,
                &previous_frame,
                opts.generated_frame_init_blend,
            );
            engine.convert_image_to_init_image(&DynamicImage::ImageRgb8(blended))?;
        } else {
            engine.convert_image_to_init_image(&DynamicImage::ImageRgb8(source_frame.clone()))?;
        }

        engine.clear_all_prompts();
        engine.encode_and_append_prompts(0, &parsed)?;
        if opts.current_source_frame_prompt_weight != 0.0 {
            engine.encode_and_append_image(
                &DynamicImage::ImageRgb8(source_frame),
                opts.current_source_frame_prompt_weight,
                None,
            )?;
        }
        if opts.previous_generated_frame_prompt_weight != 0.0 {
            engine.encode_and_append_image(
                &DynamicImage::ImageRgb8(previous_frame),
                opts.previous_generated_frame_prompt_weight,
                None,
            )?;
        }
        engine.configure_optimizer()?;

        let mut losses = Vec::new();
        for iteration in 1..=still.iterations {
            if interrupt.is_triggered() {
                break 'frames;
            }
            losses = engine.train(iteration)?;
            if due(still.save_every, iteration) {
                log_losses(iteration, Some(video_frame_num), &losses);
                engine
                    .save_current_output(&frame_path(&opts.video.video_frames_path, video_frame_num))?;
            }
        }

        log_losses(still.iterations, Some(video_frame_num), &losses);
        let generated = frame_path(&opts.video.video_frames_path, video_frame_num);
        engine.save_current_output(&generated)?;
        last_generated = generated;
        video_frame_num += 1;
        bar.inc(1);
    }
    bar.finish_and_clear();

    restyle_finalize(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_round_trip() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_triggered());
        interrupt.trigger();
        assert!(interrupt.is_triggered());
        // Clones observe the same flag.
        assert!(interrupt.clone().is_triggered());
    }

    #[test]
    fn save_cadence() {
        assert!(!due(None, 10));
        assert!(!due(Some(0), 10));
        assert!(due(Some(5), 10));
        assert!(!due(Some(7), 10));
    }

    #[test]
    fn frame_paths_are_numbered_from_one() {
        assert_eq!(
            frame_path(Path::new("frames"), 3),
            PathBuf::from("frames/3.png")
        );
    }

    #[test]
    fn default_restyle_uses_fewer_iterations() {
        let opts = RestyleOptions::default();
        assert_eq!(opts.video.still.iterations, 30);
        assert_eq!(opts.generated_frame_init_blend, 0.2);
        assert!(!opts.copy_audio);
    }
}
