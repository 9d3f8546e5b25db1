//! Raster image loading, saving, and the pixel-space helpers the video
//! drivers use (blend, zoom, wrap-around shift, seeded noise images).
//!
//! Output is written exclusively as lossless PNG, optionally with the
//! run's text prompt embedded as a `tEXt` comment chunk.

use candle_core::{Device, Result as CandleResult, Tensor};
use image::{DynamicImage, Rgb, RgbImage};
use std::io::Read;
use std::path::Path;

use crate::utils::Pcg32;

#[derive(Debug, thiserror::Error)]
pub enum ImageIoError {
    #[error("failed to read image {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("failed to write image {path}")]
    Write {
        path: String,
        #[source]
        source: png::EncodingError,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Load an image from a local path or an http(s) URL.
///
/// Network failures are fatal and not retried.
pub fn load_image(source: &str) -> Result<DynamicImage, ImageIoError> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        let response = ureq::get(source)
            .call()
            .map_err(|e| ImageIoError::Fetch {
                url: source.to_string(),
                message: e.to_string(),
            })?;
        let mut buffer = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut buffer)
            .map_err(|source_err| ImageIoError::Read {
                path: source.to_string(),
                source: source_err,
            })?;
        buffer
    } else {
        std::fs::read(source).map_err(|source_err| ImageIoError::Read {
            path: source.to_string(),
            source: source_err,
        })?
    };

    image::load_from_memory(&bytes).map_err(|e| ImageIoError::Decode {
        path: source.to_string(),
        source: e,
    })
}

/// High-quality resize to exact dimensions.
pub fn resize_lanczos(img: &DynamicImage, width: usize, height: usize) -> DynamicImage {
    img.resize_exact(
        width as u32,
        height as u32,
        image::imageops::FilterType::Lanczos3,
    )
}

/// Convert an image to a `[1, 3, H, W]` tensor in `[0, 1]`.
pub fn image_to_tensor01(img: &DynamicImage, device: &Device) -> CandleResult<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let data: Vec<f32> = rgb
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect();
    Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)
}

/// Convert a `[1, 3, H, W]` (or `[3, H, W]`) tensor in `[0, 1]` back to
/// an 8-bit RGB image.
pub fn tensor01_to_image(tensor: &Tensor) -> Result<RgbImage, ImageIoError> {
    let t = if tensor.rank() == 4 {
        tensor.get(0)?
    } else {
        tensor.clone()
    };
    let (_c, height, width) = t.dims3()?;
    let t = t.clamp(0.0, 1.0)?.affine(255.0, 0.0)?.round()?;
    let data: Vec<f32> = t.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;
    let bytes: Vec<u8> = data.iter().map(|&v| v as u8).collect();
    RgbImage::from_raw(width as u32, height as u32, bytes).ok_or_else(|| ImageIoError::Decode {
        path: "<tensor>".to_string(),
        source: image::ImageError::Limits(image::error::LimitError::from_kind(
            image::error::LimitErrorKind::DimensionError,
        )),
    })
}

/// Write a lossless PNG, embedding `comment` as a tEXt chunk when given.
pub fn save_png_with_comment(
    img: &RgbImage,
    path: &Path,
    comment: Option<&str>,
) -> Result<(), ImageIoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ImageIoError::Read {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }
    let file = std::fs::File::create(path).map_err(|source| ImageIoError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let writer = std::io::BufWriter::new(file);

    let mut encoder = png::Encoder::new(writer, img.width(), img.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let wrap = |source| ImageIoError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(comment) = comment {
        encoder
            .add_text_chunk("comment".to_string(), comment.to_string())
            .map_err(wrap)?;
    }
    let mut writer = encoder.write_header().map_err(wrap)?;
    writer.write_image_data(img.as_raw()).map_err(wrap)?;
    Ok(())
}

/// An image of uniform random pixels, drawn from a seeded generator.
pub fn make_random_noise_image(width: usize, height: usize, rng: &mut Pcg32) -> RgbImage {
    let mut img = RgbImage::new(width as u32, height as u32);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([
            (rng.next_f32() * 256.0) as u8,
            (rng.next_f32() * 256.0) as u8,
            (rng.next_f32() * 256.0) as u8,
        ]);
    }
    img
}

/// A random two-color vertical gradient.
pub fn make_random_gradient_image(width: usize, height: usize, rng: &mut Pcg32) -> RgbImage {
    let top = [rng.next_f32(), rng.next_f32(), rng.next_f32()];
    let bottom = [rng.next_f32(), rng.next_f32(), rng.next_f32()];
    let mut img = RgbImage::new(width as u32, height as u32);
    for (_, y, pixel) in img.enumerate_pixels_mut() {
        let t = if height > 1 {
            y as f32 / (height - 1) as f32
        } else {
            0.0
        };
        let mix = |a: f32, b: f32| ((a + (b - a) * t) * 255.0) as u8;
        *pixel = Rgb([
            mix(top[0], bottom[0]),
            mix(top[1], bottom[1]),
            mix(top[2], bottom[2]),
        ]);
    }
    img
}

/// Linear blend of two equally-sized images: `a * (1 - alpha) + b * alpha`.
pub fn blend(a: &RgbImage, b: &RgbImage, alpha: f32) -> RgbImage {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = RgbImage::new(a.width(), a.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        let mix = |ca: u8, cb: u8| (ca as f32 + (cb as f32 - ca as f32) * alpha).round() as u8;
        *pixel = Rgb([
            mix(pa[0], pb[0]),
            mix(pa[1], pb[1]),
            mix(pa[2], pb[2]),
        ]);
    }
    out
}

/// Zoom into the point `(cx, cy)` by `zoom`, keeping the image size.
pub fn zoom_at(img: &DynamicImage, cx: f64, cy: f64, zoom: f64) -> DynamicImage {
    let (width, height) = (img.width() as f64, img.height() as f64);
    let crop_w = (width / zoom).max(1.0);
    let crop_h = (height / zoom).max(1.0);
    let x0 = (cx - crop_w / 2.0).clamp(0.0, width - crop_w);
    let y0 = (cy - crop_h / 2.0).clamp(0.0, height - crop_h);
    let cropped = img.crop_imm(x0 as u32, y0 as u32, crop_w as u32, crop_h as u32);
    resize_lanczos(&cropped, img.width() as usize, img.height() as usize)
}

/// Shift an image with wrap-around in both axes.
pub fn wrap_offset(img: &RgbImage, dx: i64, dy: i64) -> RgbImage {
    let (width, height) = (img.width() as i64, img.height() as i64);
    let mut out = RgbImage::new(img.width(), img.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let src_x = (x as i64 - dx).rem_euclid(width) as u32;
        let src_y = (y as i64 - dy).rem_euclid(height) as u32;
        *pixel = *img.get_pixel(src_x, src_y);
    }
    out
}

/// Pick output dimensions matching a source frame's aspect ratio while
/// keeping roughly the configured pixel budget.
pub fn aspect_matched_size(
    frame: &Path,
    target_width: usize,
    target_height: usize,
) -> Result<(usize, usize), ImageIoError> {
    let img = load_image(&frame.display().to_string())?;
    let aspect = img.width() as f64 / img.height() as f64;
    let budget = (target_width * target_height) as f64;
    let height = (budget / aspect).sqrt();
    let width = height * aspect;
    Ok((width.round() as usize, height.round() as usize))
}
