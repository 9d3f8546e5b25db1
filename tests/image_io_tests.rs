//! Tests for raster I/O: lossless round trips, embedded metadata, and
//! the pixel-space helpers behind the video drivers.

use candle_core::Device;
use candle_vqgan_clip::image_io::{
    aspect_matched_size, blend, image_to_tensor01, load_image, make_random_gradient_image,
    make_random_noise_image, save_png_with_comment, tensor01_to_image, wrap_offset, zoom_at,
};
use candle_vqgan_clip::utils::Pcg32;
use image::{DynamicImage, Rgb, RgbImage};

#[test]
fn test_save_load_round_trip_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    let img = make_random_noise_image(24, 18, &mut Pcg32::new(3, 1));

    save_png_with_comment(&img, &path, None).unwrap();
    let back = load_image(&path.display().to_string()).unwrap().to_rgb8();
    assert_eq!(back.dimensions(), (24, 18));
    assert_eq!(back.as_raw(), img.as_raw());
}

#[test]
fn test_comment_is_embedded_as_text_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prompted.png");
    let img = make_random_noise_image(8, 8, &mut Pcg32::new(4, 1));
    save_png_with_comment(&img, &path, Some("a red boat on the sea")).unwrap();

    let decoder = png::Decoder::new(std::fs::File::open(&path).unwrap());
    let reader = decoder.read_info().unwrap();
    let found = reader
        .info()
        .uncompressed_latin1_text
        .iter()
        .any(|chunk| chunk.keyword == "comment" && chunk.text.contains("red boat"));
    assert!(found, "comment chunk missing");
}

#[test]
fn test_save_creates_missing_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/deeper/out.png");
    let img = make_random_noise_image(4, 4, &mut Pcg32::new(5, 1));
    save_png_with_comment(&img, &path, None).unwrap();
    assert!(path.is_file());
}

#[test]
fn test_tensor_round_trip() {
    let device = Device::Cpu;
    let img = make_random_noise_image(16, 12, &mut Pcg32::new(6, 1));
    let tensor = image_to_tensor01(&DynamicImage::ImageRgb8(img.clone()), &device).unwrap();
    assert_eq!(tensor.dims(), &[1, 3, 12, 16]);

    let min = tensor
        .flatten_all()
        .unwrap()
        .min(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(min >= 0.0);

    let back = tensor01_to_image(&tensor).unwrap();
    assert_eq!(back.as_raw(), img.as_raw());
}

#[test]
fn test_gradient_image_is_smooth_vertically() {
    let img = make_random_gradient_image(4, 64, &mut Pcg32::new(7, 1));
    // Adjacent rows should differ by at most a few gray levels.
    for y in 0..63 {
        let a = img.get_pixel(0, y);
        let b = img.get_pixel(0, y + 1);
        for c in 0..3 {
            assert!((a[c] as i16 - b[c] as i16).abs() <= 8);
        }
    }
}

#[test]
fn test_blend_midpoint() {
    let a = RgbImage::from_pixel(3, 3, Rgb([10, 20, 30]));
    let b = RgbImage::from_pixel(3, 3, Rgb([30, 40, 50]));
    let mid = blend(&a, &b, 0.5);
    assert_eq!(mid.get_pixel(1, 1), &Rgb([20, 30, 40]));
}

#[test]
fn test_zoom_preserves_dimensions() {
    let img = make_random_noise_image(32, 24, &mut Pcg32::new(8, 1));
    let zoomed = zoom_at(&DynamicImage::ImageRgb8(img), 16.0, 12.0, 1.1);
    assert_eq!(zoomed.width(), 32);
    assert_eq!(zoomed.height(), 24);
}

#[test]
fn test_wrap_offset_round_trips() {
    let img = make_random_noise_image(9, 7, &mut Pcg32::new(9, 1));
    let there = wrap_offset(&img, 3, -2);
    let back = wrap_offset(&there, -3, 2);
    assert_eq!(back.as_raw(), img.as_raw());
}

#[test]
fn test_aspect_matched_size_keeps_pixel_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wide.png");
    // A 2:1 source frame.
    let img = make_random_noise_image(64, 32, &mut Pcg32::new(10, 1));
    save_png_with_comment(&img, &path, None).unwrap();

    let (width, height) = aspect_matched_size(&path, 256, 256).unwrap();
    let aspect = width as f64 / height as f64;
    assert!((aspect - 2.0).abs() < 0.1, "aspect {aspect}");
    let budget = (width * height) as f64 / (256.0 * 256.0);
    assert!((0.9..=1.1).contains(&budget), "budget ratio {budget}");
}

#[test]
fn test_url_scheme_failures_are_fetch_errors() {
    let err = load_image("http://127.0.0.1:1/unreachable.png").unwrap_err();
    assert!(err.to_string().contains("failed to fetch"));
}
