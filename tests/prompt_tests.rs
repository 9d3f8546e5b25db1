//! Tests for prompt parsing, story rotation, and the directional
//! similarity loss, including the optimization-trend properties that do
//! not require model weights.

use candle_core::backprop::GradStore;
use candle_core::{Device, Result, Tensor, Var};
use candle_vqgan_clip::optim::{Algorithm, LatentOptimizer};
use candle_vqgan_clip::prompt::{
    l2_normalize, parse_all_prompts, parse_story, split_prompt, Prompt,
};

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_weight_only_prompt() {
    let (payload, weight, stop) = split_prompt("A red boat:0.5");
    assert_eq!(payload, "A red boat");
    assert_eq!(weight, 0.5);
    assert_eq!(stop, None);
}

#[test]
fn test_weight_and_stop_prompt() {
    let (payload, weight, stop) = split_prompt("photo.png:1.0:0.2");
    assert_eq!(payload, "photo.png");
    assert_eq!(weight, 1.0);
    assert_eq!(stop, Some(0.2));
}

#[test]
fn test_weightless_prompt_defaults_to_one() {
    let (payload, weight, stop) = split_prompt("A red boat");
    assert_eq!(payload, "A red boat");
    assert_eq!(weight, 1.0);
    assert_eq!(stop, None);
}

#[test]
fn test_colon_payloads_survive() {
    let (payload, weight, stop) = split_prompt("https://example.com/boat.png:0.5:0.1");
    assert_eq!(payload, "https://example.com/boat.png");
    assert_eq!(weight, 0.5);
    assert_eq!(stop, Some(0.1));

    let (payload, weight, _) = split_prompt("C:\\images\\boat.png:2.0");
    assert_eq!(payload, "C:\\images\\boat.png");
    assert_eq!(weight, 2.0);
}

#[test]
fn test_whitespace_is_trimmed() {
    let (payload, weight, _) = split_prompt("  a boat : 0.25 ");
    assert_eq!(payload, "a boat");
    assert_eq!(weight, 0.25);
}

#[test]
fn test_story_with_parallel_and_serial_segments() {
    let story = parse_story("a boat|the sea:0.5^a storm^calm:0.1|fog:-0.2");
    assert_eq!(story.len(), 3);
    assert_eq!(story[0], vec!["a boat", "the sea:0.5"]);
    assert_eq!(story[1], vec!["a storm"]);
    assert_eq!(story[2], vec!["calm:0.1", "fog:-0.2"]);
}

#[test]
fn test_story_rotation_wraps_per_kind() {
    let parsed = parse_all_prompts("a^b^c", "x.png", "");
    // The rotation index wraps independently over each kind's length.
    assert_eq!(parsed.text.len(), 3);
    assert_eq!(parsed.image.len(), 1);
    assert!(parsed.noise.is_empty());
    for prompt_number in 0..7usize {
        let text_segment = &parsed.text[prompt_number % parsed.text.len()];
        let image_segment = &parsed.image[prompt_number % parsed.image.len()];
        assert_eq!(text_segment.len(), 1);
        assert_eq!(image_segment[0], "x.png");
    }
}

// ============================================================================
// Loss directionality
// ============================================================================

fn cosine(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = l2_normalize(a)?;
    let b = l2_normalize(b)?;
    a.matmul(&b.t()?)?.mean_all()?.to_scalar::<f32>()
}

/// Optimize a free embedding against a prompt and report the similarity
/// trend. This exercises the loss/optimizer combination without any
/// model weights.
fn similarity_trend(weight: f32, steps: usize) -> Result<Vec<f32>> {
    let device = Device::Cpu;
    let target = Tensor::new(&[[1.0f32, 0.0, 0.0, 0.0]], &device)?;
    let var = Var::new(&[[0.1f32, 0.9, 0.3, -0.4]], &device)?;
    let prompt = Prompt::new(target.clone(), weight, None);
    let mut optimizer = LatentOptimizer::new(var.clone(), Algorithm::Adam, 0.05)?;

    let mut trend = Vec::with_capacity(steps);
    for _ in 0..steps {
        let (loss, similarity) = prompt.loss(var.as_tensor())?;
        trend.push(similarity);
        let grads: GradStore = loss.backward()?;
        optimizer.step(&grads)?;
    }
    Ok(trend)
}

#[test]
fn test_positive_prompt_raises_similarity() -> Result<()> {
    let trend = similarity_trend(1.0, 25)?;
    assert!(
        trend.last().unwrap() > trend.first().unwrap(),
        "similarity should rise: {trend:?}"
    );
    Ok(())
}

#[test]
fn test_negative_prompt_strictly_lowers_similarity() -> Result<()> {
    let trend = similarity_trend(-1.0, 25)?;
    assert!(
        trend.last().unwrap() < trend.first().unwrap(),
        "similarity should fall: {trend:?}"
    );
    // The trend is monotone on this convex toy problem.
    let rises = trend.windows(2).filter(|w| w[1] > w[0] + 1e-4).count();
    assert!(rises <= 2, "similarity rose too often: {trend:?}");
    Ok(())
}

#[test]
fn test_stop_threshold_silences_gradient_but_keeps_reporting() -> Result<()> {
    let device = Device::Cpu;
    let target = Tensor::new(&[[1.0f32, 0.0]], &device)?;
    let var = Var::new(&[[0.95f32, 0.05]], &device)?;
    let prompt = Prompt::new(target, 1.0, Some(0.5));

    let (loss, similarity) = prompt.loss(var.as_tensor())?;
    assert!(similarity > 0.5, "threshold should be crossed");
    // Still reported...
    assert!(loss.to_scalar::<f32>()?.is_finite());
    // ...but contributing no gradient.
    let grads = loss.backward()?;
    assert!(grads.get(&var).is_none());
    Ok(())
}

#[test]
fn test_uncrossed_stop_keeps_gradient() -> Result<()> {
    let device = Device::Cpu;
    let target = Tensor::new(&[[1.0f32, 0.0]], &device)?;
    let var = Var::new(&[[0.1f32, 0.99]], &device)?;
    let prompt = Prompt::new(target, 1.0, Some(0.5));

    let (loss, similarity) = prompt.loss(var.as_tensor())?;
    assert!(similarity < 0.5);
    let grads = loss.backward()?;
    assert!(grads.get(&var).is_some());
    Ok(())
}

#[test]
fn test_loss_scales_with_weight_magnitude() -> Result<()> {
    let device = Device::Cpu;
    let target = Tensor::new(&[[0.0f32, 1.0]], &device)?;
    let image = Tensor::new(&[[1.0f32, 0.0]], &device)?;

    let (half, _) = Prompt::new(target.clone(), 0.5, None).loss(&image)?;
    let (full, _) = Prompt::new(target, 1.0, None).loss(&image)?;
    let ratio = full.to_scalar::<f32>()? / half.to_scalar::<f32>()?;
    assert!((ratio - 2.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_multi_row_prompt_embeddings_average() -> Result<()> {
    let device = Device::Cpu;
    // Two orthogonal target rows: similarity averages over rows.
    let target = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &device)?;
    let image = Tensor::new(&[[1.0f32, 0.0]], &device)?;
    let prompt = Prompt::new(target, 1.0, None);
    let (_, similarity) = prompt.loss(&image)?;
    assert!((similarity - 0.5).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_cosine_helper_agrees_with_reported_similarity() -> Result<()> {
    let device = Device::Cpu;
    let target = Tensor::new(&[[0.3f32, -0.7, 0.2]], &device)?;
    let image = Tensor::new(&[[-0.1f32, 0.4, 0.9]], &device)?;
    let prompt = Prompt::new(target.clone(), 1.0, None);
    let (_, similarity) = prompt.loss(&image)?;
    assert!((similarity - cosine(&image, &target)?).abs() < 1e-5);
    Ok(())
}
