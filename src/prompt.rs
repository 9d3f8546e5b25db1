//! Prompt parsing and the per-prompt similarity loss.
//!
//! Prompts arrive as `"payload:weight[:stop]"` strings. The payload is a
//! text phrase, an image path/URL, or an integer noise seed; weight
//! defaults to 1.0. A negative weight flips the objective from "steer
//! toward" to "steer away". The optional stop value silences a prompt's
//! gradient once its similarity has crossed it.
//!
//! Serial "stories" chain prompt groups with `^`; within a group, `|`
//! separates prompts applied simultaneously.

use candle_core::{Result, Tensor, D};

/// Split a `"payload:weight[:stop]"` string.
///
/// Numeric suffixes are detected from the right, so payloads containing
/// colons (URLs, Windows paths) survive intact.
pub fn split_prompt(prompt: &str) -> (String, f32, Option<f32>) {
    let parts: Vec<&str> = prompt.split(':').collect();
    let mut end = parts.len();
    let mut weight = 1.0f32;
    let mut stop = None;

    if end >= 3 {
        if let (Ok(w), Ok(s)) = (
            parts[end - 2].trim().parse::<f32>(),
            parts[end - 1].trim().parse::<f32>(),
        ) {
            weight = w;
            stop = Some(s);
            end -= 2;
        }
    }
    if stop.is_none() && end >= 2 {
        if let Ok(w) = parts[end - 1].trim().parse::<f32>() {
            weight = w;
            end -= 1;
        }
    }

    (parts[..end].join(":").trim().to_string(), weight, stop)
}

/// Parse a story string into segments of simultaneous prompts.
///
/// `"a|b^c"` becomes `[["a", "b"], ["c"]]`. Empty entries are dropped.
pub fn parse_story(prompts: &str) -> Vec<Vec<String>> {
    prompts
        .split('^')
        .map(|segment| {
            segment
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|segment: &Vec<String>| !segment.is_empty())
        .collect()
}

/// The three prompt kinds of a run, already split into story segments.
#[derive(Debug, Clone, Default)]
pub struct ParsedPrompts {
    pub text: Vec<Vec<String>>,
    pub image: Vec<Vec<String>>,
    pub noise: Vec<Vec<String>>,
}

/// Parse the text/image/noise prompt strings of a run in one call.
pub fn parse_all_prompts(text: &str, image: &str, noise: &str) -> ParsedPrompts {
    ParsedPrompts {
        text: parse_story(text),
        image: parse_story(image),
        noise: parse_story(noise),
    }
}

/// L2-normalize along the last dimension.
pub fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    t.broadcast_div(&norm)
}

/// An encoded optimization target.
///
/// `embed` holds one or more rows in the perceptor's embedding space
/// (image prompts contribute one row per cutout view). Immutable once
/// created.
#[derive(Debug)]
pub struct Prompt {
    embed: Tensor,
    weight: f32,
    stop: Option<f32>,
}

impl Prompt {
    pub fn new(embed: Tensor, weight: f32, stop: Option<f32>) -> Self {
        Self {
            embed,
            weight,
            stop,
        }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    pub fn stop(&self) -> Option<f32> {
        self.stop
    }

    /// Directional similarity loss against a batch of image embeddings.
    ///
    /// With a positive weight the loss is `|w| * (1 - cos)`, with a
    /// negative weight `|w| * cos`, where `cos` is the mean cosine
    /// similarity over all (view, prompt-row) pairs. Once the measured
    /// similarity has crossed the stop threshold in the steered direction,
    /// the loss is detached: still reported, no longer driving gradients.
    ///
    /// Returns the loss tensor and the measured similarity.
    pub fn loss(&self, image_embed: &Tensor) -> Result<(Tensor, f32)> {
        let views = l2_normalize(image_embed)?; // [n, d]
        let targets = l2_normalize(&self.embed)?; // [p, d]
        let sim = views.matmul(&targets.t()?.contiguous()?)?.mean_all()?;
        let sim_value = sim.to_scalar::<f32>()?;

        let magnitude = self.weight.abs() as f64;
        let loss = if self.weight >= 0.0 {
            // |w| * (1 - sim)
            sim.affine(-magnitude, magnitude)?
        } else {
            // |w| * sim
            sim.affine(magnitude, 0.0)?
        };

        let crossed = match self.stop {
            Some(stop) if self.weight >= 0.0 => sim_value > stop,
            Some(stop) => sim_value < stop,
            None => false,
        };
        let loss = if crossed { loss.detach() } else { loss };

        Ok((loss, sim_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn weighted_prompt() {
        let (payload, weight, stop) = split_prompt("A red boat:0.5");
        assert_eq!(payload, "A red boat");
        assert_eq!(weight, 0.5);
        assert!(stop.is_none());
    }

    #[test]
    fn weight_and_stop() {
        let (payload, weight, stop) = split_prompt("photo.png:1.0:0.2");
        assert_eq!(payload, "photo.png");
        assert_eq!(weight, 1.0);
        assert_eq!(stop, Some(0.2));
    }

    #[test]
    fn bare_prompt_defaults() {
        let (payload, weight, stop) = split_prompt("A red boat");
        assert_eq!(payload, "A red boat");
        assert_eq!(weight, 1.0);
        assert!(stop.is_none());
    }

    #[test]
    fn url_payload_survives() {
        let (payload, weight, _) = split_prompt("https://example.com/a.png:0.7");
        assert_eq!(payload, "https://example.com/a.png");
        assert_eq!(weight, 0.7);
    }

    #[test]
    fn negative_weight() {
        let (_, weight, _) = split_prompt("fog:-0.3");
        assert_eq!(weight, -0.3);
    }

    #[test]
    fn story_segments() {
        let story = parse_story("a boat|the sea:0.5^a storm");
        assert_eq!(
            story,
            vec![
                vec!["a boat".to_string(), "the sea:0.5".to_string()],
                vec!["a storm".to_string()],
            ]
        );
    }

    #[test]
    fn empty_story_is_empty() {
        assert!(parse_story("").is_empty());
    }

    #[test]
    fn aligned_prompt_has_zero_loss() -> Result<()> {
        let device = Device::Cpu;
        let embed = Tensor::new(&[[1.0f32, 0.0, 0.0]], &device)?;
        let image = Tensor::new(&[[2.0f32, 0.0, 0.0]], &device)?;
        let prompt = Prompt::new(embed, 1.0, None);
        let (loss, sim) = prompt.loss(&image)?;
        assert!((sim - 1.0).abs() < 1e-5);
        assert!(loss.to_scalar::<f32>()?.abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn negative_weight_flips_objective() -> Result<()> {
        let device = Device::Cpu;
        let embed = Tensor::new(&[[1.0f32, 0.0, 0.0]], &device)?;
        let image = Tensor::new(&[[1.0f32, 0.0, 0.0]], &device)?;
        let prompt = Prompt::new(embed, -2.0, None);
        let (loss, sim) = prompt.loss(&image)?;
        assert!((sim - 1.0).abs() < 1e-5);
        // Aligned image under a negative prompt: loss = |w| * sim = 2.
        assert!((loss.to_scalar::<f32>()? - 2.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn crossed_stop_detaches_gradient() -> Result<()> {
        let device = Device::Cpu;
        let embed = Tensor::new(&[[1.0f32, 0.0]], &device)?;
        let var = candle_core::Var::new(&[[0.9f32, 0.1]], &device)?;
        let prompt = Prompt::new(embed, 1.0, Some(0.5));
        let (loss, sim) = prompt.loss(var.as_tensor())?;
        assert!(sim > 0.5);
        let grads = loss.backward()?;
        // Loss detached: the latent receives no gradient from this prompt.
        assert!(grads.get(&var).is_none());
        Ok(())
    }
}
