//! Tests for the cutout sampler strategies and augmentation chains.

use candle_core::{Device, Result, Tensor, Var};
use candle_vqgan_clip::cutouts::{AugmentKind, CutMethod, CutoutSampler};

fn seeded(method: CutMethod, chains: &[Vec<String>]) -> CutoutSampler {
    let mut sampler = CutoutSampler::new(method, 16, 8, 1.0, chains, true);
    sampler.reseed(1234);
    sampler
}

const ALL_METHODS: [CutMethod; 5] = [
    CutMethod::Latest,
    CutMethod::Original,
    CutMethod::Updated,
    CutMethod::NrUpdated,
    CutMethod::UpdatedPooling,
];

#[test]
fn test_all_strategies_produce_n_3_r_r() -> Result<()> {
    let device = Device::Cpu;
    // Non-square input, larger than the cut size.
    let input = Tensor::rand(0f32, 1.0, (1, 3, 64, 48), &device)?;
    for method in ALL_METHODS {
        let batch = seeded(method, &[]).sample(&input)?;
        assert_eq!(batch.dims(), &[8, 3, 16, 16], "{method:?}");
    }
    Ok(())
}

#[test]
fn test_strategies_handle_input_smaller_than_cut_size() -> Result<()> {
    let device = Device::Cpu;
    let input = Tensor::rand(0f32, 1.0, (1, 3, 10, 12), &device)?;
    for method in ALL_METHODS {
        let batch = seeded(method, &[]).sample(&input)?;
        assert_eq!(batch.dims(), &[8, 3, 16, 16], "{method:?}");
    }
    Ok(())
}

#[test]
fn test_configured_chain_reaches_nrupdated() -> Result<()> {
    let device = Device::Cpu;
    let input = Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &device)?;
    let chains = vec![vec!["Hf".to_string(), "Ji".to_string(), "Gn".to_string()]];
    let batch = seeded(CutMethod::NrUpdated, &chains).sample(&input)?;
    assert_eq!(batch.dims(), &[8, 3, 16, 16]);
    Ok(())
}

#[test]
fn test_gradient_flows_through_sampling() -> Result<()> {
    let device = Device::Cpu;
    let var = Var::from_tensor(&Tensor::rand(0f32, 1.0, (1, 3, 32, 32), &device)?)?;
    for method in ALL_METHODS {
        let batch = seeded(method, &[]).sample(var.as_tensor())?;
        let loss = batch.sqr()?.mean_all()?;
        let grads = loss.backward()?;
        assert!(
            grads.get(&var).is_some(),
            "{method:?} should keep the image on the tape"
        );
    }
    Ok(())
}

#[test]
fn test_deterministic_mode_replays_bit_identically() -> Result<()> {
    let device = Device::Cpu;
    let input = Tensor::rand(0f32, 1.0, (1, 3, 40, 40), &device)?;
    let chains = vec![vec![
        "Af".to_string(),
        "Pe".to_string(),
        "Ji".to_string(),
        "Er".to_string(),
        "Gn".to_string(),
    ]];
    let a = seeded(CutMethod::Latest, &chains).sample(&input)?;
    let b = seeded(CutMethod::Latest, &chains).sample(&input)?;
    let diff = a
        .sub(&b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn test_different_seeds_give_different_views() -> Result<()> {
    let device = Device::Cpu;
    let input = Tensor::rand(0f32, 1.0, (1, 3, 40, 40), &device)?;
    let mut a = CutoutSampler::new(CutMethod::Original, 16, 8, 1.0, &[], true);
    let mut b = CutoutSampler::new(CutMethod::Original, 16, 8, 1.0, &[], true);
    a.reseed(1);
    b.reseed(2);
    let xa = a.sample(&input)?;
    let xb = b.sample(&input)?;
    let diff = xa
        .sub(&xb)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn test_cut_power_extremes_still_fill_the_batch() -> Result<()> {
    let device = Device::Cpu;
    let input = Tensor::rand(0f32, 1.0, (1, 3, 64, 64), &device)?;
    for cut_pow in [0.1f32, 1.0, 8.0] {
        let mut sampler = CutoutSampler::new(CutMethod::Original, 16, 4, cut_pow, &[], true);
        sampler.reseed(7);
        let batch = sampler.sample(&input)?;
        assert_eq!(batch.dims(), &[4, 3, 16, 16]);
    }
    Ok(())
}

#[test]
fn test_unknown_names_degrade_with_fallbacks() {
    assert_eq!(CutMethod::from_name("garbage"), CutMethod::UpdatedPooling);
    let chain = AugmentKind::parse_chain(&[
        "Ji".to_string(),
        "Sh".to_string(),
        "Ts".to_string(),
        "Er".to_string(),
    ]);
    assert_eq!(chain, vec![AugmentKind::ColorJitter, AugmentKind::Erase]);
}
