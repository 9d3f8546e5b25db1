//! VQGAN+CLIP guided image synthesis for the Candle framework.
//!
//! This crate generates still images and videos by optimizing a latent code
//! in a frozen VQGAN's embedding space against one or more CLIP-scored
//! prompts (text, image, or seeded noise). The core is [`engine::Engine`],
//! which owns the trainable latent, both frozen models, and the optimizer,
//! and exposes [`engine::Engine::train`] as the atomic unit of progress.
//! The [`generate`] module layers image/video drivers on top of it.

pub mod config;
pub mod cutouts;
pub mod engine;
pub mod generate;
pub mod image_io;
pub mod loader;
pub mod models;
pub mod ops;
pub mod optim;
pub mod perceptor;
pub mod prompt;
pub mod utils;
pub mod video;

pub use config::VqganClipConfig;
pub use cutouts::{CutMethod, CutoutSampler};
pub use engine::{Engine, EngineError};
pub use generate::Interrupt;
pub use models::vqgan::{VqganConfig, VqganModel};
pub use optim::{Algorithm, LatentOptimizer};
pub use perceptor::Perceptor;
pub use prompt::{parse_all_prompts, parse_story, split_prompt, ParsedPrompts, Prompt};
