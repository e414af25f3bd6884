//! Pixel-buffer effects: pixelation and additive Gaussian noise.
//!
//! Every effect takes the input by reference and returns a fresh buffer of
//! identical dimensions. Nothing here touches the filesystem.

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Noise deviation, in channel units, when none is configured.
pub const DEFAULT_NOISE_SIGMA: f32 = 25.0;
/// Pixelation block size when none is configured.
pub const DEFAULT_BLOCK_SIZE: u32 = 10;

#[derive(Error, Debug, PartialEq)]
pub enum EffectError {
    #[error("pixelate block size must be at least 1, got {0}")]
    InvalidBlockSize(u32),
    #[error("noise standard deviation must be finite and non-negative, got {0}")]
    InvalidSigma(f32),
}

/// How the noise standard deviation is specified.
///
/// The two conventions stay distinct: `Sigma(25.0)` and `Level(0.1)` are
/// different requests even though both are "some noise".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "convention", content = "value", rename_all = "lowercase")]
pub enum NoiseLevel {
    /// Standard deviation in channel units (0–255 scale).
    Sigma(f32),
    /// Fraction of full scale; σ = level × 255.
    Level(f32),
}

impl NoiseLevel {
    pub fn sigma(&self) -> f32 {
        match *self {
            NoiseLevel::Sigma(sigma) => sigma,
            NoiseLevel::Level(level) => level * 255.0,
        }
    }
}

impl Default for NoiseLevel {
    fn default() -> Self {
        NoiseLevel::Sigma(DEFAULT_NOISE_SIGMA)
    }
}

/// An effect request that a session can apply to its current image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    Pixelate { block_size: u32 },
    Noise(NoiseLevel),
}

impl Effect {
    pub fn apply(&self, image: &RgbImage) -> Result<RgbImage, EffectError> {
        match *self {
            Effect::Pixelate { block_size } => pixelate(image, block_size),
            Effect::Noise(level) => add_noise(image, level),
        }
    }
}

/// Downsample by `block_size` with linear interpolation, then upsample back
/// with nearest-neighbour so each source block becomes a flat tile.
///
/// Dimensions not divisible by `block_size` are truncated on the way down;
/// the output always has the input's dimensions.
pub fn pixelate(image: &RgbImage, block_size: u32) -> Result<RgbImage, EffectError> {
    if block_size == 0 {
        return Err(EffectError::InvalidBlockSize(block_size));
    }

    let (width, height) = image.dimensions();
    if block_size == 1 || width == 0 || height == 0 {
        return Ok(image.clone());
    }

    let small_w = (width / block_size).max(1);
    let small_h = (height / block_size).max(1);

    let small = imageops::resize(image, small_w, small_h, FilterType::Triangle);
    let out = imageops::resize(&small, width, height, FilterType::Nearest);

    tracing::debug!(width, height, block_size, small_w, small_h, "pixelated image");
    Ok(out)
}

/// Add zero-mean Gaussian noise to every channel, clamping to [0, 255].
///
/// Each call draws from fresh entropy, so results are not reproducible.
pub fn add_noise(image: &RgbImage, level: NoiseLevel) -> Result<RgbImage, EffectError> {
    let sigma = level.sigma();
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(EffectError::InvalidSigma(sigma));
    }
    if sigma == 0.0 {
        return Ok(image.clone());
    }

    let normal = Normal::new(0.0f32, sigma).map_err(|_| EffectError::InvalidSigma(sigma))?;
    let mut rng = rand::thread_rng();

    let mut out = image.clone();
    for channel in out.iter_mut() {
        let noisy = *channel as f32 + normal.sample(&mut rng);
        *channel = noisy.clamp(0.0, 255.0) as u8;
    }

    tracing::debug!(?level, sigma, "added gaussian noise");
    Ok(out)
}
