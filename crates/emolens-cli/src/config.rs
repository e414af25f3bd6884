use anyhow::{Context, Result};
use emolens_core::effects::{DEFAULT_BLOCK_SIZE, DEFAULT_NOISE_SIGMA};
use emolens_core::gallery::CLIP_SIZE;
use emolens_core::{DetectionParams, FailurePolicy, MatcherConfig, NoiseLevel, ProbeRegion};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration, loaded from `EMOLENS_*` environment variables and an
/// optional TOML file.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Gallery root: one subfolder of images per person (default: ./gallery).
    pub gallery_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detection: DetectionParams,
    /// Default pixelation block size.
    pub block_size: u32,
    /// Default noise when an effect does not name one.
    pub noise: NoiseLevel,
    /// Whether emotion classifier failures are swallowed or surfaced.
    pub failure_policy: FailurePolicy,
    /// Rescale emotion scores to sum to 100.
    pub normalize: bool,
    pub probe_region: ProbeRegion,
    pub matcher: MatcherConfig,
    /// Side length of clipped gallery faces.
    pub clip_size: u32,
}

/// Keys accepted in the `--config` TOML file. Each present key replaces the
/// environment value; a present table replaces the whole section.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    gallery_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    detection: Option<DetectionParams>,
    block_size: Option<u32>,
    noise: Option<NoiseLevel>,
    failure_policy: Option<FailurePolicy>,
    normalize: Option<bool>,
    probe_region: Option<ProbeRegion>,
    matcher: Option<MatcherConfig>,
    clip_size: Option<u32>,
}

impl Config {
    /// Load configuration from `EMOLENS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Environment first, then the TOML file at `path` on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config.overlay_toml(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "config file applied");
        }
        Ok(config)
    }

    fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("EMOLENS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(emolens_core::default_model_dir);

        let defaults = DetectionParams::default();
        let detection = DetectionParams {
            scale_factor: env_parse(var, "EMOLENS_SCALE_FACTOR", defaults.scale_factor),
            min_neighbors: env_parse(var, "EMOLENS_MIN_NEIGHBORS", defaults.min_neighbors),
            min_size: var("EMOLENS_MIN_FACE_SIZE")
                .and_then(|v| parse_size(&v))
                .unwrap_or(defaults.min_size),
        };

        // A level, when given, takes precedence over a fixed sigma.
        let noise = match var("EMOLENS_NOISE_LEVEL").and_then(|v| v.parse().ok()) {
            Some(level) => NoiseLevel::Level(level),
            None => NoiseLevel::Sigma(env_parse(var, "EMOLENS_NOISE_SIGMA", DEFAULT_NOISE_SIGMA)),
        };

        let matcher = MatcherConfig {
            threshold: var("EMOLENS_LBPH_THRESHOLD").and_then(|v| v.parse().ok()),
            cache_gallery: env_flag(var, "EMOLENS_CACHE_GALLERY", false),
            ..MatcherConfig::default()
        };

        Self {
            gallery_dir: var("EMOLENS_GALLERY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("gallery")),
            model_dir,
            detection,
            block_size: env_parse(var, "EMOLENS_BLOCK_SIZE", DEFAULT_BLOCK_SIZE),
            noise,
            failure_policy: env_parse(var, "EMOLENS_FAILURE_POLICY", FailurePolicy::default()),
            normalize: env_flag(var, "EMOLENS_NORMALIZE", true),
            probe_region: env_parse(var, "EMOLENS_PROBE_REGION", ProbeRegion::default()),
            matcher,
            clip_size: env_parse(var, "EMOLENS_CLIP_SIZE", CLIP_SIZE),
        }
    }

    fn overlay_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.gallery_dir {
            self.gallery_dir = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.detection {
            self.detection = v;
        }
        if let Some(v) = file.block_size {
            self.block_size = v;
        }
        if let Some(v) = file.noise {
            self.noise = v;
        }
        if let Some(v) = file.failure_policy {
            self.failure_policy = v;
        }
        if let Some(v) = file.normalize {
            self.normalize = v;
        }
        if let Some(v) = file.probe_region {
            self.probe_region = v;
        }
        if let Some(v) = file.matcher {
            self.matcher = v;
        }
        if let Some(v) = file.clip_size {
            self.clip_size = v;
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the facial-expression model.
    pub fn emotion_model_path(&self) -> String {
        self.model_dir
            .join("emotion.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T: FromStr>(var: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable setting");
            default
        }),
    }
}

fn env_flag(var: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key)
        .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
        .unwrap_or(default)
}

/// `"40"` or `"40x32"` (width × height).
fn parse_size(value: &str) -> Option<(u32, u32)> {
    match value.trim().split_once(['x', 'X']) {
        Some((w, h)) => Some((w.trim().parse().ok()?, h.trim().parse().ok()?)),
        None => {
            let side = value.trim().parse().ok()?;
            Some((side, side))
        }
    }
}
