//! emolens-core: image effects, face location, identity matching and
//! emotion scoring.
//!
//! Face detection (SCRFD) and emotion classification run through ONNX
//! Runtime behind narrow traits; identity matching uses an in-crate LBPH
//! recognizer trained on a folder-per-person gallery.

pub mod classifier;
pub mod detector;
pub mod effects;
pub mod gallery;
pub mod lbph;
pub mod locator;
pub mod matcher;
pub mod pipeline;
pub mod scorer;
pub mod session;
pub mod types;

pub use classifier::{EmotionClassifier, OnnxEmotionClassifier};
pub use detector::{FaceDetectorBackend, ScrfdDetector};
pub use effects::{Effect, NoiseLevel};
pub use locator::{DetectionParams, FaceLocator};
pub use matcher::{IdentityMatcher, MatcherConfig};
pub use pipeline::{Analyzer, ProbeRegion};
pub use scorer::{EmotionScorer, FailurePolicy, Probe};
pub use session::{ImageSource, Session};
pub use types::{AnalysisResult, Emotion, EmotionDistribution, FaceRegion, Identity};

use std::path::PathBuf;

/// Model directory used when none is configured: `$XDG_DATA_HOME/emolens/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("emolens/models")
}
