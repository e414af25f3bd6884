//! Emotion scoring over a classifier backend.
//!
//! The classifier consumes files, so in-memory probes are written to a
//! uniquely named temporary PNG that lives exactly as long as the call.

use crate::classifier::{ClassifierError, ClassifyRequest, EmotionClassifier, RawEmotionScores};
use crate::types::{Emotion, EmotionDistribution};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

const TEMP_PREFIX: &str = "emolens-probe-";

#[derive(Error, Debug)]
pub enum ScorerError {
    #[error("emotion classifier failed: {0}")]
    ClassifierFailure(#[from] ClassifierError),
    #[error("failed to materialize probe as a temporary file: {0}")]
    TempFile(String),
}

/// What to do when classification fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and answer an empty distribution.
    #[default]
    Soft,
    /// Return the error to the caller.
    Strict,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft" => Ok(FailurePolicy::Soft),
            "strict" => Ok(FailurePolicy::Strict),
            other => Err(format!("unknown failure policy '{other}' (expected soft or strict)")),
        }
    }
}

/// Input to [`EmotionScorer::analyze`].
#[derive(Debug, Clone, Copy)]
pub enum Probe<'a> {
    InMemory(&'a RgbImage),
    FilePath(&'a Path),
}

pub struct EmotionScorer {
    classifier: Box<dyn EmotionClassifier>,
    policy: FailurePolicy,
    normalize: bool,
}

impl EmotionScorer {
    /// Soft failures, normalized output.
    pub fn new(classifier: Box<dyn EmotionClassifier>) -> Self {
        Self {
            classifier,
            policy: FailurePolicy::Soft,
            normalize: true,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Rescale scores to sum to 100 (on by default). When off, scores are
    /// reported in the classifier's own units.
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Score the first face (or the whole probe) over the fixed emotion set.
    ///
    /// The classifier never re-validates that a face is present. Under
    /// [`FailurePolicy::Soft`] every failure yields an empty distribution.
    pub fn analyze(&mut self, probe: Probe<'_>) -> Result<EmotionDistribution, ScorerError> {
        match self.try_analyze(probe) {
            Ok(distribution) => Ok(distribution),
            Err(e) if self.policy == FailurePolicy::Soft => {
                tracing::warn!(error = %e, "emotion analysis failed; returning empty distribution");
                Ok(EmotionDistribution::empty())
            }
            Err(e) => Err(e),
        }
    }

    fn try_analyze(&mut self, probe: Probe<'_>) -> Result<EmotionDistribution, ScorerError> {
        let request = ClassifyRequest { enforce_detection: false };

        let faces = match probe {
            Probe::FilePath(path) => self.classifier.classify(path, &request)?,
            Probe::InMemory(image) => {
                let temp = materialize(image)?;
                tracing::debug!(path = %temp.path().display(), "probe written to temp file");
                self.classifier.classify(temp.path(), &request)?
            }
        };

        let Some(first) = faces.into_iter().next() else {
            tracing::debug!("classifier returned no faces");
            return Ok(EmotionDistribution::empty());
        };

        let distribution = to_distribution(first);
        Ok(if self.normalize {
            distribution.normalized()
        } else {
            distribution
        })
    }
}

/// Write `image` to a fresh temp file; the file is removed when dropped.
fn materialize(image: &RgbImage) -> Result<NamedTempFile, ScorerError> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".png")
        .tempfile()
        .map_err(|e| ScorerError::TempFile(e.to_string()))?;
    image
        .write_to(temp.as_file_mut(), ImageFormat::Png)
        .map_err(|e| ScorerError::TempFile(e.to_string()))?;
    Ok(temp)
}

fn to_distribution(raw: RawEmotionScores) -> EmotionDistribution {
    let scores = raw.into_iter().filter_map(|(name, score)| match Emotion::from_name(&name) {
        Some(emotion) => Some((emotion, score)),
        None => {
            tracing::warn!(name = %name, "dropping unknown emotion label");
            None
        }
    });
    EmotionDistribution::from_scores(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    /// Decodes the probe like a real classifier and records what it saw.
    struct RecordingClassifier {
        seen: Rc<RefCell<Vec<(PathBuf, bool, bool)>>>,
        scores: Vec<(&'static str, f32)>,
    }

    impl EmotionClassifier for RecordingClassifier {
        fn classify(
            &mut self,
            path: &Path,
            request: &ClassifyRequest,
        ) -> Result<Vec<RawEmotionScores>, ClassifierError> {
            self.seen
                .borrow_mut()
                .push((path.to_path_buf(), path.exists(), request.enforce_detection));
            image::open(path).map_err(|e| ClassifierError::ImageLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let face = self.scores.iter().map(|(n, s)| (n.to_string(), *s)).collect();
            Ok(vec![face])
        }
    }

    fn scorer(scores: Vec<(&'static str, f32)>) -> (EmotionScorer, Rc<RefCell<Vec<(PathBuf, bool, bool)>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let classifier = RecordingClassifier { seen: Rc::clone(&seen), scores };
        (EmotionScorer::new(Box::new(classifier)), seen)
    }

    fn probe() -> RgbImage {
        RgbImage::from_pixel(16, 16, Rgb([120, 80, 40]))
    }

    #[test]
    fn test_in_memory_probe_temp_file_is_scoped() {
        let (mut scorer, seen) = scorer(vec![("happy", 3.0), ("sad", 1.0)]);
        let image = probe();
        let dist = scorer.analyze(Probe::InMemory(&image)).unwrap();
        assert_eq!(dist.dominant().map(|(e, _)| e), Some(Emotion::Happy));

        let calls = seen.borrow();
        let (path, existed, enforce) = &calls[0];
        assert!(*existed);
        assert!(!*enforce);
        assert!(!path.exists());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_PREFIX)));
    }

    #[test]
    fn test_temp_files_unique_per_call() {
        let (mut scorer, seen) = scorer(vec![("neutral", 1.0)]);
        let image = probe();
        scorer.analyze(Probe::InMemory(&image)).unwrap();
        scorer.analyze(Probe::InMemory(&image)).unwrap();
        let calls = seen.borrow();
        assert_ne!(calls[0].0, calls[1].0);
    }

    #[test]
    fn test_normalized_to_percentages() {
        let (mut scorer, _) = scorer(vec![("happy", 30.0), ("sad", 10.0)]);
        let dist = scorer.analyze(Probe::InMemory(&probe())).unwrap();
        assert!((dist.total() - 100.0).abs() < 1e-3);
        assert!((dist.get(Emotion::Happy).unwrap() - 75.0).abs() < 1e-3);
    }

    #[test]
    fn test_raw_scores_when_normalize_off() {
        let (scorer, _) = scorer(vec![("happy", 30.0), ("sad", 10.0)]);
        let mut scorer = scorer.with_normalize(false);
        let dist = scorer.analyze(Probe::InMemory(&probe())).unwrap();
        assert_eq!(dist.get(Emotion::Happy), Some(30.0));
        assert_eq!(dist.get(Emotion::Sad), Some(10.0));
    }

    #[test]
    fn test_unknown_labels_dropped() {
        let (mut scorer, _) = scorer(vec![("happy", 1.0), ("contempt", 5.0)]);
        let dist = scorer.analyze(Probe::InMemory(&probe())).unwrap();
        assert_eq!(dist.len(), 1);
        assert_eq!(dist.get(Emotion::Happy), Some(100.0));
    }

    #[test]
    fn test_soft_policy_unreadable_probe_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("empty.jpg");
        std::fs::write(&bogus, b"").unwrap();

        let (mut scorer, _) = scorer(vec![("happy", 1.0)]);
        assert_eq!(scorer.policy(), FailurePolicy::Soft);
        let dist = scorer.analyze(Probe::FilePath(&bogus)).unwrap();
        assert!(dist.is_empty());
    }

    #[test]
    fn test_strict_policy_surfaces_failure() {
        let (scorer, _) = scorer(vec![("happy", 1.0)]);
        let mut scorer = scorer.with_policy(FailurePolicy::Strict);
        let err = scorer
            .analyze(Probe::FilePath(Path::new("/nonexistent/probe.png")))
            .unwrap_err();
        assert!(matches!(
            err,
            ScorerError::ClassifierFailure(ClassifierError::ImageLoad { .. })
        ));
    }

    /// Records the file it was handed, then fails.
    struct FailingClassifier(Rc<RefCell<Vec<PathBuf>>>);

    impl EmotionClassifier for FailingClassifier {
        fn classify(&mut self, path: &Path, _: &ClassifyRequest) -> Result<Vec<RawEmotionScores>, ClassifierError> {
            assert!(path.exists());
            self.0.borrow_mut().push(path.to_path_buf());
            Err(ClassifierError::InferenceFailed("model exploded".into()))
        }
    }

    fn failing(policy: FailurePolicy) -> (EmotionScorer, Rc<RefCell<Vec<PathBuf>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let scorer = EmotionScorer::new(Box::new(FailingClassifier(Rc::clone(&seen)))).with_policy(policy);
        (scorer, seen)
    }

    #[test]
    fn test_temp_file_removed_after_soft_failure() {
        let (mut scorer, seen) = failing(FailurePolicy::Soft);
        let dist = scorer.analyze(Probe::InMemory(&probe())).unwrap();
        assert!(dist.is_empty());

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].exists());
    }

    #[test]
    fn test_temp_file_removed_after_strict_failure() {
        let (mut scorer, seen) = failing(FailurePolicy::Strict);
        let err = scorer.analyze(Probe::InMemory(&probe())).unwrap_err();
        assert!(matches!(
            err,
            ScorerError::ClassifierFailure(ClassifierError::InferenceFailed(_))
        ));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].exists());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Strict".parse::<FailurePolicy>(), Ok(FailurePolicy::Strict));
        assert_eq!(" soft".parse::<FailurePolicy>(), Ok(FailurePolicy::Soft));
        assert!("loud".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_file_probe_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        probe().save(&path).unwrap();

        let (mut scorer, seen) = scorer(vec![("fear", 2.0)]);
        scorer.analyze(Probe::FilePath(&path)).unwrap();
        assert_eq!(seen.borrow()[0].0, path);
        assert!(path.exists());
    }
}
