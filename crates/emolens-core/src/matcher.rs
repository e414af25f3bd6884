//! Identity matching: train an LBPH model on the gallery, then classify probes.

use crate::gallery::{Gallery, GalleryError, GalleryFingerprint};
use crate::lbph::{LbphError, LbphRecognizer};
use crate::session::ImageSource;
use crate::types::Identity;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("identity model has not been trained")]
    ModelNotTrained,
    #[error("no image loaded for recognition")]
    NoImageLoaded,
    #[error("recognizer error: {0}")]
    Recognizer(LbphError),
}

impl From<LbphError> for MatcherError {
    fn from(err: LbphError) -> Self {
        match err {
            LbphError::NotTrained => MatcherError::ModelNotTrained,
            other => MatcherError::Recognizer(other),
        }
    }
}

/// LBPH operator settings and gallery caching policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Distances at or above this resolve to "Unknown". `None` accepts any match.
    pub threshold: Option<f64>,
    /// Reuse the trained model while the gallery tree is unchanged.
    pub cache_gallery: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
            threshold: None,
            cache_gallery: false,
        }
    }
}

impl MatcherConfig {
    fn recognizer(&self) -> Result<LbphRecognizer, LbphError> {
        LbphRecognizer::new(
            self.radius,
            self.neighbors,
            self.grid_x,
            self.grid_y,
            self.threshold.unwrap_or(f64::MAX),
        )
    }
}

struct TrainedModel {
    gallery: Gallery,
    recognizer: LbphRecognizer,
    fingerprint: Option<GalleryFingerprint>,
}

/// Two-phase matcher over a gallery folder: [`train`](Self::train) then
/// [`predict`](Self::predict).
pub struct IdentityMatcher {
    gallery_root: PathBuf,
    config: MatcherConfig,
    model: Option<TrainedModel>,
    fits: u64,
}

impl IdentityMatcher {
    pub fn new(gallery_root: impl Into<PathBuf>, config: MatcherConfig) -> Result<Self, MatcherError> {
        // Reject bad operator settings up front rather than at first train.
        config.recognizer()?;
        Ok(Self {
            gallery_root: gallery_root.into(),
            config,
            model: None,
            fits: 0,
        })
    }

    pub fn gallery_root(&self) -> &Path {
        &self.gallery_root
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// How many times a model has been fitted; cached reuse does not count.
    pub fn fit_count(&self) -> u64 {
        self.fits
    }

    /// The gallery behind the current model, if trained.
    pub fn gallery(&self) -> Option<&Gallery> {
        self.model.as_ref().map(|m| &m.gallery)
    }

    /// Build the gallery and fit a fresh recognizer on it.
    ///
    /// With caching enabled, an unchanged gallery keeps the existing model.
    /// A failed train discards any previous model.
    pub fn train(&mut self) -> Result<&Gallery, MatcherError> {
        let fingerprint = if self.config.cache_gallery {
            match GalleryFingerprint::scan(&self.gallery_root) {
                Ok(fp) => Some(fp),
                Err(e) => {
                    self.model = None;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let reusable = fingerprint.is_some()
            && self.model.as_ref().and_then(|m| m.fingerprint.as_ref()) == fingerprint.as_ref();

        if reusable {
            tracing::debug!(root = %self.gallery_root.display(), "gallery unchanged; reusing model");
        } else {
            self.model = None;
            let mut recognizer = self.config.recognizer()?;
            let gallery = Gallery::build_with_min_size(&self.gallery_root, recognizer.min_image_size())?;
            recognizer.fit(gallery.images(), gallery.labels())?;
            self.fits += 1;

            tracing::info!(
                identities = gallery.identities().len(),
                samples = gallery.sample_count(),
                cached = fingerprint.is_some(),
                "identity model trained"
            );

            self.model = Some(TrainedModel {
                gallery,
                recognizer,
                fingerprint,
            });
        }

        self.gallery().ok_or(MatcherError::ModelNotTrained)
    }

    /// Classify a colour probe. Lower `distance` is a better match.
    pub fn predict(&self, probe: &RgbImage) -> Result<Identity, MatcherError> {
        self.predict_gray(&image::imageops::grayscale(probe))
    }

    pub fn predict_gray(&self, probe: &GrayImage) -> Result<Identity, MatcherError> {
        let model = self.model.as_ref().ok_or(MatcherError::ModelNotTrained)?;
        let (label, distance) = model.recognizer.predict(probe)?;
        let name = model.gallery.name_of(label).to_string();

        tracing::debug!(label, name = %name, distance, "identity predicted");
        Ok(Identity { label, name, distance })
    }

    /// Train on the gallery, then classify the source's current image.
    pub fn recognize<S: ImageSource + ?Sized>(&mut self, source: &S) -> Result<Identity, MatcherError> {
        let probe = source.current_image().ok_or(MatcherError::NoImageLoaded)?;
        self.train()?;
        self.predict(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use image::Rgb;

    fn sample(seed: u32) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x * 13 + seed * 71) ^ (y * 29 + seed * 7)) % 256;
            Rgb([v as u8, (v * 3 % 256) as u8, (x * y % 256) as u8])
        })
    }

    fn make_gallery(root: &Path) {
        for (person, seeds) in [("alice", [1u32, 2, 3].as_slice()), ("bob", [10, 11].as_slice())] {
            let dir = root.join(person);
            std::fs::create_dir_all(&dir).unwrap();
            for seed in seeds {
                sample(*seed).save(dir.join(format!("{seed}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn test_train_assigns_one_label_per_folder() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        let gallery = matcher.train().unwrap();
        assert_eq!(gallery.identities().len(), 2);
        let mut labels = gallery.labels().to_vec();
        labels.dedup();
        assert_eq!(labels, vec![1, 2]);
    }

    #[test]
    fn test_predict_training_sample_self_match() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        matcher.train().unwrap();

        let id = matcher.predict(&sample(2)).unwrap();
        assert_eq!(id.name, "alice");
        assert_eq!(id.label, 1);
        assert!(id.distance < 1e-6);

        let id = matcher.predict(&sample(11)).unwrap();
        assert_eq!(id.name, "bob");
    }

    #[test]
    fn test_predict_before_train() {
        let matcher = IdentityMatcher::new("/nonexistent", MatcherConfig::default()).unwrap();
        assert!(matches!(
            matcher.predict(&sample(1)),
            Err(MatcherError::ModelNotTrained)
        ));
    }

    #[test]
    fn test_recognize_without_image() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        assert!(matches!(
            matcher.recognize(&Session::new()),
            Err(MatcherError::NoImageLoaded)
        ));
    }

    #[test]
    fn test_recognize_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        let mut session = Session::new();
        session.load_image(sample(1));
        assert!(matches!(
            matcher.recognize(&session),
            Err(MatcherError::Gallery(GalleryError::Empty(_)))
        ));
        assert!(!matcher.is_trained());
    }

    #[test]
    fn test_threshold_resolves_unknown() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let config = MatcherConfig { threshold: Some(1e-9), ..Default::default() };
        let mut matcher = IdentityMatcher::new(dir.path(), config).unwrap();
        matcher.train().unwrap();

        let id = matcher.predict(&sample(42)).unwrap();
        assert_eq!(id.label, 0);
        assert!(id.is_unknown());
    }

    #[test]
    fn test_cache_reuses_until_gallery_changes() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let config = MatcherConfig { cache_gallery: true, ..Default::default() };
        let mut matcher = IdentityMatcher::new(dir.path(), config).unwrap();

        assert_eq!(matcher.train().unwrap().sample_count(), 5);
        assert_eq!(matcher.train().unwrap().sample_count(), 5);
        assert_eq!(matcher.fit_count(), 1);

        let carol = dir.path().join("carol");
        std::fs::create_dir_all(&carol).unwrap();
        sample(20).save(carol.join("a.png")).unwrap();

        let gallery = matcher.train().unwrap();
        assert_eq!(gallery.sample_count(), 6);
        assert_eq!(gallery.name_of(3), "carol");
        assert_eq!(matcher.fit_count(), 2);
    }

    #[test]
    fn test_without_cache_refits_every_train() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        matcher.train().unwrap();
        matcher.train().unwrap();
        assert_eq!(matcher.fit_count(), 2);
    }

    #[test]
    fn test_undersized_sample_does_not_block_training() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        RgbImage::from_pixel(8, 8, Rgb([9, 9, 9]))
            .save(dir.path().join("bob/thumb.png"))
            .unwrap();

        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();
        assert_eq!(matcher.train().unwrap().sample_count(), 5);

        let mut session = Session::new();
        session.load_image(sample(10));
        assert_eq!(matcher.recognize(&session).unwrap().name, "bob");
    }

    #[test]
    fn test_self_match_after_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        make_gallery(dir.path());
        let mut matcher = IdentityMatcher::new(dir.path(), MatcherConfig::default()).unwrap();

        let mut session = Session::new();
        session.load(dir.path().join("bob/11.png")).unwrap();
        let id = matcher.recognize(&session).unwrap();
        assert_eq!(id.name, "bob");
        assert!(id.distance < 1e-6, "distance {}", id.distance);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MatcherConfig { grid_x: 0, ..Default::default() };
        assert!(matches!(
            IdentityMatcher::new("/tmp", config),
            Err(MatcherError::Recognizer(LbphError::InvalidParams(_)))
        ));
    }
}
