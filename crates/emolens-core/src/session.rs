//! Session state: the loaded original image and the displayed current image.

use crate::effects::{Effect, EffectError, NoiseLevel};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions accepted for gallery samples and saved images.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to load image {path}: {reason}")]
    ImageLoad { path: PathBuf, reason: String },
    #[error("no image loaded")]
    NoImageLoaded,
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(PathBuf),
    #[error("failed to save image {path}: {reason}")]
    Save { path: PathBuf, reason: String },
    #[error("effect failed: {0}")]
    Effect(#[from] EffectError),
}

/// Anything that holds one current image buffer for components to read.
pub trait ImageSource {
    fn current_image(&self) -> Option<&RgbImage>;
}

/// Whether `path` carries one of the supported image extensions (any case).
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Owns the untouched original and the current (possibly edited) image.
///
/// Every mutation either fully replaces `current` or leaves it untouched.
#[derive(Debug, Default)]
pub struct Session {
    original: Option<RgbImage>,
    current: Option<RgbImage>,
    source_path: Option<PathBuf>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `path` and make it both the original and the current image.
    ///
    /// On failure the previously loaded images are kept.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<&RgbImage, SessionError> {
        let path = path.as_ref();
        let decoded = image::open(path).map_err(|e| SessionError::ImageLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let rgb = decoded.to_rgb8();
        tracing::info!(path = %path.display(), width = rgb.width(), height = rgb.height(), "image loaded");

        self.source_path = Some(path.to_path_buf());
        Ok(self.install(rgb))
    }

    /// Adopt an in-memory image as the new original.
    pub fn load_image(&mut self, image: RgbImage) -> &RgbImage {
        self.source_path = None;
        self.install(image)
    }

    fn install(&mut self, image: RgbImage) -> &RgbImage {
        self.original = Some(image.clone());
        self.current.insert(image)
    }

    pub fn original(&self) -> Option<&RgbImage> {
        self.original.as_ref()
    }

    pub fn current(&self) -> Option<&RgbImage> {
        self.current.as_ref()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    /// Apply `effect` to the current image and make the result current.
    pub fn apply_effect(&mut self, effect: Effect) -> Result<&RgbImage, SessionError> {
        let current = self.current.as_ref().ok_or(SessionError::NoImageLoaded)?;
        let next = effect.apply(current)?;
        tracing::debug!(?effect, "effect applied");
        Ok(self.current.insert(next))
    }

    pub fn pixelate(&mut self, block_size: u32) -> Result<&RgbImage, SessionError> {
        self.apply_effect(Effect::Pixelate { block_size })
    }

    pub fn add_noise(&mut self, level: NoiseLevel) -> Result<&RgbImage, SessionError> {
        self.apply_effect(Effect::Noise(level))
    }

    /// Reset the current image to a copy of the original.
    pub fn restore(&mut self) -> Result<&RgbImage, SessionError> {
        let original = self.original.as_ref().ok_or(SessionError::NoImageLoaded)?;
        Ok(self.current.insert(original.clone()))
    }

    /// Write the current image to `path`; the format follows the extension.
    pub fn save_current(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let current = self.current.as_ref().ok_or(SessionError::NoImageLoaded)?;
        if !is_supported_image(path) {
            return Err(SessionError::UnsupportedFileType(path.to_path_buf()));
        }
        current.save(path).map_err(|e| SessionError::Save {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "current image saved");
        Ok(())
    }
}

impl ImageSource for Session {
    fn current_image(&self) -> Option<&RgbImage> {
        self.current.as_ref()
    }
}

impl ImageSource for RgbImage {
    fn current_image(&self) -> Option<&RgbImage> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample() -> RgbImage {
        RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 5, y as u8 * 7, 99]))
    }

    #[test]
    fn test_effect_before_load_fails() {
        let mut session = Session::new();
        assert!(matches!(session.pixelate(10), Err(SessionError::NoImageLoaded)));
        assert!(matches!(session.restore(), Err(SessionError::NoImageLoaded)));
        assert!(session.current().is_none());
    }

    #[test]
    fn test_load_image_sets_both_slots() {
        let mut session = Session::new();
        session.load_image(sample());
        assert_eq!(session.original(), Some(&sample()));
        assert_eq!(session.current(), Some(&sample()));
        assert!(session.source_path().is_none());
    }

    #[test]
    fn test_restore_after_effects() {
        let mut session = Session::new();
        session.load_image(sample());
        session.pixelate(10).unwrap();
        session.add_noise(NoiseLevel::Sigma(40.0)).unwrap();
        session.pixelate(3).unwrap();
        assert_ne!(session.current(), Some(&sample()));

        let restored = session.restore().unwrap().clone();
        assert_eq!(restored, sample());
        assert_eq!(session.original(), Some(&sample()));
    }

    #[test]
    fn test_failed_effect_leaves_current_untouched() {
        let mut session = Session::new();
        session.load_image(sample());
        session.pixelate(4).unwrap();
        let before = session.current().cloned();
        assert!(matches!(
            session.pixelate(0),
            Err(SessionError::Effect(EffectError::InvalidBlockSize(0)))
        ));
        assert_eq!(session.current().cloned(), before);
    }

    #[test]
    fn test_failed_load_keeps_previous_image() {
        let mut session = Session::new();
        session.load_image(sample());
        let err = session.load("/nonexistent/face.jpg").unwrap_err();
        assert!(matches!(err, SessionError::ImageLoad { .. }));
        assert_eq!(session.original(), Some(&sample()));
    }

    #[test]
    fn test_load_and_save_roundtrip_png() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.png");
        sample().save(&src).unwrap();

        let mut session = Session::new();
        session.load(&src).unwrap();
        assert_eq!(session.source_path(), Some(src.as_path()));
        assert_eq!(session.current(), Some(&sample()));

        let out = dir.path().join("out.PNG");
        session.save_current(&out).unwrap();
        assert!(out.exists());
    }

    #[test]
    fn test_save_rejects_unknown_extension() {
        let mut session = Session::new();
        session.load_image(sample());
        let err = session.save_current("/tmp/out.gif").unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedFileType(_)));
    }

    #[test]
    fn test_is_supported_image() {
        assert!(is_supported_image(Path::new("a/b.JPG")));
        assert!(is_supported_image(Path::new("x.jpeg")));
        assert!(is_supported_image(Path::new("x.Png")));
        assert!(!is_supported_image(Path::new("x.gif")));
        assert!(!is_supported_image(Path::new("noext")));
    }
}
