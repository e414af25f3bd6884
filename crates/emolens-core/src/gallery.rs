//! Labeled face gallery on disk.
//!
//! Layout: `<root>/<person>/<sample>.{jpg,jpeg,png}`. Each immediate
//! subdirectory is one identity; deeper nesting is ignored. Identities are
//! sorted by folder name and labelled 1, 2, … so labels are reproducible;
//! label 0 stays reserved for "unknown".

use crate::detector::DetectorError;
use crate::locator::FaceLocator;
use crate::scorer::{EmotionScorer, Probe, ScorerError};
use crate::session::is_supported_image;
use crate::types::{EmotionDistribution, UNKNOWN_IDENTITY};
use image::imageops::FilterType;
use image::GrayImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Side length of faces written by [`clip_faces`].
pub const CLIP_SIZE: u32 = 200;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery is empty or missing: {0} (expected one subfolder of images per person)")]
    Empty(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("emotion scoring failed: {0}")]
    Scorer(#[from] ScorerError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> GalleryError + '_ {
    move |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Immediate subdirectories of `root`, sorted by name.
fn identity_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>, GalleryError> {
    if !root.is_dir() {
        return Err(GalleryError::Empty(root.to_path_buf()));
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).map_err(io_error(root))? {
        let entry = entry.map_err(io_error(root))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Supported image files directly inside `dir`, sorted by path.
fn sample_files(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() && is_supported_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// A label map plus grayscale training samples, built from one folder scan.
#[derive(Debug, Clone)]
pub struct Gallery {
    root: PathBuf,
    names: BTreeMap<u32, String>,
    images: Vec<GrayImage>,
    labels: Vec<u32>,
}

impl Gallery {
    /// Scan `root` and load every sample as grayscale.
    ///
    /// Unsupported extensions are skipped silently; files that fail to decode
    /// are skipped with a warning.
    pub fn build(root: impl AsRef<Path>) -> Result<Self, GalleryError> {
        Self::build_with_min_size(root, (1, 1))
    }

    /// Like [`build`](Self::build), also skipping (with a warning) samples
    /// narrower or shorter than `min_size`.
    pub fn build_with_min_size(root: impl AsRef<Path>, min_size: (u32, u32)) -> Result<Self, GalleryError> {
        let root = root.as_ref();
        let dirs = identity_dirs(root)?;

        let mut names = BTreeMap::new();
        let mut images = Vec::new();
        let mut labels = Vec::new();

        for (label, (name, dir)) in (1u32..).zip(dirs) {
            names.insert(label, name);
            for path in sample_files(&dir)? {
                let gray = match image::open(&path) {
                    Ok(img) => image::imageops::grayscale(&img.to_rgb8()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping undecodable gallery sample");
                        continue;
                    }
                };
                if gray.width() < min_size.0 || gray.height() < min_size.1 {
                    tracing::warn!(
                        path = %path.display(),
                        width = gray.width(),
                        height = gray.height(),
                        "skipping undersized gallery sample"
                    );
                    continue;
                }
                images.push(gray);
                labels.push(label);
            }
        }

        if images.is_empty() {
            return Err(GalleryError::Empty(root.to_path_buf()));
        }

        tracing::info!(
            root = %root.display(),
            identities = names.len(),
            samples = images.len(),
            "gallery built"
        );

        Ok(Self {
            root: root.to_path_buf(),
            names,
            images,
            labels,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Person name for `label`; label 0 and unmapped labels are "Unknown".
    pub fn name_of(&self, label: u32) -> &str {
        if label == 0 {
            return UNKNOWN_IDENTITY;
        }
        self.names
            .get(&label)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_IDENTITY)
    }

    /// Label → person name, in label order.
    pub fn identities(&self) -> &BTreeMap<u32, String> {
        &self.names
    }

    pub fn images(&self) -> &[GrayImage] {
        &self.images
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn sample_count(&self) -> usize {
        self.images.len()
    }
}

/// Snapshot of the gallery tree used to decide whether a trained model is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryFingerprint {
    entries: Vec<(PathBuf, Option<SystemTime>, u64)>,
}

impl GalleryFingerprint {
    /// Record every identity folder and sample with its mtime and size.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self, GalleryError> {
        let mut entries = Vec::new();
        for (_, dir) in identity_dirs(root.as_ref())? {
            let meta = std::fs::metadata(&dir).map_err(io_error(&dir))?;
            entries.push((dir.clone(), meta.modified().ok(), 0));
            for file in sample_files(&dir)? {
                let meta = std::fs::metadata(&file).map_err(io_error(&file))?;
                entries.push((file, meta.modified().ok(), meta.len()));
            }
        }
        Ok(Self { entries })
    }
}

/// Every supported image under `root`, recursively, sorted by path.
pub fn list_images(root: impl AsRef<Path>) -> Result<Vec<PathBuf>, GalleryError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(GalleryError::Empty(root.to_path_buf()));
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| GalleryError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();
    Ok(images)
}

/// One face written by [`clip_faces`].
#[derive(Debug, Clone, Serialize)]
pub struct ClippedFace {
    pub person: String,
    pub path: PathBuf,
    /// Present when a scorer was supplied.
    pub emotions: Option<EmotionDistribution>,
}

/// Detect faces in every gallery sample and write each as a `size × size`
/// JPEG named `clipped_face_<person>_<n>.jpg`, `n` counting per person.
///
/// With a `scorer`, every written face is also scored for emotions.
/// Samples that fail to decode are logged and skipped.
pub fn clip_faces(
    root: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    locator: &mut FaceLocator,
    size: u32,
    mut scorer: Option<&mut EmotionScorer>,
) -> Result<Vec<ClippedFace>, GalleryError> {
    let root = root.as_ref();
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir).map_err(io_error(out_dir))?;

    let mut written = Vec::new();
    for (person, dir) in identity_dirs(root)? {
        let mut n = 0usize;
        for path in sample_files(&dir)? {
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping undecodable sample");
                    continue;
                }
            };

            let faces = locator.detect_faces(&image)?;
            if faces.is_empty() {
                tracing::info!(path = %path.display(), "clip: no face found");
                continue;
            }

            for face in faces {
                let crop = face.crop(&image);
                let resized = image::imageops::resize(&crop, size, size, FilterType::Triangle);
                let out = out_dir.join(format!("clipped_face_{person}_{n}.jpg"));
                resized.save(&out).map_err(|e| GalleryError::Write {
                    path: out.clone(),
                    reason: e.to_string(),
                })?;
                n += 1;

                let emotions = match scorer.as_deref_mut() {
                    Some(scorer) => Some(scorer.analyze(Probe::FilePath(&out))?),
                    None => None,
                };
                tracing::info!(
                    person = %person,
                    path = %out.display(),
                    emotion = ?emotions.as_ref().and_then(|d| d.dominant()).map(|(e, _)| e),
                    "face clipped"
                );
                written.push(ClippedFace {
                    person: person.clone(),
                    path: out,
                    emotions,
                });
            }
        }
    }

    Ok(written)
}
