//! Emotion classifier backends.
//!
//! A classifier consumes an image file and reports raw per-emotion scores for
//! each face it finds (or assumes). The shipped backend runs a 48×48
//! grayscale facial-expression model through ONNX Runtime.

use crate::detector::DetectorError;
use crate::locator::FaceLocator;
use crate::types::{Emotion, FaceRegion};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const EMOTION_INPUT_SIZE: u32 = 48;
const EMOTION_SCALE: f32 = 255.0;
/// Output order of the expression model.
const EMOTION_LABELS: [Emotion; 7] = Emotion::ALL;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}; place the facial-expression ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("failed to load probe {path}: {reason}")]
    ImageLoad { path: String, reason: String },
    #[error("face could not be detected in the probe")]
    NoFaceDetected,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw scores keyed by emotion name, in the classifier's own units.
pub type RawEmotionScores = BTreeMap<String, f32>;

/// Options passed along with each classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyRequest {
    /// Fail with [`ClassifierError::NoFaceDetected`] instead of falling back
    /// to the whole image when no face is found.
    pub enforce_detection: bool,
}

/// File-based emotion classifier.
pub trait EmotionClassifier {
    /// Scores for every face in the image at `path`, first face first.
    fn classify(
        &mut self,
        path: &Path,
        request: &ClassifyRequest,
    ) -> Result<Vec<RawEmotionScores>, ClassifierError>;
}

/// Facial-expression classifier over ONNX Runtime.
///
/// Input: `[1, 1, 48, 48]` grayscale scaled to [0, 1]. Output: seven scores in
/// the order angry, disgust, fear, happy, sad, surprise, neutral.
pub struct OnnxEmotionClassifier {
    session: Session,
    locator: Option<FaceLocator>,
}

impl OnnxEmotionClassifier {
    /// Load the expression model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded emotion model"
        );

        Ok(Self { session, locator: None })
    }

    /// Crop faces found by `locator` before classifying.
    pub fn with_locator(mut self, locator: FaceLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    fn score_region(&mut self, gray: &GrayImage) -> Result<RawEmotionScores, ClassifierError> {
        let input = preprocess(gray);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("emotion scores: {e}")))?;

        if raw.len() != EMOTION_LABELS.len() {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {} emotion scores, got {}",
                EMOTION_LABELS.len(),
                raw.len()
            )));
        }

        Ok(EMOTION_LABELS
            .iter()
            .zip(to_probabilities(raw))
            .map(|(e, p)| (e.name().to_string(), p * 100.0))
            .collect())
    }
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn classify(
        &mut self,
        path: &Path,
        request: &ClassifyRequest,
    ) -> Result<Vec<RawEmotionScores>, ClassifierError> {
        let image: RgbImage = image::open(path)
            .map_err(|e| ClassifierError::ImageLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .to_rgb8();

        let faces: Vec<FaceRegion> = match self.locator.as_mut() {
            Some(locator) => locator.detect_faces(&image)?,
            None => Vec::new(),
        };

        if faces.is_empty() && request.enforce_detection {
            return Err(ClassifierError::NoFaceDetected);
        }

        let regions: Vec<GrayImage> = if faces.is_empty() {
            vec![image::imageops::grayscale(&image)]
        } else {
            faces
                .iter()
                .map(|f| image::imageops::grayscale(&f.crop(&image)))
                .collect()
        };

        tracing::debug!(path = %path.display(), faces = faces.len(), regions = regions.len(), "classifying emotions");

        regions.iter().map(|r| self.score_region(r)).collect()
    }
}

/// Resize to the model input and scale to [0, 1] as a NCHW tensor.
fn preprocess(gray: &GrayImage) -> Array4<f32> {
    let size = EMOTION_INPUT_SIZE;
    let resized = image::imageops::resize(gray, size, size, FilterType::Triangle);
    let n = size as usize;

    let mut tensor = Array4::<f32>::zeros((1, 1, n, n));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / EMOTION_SCALE;
    }
    tensor
}

/// Pass probabilities through; apply softmax to anything else (logits).
fn to_probabilities(raw: &[f32]) -> Vec<f32> {
    let sum: f32 = raw.iter().sum();
    let is_distribution = raw.iter().all(|&v| (0.0..=1.0).contains(&v)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return raw.to_vec();
    }

    let max = raw.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = raw.iter().map(|&v| (v - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / total).collect()
}
