//! Face detector backends.
//!
//! A backend turns a grayscale raster into raw, un-suppressed face proposals.
//! Grouping, size filtering and clamping happen in [`crate::locator`]. The
//! shipped backend runs the SCRFD model through ONNX Runtime, once per level
//! of an image pyramid.

use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Square model input side in pixels.
const INPUT_SIDE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 1.0 / 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const FEATURE_STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_LOCATION: usize = 2;
/// Levels past the first run only while the scaled short side keeps this
/// many input pixels.
const MIN_LEVEL_SIDE: f32 = 64.0;
const MAX_LEVELS: usize = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model missing at {0}; fetch det_10g.onnx (insightface) into the model directory")]
    ModelNotFound(String),
    #[error("detector inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
    #[error("onnx runtime: {0}")]
    Ort(#[from] ort::Error),
}

/// A raw detection before grouping, in source-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Source of raw face proposals on a grayscale image.
///
/// `scale_factor` (> 1.0) is the ratio between consecutive pyramid levels.
/// Implementations return every proposal they find; an image without faces
/// yields an empty vector.
pub trait FaceDetectorBackend {
    fn proposals(&mut self, gray: &GrayImage, scale_factor: f32) -> Result<Vec<Proposal>, DetectorError>;
}

/// Where each stride's score and box tensors sit among the model outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    scores: [usize; 3],
    boxes: [usize; 3],
}

impl OutputLayout {
    /// Exports without named outputs list the three score tensors, then the
    /// three box tensors, by ascending stride.
    const POSITIONAL: Self = Self {
        scores: [0, 1, 2],
        boxes: [3, 4, 5],
    };

    /// Resolve `score_<stride>` / `bbox_<stride>` output names.
    fn from_names(names: &[String]) -> Self {
        let index_of = |kind: &str, stride: u32| {
            let wanted = format!("{kind}_{stride}");
            names.iter().position(|n| *n == wanted)
        };

        let mut layout = Self::POSITIONAL;
        for (level, &stride) in FEATURE_STRIDES.iter().enumerate() {
            match (index_of("score", stride), index_of("bbox", stride)) {
                (Some(score), Some(bbox)) => {
                    layout.scores[level] = score;
                    layout.boxes[level] = bbox;
                }
                _ => {
                    tracing::debug!(?names, "SCRFD outputs unnamed; assuming positional layout");
                    return Self::POSITIONAL;
                }
            }
        }
        layout
    }
}

/// Placement of the scaled image, centred inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(src_width: u32, src_height: u32, scale: f32) -> Self {
        let side = |len: u32| ((len as f32 * scale).round() as u32).clamp(1, INPUT_SIDE);
        let (width, height) = (side(src_width), side(src_height));
        Self {
            scale,
            offset_x: (INPUT_SIDE - width) / 2,
            offset_y: (INPUT_SIDE - height) / 2,
            width,
            height,
        }
    }

    /// Map a point in model-input space back to source pixels.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// SCRFD face detector (insightface `det_10g`).
pub struct ScrfdDetector {
    session: Session,
    layout: OutputLayout,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 2 * FEATURE_STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "expected score and bbox outputs for {} strides, model has {} outputs",
                FEATURE_STRIDES.len(),
                names.len()
            )));
        }
        let layout = OutputLayout::from_names(&names);

        tracing::info!(path = model_path, outputs = names.len(), ?layout, "loaded SCRFD model");
        Ok(Self { session, layout })
    }

    fn run_level(&mut self, gray: &GrayImage, scale: f32) -> Result<Vec<Proposal>, DetectorError> {
        let letterbox = Letterbox::fit(gray.width(), gray.height(), scale);
        let input = input_tensor(gray, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (level, &stride) in FEATURE_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[self.layout.scores[level]]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("stride {stride} scores: {e}")))?;
            let (_, boxes) = outputs[self.layout.boxes[level]]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("stride {stride} boxes: {e}")))?;

            found.extend(decode_stride(scores, boxes, stride, &letterbox, SCORE_THRESHOLD));
        }
        Ok(found)
    }
}

impl FaceDetectorBackend for ScrfdDetector {
    fn proposals(&mut self, gray: &GrayImage, scale_factor: f32) -> Result<Vec<Proposal>, DetectorError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }

        let scales = pyramid_scales(gray.width(), gray.height(), scale_factor);
        let mut proposals = Vec::new();
        for &scale in &scales {
            proposals.extend(self.run_level(gray, scale)?);
        }

        tracing::debug!(levels = scales.len(), proposals = proposals.len(), "SCRFD proposals");
        Ok(proposals)
    }
}

/// Letterbox scale per pyramid level. Level 0 fits the whole image into the
/// model input; each further level shrinks by `scale_factor`.
fn pyramid_scales(width: u32, height: u32, scale_factor: f32) -> Vec<f32> {
    let side = INPUT_SIDE as f32;
    let base = (side / width as f32).min(side / height as f32);
    let short_side = width.min(height) as f32;

    let mut scales = vec![base];
    if !scale_factor.is_finite() || scale_factor <= 1.0 {
        return scales;
    }
    while scales.len() < MAX_LEVELS {
        let next = scales[scales.len() - 1] / scale_factor;
        if short_side * next < MIN_LEVEL_SIDE {
            break;
        }
        scales.push(next);
    }
    scales
}

/// Grey replicated over three channels, normalized, padding left at zero
/// (the normalized mean).
fn input_tensor(gray: &GrayImage, letterbox: &Letterbox) -> Array4<f32> {
    let scaled = image::imageops::resize(gray, letterbox.width, letterbox.height, FilterType::Triangle);
    let side = INPUT_SIDE as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in scaled.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) * PIXEL_SCALE;
        let row = (y + letterbox.offset_y) as usize;
        let col = (x + letterbox.offset_x) as usize;
        for channel in 0..3 {
            tensor[[0, channel, row, col]] = value;
        }
    }
    tensor
}

/// Anchor-free decoding of one stride. Each grid location carries
/// [`ANCHORS_PER_LOCATION`] anchors; a box is four distances, in strides,
/// from the location to the left, top, right and bottom edges.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Proposal> {
    let cols = (INPUT_SIDE / stride) as usize;
    let anchors = cols * cols * ANCHORS_PER_LOCATION;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(i, &score)| {
            let d = boxes.get(i * 4..i * 4 + 4)?;
            let location = i / ANCHORS_PER_LOCATION;
            let cx = (location % cols) as f32 * step;
            let cy = (location / cols) as f32 * step;

            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);
            Some(Proposal {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pyramid_single_level_without_scaling() {
        let scales = pyramid_scales(320, 240, 1.0);
        assert_eq!(scales, vec![2.0]);
    }

    #[test]
    fn test_pyramid_levels_shrink_by_factor() {
        let scales = pyramid_scales(640, 640, 1.25);
        assert_eq!(scales.len(), MAX_LEVELS);
        for pair in scales.windows(2) {
            assert!((pair[0] / pair[1] - 1.25).abs() < 1e-4);
        }
    }

    #[test]
    fn test_pyramid_stops_at_min_side() {
        // 640 → 160 input pixels, then 40 is below the minimum.
        let scales = pyramid_scales(128, 128, 4.0);
        assert_eq!(scales, vec![5.0, 1.25]);
    }

    #[test]
    fn test_layout_from_named_outputs() {
        let layout = OutputLayout::from_names(&names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32",
        ]));
        assert_eq!(layout, OutputLayout::POSITIONAL);

        let layout = OutputLayout::from_names(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]));
        assert_eq!(layout.scores, [2, 5, 8]);
        assert_eq!(layout.boxes, [0, 3, 6]);
    }

    #[test]
    fn test_layout_positional_fallback() {
        let numeric: Vec<String> = (0..9).map(|i| format!("{}", 440 + i)).collect();
        assert_eq!(OutputLayout::from_names(&numeric), OutputLayout::POSITIONAL);
    }

    #[test]
    fn test_letterbox_centres_image() {
        let lb = Letterbox::fit(320, 160, 2.0);
        assert_eq!((lb.width, lb.height), (640, 320));
        assert_eq!((lb.offset_x, lb.offset_y), (0, 160));
        assert_eq!(lb.to_source(64.0, 160.0), (32.0, 0.0));
    }

    #[test]
    fn test_input_tensor_pads_with_mean() {
        let gray = GrayImage::from_pixel(64, 32, Luma([255]));
        let lb = Letterbox::fit(64, 32, 10.0);
        let tensor = input_tensor(&gray, &lb);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 1, 0, 0]], 0.0);
        let inside = tensor[[0, 2, 320, 320]];
        assert!((inside - (255.0 - PIXEL_MEAN) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_maps_back_through_letterbox() {
        // One anchor at grid location (1, 1) of stride 32 with half-stride edges.
        let stride = 32;
        let cols = (INPUT_SIDE / stride) as usize;
        let mut scores = vec![0.0f32; cols * cols * ANCHORS_PER_LOCATION];
        let mut boxes = vec![0.0f32; scores.len() * 4];
        let idx = (cols + 1) * ANCHORS_PER_LOCATION;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);

        let lb = Letterbox { scale: 2.0, offset_x: 0, offset_y: 8, width: 640, height: 624 };
        let props = decode_stride(&scores, &boxes, stride, &lb, SCORE_THRESHOLD);

        assert_eq!(props.len(), 1);
        let p = props[0];
        // Input-space box (16, 16)-(48, 48), minus offset, over scale.
        assert!((p.x - 8.0).abs() < 1e-4);
        assert!((p.y - 4.0).abs() < 1e-4);
        assert!((p.width - 16.0).abs() < 1e-4);
        assert!((p.height - 16.0).abs() < 1e-4);
        assert!((p.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_below_threshold() {
        let scores = vec![0.3f32; 8];
        let boxes = vec![1.0f32; 32];
        let lb = Letterbox::fit(640, 640, 1.0);
        assert!(decode_stride(&scores, &boxes, 32, &lb, SCORE_THRESHOLD).is_empty());
    }

    #[test]
    fn test_load_missing_model() {
        let result = ScrfdDetector::load("/nonexistent/det_10g.onnx");
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }
}
