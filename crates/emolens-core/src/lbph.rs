//! Local Binary Patterns Histograms (LBPH) face recognizer.
//!
//! Each image is encoded with a circular LBP operator, split into a grid of
//! cells, and described by the concatenation of per-cell code histograms.
//! Prediction is nearest-neighbour over the training histograms using the
//! chi-square distance; lower distance means a closer match.

use image::GrayImage;
use std::f64::consts::PI;
use thiserror::Error;

const DEFAULT_RADIUS: u32 = 1;
const DEFAULT_NEIGHBORS: u32 = 8;
const DEFAULT_GRID: u32 = 8;
const MAX_NEIGHBORS: u32 = 16;
/// Samples within this of the centre pixel count as "not darker".
const LBP_EPSILON: f64 = f32::EPSILON as f64;

#[derive(Error, Debug, PartialEq)]
pub enum LbphError {
    #[error("model is not trained")]
    NotTrained,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("got {images} images but {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },
    #[error("image {width}x{height} is too small for radius {radius} and a {grid_x}x{grid_y} grid")]
    ImageTooSmall {
        width: u32,
        height: u32,
        radius: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// LBPH recognizer: operator parameters plus the trained templates.
#[derive(Debug, Clone)]
pub struct LbphRecognizer {
    radius: u32,
    neighbors: u32,
    grid_x: u32,
    grid_y: u32,
    /// Predictions farther than this answer label 0.
    threshold: f64,
    histograms: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

impl Default for LbphRecognizer {
    fn default() -> Self {
        Self {
            radius: DEFAULT_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
            threshold: f64::MAX,
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }
}

impl LbphRecognizer {
    pub fn new(
        radius: u32,
        neighbors: u32,
        grid_x: u32,
        grid_y: u32,
        threshold: f64,
    ) -> Result<Self, LbphError> {
        if radius == 0 {
            return Err(LbphError::InvalidParams("radius must be at least 1".into()));
        }
        if neighbors == 0 || neighbors > MAX_NEIGHBORS {
            return Err(LbphError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {neighbors}"
            )));
        }
        if grid_x == 0 || grid_y == 0 {
            return Err(LbphError::InvalidParams("grid must be at least 1x1".into()));
        }
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(LbphError::InvalidParams(format!(
                "threshold must be positive, got {threshold}"
            )));
        }
        Ok(Self {
            radius,
            neighbors,
            grid_x,
            grid_y,
            threshold,
            histograms: Vec::new(),
            labels: Vec::new(),
        })
    }

    pub fn is_trained(&self) -> bool {
        !self.histograms.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    /// Smallest image that yields at least one LBP code per grid cell.
    pub fn min_image_size(&self) -> (u32, u32) {
        let margin = 2 * self.radius;
        (margin + self.grid_x, margin + self.grid_y)
    }

    /// Replace the model with templates computed from `images`.
    pub fn fit(&mut self, images: &[GrayImage], labels: &[u32]) -> Result<(), LbphError> {
        if images.is_empty() {
            return Err(LbphError::EmptyTrainingSet);
        }
        if images.len() != labels.len() {
            return Err(LbphError::LabelCountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }

        let histograms = images
            .iter()
            .map(|img| self.describe(img))
            .collect::<Result<Vec<_>, _>>()?;

        self.histograms = histograms;
        self.labels = labels.to_vec();

        tracing::debug!(
            samples = self.histograms.len(),
            bins = self.histograms[0].len(),
            "LBPH model fitted"
        );
        Ok(())
    }

    /// Nearest training label and its chi-square distance.
    ///
    /// Answers label 0 when no template is closer than the threshold.
    pub fn predict(&self, image: &GrayImage) -> Result<(u32, f64), LbphError> {
        if !self.is_trained() {
            return Err(LbphError::NotTrained);
        }
        let query = self.describe(image)?;

        let mut best_dist = f64::MAX;
        let mut best_label = 0u32;
        for (hist, &label) in self.histograms.iter().zip(self.labels.iter()) {
            let dist = chi_square(hist, &query);
            if dist < best_dist && dist < self.threshold {
                best_dist = dist;
                best_label = label;
            }
        }

        Ok((best_label, best_dist))
    }

    /// Spatial LBP histogram of `image`.
    fn describe(&self, image: &GrayImage) -> Result<Vec<f32>, LbphError> {
        let too_small = || LbphError::ImageTooSmall {
            width: image.width(),
            height: image.height(),
            radius: self.radius,
            grid_x: self.grid_x,
            grid_y: self.grid_y,
        };

        let margin = 2 * self.radius;
        if image.width() <= margin || image.height() <= margin {
            return Err(too_small());
        }
        let lbp_w = (image.width() - margin) as usize;
        let lbp_h = (image.height() - margin) as usize;
        let cell_w = lbp_w / self.grid_x as usize;
        let cell_h = lbp_h / self.grid_y as usize;
        if cell_w == 0 || cell_h == 0 {
            return Err(too_small());
        }

        let codes = elbp(image, self.radius, self.neighbors);
        Ok(spatial_histogram(
            &codes,
            lbp_w,
            cell_w,
            cell_h,
            self.grid_x as usize,
            self.grid_y as usize,
            1usize << self.neighbors,
        ))
    }
}

/// Extended (circular) LBP with bilinear sampling.
///
/// Output is `(width - 2r) × (height - 2r)` codes, row-major.
fn elbp(image: &GrayImage, radius: u32, neighbors: u32) -> Vec<u32> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let r = radius as usize;
    let out_w = width - 2 * r;
    let out_h = height - 2 * r;
    let src = image.as_raw();
    let at = |row: usize, col: usize| src[row * width + col] as f64;

    let mut codes = vec![0u32; out_w * out_h];

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let x = radius as f64 * angle.cos();
        let y = -(radius as f64) * angle.sin();

        let fx = x.floor();
        let fy = y.floor();
        let cx = x.ceil();
        let cy = y.ceil();
        let tx = x - fx;
        let ty = y - fy;

        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        // Offsets relative to the centre, shifted by r so they stay unsigned.
        let (fx, fy, cx, cy) = (
            (fx as i64 + r as i64) as usize,
            (fy as i64 + r as i64) as usize,
            (cx as i64 + r as i64) as usize,
            (cy as i64 + r as i64) as usize,
        );

        for i in 0..out_h {
            for j in 0..out_w {
                let t = w1 * at(i + fy, j + fx)
                    + w2 * at(i + fy, j + cx)
                    + w3 * at(i + cy, j + fx)
                    + w4 * at(i + cy, j + cx);
                let centre = at(i + r, j + r);
                if t > centre || (t - centre).abs() < LBP_EPSILON {
                    codes[i * out_w + j] |= 1 << n;
                }
            }
        }
    }

    codes
}

/// Concatenated per-cell histograms, each normalised by the cell's pixel count.
/// Pixels beyond the last whole cell are ignored.
fn spatial_histogram(
    codes: &[u32],
    codes_width: usize,
    cell_w: usize,
    cell_h: usize,
    grid_x: usize,
    grid_y: usize,
    bins: usize,
) -> Vec<f32> {
    let mut hist = vec![0.0f32; grid_x * grid_y * bins];
    let cell_pixels = (cell_w * cell_h) as f32;

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let base = (gy * grid_x + gx) * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    hist[base + codes[y * codes_width + x] as usize] += 1.0;
                }
            }
            for bin in &mut hist[base..base + bins] {
                *bin /= cell_pixels;
            }
        }
    }

    hist
}

/// Symmetric chi-square distance: Σ 2(a − b)² / (a + b).
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let sum = x + y;
            if sum.abs() > f64::EPSILON {
                2.0 * (x - y).powi(2) / sum
            } else {
                0.0
            }
        })
        .sum()
}
