//! Face localisation over a detector backend.
//!
//! Converts the probe to grayscale, collects backend proposals across the
//! pyramid, then filters by minimum size and merges overlapping proposals
//! into confirmed regions (a region needs more than `min_neighbors` raw hits).

use crate::detector::{DetectorError, FaceDetectorBackend, Proposal};
use crate::session::ImageSource;
use crate::types::FaceRegion;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Relative tolerance used when deciding two proposals describe the same face.
const GROUP_EPS: f32 = 0.2;

/// Detector tuning: pyramid step, confirmation count and minimum face size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Ratio between consecutive pyramid levels (≥ 1.0).
    pub scale_factor: f32,
    /// Proposals a group needs beyond the first to be confirmed. 0 disables grouping.
    pub min_neighbors: u32,
    /// Minimum face size in pixels (width, height).
    pub min_size: (u32, u32),
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: (30, 30),
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !self.scale_factor.is_finite() || self.scale_factor < 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be >= 1.0, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Configurable frontal-face locator.
pub struct FaceLocator {
    backend: Box<dyn FaceDetectorBackend>,
    params: DetectionParams,
}

impl FaceLocator {
    pub fn new(backend: Box<dyn FaceDetectorBackend>, params: DetectionParams) -> Self {
        Self { backend, params }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Locate faces in `image`, largest first. No face is an empty vector.
    pub fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        self.params.validate()?;

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let gray = image::imageops::grayscale(image);
        let proposals = self.backend.proposals(&gray, self.params.scale_factor)?;
        let raw = proposals.len();

        let (min_w, min_h) = self.params.min_size;
        let sized: Vec<Proposal> = proposals
            .into_iter()
            .filter(|p| p.width >= min_w as f32 && p.height >= min_h as f32)
            .collect();

        let grouped = group_proposals(&sized, self.params.min_neighbors, GROUP_EPS);

        let mut faces: Vec<FaceRegion> = grouped
            .iter()
            .filter_map(|p| FaceRegion::clamped(p.x, p.y, p.width, p.height, width, height))
            .collect();
        faces.sort_by(|a, b| b.area().cmp(&a.area()));

        tracing::debug!(raw, sized = sized.len(), faces = faces.len(), "located faces");
        Ok(faces)
    }

    /// Locate faces in the source's current image.
    pub fn detect_in<S: ImageSource + ?Sized>(
        &mut self,
        source: &S,
    ) -> Result<Option<Vec<FaceRegion>>, DetectorError> {
        match source.current_image() {
            Some(image) => self.detect_faces(image).map(Some),
            None => Ok(None),
        }
    }
}

/// Whether two proposals are close enough to describe the same face.
fn similar(a: &Proposal, b: &Proposal, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    (a.x - b.x).abs() <= delta
        && (a.y - b.y).abs() <= delta
        && (a.x + a.width - b.x - b.width).abs() <= delta
        && (a.y + a.height - b.y - b.height).abs() <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge overlapping proposals and keep groups with more than `min_neighbors`
/// members. With `min_neighbors == 0` proposals pass through unmerged.
///
/// Each kept group is the average of its members. Groups lying inside a
/// clearly stronger group are dropped.
pub fn group_proposals(proposals: &[Proposal], min_neighbors: u32, eps: f32) -> Vec<Proposal> {
    if min_neighbors == 0 || proposals.is_empty() {
        return proposals.to_vec();
    }

    let n = proposals.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&proposals[i], &proposals[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // root -> (sum box, max confidence, count)
    let mut sums: Vec<([f32; 4], f32, u32)> = vec![([0.0; 4], 0.0, 0); n];
    for i in 0..n {
        let root = find_root(&mut parent, i);
        let p = &proposals[i];
        let entry = &mut sums[root];
        entry.0[0] += p.x;
        entry.0[1] += p.y;
        entry.0[2] += p.width;
        entry.0[3] += p.height;
        entry.1 = entry.1.max(p.confidence);
        entry.2 += 1;
    }

    let groups: Vec<(Proposal, u32)> = sums
        .into_iter()
        .filter(|(_, _, count)| *count > min_neighbors)
        .map(|(sum, confidence, count)| {
            let c = count as f32;
            (
                Proposal {
                    x: sum[0] / c,
                    y: sum[1] / c,
                    width: sum[2] / c,
                    height: sum[3] / c,
                    confidence,
                },
                count,
            )
        })
        .collect();

    groups
        .iter()
        .enumerate()
        .filter(|(i, (inner, inner_count))| {
            !groups.iter().enumerate().any(|(j, (outer, outer_count))| {
                if *i == j || *outer_count <= (*inner_count).max(3) {
                    return false;
                }
                let dx = (outer.width * eps).round();
                let dy = (outer.height * eps).round();
                inner.x >= outer.x - dx
                    && inner.y >= outer.y - dy
                    && inner.x + inner.width <= outer.x + outer.width + dx
                    && inner.y + inner.height <= outer.y + outer.height + dy
            })
        })
        .map(|(_, (p, _))| *p)
        .collect()
}
