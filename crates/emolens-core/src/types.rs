use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name reported for label 0 and for labels missing from the gallery map.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Axis-aligned face rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip a floating-point box to `width × height`.
    ///
    /// Returns `None` when nothing with positive area remains.
    pub fn clamped(x: f32, y: f32, w: f32, h: f32, width: u32, height: u32) -> Option<Self> {
        if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) {
            return None;
        }
        let x0 = x.round().clamp(0.0, width as f32) as u32;
        let y0 = y.round().clamp(0.0, height as f32) as u32;
        let x1 = (x + w).round().clamp(0.0, width as f32) as u32;
        let y1 = (y + h).round().clamp(0.0, height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Whether the region lies inside a `width × height` image and is non-empty.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }

    /// Copy the region out of `image` into a new buffer.
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        image::imageops::crop_imm(image, self.x, self.y, self.width, self.height).to_image()
    }
}

/// The closed set of emotions the scorer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// All emotions, in classifier output order.
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }

    /// Case-insensitive lookup by classifier output name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-negative score per emotion. May be empty (fail-soft result).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionDistribution {
    scores: BTreeMap<Emotion, f32>,
}

impl EmotionDistribution {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from raw scores. Negative and non-finite scores become 0; a
    /// repeated emotion keeps its last score.
    pub fn from_scores<I>(scores: I) -> Self
    where
        I: IntoIterator<Item = (Emotion, f32)>,
    {
        let scores = scores
            .into_iter()
            .map(|(e, s)| (e, if s.is_finite() { s.max(0.0) } else { 0.0 }))
            .collect();
        Self { scores }
    }

    /// Rescale so scores sum to 100. A zero total is returned unchanged.
    pub fn normalized(&self) -> Self {
        let total = self.total();
        if total <= 0.0 {
            return self.clone();
        }
        Self {
            scores: self
                .scores
                .iter()
                .map(|(&e, &s)| (e, s / total * 100.0))
                .collect(),
        }
    }

    pub fn total(&self) -> f32 {
        self.scores.values().sum()
    }

    pub fn get(&self, emotion: Emotion) -> Option<f32> {
        self.scores.get(&emotion).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Highest-scoring emotion, if any.
    pub fn dominant(&self) -> Option<(Emotion, f32)> {
        self.scores
            .iter()
            .map(|(&e, &s)| (e, s))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        self.scores.iter().map(|(&e, &s)| (e, s))
    }
}

/// Identity estimate for a probe. Lower `distance` means a closer match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub label: u32,
    pub name: String,
    pub distance: f64,
}

impl Identity {
    /// True only for the reserved label 0, whatever the name.
    pub fn is_unknown(&self) -> bool {
        self.label == 0
    }
}

/// Everything one analysis request produces. Never cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub identity: Identity,
    pub emotions: EmotionDistribution,
    /// Faces located on the analysed image, largest first.
    pub faces: Vec<FaceRegion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_inside() {
        let r = FaceRegion::clamped(10.0, 20.0, 30.0, 40.0, 100, 100).unwrap();
        assert_eq!(r, FaceRegion::new(10, 20, 30, 40));
        assert!(r.fits_within(100, 100));
    }

    #[test]
    fn test_clamped_overhanging() {
        let r = FaceRegion::clamped(-5.0, 90.0, 20.0, 20.0, 100, 100).unwrap();
        assert_eq!(r, FaceRegion::new(0, 90, 15, 10));
        assert!(r.fits_within(100, 100));
    }

    #[test]
    fn test_clamped_outside_is_none() {
        assert!(FaceRegion::clamped(150.0, 10.0, 20.0, 20.0, 100, 100).is_none());
        assert!(FaceRegion::clamped(10.0, 10.0, 0.0, 20.0, 100, 100).is_none());
        assert!(FaceRegion::clamped(f32::NAN, 10.0, 5.0, 5.0, 100, 100).is_none());
    }

    #[test]
    fn test_crop_dimensions() {
        let img = RgbImage::new(50, 40);
        let face = FaceRegion::new(5, 5, 20, 10);
        let crop = face.crop(&img);
        assert_eq!(crop.dimensions(), (20, 10));
    }

    #[test]
    fn test_emotion_from_name_case_insensitive() {
        assert_eq!(Emotion::from_name("Happy"), Some(Emotion::Happy));
        assert_eq!(Emotion::from_name(" SURPRISE "), Some(Emotion::Surprise));
        assert_eq!(Emotion::from_name("contempt"), None);
    }

    #[test]
    fn test_normalized_sums_to_100() {
        let dist = EmotionDistribution::from_scores([
            (Emotion::Happy, 3.0),
            (Emotion::Sad, 1.0),
        ]);
        let norm = dist.normalized();
        assert!((norm.total() - 100.0).abs() < 1e-3);
        assert!((norm.get(Emotion::Happy).unwrap() - 75.0).abs() < 1e-3);
    }

    #[test]
    fn test_normalized_zero_total_unchanged() {
        let dist = EmotionDistribution::from_scores([(Emotion::Fear, 0.0)]);
        assert_eq!(dist.normalized(), dist);
    }

    #[test]
    fn test_negative_scores_floor_at_zero() {
        let dist = EmotionDistribution::from_scores([
            (Emotion::Angry, -2.0),
            (Emotion::Neutral, f32::INFINITY),
        ]);
        assert_eq!(dist.get(Emotion::Angry), Some(0.0));
        assert_eq!(dist.get(Emotion::Neutral), Some(0.0));
    }

    #[test]
    fn test_dominant() {
        let dist = EmotionDistribution::from_scores([
            (Emotion::Happy, 10.0),
            (Emotion::Neutral, 60.0),
            (Emotion::Sad, 30.0),
        ]);
        assert_eq!(dist.dominant().map(|(e, _)| e), Some(Emotion::Neutral));
        assert!(EmotionDistribution::empty().dominant().is_none());
    }

    #[test]
    fn test_identity_unknown() {
        let id = Identity { label: 0, name: UNKNOWN_IDENTITY.into(), distance: 1.0 };
        assert!(id.is_unknown());
        let id = Identity { label: 2, name: "bob".into(), distance: 1.0 };
        assert!(!id.is_unknown());
        let id = Identity { label: 3, name: UNKNOWN_IDENTITY.into(), distance: 0.5 };
        assert!(!id.is_unknown());
    }
}
