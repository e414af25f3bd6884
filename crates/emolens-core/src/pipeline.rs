//! Analysis orchestration: locate faces, match identity, score emotions.

use crate::detector::DetectorError;
use crate::locator::FaceLocator;
use crate::matcher::{IdentityMatcher, MatcherError};
use crate::scorer::{EmotionScorer, Probe, ScorerError};
use crate::session::ImageSource;
use crate::types::{AnalysisResult, EmotionDistribution, FaceRegion, Identity};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("no image loaded for analysis")]
    NoImageLoaded,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("matcher error: {0}")]
    Matcher(#[from] MatcherError),
    #[error("scorer error: {0}")]
    Scorer(#[from] ScorerError),
}

/// Which part of the current image is handed to the matcher. The scorer
/// always gets the largest located face, or the whole image without one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeRegion {
    #[default]
    WholeImage,
    /// Crop the largest located face; the whole image when none is found.
    LargestFace,
}

impl std::str::FromStr for ProbeRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "whole_image" | "whole" => Ok(ProbeRegion::WholeImage),
            "largest_face" | "face" => Ok(ProbeRegion::LargestFace),
            other => Err(format!("unknown probe region '{other}' (expected whole_image or largest_face)")),
        }
    }
}

impl ProbeRegion {
    fn select<'a>(&self, image: &'a RgbImage, faces: &[FaceRegion]) -> Cow<'a, RgbImage> {
        match (self, faces.first()) {
            (ProbeRegion::LargestFace, Some(face)) => Cow::Owned(face.crop(image)),
            _ => Cow::Borrowed(image),
        }
    }
}

pub struct Analyzer {
    locator: FaceLocator,
    matcher: IdentityMatcher,
    scorer: EmotionScorer,
    probe_region: ProbeRegion,
}

impl Analyzer {
    pub fn new(locator: FaceLocator, matcher: IdentityMatcher, scorer: EmotionScorer) -> Self {
        Self {
            locator,
            matcher,
            scorer,
            probe_region: ProbeRegion::default(),
        }
    }

    pub fn with_probe_region(mut self, probe_region: ProbeRegion) -> Self {
        self.probe_region = probe_region;
        self
    }

    pub fn probe_region(&self) -> ProbeRegion {
        self.probe_region
    }

    /// Full request: faces, identity and emotions for the current image.
    ///
    /// Faces are located once per call and shared by both probes. The
    /// gallery is retrained per call (unless the matcher caches it).
    pub fn analyze<S: ImageSource + ?Sized>(&mut self, source: &S) -> Result<AnalysisResult, AnalyzerError> {
        let image = source.current_image().ok_or(AnalyzerError::NoImageLoaded)?;
        let faces = self.locator.detect_faces(image)?;
        let probe = self.probe_region.select(image, &faces);

        self.matcher.train()?;
        let identity = self.matcher.predict(&probe)?;
        let face = ProbeRegion::LargestFace.select(image, &faces);
        let emotions = self.scorer.analyze(Probe::InMemory(&face))?;

        tracing::info!(
            faces = faces.len(),
            identity = %identity.name,
            distance = identity.distance,
            emotion = ?emotions.dominant().map(|(e, _)| e),
            "analysis complete"
        );

        Ok(AnalysisResult {
            identity,
            emotions,
            faces,
        })
    }

    pub fn locate<S: ImageSource + ?Sized>(&mut self, source: &S) -> Result<Vec<FaceRegion>, AnalyzerError> {
        self.locator
            .detect_in(source)?
            .ok_or(AnalyzerError::NoImageLoaded)
    }

    pub fn recognize<S: ImageSource + ?Sized>(&mut self, source: &S) -> Result<Identity, AnalyzerError> {
        let image = source.current_image().ok_or(AnalyzerError::NoImageLoaded)?;
        let faces = self.faces_for_probe(image)?;
        let probe = self.probe_region.select(image, &faces);

        self.matcher.train()?;
        Ok(self.matcher.predict(&probe)?)
    }

    pub fn score_emotions<S: ImageSource + ?Sized>(
        &mut self,
        source: &S,
    ) -> Result<EmotionDistribution, AnalyzerError> {
        let image = source.current_image().ok_or(AnalyzerError::NoImageLoaded)?;
        let faces = self.locator.detect_faces(image)?;
        let face = ProbeRegion::LargestFace.select(image, &faces);
        Ok(self.scorer.analyze(Probe::InMemory(&face))?)
    }

    /// Identity probes only need detection when cropped.
    fn faces_for_probe(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        match self.probe_region {
            ProbeRegion::WholeImage => Ok(Vec::new()),
            ProbeRegion::LargestFace => Ok(self.locator.detect_faces(image)?),
        }
    }
}
