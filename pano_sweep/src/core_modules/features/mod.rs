// THEORY:
// The feature layer answers a single question for the rest of the crate:
// "given two grayscale images, which homography takes the second onto the
// first, and how much evidence is there for it?" Both the homography-based
// continuity test and the pairwise homography chain ask exactly this, so the
// evidence rules (minimum keypoints, minimum cross-checked matches, RANSAC
// threshold) live here once instead of being repeated by each caller.

pub mod homography;
pub mod matcher;
pub mod orb;

use homography::{HomographyEstimate, RansacParams, estimate_homography};
use image::GrayImage;
use matcher::Matcher;
use orb::{Orb, OrbFeatures};

/// Evidence thresholds for pairwise alignment.
#[derive(Debug, Clone)]
pub struct PairAlignParams {
    pub max_features: usize,
    pub min_keypoints: usize,
    pub min_matches: usize,
    pub ransac: RansacParams,
}

impl Default for PairAlignParams {
    fn default() -> Self {
        Self {
            max_features: 500,
            min_keypoints: 10,
            min_matches: 10,
            ransac: RansacParams::default(),
        }
    }
}

/// Outcome of aligning a moving image onto a reference image.
#[derive(Debug, Clone)]
pub enum PairAlignment {
    TooFewKeypoints { reference: usize, moving: usize },
    TooFewMatches { matches: usize },
    EstimationFailed { matches: usize },
    Aligned(HomographyEstimate),
}

impl PairAlignment {
    pub fn homography(&self) -> Option<&HomographyEstimate> {
        match self {
            PairAlignment::Aligned(estimate) => Some(estimate),
            _ => None,
        }
    }
}

pub struct PairAligner {
    orb: Orb,
    matcher: Matcher,
    params: PairAlignParams,
}

impl PairAligner {
    pub fn new(params: PairAlignParams) -> Self {
        Self {
            orb: Orb::new().with_n_features(params.max_features),
            matcher: Matcher::new(),
            params,
        }
    }

    pub fn detect(&self, image: &GrayImage) -> OrbFeatures {
        self.orb.detect_and_compute(image)
    }

    /// Estimates the homography mapping `moving` coordinates into `reference`
    /// coordinates.
    pub fn align(&self, reference: &GrayImage, moving: &GrayImage) -> PairAlignment {
        let reference_features = self.detect(reference);
        let moving_features = self.detect(moving);
        self.align_features(&reference_features, &moving_features)
    }

    pub fn align_features(&self, reference: &OrbFeatures, moving: &OrbFeatures) -> PairAlignment {
        if reference.len() < self.params.min_keypoints || moving.len() < self.params.min_keypoints {
            return PairAlignment::TooFewKeypoints {
                reference: reference.len(),
                moving: moving.len(),
            };
        }

        let matches = self
            .matcher
            .match_descriptors(&moving.descriptors, &reference.descriptors);
        if matches.len() < self.params.min_matches {
            return PairAlignment::TooFewMatches {
                matches: matches.len(),
            };
        }

        let (src, dst): (Vec<(f64, f64)>, Vec<(f64, f64)>) = matches
            .iter()
            .map(|m| {
                let from = moving.keypoints[m.query_idx];
                let to = reference.keypoints[m.train_idx];
                ((from.x as f64, from.y as f64), (to.x as f64, to.y as f64))
            })
            .unzip();

        match estimate_homography(&src, &dst, &self.params.ransac) {
            Some(estimate) => PairAlignment::Aligned(estimate),
            None => PairAlignment::EstimationFailed {
                matches: matches.len(),
            },
        }
    }
}
