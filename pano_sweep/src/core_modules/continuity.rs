// THEORY:
// A continuity test looks at two adjacent selected frames and decides whether
// they belong to the same camera sweep. The segmenter only ever sees the
// `ContinuityTest` trait; which concrete test runs is fixed once per run by
// the configuration.
//
// Both tests lean towards "continue": a cut is only declared on positive
// evidence (a large histogram shift, or a confidently estimated large
// translation). Missing evidence never splits a sweep.

use crate::core_modules::features::{PairAlignParams, PairAligner};
use crate::core_modules::frame::Frame;
use crate::core_modules::image_ops;
use crate::pipeline::{ContinuityMethod, PipelineConfig};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityVerdict {
    /// The frame extends the current segment.
    Continue,
    /// The frame starts a new segment.
    Cut,
}

pub trait ContinuityTest: Send + Sync {
    fn compare(&self, previous: &Frame, current: &Frame) -> ContinuityVerdict;
}

/// Builds the continuity test selected by `config.continuity`.
pub fn from_config(config: &PipelineConfig) -> Box<dyn ContinuityTest> {
    match config.continuity {
        ContinuityMethod::Histogram => Box::new(HistogramContinuity::new(config.segment_hist_diff)),
        ContinuityMethod::Homography => Box::new(HomographyContinuity::new(
            config.segment_homography_threshold,
            config.pair_align_params(),
        )),
    }
}

/// Cuts when the Bhattacharyya distance between 64-bin grayscale histograms
/// exceeds the threshold.
pub struct HistogramContinuity {
    threshold: f64,
}

impl HistogramContinuity {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn distance(previous: &Frame, current: &Frame) -> f64 {
        let a = image_ops::normalized_histogram(previous.gray());
        let b = image_ops::normalized_histogram(current.gray());
        image_ops::bhattacharyya_distance(&a, &b)
    }
}

impl ContinuityTest for HistogramContinuity {
    fn compare(&self, previous: &Frame, current: &Frame) -> ContinuityVerdict {
        let distance = Self::distance(previous, current);
        let verdict = if distance > self.threshold {
            ContinuityVerdict::Cut
        } else {
            ContinuityVerdict::Continue
        };
        debug!(
            previous = previous.index,
            current = current.index,
            distance,
            ?verdict,
            "histogram continuity"
        );
        verdict
    }
}

/// Cuts when the translation of the estimated inter-frame homography exceeds
/// `threshold * max(width, height)`.
pub struct HomographyContinuity {
    threshold: f64,
    aligner: PairAligner,
}

impl HomographyContinuity {
    pub fn new(threshold: f64, params: PairAlignParams) -> Self {
        Self {
            threshold,
            aligner: PairAligner::new(params),
        }
    }
}

impl ContinuityTest for HomographyContinuity {
    fn compare(&self, previous: &Frame, current: &Frame) -> ContinuityVerdict {
        let alignment = self.aligner.align(previous.gray(), current.gray());
        let Some(estimate) = alignment.homography() else {
            debug!(
                previous = previous.index,
                current = current.index,
                ?alignment,
                "insufficient evidence for a cut"
            );
            return ContinuityVerdict::Continue;
        };

        let max_dim = previous.width().max(previous.height()) as f64;
        let limit = self.threshold * max_dim;
        let translation = estimate.translation_norm();
        let verdict = if translation > limit {
            ContinuityVerdict::Cut
        } else {
            ContinuityVerdict::Continue
        };
        debug!(
            previous = previous.index,
            current = current.index,
            translation,
            limit,
            inliers = estimate.num_inliers,
            ?verdict,
            "homography continuity"
        );
        verdict
    }
}
