// THEORY:
// The `pipeline` module is the top-level API of the panorama engine. It wires
// the stages together in the only order that makes sense:
//
//   FrameSource -> FrameSelector -> Segmenter -> AlignmentCascade (per segment)
//
// and hands back one `PanoramaResult` per retained segment, in segment order.
//
// Everything tunable lives in `PipelineConfig`, which is validated once and
// then passed by reference to every stage. No stage reads global state, so two
// pipelines with different configurations can run side by side.
//
// Only whole-video conditions end a run early (`InsufficientFrames`,
// `NoSegmentsFound`, cancellation), plus a pushbroom canvas too large to
// allocate. Every other problem inside one segment's cascade is absorbed by
// the cascade itself and never reaches this level.

use crate::core_modules::cascade::global::{GlobalStitcher, NoGlobalStitcher};
use crate::core_modules::cascade::{AlignmentCascade, AttemptSummary, CascadeOutput, TierId};
use crate::core_modules::continuity;
use crate::core_modules::export::{self, ExportFormat};
use crate::core_modules::features::PairAlignParams;
use crate::core_modules::features::homography::RansacParams;
use crate::core_modules::frame::{FrameSequence, FrameSource};
use crate::core_modules::frame_selector::{FrameSelector, SELECTION_PROGRESS_SPAN};
use crate::core_modules::optical_flow::FlowParams;
use crate::core_modules::segmenter::{Segment, Segmenter};
use crate::error::{PipelineError, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Progress reported once segmentation is done; the cascades share the rest.
pub const SEGMENTED_PROGRESS: u8 = 40;

/// Which test decides whether adjacent frames belong to the same sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinuityMethod {
    /// Bhattacharyya distance between grayscale histograms.
    #[default]
    Histogram,
    /// Translation of the ORB + RANSAC homography between the frames.
    Homography,
}

/// What the cascade does with a tier that produced an image without doing
/// any real alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegeneratePolicy {
    /// Drop the image and try the next tier.
    #[default]
    FallThrough,
    /// Keep the image and flag the result as degenerate.
    Accept,
}

/// Configuration for the panorama pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Keep every `frame_interval`-th decoded frame, starting with frame 0.
    pub frame_interval: u64,
    /// Minimum Laplacian variance for a sampled frame; `None` disables the gate.
    pub sharpness_threshold: Option<f64>,
    pub continuity: ContinuityMethod,
    /// Histogram test: cut when the Bhattacharyya distance exceeds this.
    pub segment_hist_diff: f64,
    /// Homography test: cut when the translation exceeds this fraction of the
    /// larger frame dimension.
    pub segment_homography_threshold: f64,
    /// Runs shorter than this are dropped, never merged.
    pub min_segment_frames: usize,
    /// Tier C skips frames whose mean flow magnitude (pixels) exceeds this.
    pub flow_mag_threshold: f64,
    /// Tier D strip thickness in rows.
    pub strip_height: u32,
    /// RANSAC inlier threshold in pixels.
    pub ransac_reproj_threshold: f64,
    pub min_keypoints: usize,
    pub min_matches: usize,
    /// Keypoint budget per image for ORB.
    pub orb_features: usize,
    pub flow: FlowParams,
    pub degenerate_policy: DegeneratePolicy,
    /// Cascade workers for the parallel pipeline; `None` uses one per core.
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_interval: 30,
            sharpness_threshold: None,
            continuity: ContinuityMethod::Histogram,
            segment_hist_diff: 0.15,
            segment_homography_threshold: 0.15,
            min_segment_frames: 2,
            flow_mag_threshold: 8.0,
            strip_height: 10,
            ransac_reproj_threshold: 5.0,
            min_keypoints: 10,
            min_matches: 10,
            orb_features: 500,
            flow: FlowParams::default(),
            degenerate_policy: DegeneratePolicy::FallThrough,
            worker_threads: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.frame_interval == 0 {
            return invalid("frame_interval must be at least 1".into());
        }
        if self.min_segment_frames == 0 {
            return invalid("min_segment_frames must be at least 1".into());
        }
        if self.strip_height == 0 {
            return invalid("strip_height must be at least 1".into());
        }
        if self.orb_features == 0 {
            return invalid("orb_features must be at least 1".into());
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be at least 1".into());
        }
        if let Some(t) = self.sharpness_threshold.filter(|t| !(t.is_finite() && *t >= 0.0)) {
            return invalid(format!("sharpness_threshold must be a non-negative number, got {t}"));
        }
        let thresholds = [
            ("segment_hist_diff", self.segment_hist_diff),
            ("segment_homography_threshold", self.segment_homography_threshold),
            ("flow_mag_threshold", self.flow_mag_threshold),
            ("ransac_reproj_threshold", self.ransac_reproj_threshold),
        ];
        for (name, value) in thresholds {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        self.flow.validate().map_err(PipelineError::InvalidConfig)
    }

    /// Evidence thresholds shared by the homography continuity test and Tier B.
    pub fn pair_align_params(&self) -> PairAlignParams {
        PairAlignParams {
            max_features: self.orb_features,
            min_keypoints: self.min_keypoints,
            min_matches: self.min_matches,
            ransac: RansacParams {
                threshold: self.ransac_reproj_threshold,
                ..RansacParams::default()
            },
        }
    }
}

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when either it or `self` is. Cancelling the
    /// child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// Receives coarse progress milestones. Purely informational.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, stage: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn report(&self, percent: u8, stage: &str) {
        self(percent, stage)
    }
}

/// Discards progress reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8, _stage: &str) {}
}

/// Progress after `done` of `total` segments have been stitched.
pub(crate) fn segment_progress(done: usize, total: usize) -> u8 {
    let span = (100 - SEGMENTED_PROGRESS) as usize;
    let share = if total == 0 { span } else { span * done / total };
    SEGMENTED_PROGRESS + share as u8
}

/// The panorama of one segment.
#[derive(Debug, Clone)]
pub struct PanoramaResult {
    pub segment_index: usize,
    pub tier: TierId,
    pub image: RgbImage,
    /// Set when the image came from a degenerate tier result that was accepted.
    pub degenerate: bool,
    /// Decode-order indices of the frames the segment was built from.
    pub frame_indices: Vec<u64>,
    /// Every tier tried for this segment, in order, including the accepted one.
    pub attempts: Vec<AttemptSummary>,
}

impl PanoramaResult {
    pub(crate) fn new(segment_index: usize, frame_indices: Vec<u64>, output: CascadeOutput) -> Self {
        Self {
            segment_index,
            tier: output.tier,
            image: output.image,
            degenerate: output.degenerate,
            frame_indices,
            attempts: output.attempts,
        }
    }

    pub fn encode(&self, format: ExportFormat) -> Result<Vec<u8>> {
        export::encode(&self.image, format)
    }

    /// `panorama_<segment>_<tier>.<ext>`
    pub fn file_name(&self, format: ExportFormat) -> String {
        format!(
            "panorama_{:03}_{}.{}",
            self.segment_index,
            self.tier.label().to_lowercase(),
            format.extension()
        )
    }

    /// Writes the panorama into `dir` and returns the file's path.
    pub fn save(&self, dir: &Path, format: ExportFormat) -> Result<PathBuf> {
        let path = dir.join(self.file_name(format));
        export::save(&self.image, format, &path)?;
        Ok(path)
    }
}

/// The sequential panorama pipeline.
pub struct PanoramaPipeline {
    config: PipelineConfig,
    cascade: Arc<AlignmentCascade>,
}

impl PanoramaPipeline {
    /// A pipeline without a global stitcher; Tier A always falls through.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_global_stitcher(config, Arc::new(NoGlobalStitcher))
    }

    pub fn with_global_stitcher(config: PipelineConfig, stitcher: Arc<dyn GlobalStitcher>) -> Result<Self> {
        config.validate()?;
        let cascade = AlignmentCascade::from_config(&config, stitcher)?;
        Ok(Self {
            config,
            cascade: Arc::new(cascade),
        })
    }

    /// Uses a caller-assembled cascade instead of the standard one.
    pub fn with_cascade(config: PipelineConfig, cascade: AlignmentCascade) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cascade: Arc::new(cascade),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cascade(&self) -> Arc<AlignmentCascade> {
        Arc::clone(&self.cascade)
    }

    /// Stage 1: decode, sample and sharpness-gate frames.
    pub fn select_frames<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FrameSequence> {
        progress.report(0, "selecting frames");
        let frames = FrameSelector::new(&self.config).select(source, progress, cancel)?;
        progress.report(SELECTION_PROGRESS_SPAN, "frames selected");
        Ok(frames)
    }

    /// Stage 2: split the selected frames into sweeps.
    pub fn segment_frames(
        &self,
        frames: FrameSequence,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<Segment>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let selected = frames.len();
        let test = continuity::from_config(&self.config);
        let segments = Segmenter::new(test.as_ref(), self.config.min_segment_frames).segment(frames);
        if segments.is_empty() {
            return Err(PipelineError::NoSegmentsFound { frames: selected });
        }
        progress.report(SEGMENTED_PROGRESS, "segmented");
        Ok(segments)
    }

    /// Runs the whole pipeline and returns one panorama per segment, in order.
    pub fn run<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<PanoramaResult>> {
        let frames = self.select_frames(source, progress, cancel)?;
        let segments = self.segment_frames(frames, progress, cancel)?;

        let total = segments.len();
        let mut results = Vec::with_capacity(total);
        for segment in segments {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let output = self.cascade.run(&segment, cancel)?;
            results.push(PanoramaResult::new(segment.index, segment.frame_indices(), output));
            // The segment's frames are released here, before the next cascade.
            drop(segment);
            progress.report(
                segment_progress(results.len(), total),
                &format!("segment {}/{} stitched", results.len(), total),
            );
        }

        info!(panoramas = results.len(), "pipeline complete");
        progress.report(100, "complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let bad = [
            PipelineConfig {
                frame_interval: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                min_segment_frames: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                strip_height: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                segment_hist_diff: f64::NAN,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                worker_threads: Some(0),
                ..PipelineConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
        }
    }

    #[test]
    fn pair_params_follow_config() {
        let config = PipelineConfig {
            ransac_reproj_threshold: 3.0,
            min_matches: 25,
            ..PipelineConfig::default()
        };
        let params = config.pair_align_params();
        assert_eq!(params.ransac.threshold, 3.0);
        assert_eq!(params.min_matches, 25);
        assert_eq!(params.max_features, 500);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn child_token_follows_parent_but_not_back() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();
        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!parent.is_cancelled());

        let sibling = parent.child();
        assert!(!sibling.is_cancelled());
        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn segment_progress_spans_forty_to_hundred() {
        assert_eq!(segment_progress(0, 4), 40);
        assert_eq!(segment_progress(2, 4), 70);
        assert_eq!(segment_progress(4, 4), 100);
    }

    #[test]
    fn file_name_encodes_segment_and_tier() {
        let result = PanoramaResult {
            segment_index: 3,
            tier: TierId::C,
            image: RgbImage::new(1, 1),
            degenerate: false,
            frame_indices: vec![0, 30],
            attempts: Vec::new(),
        };
        assert_eq!(result.file_name(ExportFormat::Png), "panorama_003_c.png");
        assert_eq!(result.file_name(ExportFormat::jpeg()), "panorama_003_c.jpg");
    }
}
