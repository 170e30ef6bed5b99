// THEORY:
// Tier B grows a mosaic on the canvas of the segment's first frame. Every
// later frame is aligned against the current mosaic (not against its
// predecessor), warped into the mosaic's coordinates and pasted over it
// wherever the warp produced content. The canvas never grows, so whatever
// falls outside frame 0's footprint is lost; that is the price of a tier that
// needs no global optimisation.
//
// A frame without enough evidence for a homography is skipped and the mosaic
// is left as it was. If that happens to every frame the result is just frame 0
// again, which is reported as degenerate rather than as a panorama. The same
// holds when every accepted homography is the identity: a static camera gives
// clean matches, but pasting a frame onto itself covers no new ground.

use super::{StitchAttemptResult, StitchStrategy, TierId};
use crate::core_modules::features::homography::max_corner_displacement;
use crate::core_modules::features::{PairAlignParams, PairAligner, PairAlignment};
use crate::core_modules::image_ops;
use crate::core_modules::segmenter::Segment;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancelToken;
use tracing::debug;

/// Corner motion, in pixels, below which an accepted homography counts as the identity.
const MIN_EFFECTIVE_MOTION: f64 = 0.5;

pub struct HomographyChainTier {
    aligner: PairAligner,
}

impl HomographyChainTier {
    pub fn new(params: PairAlignParams) -> Self {
        Self {
            aligner: PairAligner::new(params),
        }
    }
}

impl StitchStrategy for HomographyChainTier {
    fn tier(&self) -> TierId {
        TierId::B
    }

    fn attempt(&self, segment: &Segment, cancel: &CancelToken) -> Result<StitchAttemptResult> {
        let Some((first, rest)) = segment.frames().split_first() else {
            return Ok(StitchAttemptResult::failed(TierId::B, "empty segment"));
        };

        let mut base = first.image().clone();
        let mut base_gray = first.gray().clone();
        let (width, height) = base.dimensions();
        let mut warped_frames = 0usize;
        let mut moved_frames = 0usize;

        for frame in rest {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let estimate = match self.aligner.align(&base_gray, frame.gray()) {
                PairAlignment::Aligned(estimate) => estimate,
                other => {
                    debug!(segment = segment.index, frame = frame.index, alignment = ?other, "skipping frame");
                    continue;
                }
            };
            let Some(warped) = image_ops::warp_perspective(frame.image(), &estimate.matrix, width, height) else {
                debug!(segment = segment.index, frame = frame.index, "homography not invertible, skipping frame");
                continue;
            };

            let motion = max_corner_displacement(&estimate.matrix, width, height);
            let written = image_ops::composite_nonzero(&mut base, &warped);
            base_gray = image_ops::to_gray(&base);
            warped_frames += 1;
            if motion > MIN_EFFECTIVE_MOTION {
                moved_frames += 1;
            }
            debug!(
                segment = segment.index,
                frame = frame.index,
                inliers = estimate.num_inliers,
                motion,
                written,
                "frame warped onto mosaic"
            );
        }

        if warped_frames == 0 {
            return Ok(StitchAttemptResult::degenerate(
                TierId::B,
                base,
                format!("none of {} follow-up frames could be aligned", rest.len()),
            ));
        }
        if moved_frames == 0 {
            return Ok(StitchAttemptResult::degenerate(
                TierId::B,
                base,
                format!("all {warped_frames} aligned frames matched by identity, no camera motion"),
            ));
        }
        Ok(StitchAttemptResult::succeeded(TierId::B, base))
    }
}
