// THEORY:
// Tier A hands the whole segment to an external global stitcher. Feature
// matching, bundle adjustment, seam finding and blending all happen on the far
// side of `GlobalStitcher`; this tier only adapts its answer to the cascade
// contract.

use super::{StitchAttemptResult, StitchStrategy, TierId};
use crate::core_modules::segmenter::Segment;
use crate::error::Result;
use crate::pipeline::CancelToken;
use image::RgbImage;
use std::sync::Arc;

pub trait GlobalStitcher: Send + Sync {
    /// Stitches `frames`, in order, into one image, or explains why it could not.
    fn stitch(&self, frames: &[&RgbImage]) -> std::result::Result<RgbImage, String>;
}

/// A stitcher that is never available; Tier A always falls through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGlobalStitcher;

impl GlobalStitcher for NoGlobalStitcher {
    fn stitch(&self, _frames: &[&RgbImage]) -> std::result::Result<RgbImage, String> {
        Err("no global stitcher configured".into())
    }
}

pub struct GlobalStitchTier {
    stitcher: Arc<dyn GlobalStitcher>,
}

impl GlobalStitchTier {
    pub fn new(stitcher: Arc<dyn GlobalStitcher>) -> Self {
        Self { stitcher }
    }
}

impl StitchStrategy for GlobalStitchTier {
    fn tier(&self) -> TierId {
        TierId::A
    }

    fn attempt(&self, segment: &Segment, _cancel: &CancelToken) -> Result<StitchAttemptResult> {
        let frames: Vec<&RgbImage> = segment.frames().iter().map(|f| f.image()).collect();
        if frames.is_empty() {
            return Ok(StitchAttemptResult::failed(TierId::A, "empty segment"));
        }
        Ok(match self.stitcher.stitch(&frames) {
            Ok(image) if image.width() == 0 || image.height() == 0 => {
                StitchAttemptResult::failed(TierId::A, "global stitcher returned an empty image")
            }
            Ok(image) => StitchAttemptResult::succeeded(TierId::A, image),
            Err(reason) => StitchAttemptResult::failed(TierId::A, reason),
        })
    }
}
