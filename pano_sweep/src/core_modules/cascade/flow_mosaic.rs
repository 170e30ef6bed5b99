// THEORY:
// Tier C trades geometry for tolerance. Instead of one global transform per
// frame it estimates a dense flow field between consecutive frames, pulls the
// new frame back along that field and blends it half-and-half into a floating
// point canvas seeded with frame 0.
//
// Large mean motion means the flow is probably wrong (fast pans, cuts the
// segmenter missed), so such frames are skipped. The "previous" frame still
// advances, so the next estimate starts from the most recent view. Pixels whose
// displaced sample falls outside the new frame keep their canvas value.
//
// A mosaic built only from zero-flow frames is frame 0 averaged with copies of
// itself, so it is reported as degenerate just like a mosaic that blended
// nothing.

use super::{StitchAttemptResult, StitchStrategy, TierId};
use crate::core_modules::image_ops;
use crate::core_modules::optical_flow::{FarnebackFlow, FlowParams};
use crate::core_modules::segmenter::Segment;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancelToken;
use image::RgbImage;
use tracing::debug;

const BLEND_ALPHA: f32 = 0.5;
/// Mean flow, in pixels, at or below which a blended frame counts as static.
const MIN_EFFECTIVE_FLOW: f64 = 0.1;

pub struct FlowMosaicTier {
    flow: FarnebackFlow,
    mag_threshold: f64,
}

impl FlowMosaicTier {
    pub fn new(params: FlowParams, mag_threshold: f64) -> Result<Self> {
        Ok(Self {
            flow: FarnebackFlow::new(params)?,
            mag_threshold,
        })
    }
}

impl StitchStrategy for FlowMosaicTier {
    fn tier(&self) -> TierId {
        TierId::C
    }

    fn attempt(&self, segment: &Segment, cancel: &CancelToken) -> Result<StitchAttemptResult> {
        let Some((first, rest)) = segment.frames().split_first() else {
            return Ok(StitchAttemptResult::failed(TierId::C, "empty segment"));
        };

        let (width, height) = first.dimensions();
        let mut canvas: Vec<f32> = first.image().as_raw().iter().map(|&v| v as f32).collect();
        let mut previous = first.gray();
        let mut composited = 0usize;
        let mut peak_magnitude = 0.0f64;

        for frame in rest {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let field = self.flow.compute(previous, frame.gray());
            let magnitude = field.mean_magnitude();
            previous = frame.gray();
            if magnitude > self.mag_threshold {
                debug!(
                    segment = segment.index,
                    frame = frame.index,
                    magnitude,
                    threshold = self.mag_threshold,
                    "flow too large, skipping frame"
                );
                continue;
            }

            let samples = image_ops::remap(frame.image(), width, height, |x, y| {
                let (dx, dy) = field.at(x, y);
                (x as f32 + dx, y as f32 + dy)
            });
            for (pixel, sample) in canvas.chunks_exact_mut(3).zip(&samples) {
                if let Some(rgb) = sample {
                    for (acc, &v) in pixel.iter_mut().zip(rgb) {
                        *acc = (1.0 - BLEND_ALPHA) * *acc + BLEND_ALPHA * v;
                    }
                }
            }
            composited += 1;
            peak_magnitude = peak_magnitude.max(magnitude);
            debug!(segment = segment.index, frame = frame.index, magnitude, "frame blended");
        }

        let pixels: Vec<u8> = canvas.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
        let Some(image) = RgbImage::from_raw(width, height, pixels) else {
            return Ok(StitchAttemptResult::failed(TierId::C, "canvas size mismatch"));
        };

        if composited == 0 {
            return Ok(StitchAttemptResult::degenerate(
                TierId::C,
                image,
                format!("none of {} follow-up frames could be composited", rest.len()),
            ));
        }
        if peak_magnitude <= MIN_EFFECTIVE_FLOW {
            return Ok(StitchAttemptResult::degenerate(
                TierId::C,
                image,
                format!("all {composited} blended frames had zero flow (peak {peak_magnitude:.3} px), no camera motion"),
            ));
        }
        Ok(StitchAttemptResult::succeeded(TierId::C, image))
    }
}
