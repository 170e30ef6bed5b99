// THEORY:
// Tier D stacks a horizontal strip from the middle of every frame. No
// alignment is attempted, so this tier cannot fail on content. For `N` frames
// of width `W` the output is always `W` x `N * strip_height`; strips taller
// than the frame are padded with black rows. The only error is a canvas whose
// size cannot be represented, which ends the run instead of wrapping around.

use super::{StitchAttemptResult, StitchStrategy, TierId};
use crate::core_modules::segmenter::Segment;
use crate::error::{PipelineError, Result};
use crate::pipeline::CancelToken;
use image::RgbImage;

pub struct PushbroomTier {
    strip_height: u32,
}

impl PushbroomTier {
    pub fn new(strip_height: u32) -> Self {
        Self {
            strip_height: strip_height.max(1),
        }
    }

    pub fn stitch(&self, segment: &Segment) -> Result<RgbImage> {
        let frames = segment.frames();
        let width = frames.first().map_or(0, |f| f.width());
        let strip = self.strip_height;
        let too_large = || PipelineError::OutputTooLarge {
            frames: frames.len(),
            strip_height: strip,
        };
        let height = u32::try_from(frames.len())
            .ok()
            .and_then(|n| strip.checked_mul(n))
            .ok_or_else(too_large)?;
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(3))
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or_else(too_large)?;
        let mut out = RgbImage::new(width, height);

        for (k, frame) in frames.iter().enumerate() {
            let image = frame.image();
            let height = image.height() as i64;
            let top = height / 2 - strip as i64 / 2;
            for row in 0..strip {
                let src_y = top + row as i64;
                if src_y < 0 || src_y >= height {
                    continue;
                }
                let dst_y = k as u32 * strip + row;
                for x in 0..width.min(image.width()) {
                    out.put_pixel(x, dst_y, *image.get_pixel(x, src_y as u32));
                }
            }
        }
        Ok(out)
    }
}

impl StitchStrategy for PushbroomTier {
    fn tier(&self) -> TierId {
        TierId::D
    }

    fn attempt(&self, segment: &Segment, _cancel: &CancelToken) -> Result<StitchAttemptResult> {
        Ok(StitchAttemptResult::succeeded(TierId::D, self.stitch(segment)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Frame;
    use image::Rgb;

    /// Each row carries its own y coordinate, each frame its index in blue.
    fn segment(n: u64, width: u32, height: u32) -> Segment {
        let frames = (0..n)
            .map(|i| Frame::new(i, RgbImage::from_fn(width, height, |_, y| Rgb([y as u8, 0, i as u8]))))
            .collect();
        Segment::new(0, frames)
    }

    #[test]
    fn output_is_n_strips_tall() {
        let out = PushbroomTier::new(10).stitch(&segment(5, 32, 40)).unwrap();
        assert_eq!(out.dimensions(), (32, 50));
    }

    #[test]
    fn strips_are_centred_and_ordered() {
        let out = PushbroomTier::new(4).stitch(&segment(3, 8, 20)).unwrap();
        // Rows 8..12 of each frame, frame order preserved.
        assert_eq!(out.get_pixel(0, 0).0, [8, 0, 0]);
        assert_eq!(out.get_pixel(0, 3).0, [11, 0, 0]);
        assert_eq!(out.get_pixel(5, 4).0, [8, 0, 1]);
        assert_eq!(out.get_pixel(5, 11).0, [11, 0, 2]);
    }

    #[test]
    fn oversized_strip_is_padded() {
        let out = PushbroomTier::new(12).stitch(&segment(2, 4, 6)).unwrap();
        assert_eq!(out.dimensions(), (4, 24));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(0, 3).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(0, 8).0, [5, 0, 0]);
        assert_eq!(out.get_pixel(0, 9).0, [0, 0, 0]);
    }

    #[test]
    fn unrepresentable_height_is_an_error() {
        let err = PushbroomTier::new(u32::MAX).stitch(&segment(2, 4, 6)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutputTooLarge {
                frames: 2,
                strip_height: u32::MAX
            }
        ));
    }
}
