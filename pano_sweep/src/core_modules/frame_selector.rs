// THEORY:
// The frame selector is the first stage of the pipeline. It thins the raw
// decode stream down to the frames worth aligning: one frame every
// `frame_interval` decoded frames (starting with frame 0), optionally gated on
// sharpness so motion-blurred frames never reach the matcher.
//
// Running out of usable frames is not a crash. It is reported as
// `InsufficientFrames`, a terminal but ordinary answer for a given video.

use crate::core_modules::frame::{Frame, FrameSequence, FrameSource};
use crate::error::{PipelineError, Result};
use crate::pipeline::{CancelToken, PipelineConfig, ProgressSink};
use tracing::{debug, info};

/// Share of the overall progress bar owned by frame selection.
pub const SELECTION_PROGRESS_SPAN: u8 = 30;

/// Samples and filters decoded frames into a `FrameSequence`.
#[derive(Debug, Clone)]
pub struct FrameSelector {
    frame_interval: u64,
    sharpness_threshold: Option<f64>,
    min_frames: usize,
}

impl FrameSelector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            frame_interval: config.frame_interval.max(1),
            sharpness_threshold: config.sharpness_threshold,
            min_frames: config.min_segment_frames,
        }
    }

    /// Drains `source`, keeping every `frame_interval`-th frame that passes
    /// the sharpness gate. Checks `cancel` once per decoded frame.
    pub fn select<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FrameSequence> {
        let hint = source.frame_count_hint().filter(|&n| n > 0);
        let mut selected = FrameSequence::new();
        let mut expected_dims: Option<(u32, u32)> = None;
        let mut decoded: u64 = 0;
        let mut rejected_blurry = 0usize;
        let mut last_percent = 0u8;

        while let Some(image) = source.next_frame()? {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let index = decoded;
            decoded += 1;

            if index % self.frame_interval != 0 {
                continue;
            }

            let dims = image.dimensions();
            match expected_dims {
                None => expected_dims = Some(dims),
                Some(expected) if expected != dims => {
                    return Err(PipelineError::FrameDimensionMismatch {
                        index,
                        expected,
                        found: dims,
                    });
                }
                Some(_) => {}
            }

            let frame = Frame::new(index, image);
            match self.sharpness_threshold {
                Some(threshold) if frame.sharpness() < threshold => {
                    debug!(
                        index,
                        sharpness = frame.sharpness(),
                        threshold,
                        "rejected blurry frame"
                    );
                    rejected_blurry += 1;
                }
                _ => {
                    debug!(index, sharpness = frame.sharpness(), "selected frame");
                    selected.push(frame);
                }
            }

            if let Some(total) = hint {
                let fraction = (decoded as f64 / total as f64).min(1.0);
                let percent = (fraction * SELECTION_PROGRESS_SPAN as f64) as u8;
                if percent > last_percent {
                    last_percent = percent;
                    progress.report(percent, "selecting frames");
                }
            }
        }

        info!(
            decoded,
            selected = selected.len(),
            rejected_blurry,
            "frame selection finished"
        );

        if selected.len() < self.min_frames.max(1) {
            return Err(PipelineError::InsufficientFrames {
                selected: selected.len(),
                required: self.min_frames.max(1),
            });
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::VecFrameSource;
    use crate::pipeline::NoProgress;
    use image::{Rgb, RgbImage};

    fn flat(value: u8) -> RgbImage {
        RgbImage::from_pixel(16, 12, Rgb([value, value, value]))
    }

    fn checker() -> RgbImage {
        RgbImage::from_fn(16, 12, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { 255 } else { 0 };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn samples_every_interval_starting_at_zero() {
        let config = PipelineConfig {
            frame_interval: 3,
            ..PipelineConfig::default()
        };
        let frames = (0..10).map(|i| flat(i as u8)).collect();
        let mut source = VecFrameSource::new(frames);
        let selected = FrameSelector::new(&config)
            .select(&mut source, &NoProgress, &CancelToken::new())
            .unwrap();
        let indices: Vec<u64> = selected.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 3, 6, 9]);
    }

    #[test]
    fn sharpness_gate_drops_flat_frames() {
        let config = PipelineConfig {
            frame_interval: 1,
            sharpness_threshold: Some(10.0),
            ..PipelineConfig::default()
        };
        let frames = vec![checker(), flat(40), checker(), flat(80)];
        let mut source = VecFrameSource::new(frames);
        let selected = FrameSelector::new(&config)
            .select(&mut source, &NoProgress, &CancelToken::new())
            .unwrap();
        let indices: Vec<u64> = selected.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn empty_source_is_insufficient() {
        let config = PipelineConfig::default();
        let mut source = VecFrameSource::new(Vec::new());
        let err = FrameSelector::new(&config)
            .select(&mut source, &NoProgress, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientFrames { selected: 0, required: 2 }
        ));
    }

    #[test]
    fn mismatched_frame_size_is_rejected() {
        let config = PipelineConfig {
            frame_interval: 1,
            ..PipelineConfig::default()
        };
        let frames = vec![flat(1), RgbImage::new(8, 8)];
        let mut source = VecFrameSource::new(frames);
        let err = FrameSelector::new(&config)
            .select(&mut source, &NoProgress, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::FrameDimensionMismatch { index: 1, .. }));
    }

    #[test]
    fn cancellation_stops_selection() {
        let config = PipelineConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut source = VecFrameSource::new(vec![flat(1), flat(2)]);
        let err = FrameSelector::new(&config)
            .select(&mut source, &NoProgress, &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
