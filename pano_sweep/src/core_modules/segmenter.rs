// THEORY:
// The segmenter walks the selected frames once, in order, and splits them
// wherever the continuity test reports a cut. Each decision only involves the
// immediately preceding frame, so the scan is inherently sequential and fully
// deterministic for a given sequence, test and threshold.
//
// Runs shorter than the configured minimum are dropped outright. They are
// never merged into a neighbouring segment: a sweep that was too short to
// stitch stays unstitched, whether it sits at the start, middle or end.
//
// Frames are moved into their segment, so every segment owns its pixels
// exclusively and can be handed to a worker without sharing.

use crate::core_modules::continuity::{ContinuityTest, ContinuityVerdict};
use crate::core_modules::frame::{Frame, FrameSequence};
use tracing::{debug, info};

/// A contiguous run of frames judged to be one camera sweep.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Position of this segment among the retained segments (0-based).
    pub index: usize,
    frames: Vec<Frame>,
}

impl Segment {
    pub fn new(index: usize, frames: Vec<Frame>) -> Self {
        Self { index, frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Decode-order indices of the member frames.
    pub fn frame_indices(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.index).collect()
    }

    pub fn frame_dimensions(&self) -> Option<(u32, u32)> {
        self.frames.first().map(Frame::dimensions)
    }
}

pub struct Segmenter<'a> {
    test: &'a dyn ContinuityTest,
    min_segment_frames: usize,
}

impl<'a> Segmenter<'a> {
    pub fn new(test: &'a dyn ContinuityTest, min_segment_frames: usize) -> Self {
        Self {
            test,
            min_segment_frames: min_segment_frames.max(1),
        }
    }

    /// Partitions `frames` into ordered segments of at least
    /// `min_segment_frames` frames each.
    pub fn segment(&self, frames: FrameSequence) -> Vec<Segment> {
        let total = frames.len();
        let mut segments: Vec<Segment> = Vec::new();
        let mut current: Vec<Frame> = Vec::new();
        let mut dropped = 0usize;

        for frame in frames {
            let verdict = match current.last() {
                None => ContinuityVerdict::Continue,
                Some(previous) => self.test.compare(previous, &frame),
            };
            if verdict == ContinuityVerdict::Cut {
                let run = std::mem::take(&mut current);
                dropped += self.close(run, &mut segments);
            }
            current.push(frame);
        }
        dropped += self.close(current, &mut segments);

        info!(
            frames = total,
            segments = segments.len(),
            dropped_frames = dropped,
            "segmentation finished"
        );
        segments
    }

    /// Keeps `run` as a segment if it is long enough; returns the number of
    /// frames dropped.
    fn close(&self, run: Vec<Frame>, segments: &mut Vec<Segment>) -> usize {
        if run.is_empty() {
            return 0;
        }
        if run.len() < self.min_segment_frames {
            debug!(
                first = run[0].index,
                len = run.len(),
                min = self.min_segment_frames,
                "dropping short run"
            );
            return run.len();
        }
        let index = segments.len();
        debug!(index, first = run[0].index, len = run.len(), "closed segment");
        segments.push(Segment::new(index, run));
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Cuts before every frame whose pixel value differs from its predecessor.
    struct ValueChange;

    impl ContinuityTest for ValueChange {
        fn compare(&self, previous: &Frame, current: &Frame) -> ContinuityVerdict {
            if previous.image().get_pixel(0, 0) == current.image().get_pixel(0, 0) {
                ContinuityVerdict::Continue
            } else {
                ContinuityVerdict::Cut
            }
        }
    }

    fn frames(values: &[u8]) -> FrameSequence {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Frame::new(i as u64, RgbImage::from_pixel(4, 4, Rgb([v, v, v]))))
            .collect()
    }

    fn lengths(segments: &[Segment]) -> Vec<usize> {
        segments.iter().map(Segment::len).collect()
    }

    #[test]
    fn splits_on_cuts() {
        let segments = Segmenter::new(&ValueChange, 2).segment(frames(&[1, 1, 1, 2, 2, 3, 3, 3]));
        assert_eq!(lengths(&segments), vec![3, 2, 3]);
        assert_eq!(segments[1].frame_indices(), vec![3, 4]);
        let indices: Vec<usize> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn short_runs_are_dropped_not_merged() {
        // Leading, middle and trailing singletons all disappear.
        let segments = Segmenter::new(&ValueChange, 2).segment(frames(&[9, 1, 1, 5, 2, 2, 7]));
        assert_eq!(lengths(&segments), vec![2, 2]);
        assert_eq!(segments[0].frame_indices(), vec![1, 2]);
        assert_eq!(segments[1].frame_indices(), vec![4, 5]);
    }

    #[test]
    fn run_one_short_of_minimum_is_dropped() {
        let segments = Segmenter::new(&ValueChange, 3).segment(frames(&[1, 1, 2, 2, 2]));
        assert_eq!(lengths(&segments), vec![3]);
        assert_eq!(segments[0].frame_indices(), vec![2, 3, 4]);
    }

    #[test]
    fn all_singletons_yield_nothing() {
        let segments = Segmenter::new(&ValueChange, 2).segment(frames(&[1, 2, 3, 4]));
        assert!(segments.is_empty());
    }

    #[test]
    fn segmentation_is_deterministic() {
        let values = [4, 4, 8, 8, 8, 1, 6, 6];
        let a = Segmenter::new(&ValueChange, 2).segment(frames(&values));
        let b = Segmenter::new(&ValueChange, 2).segment(frames(&values));
        assert_eq!(
            a.iter().map(Segment::frame_indices).collect::<Vec<_>>(),
            b.iter().map(Segment::frame_indices).collect::<Vec<_>>()
        );
    }
}
