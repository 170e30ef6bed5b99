// THEORY:
// A `Frame` is a decoded picture plus the few facts about it that later stages
// keep asking for: where it sat in decode order, its grayscale rendition and
// how sharp it is. All of it is computed once at construction and never
// mutated afterwards, so frames can be moved between stages and threads
// without any coordination.
//
// Frames enter the system through a `FrameSource`, the only seam to the video
// decoder. The core never sees containers or codecs, just a sequence of RGB
// images that ends with `None`.

use crate::core_modules::image_ops;
use crate::error::Result;
use image::{GrayImage, RgbImage};
use std::collections::VecDeque;

/// A single decoded, immutable video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position of this frame in decode order (0-based).
    pub index: u64,
    image: RgbImage,
    gray: GrayImage,
    sharpness: f64,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        let gray = image_ops::to_gray(&image);
        let sharpness = image_ops::laplacian_variance(&gray);
        Self {
            index,
            image,
            gray,
            sharpness,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// Variance of the Laplacian over the grayscale frame.
    pub fn sharpness(&self) -> f64 {
        self.sharpness
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// The selected frames of one video, in decode order.
pub type FrameSequence = Vec<Frame>;

/// A sequential decoder. Implementations yield frames in decode order and
/// `Ok(None)` once the stream is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Total number of frames, when the container knows it.
    fn frame_count_hint(&self) -> Option<u64> {
        None
    }
}

/// A `FrameSource` over frames already held in memory.
pub struct VecFrameSource {
    frames: VecDeque<RgbImage>,
    total: u64,
}

impl VecFrameSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        let total = frames.len() as u64;
        Self {
            frames: frames.into(),
            total,
        }
    }
}

impl FrameSource for VecFrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        Ok(self.frames.pop_front())
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.total)
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        (**self).next_frame()
    }

    fn frame_count_hint(&self) -> Option<u64> {
        (**self).frame_count_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn frame_caches_derived_data() {
        let frame = Frame::new(7, RgbImage::from_pixel(6, 4, Rgb([30, 60, 90])));
        assert_eq!(frame.index, 7);
        assert_eq!(frame.dimensions(), (6, 4));
        assert_eq!(frame.gray().dimensions(), (6, 4));
        assert_eq!(frame.sharpness(), 0.0);
    }

    #[test]
    fn vec_source_drains_in_order() {
        let frames = (0..3)
            .map(|i| RgbImage::from_pixel(2, 2, Rgb([i as u8, 0, 0])))
            .collect();
        let mut source = VecFrameSource::new(frames);
        assert_eq!(source.frame_count_hint(), Some(3));
        for expected in 0..3u8 {
            let frame = source.next_frame().unwrap().unwrap();
            assert_eq!(frame.get_pixel(0, 0)[0], expected);
        }
        assert!(source.next_frame().unwrap().is_none());
    }
}
