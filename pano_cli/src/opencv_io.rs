// THEORY:
// OpenCV sits on both outer edges of the library: it decodes the video into
// the `FrameSource` the selector drains, and its stitching module is the
// opaque global stitcher behind Tier A. OpenCV works in BGR while the library
// works in RGB, so every crossing converts with `cvt_color`.

use image::RgbImage;
use opencv::{
    core::{self, Mat, Scalar, Vector},
    imgproc,
    prelude::*,
    stitching::{Stitcher, Stitcher_Mode, Stitcher_Status},
    videoio::{self, VideoCapture},
};
use pano_sweep::{FrameSource, GlobalStitcher, PipelineError};
use std::path::Path;
use tracing::debug;

fn source_error(e: opencv::Error) -> PipelineError {
    PipelineError::Source(e.to_string())
}

/// Copies a BGR `Mat` into an owned RGB image.
fn mat_to_rgb(bgr: &Mat) -> opencv::Result<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    let bytes = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(width, height, bytes).ok_or_else(|| {
        opencv::Error::new(core::StsUnmatchedSizes, format!("unexpected buffer size for {width}x{height} frame"))
    })
}

/// Copies an RGB image into a freshly allocated BGR `Mat`.
fn rgb_to_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    rgb.data_bytes_mut()?.copy_from_slice(image.as_raw());
    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

/// Decodes a video file frame by frame.
pub struct VideoFileSource {
    capture: VideoCapture,
    frame: Mat,
    frame_count: Option<u64>,
}

impl VideoFileSource {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| PipelineError::Source(format!("non UTF-8 path: {}", path.display())))?;
        let capture = VideoCapture::from_file(path_str, videoio::CAP_ANY).map_err(source_error)?;
        if !capture.is_opened().map_err(source_error)? {
            return Err(PipelineError::Source(format!("cannot open video {}", path.display())));
        }
        let count = capture.get(videoio::CAP_PROP_FRAME_COUNT).map_err(source_error)?;
        let frame_count = (count.is_finite() && count > 0.0).then_some(count as u64);
        debug!(path = %path.display(), ?frame_count, "video opened");
        Ok(Self {
            capture,
            frame: Mat::default(),
            frame_count,
        })
    }
}

impl FrameSource for VideoFileSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        if !self.capture.read(&mut self.frame).map_err(source_error)? || self.frame.empty() {
            return Ok(None);
        }
        mat_to_rgb(&self.frame).map(Some).map_err(source_error)
    }

    fn frame_count_hint(&self) -> Option<u64> {
        self.frame_count
    }
}

/// Tier A backed by OpenCV's panorama stitcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvStitcher;

impl OpenCvStitcher {
    fn run(&self, frames: &[&RgbImage]) -> opencv::Result<Result<RgbImage, String>> {
        let mut images = Vector::<Mat>::new();
        for frame in frames {
            images.push(rgb_to_mat(frame)?);
        }

        let mut stitcher = Stitcher::create(Stitcher_Mode::PANORAMA)?;
        let mut pano = Mat::default();
        let status = stitcher.stitch(&images, &mut pano)?;
        if status != Stitcher_Status::OK {
            return Ok(Err(format!("OpenCV stitcher returned {status:?}")));
        }
        if pano.empty() {
            return Ok(Err("OpenCV stitcher returned an empty panorama".into()));
        }
        Ok(Ok(mat_to_rgb(&pano)?))
    }
}

impl GlobalStitcher for OpenCvStitcher {
    fn stitch(&self, frames: &[&RgbImage]) -> Result<RgbImage, String> {
        match self.run(frames) {
            Ok(result) => result,
            Err(e) => Err(format!("OpenCV error: {e}")),
        }
    }
}
