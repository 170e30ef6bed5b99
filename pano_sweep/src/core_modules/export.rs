// THEORY:
// Export is the last hop out of the library: a finished panorama becomes an
// encoded byte buffer (PNG for lossless archives, JPEG for sharing) or a file
// on disk. Encoding never alters the image in memory; a `PanoramaResult` stays
// immutable once the cascade has produced it.

use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Png,
    Jpeg { quality: u8 },
}

impl ExportFormat {
    pub fn jpeg() -> Self {
        ExportFormat::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg { .. } => "jpg",
        }
    }
}

/// Encodes `image` into `out` in the requested format.
pub fn write_image<W: Write>(image: &RgbImage, format: ExportFormat, out: W) -> Result<()> {
    match format {
        ExportFormat::Png => {
            let encoder = PngEncoder::new(out);
            encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
        }
        ExportFormat::Jpeg { quality } => {
            let encoder = JpegEncoder::new_with_quality(out, quality.clamp(1, 100));
            encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
        }
    }
    Ok(())
}

pub fn encode(image: &RgbImage, format: ExportFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_image(image, format, &mut buffer)?;
    Ok(buffer)
}

pub fn save(image: &RgbImage, format: ExportFormat, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_image(image, format, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Decodes a buffer produced by [`encode`] back into RGB pixels.
pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Peak signal-to-noise ratio in dB; infinite for identical images and zero
/// for images of different sizes.
pub fn psnr(a: &RgbImage, b: &RgbImage) -> f64 {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| (x as f64 - y as f64).powi(2))
        .sum();
    let mse = sum_sq / a.as_raw().len() as f64;
    if mse == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (255.0f64 * 255.0 / mse).log10()
}
