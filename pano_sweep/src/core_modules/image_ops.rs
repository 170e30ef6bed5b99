// THEORY:
// Small, stateless pixel routines shared by the selector, the continuity tests
// and the stitching tiers. Nothing here knows about frames, segments or tiers;
// every function takes plain `image` buffers and returns plain values, which
// keeps the higher layers free of index arithmetic.

use image::{GrayImage, Rgb, RgbImage};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Number of intensity bins used by the histogram continuity test.
pub const HISTOGRAM_BINS: usize = 64;

pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// Variance of the 4-neighbour Laplacian response, computed in floating point
/// with replicated borders. Blurry frames have a flat response and score low.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let w = width as i64;
    let h = height as i64;
    let raw = gray.as_raw();
    let at = |x: i64, y: i64| -> f64 {
        let cx = x.clamp(0, w - 1) as usize;
        let cy = y.clamp(0, h - 1) as usize;
        raw[cy * width as usize + cx] as f64
    };

    let count = (width as f64) * (height as f64);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..h {
        for x in 0..w {
            let response =
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

/// A 64-bin intensity histogram normalized to unit mass.
pub fn normalized_histogram(gray: &GrayImage) -> [f64; HISTOGRAM_BINS] {
    let mut hist = [0.0f64; HISTOGRAM_BINS];
    let bin_width = 256 / HISTOGRAM_BINS;
    for pixel in gray.pixels() {
        hist[pixel[0] as usize / bin_width] += 1.0;
    }
    let total: f64 = hist.iter().sum();
    if total > 0.0 {
        for bin in hist.iter_mut() {
            *bin /= total;
        }
    }
    hist
}

/// Bhattacharyya distance in the Hellinger form: 0 for identical
/// distributions, 1 for distributions with disjoint support.
pub fn bhattacharyya_distance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a: f64 = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b: f64 = b[..n].iter().sum::<f64>() / n as f64;
    let norm = (mean_a * mean_b * (n * n) as f64).sqrt();
    if norm <= f64::EPSILON {
        // An empty histogram carries no evidence either way.
        return if mean_a == mean_b { 0.0 } else { 1.0 };
    }
    let coefficient: f64 = a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(x, y)| (x * y).sqrt())
        .sum();
    (1.0 - coefficient / norm).max(0.0).sqrt()
}

/// Bilinear RGB sample at a sub-pixel location, or `None` outside the image.
pub fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    if !(x >= 0.0 && y >= 0.0 && x <= max_x && y <= max_y) {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// Warps `src` by `h` (which maps source coordinates to destination
/// coordinates) into a `width` x `height` canvas. Destination pixels with no
/// source are left black. Returns `None` when `h` is not invertible.
pub fn warp_perspective(
    src: &RgbImage,
    h: &Matrix3<f64>,
    width: u32,
    height: u32,
) -> Option<RgbImage> {
    let inverse = h.try_inverse()?;
    let mut dst = RgbImage::new(width, height);
    let row_len = width as usize * 3;
    if row_len == 0 {
        return Some(dst);
    }

    let buffer: &mut [u8] = &mut dst;
    buffer
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let p = inverse * Vector3::new(x as f64, y as f64, 1.0);
                if p[2].abs() < 1e-12 {
                    continue;
                }
                let sx = (p[0] / p[2]) as f32;
                let sy = (p[1] / p[2]) as f32;
                if let Some(rgb) = sample_bilinear(src, sx, sy) {
                    for c in 0..3 {
                        row[x * 3 + c] = rgb[c].round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        });
    Some(dst)
}

/// Samples `src` at `map(x, y)` for every pixel of a `width` x `height` grid,
/// row-major. Samples that land outside `src` are `None`, so the caller
/// decides what an uncovered pixel means.
pub fn remap<F>(src: &RgbImage, width: u32, height: u32, map: F) -> Vec<Option<[f32; 3]>>
where
    F: Fn(u32, u32) -> (f32, f32) + Sync,
{
    let row_len = width as usize;
    let mut out = vec![None; row_len * height as usize];
    if row_len == 0 {
        return out;
    }
    out.par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, slot) in row.iter_mut().enumerate() {
                let (sx, sy) = map(x as u32, y as u32);
                *slot = sample_bilinear(src, sx, sy);
            }
        });
    out
}

/// Copies every non-black pixel of `overlay` onto `base`. Both images must
/// share dimensions; mismatched images leave `base` untouched.
pub fn composite_nonzero(base: &mut RgbImage, overlay: &RgbImage) -> usize {
    if base.dimensions() != overlay.dimensions() {
        return 0;
    }
    let mut written = 0;
    for (dst, src) in base.pixels_mut().zip(overlay.pixels()) {
        if src.0 != [0, 0, 0] {
            *dst = Rgb(src.0);
            written += 1;
        }
    }
    written
}
