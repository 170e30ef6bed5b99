#![allow(dead_code)]

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A uniform frame.
pub fn flat(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

/// A smooth colour ramp; sharp enough for nothing, easy on JPEG.
pub fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    })
}

/// Square cells of random grey levels. Cell junctions give ORB plenty of
/// distinct corners; the seed makes the texture reproducible.
pub fn block_world(width: u32, height: u32, cell: u32, seed: u64) -> RgbImage {
    assert!(cell > 0, "cell size must be positive");
    let mut rng = StdRng::seed_from_u64(seed);
    let cols = width.div_ceil(cell);
    let rows = height.div_ceil(cell);
    let levels: Vec<u8> = (0..cols * rows).map(|_| rng.gen_range(0..=255)).collect();
    RgbImage::from_fn(width, height, |x, y| {
        let v = levels[((y / cell) * cols + x / cell) as usize];
        Rgb([v, v, v])
    })
}

/// `count` crops of `world`, each `step` pixels further right than the last.
pub fn pan(world: &RgbImage, width: u32, height: u32, step: u32, count: u32) -> Vec<RgbImage> {
    assert!(
        width + step * count.saturating_sub(1) <= world.width() && height <= world.height(),
        "world too small for the requested pan"
    );
    (0..count)
        .map(|i| image::imageops::crop_imm(world, i * step, 0, width, height).to_image())
        .collect()
}

/// Every image repeated `times` times in a row.
pub fn repeat_each(images: &[RgbImage], times: usize) -> Vec<RgbImage> {
    images
        .iter()
        .flat_map(|img| std::iter::repeat_n(img.clone(), times))
        .collect()
}
