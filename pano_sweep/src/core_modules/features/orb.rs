// THEORY:
// ORB: oriented FAST keypoints with rotated BRIEF descriptors. Keypoints are
// found with FAST-9 on a small image pyramid, oriented by the intensity
// centroid of their patch, and described by 256 binary intensity comparisons
// steered by that orientation. The sampling pattern is drawn from a fixed seed
// so two runs over the same frames always produce the same descriptors.

use image::GrayImage;
use image::imageops::{self, FilterType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PATTERN_SEED: u64 = 0x0b1e_5eed;
const PATTERN_PAIRS: usize = 256;
/// Pattern coordinates stay within this radius before rotation.
const PATTERN_EXTENT: i32 = 13;
/// Radius of the orientation patch.
const HALF_PATCH: i32 = 15;
/// Keypoints closer than this to the border have no complete rotated patch.
const EDGE_THRESHOLD: u32 = 19;

/// Bresenham circle of radius 3 used by FAST, in clockwise order.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    /// Position in full-resolution image coordinates.
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Orientation in radians.
    pub angle: f32,
    pub octave: u8,
}

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    pub fn hamming_distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints and their descriptors; `descriptors[i]` describes `keypoints[i]`.
#[derive(Debug, Clone, Default)]
pub struct OrbFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl OrbFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

pub struct Orb {
    n_features: usize,
    scale_factor: f32,
    n_levels: usize,
    fast_threshold: u8,
    pattern: Vec<[i32; 4]>,
}

impl Default for Orb {
    fn default() -> Self {
        Self {
            n_features: 500,
            scale_factor: 1.2,
            n_levels: 4,
            fast_threshold: 20,
            pattern: brief_pattern(),
        }
    }
}

impl Orb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_features(mut self, n: usize) -> Self {
        self.n_features = n;
        self
    }

    pub fn detect_and_compute(&self, image: &GrayImage) -> OrbFeatures {
        let min_side = 2 * EDGE_THRESHOLD + 1;
        let mut levels: Vec<(f32, GrayImage, GrayImage)> = Vec::new();
        let mut scale = 1.0f32;
        for level in 0..self.n_levels {
            let width = (image.width() as f32 / scale).round() as u32;
            let height = (image.height() as f32 / scale).round() as u32;
            if width < min_side || height < min_side {
                break;
            }
            let level_image = if level == 0 {
                image.clone()
            } else {
                imageops::resize(image, width, height, FilterType::Triangle)
            };
            let smoothed = imageops::blur(&level_image, 2.0);
            levels.push((scale, level_image, smoothed));
            scale *= self.scale_factor;
        }

        let mut candidates: Vec<(usize, u32, u32, f32)> = Vec::new();
        for (octave, (_, level_image, _)) in levels.iter().enumerate() {
            for (x, y, score) in fast_detect(level_image, self.fast_threshold) {
                candidates.push((octave, x, y, score));
            }
        }
        // Strongest first; ties broken by position so the order is total.
        candidates.sort_by(|a, b| {
            b.3.total_cmp(&a.3)
                .then(a.0.cmp(&b.0))
                .then(a.2.cmp(&b.2))
                .then(a.1.cmp(&b.1))
        });
        candidates.truncate(self.n_features);

        let mut features = OrbFeatures::default();
        for (octave, x, y, score) in candidates {
            let (scale, level_image, smoothed) = &levels[octave];
            let angle = intensity_centroid_angle(level_image, x, y);
            let descriptor = steered_brief(smoothed, x, y, angle, &self.pattern);
            features.keypoints.push(KeyPoint {
                x: x as f32 * scale,
                y: y as f32 * scale,
                response: score,
                angle,
                octave: octave as u8,
            });
            features.descriptors.push(descriptor);
        }
        features
    }
}

fn brief_pattern() -> Vec<[i32; 4]> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    (0..PATTERN_PAIRS)
        .map(|_| {
            [
                rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
                rng.gen_range(-PATTERN_EXTENT..=PATTERN_EXTENT),
            ]
        })
        .collect()
}

/// FAST-9 corners with 3x3 non-maximum suppression, restricted to the region
/// where a full descriptor patch fits. Returns `(x, y, score)`.
pub fn fast_detect(image: &GrayImage, threshold: u8) -> Vec<(u32, u32, f32)> {
    let (width, height) = image.dimensions();
    if width < 2 * EDGE_THRESHOLD + 1 || height < 2 * EDGE_THRESHOLD + 1 {
        return Vec::new();
    }
    let stride = width as usize;
    let raw = image.as_raw();
    let t = threshold as i32;

    let mut scores = vec![0.0f32; (width * height) as usize];
    for y in EDGE_THRESHOLD..height - EDGE_THRESHOLD {
        for x in EDGE_THRESHOLD..width - EDGE_THRESHOLD {
            let center = raw[y as usize * stride + x as usize] as i32;
            let ring: [i32; 16] = std::array::from_fn(|i| {
                let (dx, dy) = CIRCLE[i];
                raw[(y as i32 + dy) as usize * stride + (x as i32 + dx) as usize] as i32
            });

            // A 9-arc always covers at least two of the four compass points.
            let compass = [ring[0], ring[4], ring[8], ring[12]];
            let bright = compass.iter().filter(|&&v| v > center + t).count();
            let dark = compass.iter().filter(|&&v| v < center - t).count();
            if bright < 2 && dark < 2 {
                continue;
            }

            if has_arc(&ring, |v| v > center + t) || has_arc(&ring, |v| v < center - t) {
                let score: i32 = ring
                    .iter()
                    .map(|&v| ((v - center).abs() - t).max(0))
                    .sum();
                scores[y as usize * stride + x as usize] = score as f32;
            }
        }
    }

    let mut corners = Vec::new();
    for y in EDGE_THRESHOLD..height - EDGE_THRESHOLD {
        for x in EDGE_THRESHOLD..width - EDGE_THRESHOLD {
            let idx = y as usize * stride + x as usize;
            let score = scores[idx];
            if score <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'window: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nidx = ((y as i32 + dy) as usize) * stride + (x as i32 + dx) as usize;
                    let neighbour = scores[nidx];
                    // Equal scores: the earlier pixel in raster order wins.
                    if neighbour > score || (neighbour == score && nidx < idx) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                corners.push((x, y, score));
            }
        }
    }
    corners
}

fn has_arc(ring: &[i32; 16], pass: impl Fn(i32) -> bool) -> bool {
    let mut run = 0;
    for i in 0..32 {
        if pass(ring[i % 16]) {
            run += 1;
            if run >= 9 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn intensity_centroid_angle(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -HALF_PATCH..=HALF_PATCH {
        for dx in -HALF_PATCH..=HALF_PATCH {
            if dx * dx + dy * dy > HALF_PATCH * HALF_PATCH {
                continue;
            }
            let value = image.get_pixel((cx as i32 + dx) as u32, (cy as i32 + dy) as u32)[0] as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn steered_brief(
    smoothed: &GrayImage,
    cx: u32,
    cy: u32,
    angle: f32,
    pattern: &[[i32; 4]],
) -> Descriptor {
    let (sin_a, cos_a) = angle.sin_cos();
    let rotate = |x: i32, y: i32| -> (u32, u32) {
        let rx = cos_a * x as f32 - sin_a * y as f32;
        let ry = sin_a * x as f32 + cos_a * y as f32;
        (
            (cx as i32 + rx.round() as i32) as u32,
            (cy as i32 + ry.round() as i32) as u32,
        )
    };

    let mut bits = [0u8; 32];
    for (i, &[x1, y1, x2, y2]) in pattern.iter().enumerate() {
        let (px1, py1) = rotate(x1, y1);
        let (px2, py2) = rotate(x2, y2);
        if smoothed.get_pixel(px1, py1)[0] < smoothed.get_pixel(px2, py2)[0] {
            bits[i / 8] |= 1 << (7 - i % 8);
        }
    }
    Descriptor(bits)
}
