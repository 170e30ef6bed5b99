// THEORY:
// Robust homography estimation. Minimal four-point samples are drawn with a
// seeded generator, each sample is solved with a normalized DLT, and the model
// with the largest inlier set (reprojection error below the threshold) is
// refit on all of its inliers. Seeding keeps the estimate reproducible for
// identical inputs.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;

const RANSAC_SEED: u64 = 0x5eed_cafe;

#[derive(Debug, Clone)]
pub struct RansacParams {
    /// Maximum reprojection error in pixels for a correspondence to count as an inlier.
    pub threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            max_iterations: 2000,
            confidence: 0.995,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HomographyEstimate {
    /// Maps source points onto destination points, normalized so `h[(2, 2)] == 1`.
    pub matrix: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

impl HomographyEstimate {
    /// Euclidean norm of the translation component.
    pub fn translation_norm(&self) -> f64 {
        translation_norm(&self.matrix)
    }
}

pub fn translation_norm(h: &Matrix3<f64>) -> f64 {
    (h[(0, 2)].powi(2) + h[(1, 2)].powi(2)).sqrt()
}

pub fn project(h: &Matrix3<f64>, point: (f64, f64)) -> Option<(f64, f64)> {
    let p = h * Vector3::new(point.0, point.1, 1.0);
    if p[2].abs() < 1e-12 {
        None
    } else {
        Some((p[0] / p[2], p[1] / p[2]))
    }
}

/// Largest distance any corner of a `width` x `height` frame moves under `h`.
/// Near zero means `h` is effectively the identity over that frame.
pub fn max_corner_displacement(h: &Matrix3<f64>, width: u32, height: u32) -> f64 {
    let (w, hgt) = (width as f64, height as f64);
    [(0.0, 0.0), (w, 0.0), (0.0, hgt), (w, hgt)]
        .into_iter()
        .map(|corner| match project(h, corner) {
            Some((x, y)) => ((x - corner.0).powi(2) + (y - corner.1).powi(2)).sqrt(),
            None => f64::INFINITY,
        })
        .fold(0.0, f64::max)
}

fn reprojection_error(h: &Matrix3<f64>, src: (f64, f64), dst: (f64, f64)) -> f64 {
    match project(h, src) {
        Some((x, y)) => ((x - dst.0).powi(2) + (y - dst.1).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Estimates the homography taking `src[i]` to `dst[i]`. Returns `None` with
/// fewer than four correspondences or when no sample yields a usable model.
pub fn estimate_homography(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    params: &RansacParams,
) -> Option<HomographyEstimate> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best: Option<(Matrix3<f64>, usize)> = None;
    let mut required_iterations = params.max_iterations;
    let mut iteration = 0;

    while iteration < required_iterations.min(params.max_iterations) {
        iteration += 1;
        let picked = sample(&mut rng, n, 4).into_vec();
        let sample_src: Vec<(f64, f64)> = picked.iter().map(|&i| src[i]).collect();
        let sample_dst: Vec<(f64, f64)> = picked.iter().map(|&i| dst[i]).collect();
        if has_collinear_triple(&sample_src) || has_collinear_triple(&sample_dst) {
            continue;
        }
        let Some(h) = solve_normalized_dlt(&sample_src, &sample_dst) else {
            continue;
        };
        let count = (0..n)
            .filter(|&i| reprojection_error(&h, src[i], dst[i]) < params.threshold)
            .count();
        if best.as_ref().is_none_or(|(_, c)| count > *c) {
            best = Some((h, count));
            let inlier_ratio = count as f64 / n as f64;
            required_iterations = adaptive_iterations(inlier_ratio, params.confidence);
        }
    }

    let (mut matrix, _) = best.filter(|(_, count)| *count >= 4)?;
    let mut inliers = inlier_mask(&matrix, src, dst, params.threshold);

    // Refit on the consensus set; keep the refit only if it does not lose support.
    let (in_src, in_dst): (Vec<_>, Vec<_>) = (0..n)
        .filter(|&i| inliers[i])
        .map(|i| (src[i], dst[i]))
        .unzip();
    if let Some(refit) = solve_normalized_dlt(&in_src, &in_dst) {
        let refit_inliers = inlier_mask(&refit, src, dst, params.threshold);
        if count_true(&refit_inliers) >= count_true(&inliers) {
            matrix = refit;
            inliers = refit_inliers;
        }
    }

    let num_inliers = count_true(&inliers);
    if num_inliers < 4 {
        return None;
    }
    Some(HomographyEstimate {
        matrix,
        inliers,
        num_inliers,
    })
}

fn adaptive_iterations(inlier_ratio: f64, confidence: f64) -> usize {
    let all_inliers = inlier_ratio.powi(4);
    if all_inliers >= 1.0 - f64::EPSILON {
        return 1;
    }
    if all_inliers <= f64::EPSILON {
        return usize::MAX;
    }
    let n = (1.0 - confidence).ln() / (1.0 - all_inliers).ln();
    if n.is_finite() { n.ceil().max(1.0) as usize } else { usize::MAX }
}

fn inlier_mask(h: &Matrix3<f64>, src: &[(f64, f64)], dst: &[(f64, f64)], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst)
        .map(|(&s, &d)| reprojection_error(h, s, d) < threshold)
        .collect()
}

fn count_true(mask: &[bool]) -> usize {
    mask.iter().filter(|&&b| b).count()
}

fn has_collinear_triple(points: &[(f64, f64)]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let (a, b, c) = (points[i], points[j], points[k]);
                let cross = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
                if cross.abs() < 1e-6 {
                    return true;
                }
            }
        }
    }
    false
}

/// Similarity transform moving the centroid to the origin with mean distance sqrt(2).
fn normalizing_transform(points: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn solve_normalized_dlt(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    let rows = (src.len() * 2).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (&s, &d)) in src.iter().zip(dst).enumerate() {
        let ps = t_src * Vector3::new(s.0, s.1, 1.0);
        let pd = t_dst * Vector3::new(d.0, d.1, 1.0);
        let (x1, y1) = (ps[0], ps[1]);
        let (x2, y2) = (pd[0], pd[1]);
        let r = 2 * i;
        a[(r, 0)] = -x1;
        a[(r, 1)] = -y1;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = x2 * x1;
        a[(r, 7)] = x2 * y1;
        a[(r, 8)] = x2;
        a[(r + 1, 3)] = -x1;
        a[(r + 1, 4)] = -y1;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = y2 * x1;
        a[(r + 1, 7)] = y2 * y1;
        a[(r + 1, 8)] = y2;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let smallest = svd.singular_values.imin();
    let h = v_t.row(smallest);
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let denormalized = t_dst.try_inverse()? * normalized * t_src;
    let scale = denormalized[(2, 2)];
    if scale.abs() < 1e-12 || !denormalized.iter().all(|v| v.is_finite()) {
        return None;
    }
    let matrix = denormalized / scale;
    if matrix.determinant().abs() < 1e-9 {
        return None;
    }
    Some(matrix)
}
