// THEORY:
// Dense optical flow after Farnebäck's two-frame method. Every pixel's
// neighbourhood is approximated by a quadratic polynomial
//
//     f(p) ≈ pᵀ A p + bᵀ p + c
//
// fitted by Gaussian-weighted least squares. If the second frame is the first
// shifted by `d`, the quadratic terms agree and the linear terms differ by
// `-2 A d`, so `d` falls out of a 2x2 system. Aggregating the per-pixel normal
// equations over a box window makes the solve robust, and running it
// coarse-to-fine over a pyramid lets it recover displacements larger than the
// polynomial neighbourhood.
//
// The returned field `d` satisfies `next(p + d(p)) ≈ prev(p)`, so sampling
// the next frame at `p + d(p)` aligns it with the previous one.

use crate::error::{PipelineError, Result};
use image::GrayImage;
use nalgebra::SMatrix;
use rayon::prelude::*;
use tracing::trace;

/// Pyramid levels whose shorter side would drop below this are not built.
const MIN_LEVEL_SIZE: usize = 16;

/// Added to the 2x2 determinant so textureless windows keep their prior.
const SOLVE_REGULARIZER: f64 = 1e-3;

/// Tuning for the Farnebäck estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowParams {
    /// Image scale between consecutive pyramid levels, in (0, 1).
    pub pyr_scale: f64,
    /// Number of pyramid levels, including the full-resolution one.
    pub levels: usize,
    /// Side of the box window the normal equations are averaged over.
    pub win_size: usize,
    /// Refinement passes per pyramid level.
    pub iterations: usize,
    /// Half-width of the polynomial fitting neighbourhood.
    pub poly_n: usize,
    /// Standard deviation of the Gaussian weighting the polynomial fit.
    pub poly_sigma: f64,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            win_size: 15,
            iterations: 3,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

impl FlowParams {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.pyr_scale > 0.0 && self.pyr_scale < 1.0) {
            return Err(format!("flow pyramid scale must be in (0, 1), got {}", self.pyr_scale));
        }
        if self.levels == 0 {
            return Err("flow pyramid needs at least one level".into());
        }
        if self.win_size == 0 {
            return Err("flow window size must be positive".into());
        }
        if self.iterations == 0 {
            return Err("flow needs at least one iteration per level".into());
        }
        if self.poly_n == 0 {
            return Err("polynomial neighbourhood must be positive".into());
        }
        if !(self.poly_sigma.is_finite() && self.poly_sigma > 0.0) {
            return Err(format!("polynomial sigma must be positive, got {}", self.poly_sigma));
        }
        Ok(())
    }
}

/// A per-pixel displacement field.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: u32,
    height: u32,
    dx: Vec<f32>,
    dy: Vec<f32>,
}

impl FlowField {
    pub fn zeros(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            dx: vec![0.0; len],
            dy: vec![0.0; len],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn at(&self, x: u32, y: u32) -> (f32, f32) {
        let i = y as usize * self.width as usize + x as usize;
        (self.dx[i], self.dy[i])
    }

    /// Mean Euclidean length of the displacement vectors.
    pub fn mean_magnitude(&self) -> f64 {
        if self.dx.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .dx
            .iter()
            .zip(&self.dy)
            .map(|(&x, &y)| ((x as f64).powi(2) + (y as f64).powi(2)).sqrt())
            .sum();
        total / self.dx.len() as f64
    }
}

/// A single-channel floating point image.
#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn clamped(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    /// Bilinear sample with replicated borders.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let row0 = y0 * self.width;
        let row1 = y1 * self.width;
        let top = self.data[row0 + x0] * (1.0 - fx) + self.data[row0 + x1] * fx;
        let bottom = self.data[row1 + x0] * (1.0 - fx) + self.data[row1 + x1] * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Separable Gaussian blur with replicated borders.
    fn gaussian_blur(&self, sigma: f64) -> Plane {
        if sigma <= 0.0 {
            return self.clone();
        }
        let radius = (sigma * 3.0).ceil() as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp() as f32)
            .collect();
        let sum: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= sum);

        let mut horizontal = Plane::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                horizontal.data[y * self.width + x] = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * self.clamped(x as isize + k as isize - radius, y as isize))
                    .sum();
            }
        }
        let mut out = Plane::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                out.data[y * self.width + x] = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * horizontal.clamped(x as isize, y as isize + k as isize - radius))
                    .sum();
            }
        }
        out
    }

    /// Anti-aliased resize to `width` x `height`.
    fn downscale(&self, width: usize, height: usize, scale: f64) -> Plane {
        let smoothed = self.gaussian_blur((1.0 / scale - 1.0) * 0.5);
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        let mut out = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                let src_y = (y as f32 + 0.5) * sy - 0.5;
                out.data[y * width + x] = smoothed.sample(src_x, src_y);
            }
        }
        out
    }

    /// Mean over a `(2 * half + 1)`-sided square window, replicated borders.
    fn box_mean(&self, half: usize) -> Plane {
        let h = half as isize;
        let norm = ((2 * half + 1) as f32).recip();
        let mut horizontal = Plane::new(self.width, self.height);
        for y in 0..self.height {
            let mut acc: f32 = (-h..=h).map(|dx| self.clamped(dx, y as isize)).sum();
            for x in 0..self.width {
                horizontal.data[y * self.width + x] = acc * norm;
                let xi = x as isize;
                acc += self.clamped(xi + h + 1, y as isize) - self.clamped(xi - h, y as isize);
            }
        }
        let mut out = Plane::new(self.width, self.height);
        for x in 0..self.width {
            let mut acc: f32 = (-h..=h).map(|dy| horizontal.clamped(x as isize, dy)).sum();
            for y in 0..self.height {
                out.data[y * self.width + x] = acc * norm;
                let yi = y as isize;
                acc += horizontal.clamped(x as isize, yi + h + 1) - horizontal.clamped(x as isize, yi - h);
            }
        }
        out
    }
}

/// Quadratic coefficients of every pixel's neighbourhood:
/// `A = [[xx, xy/2], [xy/2, yy]]`, `b = [x, y]`.
struct Expansion {
    x: Plane,
    y: Plane,
    xx: Plane,
    yy: Plane,
    xy: Plane,
}

/// Precomputed weighted least-squares projection onto the basis
/// `[1, x, y, x², y², xy]`.
struct PolyKernel {
    half: isize,
    /// One row per non-constant coefficient, one column per neighbourhood offset.
    rows: [Vec<f32>; 5],
}

impl PolyKernel {
    fn new(half: usize, sigma: f64) -> Option<Self> {
        let half = half as isize;
        let offsets: Vec<(f64, f64)> = (-half..=half)
            .flat_map(|dy| (-half..=half).map(move |dx| (dx as f64, dy as f64)))
            .collect();
        let basis = |(x, y): (f64, f64)| [1.0, x, y, x * x, y * y, x * y];
        let weight = |(x, y): (f64, f64)| (-(x * x + y * y) / (2.0 * sigma * sigma)).exp();

        let mut normal = SMatrix::<f64, 6, 6>::zeros();
        for &o in &offsets {
            let b = basis(o);
            let w = weight(o);
            for i in 0..6 {
                for j in 0..6 {
                    normal[(i, j)] += w * b[i] * b[j];
                }
            }
        }
        let inverse = normal.try_inverse()?;

        let mut rows: [Vec<f32>; 5] = Default::default();
        for (k, row) in rows.iter_mut().enumerate() {
            *row = offsets
                .iter()
                .map(|&o| {
                    let b = basis(o);
                    let w = weight(o);
                    let coeff: f64 = (0..6).map(|j| inverse[(k + 1, j)] * b[j]).sum();
                    (coeff * w) as f32
                })
                .collect();
        }
        Some(Self { half, rows })
    }

    fn expand(&self, plane: &Plane) -> Expansion {
        let (width, height) = (plane.width, plane.height);
        let side = (2 * self.half + 1) as usize;
        let mut coeffs: Vec<[f32; 5]> = vec![[0.0; 5]; width * height];
        coeffs
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    for dy in -self.half..=self.half {
                        for dx in -self.half..=self.half {
                            let v = plane.clamped(x as isize + dx, y as isize + dy);
                            let j = (dy + self.half) as usize * side + (dx + self.half) as usize;
                            for (k, c) in out.iter_mut().enumerate() {
                                *c += self.rows[k][j] * v;
                            }
                        }
                    }
                }
            });

        let split = |k: usize| Plane {
            width,
            height,
            data: coeffs.iter().map(|c| c[k]).collect(),
        };
        Expansion {
            x: split(0),
            y: split(1),
            xx: split(2),
            yy: split(3),
            xy: split(4),
        }
    }
}

/// Farnebäck dense optical flow.
pub struct FarnebackFlow {
    params: FlowParams,
    kernel: PolyKernel,
}

impl FarnebackFlow {
    pub fn new(params: FlowParams) -> Result<Self> {
        params.validate().map_err(PipelineError::InvalidConfig)?;
        let kernel = PolyKernel::new(params.poly_n, params.poly_sigma).ok_or_else(|| {
            PipelineError::InvalidConfig("polynomial expansion system is singular".into())
        })?;
        Ok(Self { params, kernel })
    }

    /// Flow from `prev` to `next`. Mismatched sizes yield an empty field of
    /// `prev`'s size.
    pub fn compute(&self, prev: &GrayImage, next: &GrayImage) -> FlowField {
        let (width, height) = prev.dimensions();
        if prev.dimensions() != next.dimensions() || width == 0 || height == 0 {
            return FlowField::zeros(width, height);
        }

        let prev_pyramid = self.pyramid(Plane::from_gray(prev));
        let next_pyramid = self.pyramid(Plane::from_gray(next));

        let mut flow: Option<(Plane, Plane)> = None;
        for (level, (p, n)) in prev_pyramid.iter().zip(&next_pyramid).enumerate().rev() {
            let (mut dx, mut dy) = match flow.take() {
                None => (Plane::new(p.width, p.height), Plane::new(p.width, p.height)),
                Some((cdx, cdy)) => upsample_flow(&cdx, &cdy, p.width, p.height),
            };
            let e1 = self.kernel.expand(p);
            let e2 = self.kernel.expand(n);
            for _ in 0..self.params.iterations {
                self.refine(&e1, &e2, &mut dx, &mut dy);
            }
            trace!(level, width = p.width, height = p.height, "flow level refined");
            flow = Some((dx, dy));
        }

        match flow {
            Some((dx, dy)) => FlowField {
                width,
                height,
                dx: dx.data,
                dy: dy.data,
            },
            None => FlowField::zeros(width, height),
        }
    }

    fn pyramid(&self, base: Plane) -> Vec<Plane> {
        let mut levels = vec![base];
        while levels.len() < self.params.levels {
            let Some(last) = levels.last() else { break };
            let width = (last.width as f64 * self.params.pyr_scale).round() as usize;
            let height = (last.height as f64 * self.params.pyr_scale).round() as usize;
            if width.min(height) < MIN_LEVEL_SIZE {
                break;
            }
            let next = last.downscale(width, height, self.params.pyr_scale);
            levels.push(next);
        }
        levels
    }

    /// One Farnebäck update of `(dx, dy)` in place.
    fn refine(&self, e1: &Expansion, e2: &Expansion, dx: &mut Plane, dy: &mut Plane) {
        let (width, height) = (dx.width, dx.height);
        let len = width * height;
        // Per-pixel normal equations: G = AᵀA (symmetric), h = AᵀΔb.
        let mut terms: Vec<[f32; 5]> = vec![[0.0; 5]; len];
        terms
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let i = y * width + x;
                    let (px, py) = (dx.data[i], dy.data[i]);
                    let tx = x as f32 + px;
                    let ty = y as f32 + py;
                    if tx < 0.0 || ty < 0.0 || tx > (width - 1) as f32 || ty > (height - 1) as f32 {
                        continue;
                    }

                    let a11 = 0.5 * (e1.xx.data[i] + e2.xx.sample(tx, ty));
                    let a22 = 0.5 * (e1.yy.data[i] + e2.yy.sample(tx, ty));
                    let a12 = 0.25 * (e1.xy.data[i] + e2.xy.sample(tx, ty));

                    let db1 = -0.5 * (e2.x.sample(tx, ty) - e1.x.data[i]) + a11 * px + a12 * py;
                    let db2 = -0.5 * (e2.y.sample(tx, ty) - e1.y.data[i]) + a12 * px + a22 * py;

                    *out = [
                        a11 * a11 + a12 * a12,
                        a12 * (a11 + a22),
                        a12 * a12 + a22 * a22,
                        a11 * db1 + a12 * db2,
                        a12 * db1 + a22 * db2,
                    ];
                }
            });

        let half = self.params.win_size / 2;
        let smoothed: Vec<Plane> = (0..5)
            .into_par_iter()
            .map(|k| {
                Plane {
                    width,
                    height,
                    data: terms.iter().map(|t| t[k]).collect(),
                }
                .box_mean(half)
            })
            .collect();
        let (g11, g12, g22, h1, h2) = (
            &smoothed[0],
            &smoothed[1],
            &smoothed[2],
            &smoothed[3],
            &smoothed[4],
        );

        for i in 0..len {
            let det = g11.data[i] as f64 * g22.data[i] as f64 - (g12.data[i] as f64).powi(2);
            let inv = 1.0 / (det + SOLVE_REGULARIZER);
            let ux = (g22.data[i] as f64 * h1.data[i] as f64 - g12.data[i] as f64 * h2.data[i] as f64) * inv;
            let uy = (g11.data[i] as f64 * h2.data[i] as f64 - g12.data[i] as f64 * h1.data[i] as f64) * inv;
            if ux.is_finite() && uy.is_finite() {
                dx.data[i] = ux as f32;
                dy.data[i] = uy as f32;
            }
        }
    }
}

/// Resamples a coarse flow onto a finer grid, rescaling the vectors.
fn upsample_flow(dx: &Plane, dy: &Plane, width: usize, height: usize) -> (Plane, Plane) {
    let sx = dx.width as f32 / width as f32;
    let sy = dx.height as f32 / height as f32;
    let mut out_x = Plane::new(width, height);
    let mut out_y = Plane::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let cx = (x as f32 + 0.5) * sx - 0.5;
            let cy = (y as f32 + 0.5) * sy - 0.5;
            out_x.data[y * width + x] = dx.sample(cx, cy) / sx;
            out_y.data[y * width + x] = dy.sample(cx, cy) / sy;
        }
    }
    (out_x, out_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn waves(width: u32, height: u32, shift_x: f32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let fx = x as f32 - shift_x;
            let v = 128.0 + 50.0 * (fx / 6.0).sin() + 50.0 * (y as f32 / 7.0).cos();
            Luma([v.round().clamp(0.0, 255.0) as u8])
        })
    }

    fn flow() -> FarnebackFlow {
        FarnebackFlow::new(FlowParams::default()).unwrap()
    }

    #[test]
    fn identical_frames_have_zero_flow() {
        let img = waves(64, 48, 0.0);
        let field = flow().compute(&img, &img);
        assert_eq!(field.dimensions(), (64, 48));
        assert_eq!(field.mean_magnitude(), 0.0);
    }

    #[test]
    fn uniform_frames_have_zero_flow() {
        let a = GrayImage::from_pixel(40, 30, Luma([77]));
        assert_eq!(flow().compute(&a, &a).mean_magnitude(), 0.0);
    }

    #[test]
    fn recovers_small_horizontal_shift() {
        let prev = waves(96, 72, 0.0);
        let next = waves(96, 72, 2.0);
        let field = flow().compute(&prev, &next);
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut n = 0.0;
        for y in 24..48 {
            for x in 32..64 {
                let (dx, dy) = field.at(x, y);
                sum_x += dx as f64;
                sum_y += dy as f64;
                n += 1.0;
            }
        }
        let (mean_x, mean_y) = (sum_x / n, sum_y / n);
        assert!((mean_x - 2.0).abs() < 0.5, "mean dx = {mean_x}");
        assert!(mean_y.abs() < 0.5, "mean dy = {mean_y}");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let params = FlowParams {
            pyr_scale: 1.5,
            ..FlowParams::default()
        };
        assert!(matches!(
            FarnebackFlow::new(params),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
