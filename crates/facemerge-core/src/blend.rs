//! Gradient-domain (Poisson) seamless cloning.
//!
//! The masked region of the source patch is re-solved so that its Laplacian
//! matches the source while its boundary matches the destination ("normal"
//! cloning: the guidance field is the source gradient only, never mixed with
//! destination gradients).

use crate::mask::bounding_rect;
use image::{GrayImage, RgbImage};

/// Unused neighbour slot.
const NO_NEIGHBOR: usize = usize::MAX;

/// Offsets of the 4-connected neighbours.
const NEIGHBORS: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// A seamless-blend backend.
pub trait SeamlessBlender {
    /// Clone the masked part of `source` into `destination` so that the
    /// bounding rectangle of the mask is centered on `center`.
    ///
    /// `source` and `mask` share dimensions; the result has the dimensions of
    /// `destination`.
    fn seamless_clone(
        &self,
        source: &RgbImage,
        destination: &RgbImage,
        mask: &GrayImage,
        center: (u32, u32),
    ) -> RgbImage;
}

/// Poisson solver using conjugate gradients on the 5-point Laplacian,
/// preconditioned with one symmetric SOR sweep.
///
/// The three channels are independent systems solved side by side in a fixed
/// order, so results are deterministic.
#[derive(Debug, Clone)]
pub struct PoissonBlender {
    pub max_iterations: usize,
    /// Stop once every residual `|4·u − Σ neighbours − b|` is below this.
    pub tolerance: f64,
}

impl Default for PoissonBlender {
    fn default() -> Self {
        Self {
            max_iterations: 20_000,
            tolerance: 1e-4,
        }
    }
}

/// One unknown pixel of the Poisson system.
struct Unknown {
    /// Destination coordinates.
    x: u32,
    y: u32,
    /// Indices of neighbouring unknowns, [`NO_NEIGHBOR`] when the neighbour is
    /// a fixed boundary pixel.
    neighbors: [usize; 4],
    /// Guidance divergence plus fixed boundary values.
    rhs: [f64; 3],
}

impl SeamlessBlender for PoissonBlender {
    fn seamless_clone(
        &self,
        source: &RgbImage,
        destination: &RgbImage,
        mask: &GrayImage,
        center: (u32, u32),
    ) -> RgbImage {
        let mut output = destination.clone();
        let Some(rect) = bounding_rect(mask) else {
            return output;
        };

        // Translation from source to destination coordinates.
        let dx = center.0 as i64 - (rect.width / 2) as i64 - rect.x as i64;
        let dy = center.1 as i64 - (rect.height / 2) as i64 - rect.y as i64;

        let (dst_w, dst_h) = (destination.width() as i64, destination.height() as i64);
        let (src_w, src_h) = (source.width() as i64, source.height() as i64);

        // Unknowns are masked pixels whose destination position has all four
        // neighbours inside the destination image.
        let rect_w = rect.width as usize;
        let mut index = vec![NO_NEIGHBOR; rect_w * rect.height as usize];
        let mut cells: Vec<(i64, i64)> = Vec::new();
        for sy in rect.y..rect.y + rect.height {
            for sx in rect.x..rect.x + rect.width {
                if mask.get_pixel(sx, sy)[0] == 0 {
                    continue;
                }
                let (tx, ty) = (sx as i64 + dx, sy as i64 + dy);
                if tx < 1 || ty < 1 || tx >= dst_w - 1 || ty >= dst_h - 1 {
                    continue;
                }
                index[(sy - rect.y) as usize * rect_w + (sx - rect.x) as usize] = cells.len();
                cells.push((sx as i64, sy as i64));
            }
        }

        if cells.is_empty() {
            return output;
        }

        let lookup = |sx: i64, sy: i64| -> usize {
            if sx < rect.x as i64
                || sy < rect.y as i64
                || sx >= (rect.x + rect.width) as i64
                || sy >= (rect.y + rect.height) as i64
            {
                return NO_NEIGHBOR;
            }
            index[(sy - rect.y as i64) as usize * rect_w + (sx - rect.x as i64) as usize]
        };

        let in_source = |x: i64, y: i64| x >= 0 && y >= 0 && x < src_w && y < src_h;
        let src_px = |x: i64, y: i64| -> [f64; 3] {
            let p = source.get_pixel(x as u32, y as u32);
            [p[0] as f64, p[1] as f64, p[2] as f64]
        };

        let mut unknowns = Vec::with_capacity(cells.len());
        // Mean jump between the destination boundary and the source just
        // across it; shifting the source by it gives the starting guess.
        let mut seam_sum = [0.0f64; 3];
        let mut seam_count = 0usize;

        for &(sx, sy) in &cells {
            let g = src_px(sx, sy);
            let mut neighbors = [NO_NEIGHBOR; 4];
            let mut rhs = [0.0f64; 3];

            for (k, (ox, oy)) in NEIGHBORS.iter().enumerate() {
                let (nx, ny) = (sx + ox, sy + oy);

                // Guidance: source gradient, zero across the source border.
                let gn = if in_source(nx, ny) { src_px(nx, ny) } else { g };
                for c in 0..3 {
                    rhs[c] += g[c] - gn[c];
                }

                let n = lookup(nx, ny);
                if n == NO_NEIGHBOR {
                    let d = destination.get_pixel((nx + dx) as u32, (ny + dy) as u32);
                    for c in 0..3 {
                        rhs[c] += d[c] as f64;
                        seam_sum[c] += d[c] as f64 - gn[c];
                    }
                    seam_count += 1;
                } else {
                    neighbors[k] = n;
                }
            }

            unknowns.push(Unknown {
                x: (sx + dx) as u32,
                y: (sy + dy) as u32,
                neighbors,
                rhs,
            });
        }

        let shift = seam_sum.map(|s| s / seam_count.max(1) as f64);
        let mut solution: Vec<[f64; 3]> = cells
            .iter()
            .map(|&(sx, sy)| {
                let g = src_px(sx, sy);
                [g[0] + shift[0], g[1] + shift[1], g[2] + shift[2]]
            })
            .collect();

        let span = rect.width.max(rect.height) as f64;
        let omega = 2.0 / (1.0 + std::f64::consts::PI / span.max(2.0));
        let iterations = self.solve(&unknowns, omega, &mut solution);
        tracing::debug!(unknowns = unknowns.len(), iterations, "poisson blend solved");

        for (u, value) in unknowns.iter().zip(solution.iter()) {
            let px = output.get_pixel_mut(u.x, u.y);
            for c in 0..3 {
                px[c] = value[c].round().clamp(0.0, 255.0) as u8;
            }
        }

        output
    }
}

/// `out = A·v` for the system matrix (4 on the diagonal, −1 per unknown
/// neighbour).
fn apply_laplacian(unknowns: &[Unknown], v: &[[f64; 3]], out: &mut [[f64; 3]]) {
    for (i, u) in unknowns.iter().enumerate() {
        let mut acc = v[i].map(|c| 4.0 * c);
        for &n in &u.neighbors {
            if n != NO_NEIGHBOR {
                for c in 0..3 {
                    acc[c] -= v[n][c];
                }
            }
        }
        out[i] = acc;
    }
}

/// `z = M⁻¹·r` for the SSOR preconditioner with relaxation `omega`. Unknowns
/// are in raster order, so a forward then a backward sweep over the index
/// order is a symmetric Gauss-Seidel pass.
fn precondition(unknowns: &[Unknown], omega: f64, r: &[[f64; 3]], z: &mut [[f64; 3]]) {
    let diag = 4.0 / omega;
    for (i, u) in unknowns.iter().enumerate() {
        let mut acc = r[i];
        for &n in &u.neighbors {
            if n < i {
                for c in 0..3 {
                    acc[c] += z[n][c];
                }
            }
        }
        z[i] = acc.map(|a| a / diag);
    }
    for z_i in z.iter_mut() {
        *z_i = z_i.map(|v| v * diag);
    }
    for (i, u) in unknowns.iter().enumerate().rev() {
        let mut acc = z[i];
        for &n in &u.neighbors {
            if n != NO_NEIGHBOR && n > i {
                for c in 0..3 {
                    acc[c] += z[n][c];
                }
            }
        }
        z[i] = acc.map(|a| a / diag);
    }
    let scale = (2.0 - omega) / omega;
    for z_i in z.iter_mut() {
        *z_i = z_i.map(|v| v * scale);
    }
}

fn dot(a: &[[f64; 3]], b: &[[f64; 3]]) -> [f64; 3] {
    let mut sum = [0.0f64; 3];
    for (x, y) in a.iter().zip(b) {
        for c in 0..3 {
            sum[c] += x[c] * y[c];
        }
    }
    sum
}

fn max_abs(v: &[[f64; 3]]) -> [f64; 3] {
    let mut max = [0.0f64; 3];
    for x in v {
        for c in 0..3 {
            max[c] = max[c].max(x[c].abs());
        }
    }
    max
}

impl PoissonBlender {
    /// Preconditioned conjugate-gradient solve of `A·x = b` starting from
    /// `x`; returns the number of iterations taken.
    fn solve(&self, unknowns: &[Unknown], omega: f64, x: &mut [[f64; 3]]) -> usize {
        let n = unknowns.len();
        let mut ap = vec![[0.0f64; 3]; n];
        let mut z = vec![[0.0f64; 3]; n];

        apply_laplacian(unknowns, x, &mut ap);
        let mut r: Vec<[f64; 3]> = unknowns
            .iter()
            .zip(&ap)
            .map(|(u, a)| [u.rhs[0] - a[0], u.rhs[1] - a[1], u.rhs[2] - a[2]])
            .collect();
        precondition(unknowns, omega, &r, &mut z);
        let mut p = z.clone();
        let mut rz = dot(&r, &z);

        for iteration in 0..self.max_iterations {
            let residual = max_abs(&r);
            let done = residual.map(|m| m < self.tolerance);
            if done.iter().all(|d| *d) {
                return iteration;
            }

            apply_laplacian(unknowns, &p, &mut ap);
            let pap = dot(&p, &ap);

            let mut alpha = [0.0f64; 3];
            for c in 0..3 {
                if !done[c] && pap[c] > 0.0 {
                    alpha[c] = rz[c] / pap[c];
                }
            }
            for i in 0..n {
                for c in 0..3 {
                    x[i][c] += alpha[c] * p[i][c];
                    r[i][c] -= alpha[c] * ap[i][c];
                }
            }

            precondition(unknowns, omega, &r, &mut z);
            let rz_next = dot(&r, &z);
            let mut beta = [0.0f64; 3];
            for c in 0..3 {
                if rz[c] > 0.0 {
                    beta[c] = rz_next[c] / rz[c];
                }
            }
            for i in 0..n {
                for c in 0..3 {
                    p[i][c] = z[i][c] + beta[c] * p[i][c];
                }
            }
            rz = rz_next;
        }

        tracing::warn!(
            max_iterations = self.max_iterations,
            residual = ?max_abs(&r),
            "poisson blend did not converge"
        );
        self.max_iterations
    }
}

/// Blend center: the center of the mask's bounding rectangle (not its pixel
/// centroid). `None` for an empty mask.
pub fn blend_center(mask: &GrayImage) -> Option<(u32, u32)> {
    bounding_rect(mask).map(|r| r.center())
}

/// Seamlessly composite `face` into `destination` under `mask`, centered on
/// the mask's bounding rectangle. An empty mask returns the destination
/// unchanged.
pub fn blend<B: SeamlessBlender + ?Sized>(
    blender: &B,
    face: &RgbImage,
    destination: &RgbImage,
    mask: &GrayImage,
) -> RgbImage {
    match blend_center(mask) {
        Some(center) => blender.seamless_clone(face, destination, mask, center),
        None => destination.clone(),
    }
}
