//! Anchor-point alignment via an exact 6-DOF affine transform.
//!
//! Three anchors per face (left-eye center, right-eye center, nose-tip
//! reference) give exactly six equations for the six affine unknowns, so the
//! transform is solved directly rather than by least squares.

use crate::types::{LandmarkSet, Point, Region};
use image::RgbImage;
use thiserror::Error;

/// Pivots smaller than this make the anchor system singular.
const SINGULAR_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum AlignError {
    #[error("invalid landmarks: {0} group is empty")]
    EmptyGroup(Region),
    #[error("invalid landmarks: anchor points are collinear")]
    DegenerateAnchors,
}

/// Left-eye center, right-eye center and nose reference point of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorTriple {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
}

impl AnchorTriple {
    /// Derive the anchors from a landmark set.
    ///
    /// Eye centers are the mean of each eye's points, truncated to whole
    /// pixels. The nose reference is the middle element (`len / 2`) of the
    /// nose-tip sequence, not its centroid.
    pub fn from_landmarks(landmarks: &LandmarkSet) -> Result<Self, AlignError> {
        let left_eye = centroid(landmarks.get(Region::LeftEye)).ok_or(AlignError::EmptyGroup(Region::LeftEye))?;
        let right_eye = centroid(landmarks.get(Region::RightEye)).ok_or(AlignError::EmptyGroup(Region::RightEye))?;
        let nose_tip = landmarks.get(Region::NoseTip);
        let nose = *nose_tip
            .get(nose_tip.len() / 2)
            .ok_or(AlignError::EmptyGroup(Region::NoseTip))?;

        Ok(Self { left_eye, right_eye, nose })
    }

    pub fn points(&self) -> [Point; 3] {
        [self.left_eye, self.right_eye, self.nose]
    }
}

fn centroid(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let sx: i64 = points.iter().map(|p| p.x as i64).sum();
    let sy: i64 = points.iter().map(|p| p.y as i64).sum();
    // `as` truncates toward zero.
    Some(Point::new((sx as f64 / n) as i32, (sy as f64 / n) as i32))
}

/// A 2×3 affine matrix, row-major:
/// ```text
/// | m0  m1  m2 |
/// | m3  m4  m5 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    m: [f64; 6],
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    pub fn from_matrix(m: [f64; 6]) -> Self {
        Self { m }
    }

    pub fn matrix(&self) -> [f64; 6] {
        self.m
    }

    /// Solve the unique transform mapping each `src[i]` onto `dst[i]`.
    ///
    /// Both output rows share the system `[x y 1] · row = target`, so it is
    /// solved once per row. Collinear points on either side fail with
    /// [`AlignError::DegenerateAnchors`]: collinear sources make the system
    /// singular, collinear targets make the solved transform non-invertible.
    pub fn from_points(src: &[(f64, f64); 3], dst: &[(f64, f64); 3]) -> Result<Self, AlignError> {
        let a = [
            [src[0].0, src[0].1, 1.0],
            [src[1].0, src[1].1, 1.0],
            [src[2].0, src[2].1, 1.0],
        ];
        let row_x = solve_3x3(&a, &[dst[0].0, dst[1].0, dst[2].0]).ok_or(AlignError::DegenerateAnchors)?;
        let row_y = solve_3x3(&a, &[dst[0].1, dst[1].1, dst[2].1]).ok_or(AlignError::DegenerateAnchors)?;

        let transform = Self {
            m: [row_x[0], row_x[1], row_x[2], row_y[0], row_y[1], row_y[2]],
        };
        if transform.inverse().is_none() {
            return Err(AlignError::DegenerateAnchors);
        }
        Ok(transform)
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.m;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    /// Inverse transform, or `None` if the linear part is singular.
    pub fn inverse(&self) -> Option<Self> {
        let [a, b, tx, c, d, ty] = self.m;
        let det = a * d - b * c;
        if det.abs() < SINGULAR_EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;
        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        Some(Self {
            m: [ia, ib, -(ia * tx + ib * ty), ic, id, -(ic * tx + id * ty)],
        })
    }
}

/// Compute the transform taking the source face's anchors onto the
/// destination face's anchors.
pub fn align(src: &LandmarkSet, dst: &LandmarkSet) -> Result<AffineTransform, AlignError> {
    let src_anchors = AnchorTriple::from_landmarks(src)?;
    let dst_anchors = AnchorTriple::from_landmarks(dst)?;

    let to_f64 = |p: Point| (p.x as f64, p.y as f64);
    let transform = AffineTransform::from_points(
        &src_anchors.points().map(to_f64),
        &dst_anchors.points().map(to_f64),
    )?;

    tracing::debug!(
        src = ?src_anchors,
        dst = ?dst_anchors,
        matrix = ?transform.matrix(),
        "anchor transform solved"
    );
    Ok(transform)
}

/// Solve a 3×3 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    // Augmented matrix [A | b]
    let mut m = [[0.0f64; 4]; 3];
    for i in 0..3 {
        m[i][..3].copy_from_slice(&a[i]);
        m[i][3] = b[i];
    }

    for col in 0..3 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..3 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < SINGULAR_EPSILON {
            return None;
        }

        for row in (col + 1)..3 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 3];
    for i in (0..3).rev() {
        x[i] = m[i][3];
        for j in (i + 1)..3 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Mirror index including the edge pixel: `fedcba|abcdef|fedcba`.
fn reflect(i: i64, n: i64) -> i64 {
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    if m >= n {
        period - 1 - m
    } else {
        m
    }
}

/// Warp `src` by `transform` into an `out_width × out_height` image.
///
/// Each output pixel is mapped back through the inverse transform and sampled
/// with bilinear interpolation. Samples outside `src` are mirrored back in,
/// a border mode the `imageproc` warps do not offer. A singular transform
/// yields an all-zero image.
pub fn warp_affine(src: &RgbImage, transform: &AffineTransform, out_width: u32, out_height: u32) -> RgbImage {
    let mut output = RgbImage::new(out_width, out_height);
    let Some(inv) = transform.inverse() else {
        return output;
    };

    let src_w = src.width() as i64;
    let src_h = src.height() as i64;
    if src_w == 0 || src_h == 0 {
        return output;
    }

    let sample = |x: i64, y: i64, c: usize| -> f64 {
        src.get_pixel(reflect(x, src_w) as u32, reflect(y, src_h) as u32)[c] as f64
    };

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let (sx, sy) = inv.apply(ox as f64, oy as f64);

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f64;
        let fy = sy - y0 as f64;

        for c in 0..3 {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            pixel[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}
