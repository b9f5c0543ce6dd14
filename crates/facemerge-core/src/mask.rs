//! Face-region masks built from the convex hull of the landmark points.

use crate::alignment::AffineTransform;
use crate::types::{LandmarkSet, Point, Region};
use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::{draw_line_segment_mut, draw_polygon_mut};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::convex_hull;
use imageproc::point::Point as HullPoint;

pub const IN_REGION: u8 = 255;
pub const OUT_OF_REGION: u8 = 0;

/// Regions whose points make up the face hull.
pub const FACE_REGIONS: [Region; 9] = Region::ALL;

/// A binary face mask and the hull it was rasterized from.
#[derive(Debug, Clone)]
pub struct FaceMask {
    pub mask: GrayImage,
    /// Hull vertices in image coordinates.
    pub hull: Vec<Point>,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Geometric center with integer halving: `(x + w/2, y + h/2)`.
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Build the face mask for `image` from its landmarks.
///
/// Returns `None` when none of the face regions has any point.
pub fn build_mask(image: &RgbImage, landmarks: &LandmarkSet) -> Option<FaceMask> {
    let mut points = landmarks.gather(&FACE_REGIONS);
    if points.is_empty() {
        return None;
    }
    points.sort_by_key(|p| (p.x, p.y));
    points.dedup();

    let input: Vec<HullPoint<i32>> = points.iter().map(|p| HullPoint::new(p.x, p.y)).collect();
    let hull: Vec<HullPoint<i32>> = convex_hull(&input[..]);
    let hull: Vec<Point> = hull.iter().map(|p| Point::new(p.x, p.y)).collect();

    let mut mask = GrayImage::new(image.width(), image.height());
    fill_convex_polygon(&mut mask, &hull);

    tracing::debug!(
        points = points.len(),
        hull = hull.len(),
        area = region_area(&mask),
        "face mask built"
    );
    Some(FaceMask { mask, hull })
}

/// Rasterize a convex polygon, boundary included, clipping to the image.
///
/// Hulls of one or two points (all landmarks coincident or collinear) are
/// drawn as a pixel or a segment; `draw_polygon_mut` needs a closed area.
pub fn fill_convex_polygon(mask: &mut GrayImage, hull: &[Point]) {
    let color = Luma([IN_REGION]);
    match hull {
        [] => {}
        [p] => {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < mask.width() && (p.y as u32) < mask.height() {
                mask.put_pixel(p.x as u32, p.y as u32, color);
            }
        }
        [a, b] => draw_line_segment_mut(mask, (a.x as f32, a.y as f32), (b.x as f32, b.y as f32), color),
        _ => {
            let mut poly: Vec<HullPoint<i32>> = hull.iter().map(|p| HullPoint::new(p.x, p.y)).collect();
            // The polygon is closed implicitly; an explicit closing vertex is rejected.
            if poly.first() == poly.last() {
                poly.pop();
            }
            draw_polygon_mut(mask, &poly, color);
        }
    }
}

/// Binarize in place: values strictly above `threshold` become in-region.
pub fn binarize(mask: &mut GrayImage, threshold: u8) {
    for p in mask.pixels_mut() {
        p[0] = if p[0] > threshold { IN_REGION } else { OUT_OF_REGION };
    }
}

/// Warp a mask into another image's coordinate space (bilinear, zero
/// outside) and re-binarize it to remove interpolation fringing.
pub fn warp_mask(
    mask: &GrayImage,
    transform: &AffineTransform,
    width: u32,
    height: u32,
    threshold: u8,
) -> GrayImage {
    let mut warped = GrayImage::new(width, height);
    let [a, b, c, d, e, f] = transform.matrix();
    let matrix = [a as f32, b as f32, c as f32, d as f32, e as f32, f as f32, 0.0, 0.0, 1.0];
    let Some(projection) = Projection::from_matrix(matrix) else {
        return warped;
    };
    warp_into(mask, &projection, Interpolation::Bilinear, Luma([OUT_OF_REGION]), &mut warped);
    binarize(&mut warped, threshold);
    warped
}

/// Number of in-region pixels.
pub fn region_area(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Minimal rectangle containing every in-region pixel, or `None` if empty.
pub fn bounding_rect(mask: &GrayImage) -> Option<Rect> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut any = false;

    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        any = true;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    any.then(|| Rect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}
