//! Per-channel mean color transfer under a mask.

use image::{GrayImage, RgbImage};

/// Default guard against division by a zero source mean.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Channel means used when the mask selects no pixels.
const EMPTY_MASK_MEAN: f64 = 1.0;

/// Mean of each channel over the in-region pixels of `mask`.
///
/// An empty mask yields `[1.0; 3]` instead of an undefined mean.
pub fn masked_channel_means(image: &RgbImage, mask: &GrayImage) -> [f64; 3] {
    let mut sums = [0.0f64; 3];
    let mut count = 0usize;

    for (px, m) in image.pixels().zip(mask.pixels()) {
        if m[0] == 0 {
            continue;
        }
        count += 1;
        for c in 0..3 {
            sums[c] += px[c] as f64;
        }
    }

    if count == 0 {
        return [EMPTY_MASK_MEAN; 3];
    }
    sums.map(|s| s / count as f64)
}

/// Scale each channel of `face` so its mean under `mask` matches the mean of
/// `destination` under the same mask.
///
/// Every pixel is scaled, not only the masked ones; values are rounded and
/// clipped to `0..=255`. A channel whose source mean is exactly zero is left
/// unchanged.
pub fn color_correct(face: &RgbImage, destination: &RgbImage, mask: &GrayImage, epsilon: f64) -> RgbImage {
    let src_mean = masked_channel_means(face, mask);
    let dst_mean = masked_channel_means(destination, mask);

    let mut ratios = [1.0f64; 3];
    for c in 0..3 {
        if src_mean[c] != 0.0 {
            ratios[c] = dst_mean[c] / (src_mean[c] + epsilon);
        }
    }

    tracing::debug!(?src_mean, ?dst_mean, ?ratios, "color correction");

    let mut corrected = face.clone();
    for px in corrected.pixels_mut() {
        for c in 0..3 {
            px[c] = (px[c] as f64 * ratios[c]).round().clamp(0.0, 255.0) as u8;
        }
    }
    corrected
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn half_mask(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| if x < w / 2 { Luma([255]) } else { Luma([0]) })
    }

    #[test]
    fn test_means_ignore_out_of_region_pixels() {
        let image = RgbImage::from_fn(4, 2, |x, _| if x < 2 { Rgb([100, 50, 10]) } else { Rgb([0, 0, 0]) });
        let means = masked_channel_means(&image, &half_mask(4, 2));
        assert_eq!(means, [100.0, 50.0, 10.0]);
    }

    #[test]
    fn test_empty_mask_means_default_to_one() {
        let image = RgbImage::from_pixel(3, 3, Rgb([90, 90, 90]));
        let mask = GrayImage::new(3, 3);
        assert_eq!(masked_channel_means(&image, &mask), [1.0; 3]);
    }

    #[test]
    fn test_identical_means_leave_face_unchanged() {
        let face = RgbImage::from_fn(6, 4, |x, y| Rgb([(x * 40) as u8, (y * 60 + 10) as u8, 255]));
        // Same pixels under the mask, different outside it.
        let mask = half_mask(6, 4);
        let destination = RgbImage::from_fn(6, 4, |x, y| {
            if x < 3 { *face.get_pixel(x, y) } else { Rgb([7, 7, 7]) }
        });
        let corrected = color_correct(&face, &destination, &mask, DEFAULT_EPSILON);
        assert_eq!(corrected, face);
    }

    #[test]
    fn test_scales_toward_destination_mean() {
        let face = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let destination = RgbImage::from_pixel(4, 4, Rgb([150, 50, 100]));
        let mask = GrayImage::from_pixel(4, 4, Luma([255]));
        let corrected = color_correct(&face, &destination, &mask, DEFAULT_EPSILON);
        assert!(corrected.pixels().all(|p| *p == Rgb([150, 50, 100])));
    }

    #[test]
    fn test_results_are_clipped() {
        let face = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([100, 100, 100]) } else { Rgb([250, 250, 250]) });
        let destination = RgbImage::from_pixel(2, 1, Rgb([200, 200, 200]));
        let mask = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 255 } else { 0 }]));
        let corrected = color_correct(&face, &destination, &mask, DEFAULT_EPSILON);
        assert_eq!(*corrected.get_pixel(0, 0), Rgb([200, 200, 200]));
        assert_eq!(*corrected.get_pixel(1, 0), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_zero_source_channel_is_not_scaled() {
        let face = RgbImage::from_pixel(2, 2, Rgb([0, 80, 80]));
        let destination = RgbImage::from_pixel(2, 2, Rgb([120, 80, 80]));
        let mask = GrayImage::from_pixel(2, 2, Luma([255]));
        let corrected = color_correct(&face, &destination, &mask, DEFAULT_EPSILON);
        assert!(corrected.pixels().all(|p| *p == Rgb([0, 80, 80])));
    }

    #[test]
    fn test_empty_mask_is_near_noop() {
        let face = RgbImage::from_pixel(3, 3, Rgb([10, 128, 250]));
        let destination = RgbImage::from_pixel(3, 3, Rgb([200, 0, 30]));
        let mask = GrayImage::new(3, 3);
        let corrected = color_correct(&face, &destination, &mask, DEFAULT_EPSILON);
        assert_eq!(corrected, face);
    }
}
