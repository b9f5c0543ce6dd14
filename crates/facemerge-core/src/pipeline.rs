//! Merge orchestrator: extract → align → mask → warp → color match → blend.

use crate::alignment::{self, warp_affine, AffineTransform, AlignError};
use crate::blend::{self, PoissonBlender, SeamlessBlender};
use crate::color::{self, DEFAULT_EPSILON};
use crate::extractor::{ExtractError, LandmarkDetector, LandmarkExtractor};
use crate::mask::{self, build_mask, FaceMask};
use image::{GrayImage, ImageError, ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default cut-off for re-binarizing the warped source mask.
pub const DEFAULT_MASK_THRESHOLD: u8 = 10;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("no face detected in source or target")]
    NoFaceDetected,
    #[error("{0}")]
    InvalidLandmarks(String),
    #[error("landmark detection failed: {0}")]
    Detector(#[from] ExtractError),
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<AlignError> for MergeError {
    fn from(e: AlignError) -> Self {
        MergeError::InvalidLandmarks(e.to_string())
    }
}

impl MergeError {
    fn image(path: &Path, source: ImageError) -> Self {
        match source {
            ImageError::IoError(source) => MergeError::Io { path: path.to_path_buf(), source },
            source => MergeError::Image { path: path.to_path_buf(), source },
        }
    }
}

/// Tunables for one merge.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Warped-mask values strictly above this become in-region.
    pub mask_threshold: u8,
    /// Added to the source channel mean before dividing.
    pub color_epsilon: f64,
    /// Iteration limit for the Poisson solver.
    pub blend_max_iterations: usize,
    /// Largest Poisson residual accepted as converged.
    pub blend_tolerance: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            mask_threshold: DEFAULT_MASK_THRESHOLD,
            color_epsilon: DEFAULT_EPSILON,
            blend_max_iterations: PoissonBlender::default().max_iterations,
            blend_tolerance: PoissonBlender::default().tolerance,
        }
    }
}

/// Face merge pipeline over a caller-supplied detector and blender.
///
/// The detector is constructed by the caller and reused across merges.
pub struct FaceMerger<D, B = PoissonBlender> {
    extractor: LandmarkExtractor<D>,
    blender: B,
    options: MergeOptions,
}

impl<D: LandmarkDetector> FaceMerger<D, PoissonBlender> {
    pub fn new(detector: D) -> Self {
        Self::with_options(detector, MergeOptions::default())
    }

    pub fn with_options(detector: D, options: MergeOptions) -> Self {
        let blender = PoissonBlender {
            max_iterations: options.blend_max_iterations,
            tolerance: options.blend_tolerance,
        };
        Self::with_blender(detector, blender, options)
    }
}

impl<D: LandmarkDetector, B: SeamlessBlender> FaceMerger<D, B> {
    pub fn with_blender(detector: D, blender: B, options: MergeOptions) -> Self {
        Self {
            extractor: LandmarkExtractor::new(detector),
            blender,
            options,
        }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge the source face onto the destination face of two files and write
    /// the result to `result_path`.
    ///
    /// Nothing is written unless every stage succeeds.
    pub fn merge(
        &mut self,
        source_path: &Path,
        destination_path: &Path,
        result_path: &Path,
    ) -> Result<PathBuf, MergeError> {
        let source = load_rgb(source_path)?;
        let destination = load_rgb(destination_path)?;

        let merged = self.merge_images(&source, &destination)?;

        save_atomic(&merged, result_path)?;
        tracing::info!(
            source = %source_path.display(),
            destination = %destination_path.display(),
            result = %result_path.display(),
            width = merged.width(),
            height = merged.height(),
            "merge complete"
        );
        Ok(result_path.to_path_buf())
    }

    /// In-memory merge. The output has the destination's dimensions.
    pub fn merge_images(&mut self, source: &RgbImage, destination: &RgbImage) -> Result<RgbImage, MergeError> {
        let stages = self.prepare(source, destination)?;
        Ok(blend::blend(&self.blender, &stages.corrected_face, destination, &stages.warped_mask))
    }

    /// Every stage up to, but not including, the blend.
    pub fn prepare(&mut self, source: &RgbImage, destination: &RgbImage) -> Result<MergeStages, MergeError> {
        let src_landmarks = self.extractor.extract(source)?;
        let dst_landmarks = self.extractor.extract(destination)?;

        let (src_landmarks, dst_landmarks) = match (src_landmarks, dst_landmarks) {
            (Some(s), Some(d)) => (s, d),
            (s, d) => {
                tracing::warn!(
                    source_face = s.is_some(),
                    destination_face = d.is_some(),
                    "merge aborted: face missing"
                );
                return Err(MergeError::NoFaceDetected);
            }
        };

        let transform = alignment::align(&src_landmarks, &dst_landmarks)?;

        let (width, height) = destination.dimensions();
        let destination_mask = build_mask(destination, &dst_landmarks)
            .ok_or_else(|| MergeError::InvalidLandmarks("destination face has no mask points".into()))?;
        let src_mask = build_mask(source, &src_landmarks)
            .ok_or_else(|| MergeError::InvalidLandmarks("source face has no mask points".into()))?;

        let warped_face = warp_affine(source, &transform, width, height);
        let warped_mask = mask::warp_mask(&src_mask.mask, &transform, width, height, self.options.mask_threshold);

        tracing::debug!(
            destination_area = mask::region_area(&destination_mask.mask),
            warped_source_area = mask::region_area(&warped_mask),
            "face masks ready"
        );

        let corrected_face = color::color_correct(&warped_face, destination, &warped_mask, self.options.color_epsilon);
        Ok(MergeStages {
            transform,
            destination_mask,
            warped_mask,
            corrected_face,
        })
    }
}

/// Intermediate products of one merge, in destination coordinates.
#[derive(Debug, Clone)]
pub struct MergeStages {
    pub transform: AffineTransform,
    /// Hull mask of the destination face; validated, not used for blending.
    pub destination_mask: FaceMask,
    /// Source hull mask warped and re-binarized; drives color and blend.
    pub warped_mask: GrayImage,
    /// Warped source face after color correction.
    pub corrected_face: RgbImage,
}

fn load_rgb(path: &Path) -> Result<RgbImage, MergeError> {
    let image = image::open(path).map_err(|e| MergeError::image(path, e))?;
    Ok(image.to_rgb8())
}

/// Encode next to `path` and rename into place, so a failed encode never
/// leaves a partial file at `path`.
///
/// The temporary name is derived from the result name and the process id
/// only; concurrent merges within one process must use distinct result paths.
fn save_atomic(image: &RgbImage, path: &Path) -> Result<(), MergeError> {
    let format = ImageFormat::from_path(path).map_err(|e| MergeError::image(path, e))?;

    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    if let Err(e) = image.save_with_format(&tmp, format) {
        let _ = std::fs::remove_file(&tmp);
        return Err(MergeError::image(path, e));
    }
    std::fs::rename(&tmp, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp);
        MergeError::Io { path: path.to_path_buf(), source }
    })
}

/// Result file name for a capture merged onto a target:
/// `result_<capture>_on_<target>.png`, using only the final path components.
pub fn result_file_name(capture: &Path, target: &Path) -> String {
    let name = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    format!("result_{}_on_{}.png", name(capture), name(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LandmarkSet, Point, Region};
    use image::Rgb;

    /// Synthetic detector: a face whose geometry scales with the image,
    /// reported only for images whose top-left pixel is not pure black.
    struct SyntheticDetector {
        calls: usize,
    }

    fn synthetic_face(width: u32, height: u32) -> LandmarkSet {
        let p = |fx: f32, fy: f32| Point::from_f32(fx * width as f32, fy * height as f32);
        LandmarkSet::new()
            .with(Region::Chin, vec![p(0.30, 0.45), p(0.33, 0.65), p(0.42, 0.78), p(0.50, 0.80), p(0.58, 0.78), p(0.67, 0.65), p(0.70, 0.45)])
            .with(Region::LeftEyebrow, vec![p(0.34, 0.35), p(0.38, 0.33), p(0.43, 0.34)])
            .with(Region::RightEyebrow, vec![p(0.57, 0.34), p(0.62, 0.33), p(0.66, 0.35)])
            .with(Region::NoseBridge, vec![p(0.50, 0.40), p(0.50, 0.46)])
            .with(Region::NoseTip, vec![p(0.46, 0.55), p(0.48, 0.56), p(0.50, 0.57), p(0.52, 0.56), p(0.54, 0.55)])
            .with(Region::LeftEye, vec![p(0.37, 0.42), p(0.40, 0.40), p(0.43, 0.42), p(0.40, 0.44)])
            .with(Region::RightEye, vec![p(0.57, 0.42), p(0.60, 0.40), p(0.63, 0.42), p(0.60, 0.44)])
            .with(Region::TopLip, vec![p(0.44, 0.66), p(0.50, 0.64), p(0.56, 0.66)])
            .with(Region::BottomLip, vec![p(0.56, 0.66), p(0.50, 0.70), p(0.44, 0.66)])
    }

    impl LandmarkDetector for SyntheticDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
            self.calls += 1;
            if *image.get_pixel(0, 0) == Rgb([0, 0, 0]) {
                return Ok(Vec::new());
            }
            Ok(vec![synthetic_face(image.width(), image.height())])
        }
    }

    fn merger() -> FaceMerger<SyntheticDetector> {
        FaceMerger::new(SyntheticDetector { calls: 0 })
    }

    fn portrait(width: u32, height: u32, skin: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let dx = x as f32 / width as f32 - 0.5;
            let dy = y as f32 / height as f32 - 0.55;
            if dx * dx + dy * dy < 0.05 {
                let shade = ((x + y) % 17) as u8;
                Rgb([skin[0].saturating_add(shade), skin[1], skin[2].saturating_sub(shade)])
            } else {
                Rgb([30, (y % 200) as u8 + 20, 90])
            }
        })
    }

    fn faceless(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([0, 0, 0]))
    }

    #[test]
    fn test_merge_images_keeps_destination_shape() {
        let mut merger = merger();
        let source = portrait(60, 40, [200, 150, 120]);
        let destination = portrait(80, 60, [150, 110, 90]);
        let out = merger.merge_images(&source, &destination).unwrap();
        assert_eq!(out.dimensions(), (80, 60));
        assert_ne!(out, destination, "face region should change");
    }

    #[test]
    fn test_no_face_in_either_image() {
        let mut merger = merger();
        let face = portrait(40, 40, [200, 150, 120]);
        let err = merger.merge_images(&faceless(40, 40), &face).unwrap_err();
        assert!(matches!(err, MergeError::NoFaceDetected));
        let err = merger.merge_images(&face, &faceless(40, 40)).unwrap_err();
        assert!(matches!(err, MergeError::NoFaceDetected));
    }

    #[test]
    fn test_missing_eye_group_is_invalid_landmarks() {
        struct NoEyes;
        impl LandmarkDetector for NoEyes {
            fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
                let mut face = synthetic_face(image.width(), image.height());
                face.insert(Region::LeftEye, Vec::new());
                Ok(vec![face])
            }
        }
        let mut merger = FaceMerger::new(NoEyes);
        let image = portrait(40, 40, [200, 150, 120]);
        let err = merger.merge_images(&image, &image).unwrap_err();
        assert!(matches!(&err, MergeError::InvalidLandmarks(msg) if msg.contains("left_eye")), "{err}");
    }

    #[test]
    fn test_merge_writes_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        let dst_path = dir.path().join("target.png");
        let out_path = dir.path().join("result.png");
        portrait(60, 40, [200, 150, 120]).save(&src_path).unwrap();
        portrait(80, 60, [150, 110, 90]).save(&dst_path).unwrap();

        let mut merger = merger();
        let returned = merger.merge(&src_path, &dst_path, &out_path).unwrap();
        assert_eq!(returned, out_path);

        let written = image::open(&out_path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (80, 60));

        // Only the result is left behind; no temporary files.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        let dst_path = dir.path().join("target.png");
        portrait(60, 40, [200, 150, 120]).save(&src_path).unwrap();
        portrait(80, 60, [150, 110, 90]).save(&dst_path).unwrap();

        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        merger().merge(&src_path, &dst_path, &first).unwrap();
        merger().merge(&src_path, &dst_path, &second).unwrap();

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[test]
    fn test_repeated_merge_to_same_path_replaces_result() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        let dst_path = dir.path().join("target.png");
        let out_path = dir.path().join("result.png");
        portrait(60, 40, [200, 150, 120]).save(&src_path).unwrap();
        portrait(80, 60, [150, 110, 90]).save(&dst_path).unwrap();

        let mut merger = merger();
        merger.merge(&src_path, &dst_path, &out_path).unwrap();
        let first = std::fs::read(&out_path).unwrap();
        merger.merge(&src_path, &dst_path, &out_path).unwrap();

        assert_eq!(std::fs::read(&out_path).unwrap(), first);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 3, "temporary file left behind");
    }

    #[test]
    fn test_no_face_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        let dst_path = dir.path().join("target.png");
        let out_path = dir.path().join("result.png");
        faceless(40, 30).save(&src_path).unwrap();
        portrait(80, 60, [150, 110, 90]).save(&dst_path).unwrap();

        let err = merger().merge(&src_path, &dst_path, &out_path).unwrap_err();
        assert!(matches!(err, MergeError::NoFaceDetected));
        assert!(!out_path.exists());
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.png");
        let out_path = dir.path().join("result.png");
        let err = merger().merge(&missing, &missing, &out_path).unwrap_err();
        assert!(matches!(err, MergeError::Io { .. }), "{err:?}");
        assert!(!out_path.exists());
    }

    #[test]
    fn test_unknown_output_extension_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        portrait(40, 40, [200, 150, 120]).save(&src_path).unwrap();
        let out_path = dir.path().join("result.unknown");

        let err = merger().merge(&src_path, &src_path, &out_path).unwrap_err();
        assert!(matches!(err, MergeError::Image { .. }), "{err:?}");
        assert!(!out_path.exists());
    }

    #[test]
    fn test_collinear_destination_anchors_fail_merge() {
        /// Destination (80 wide) eyes and nose tip share one row.
        struct FlatDestination;
        impl LandmarkDetector for FlatDestination {
            fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
                let mut face = synthetic_face(image.width(), image.height());
                if image.width() == 80 {
                    face.insert(Region::LeftEye, vec![Point::new(20, 25)]);
                    face.insert(Region::RightEye, vec![Point::new(50, 25)]);
                    face.insert(Region::NoseTip, vec![Point::new(35, 25)]);
                }
                Ok(vec![face])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("capture.png");
        let dst_path = dir.path().join("target.png");
        let out_path = dir.path().join("result.png");
        portrait(60, 40, [200, 150, 120]).save(&src_path).unwrap();
        portrait(80, 60, [150, 110, 90]).save(&dst_path).unwrap();

        let mut merger = FaceMerger::new(FlatDestination);
        let err = merger.merge(&src_path, &dst_path, &out_path).unwrap_err();
        assert!(matches!(&err, MergeError::InvalidLandmarks(msg) if msg.contains("collinear")), "{err}");
        assert!(!out_path.exists());
    }

    #[test]
    fn test_scenario_600x400_onto_800x600() {
        // Smooth skin gradients; the source carries a dark spot below the
        // nose so interior contrast can be traced through the blend.
        let spot = |x: u32, y: u32| (288..312).contains(&x) && (236..260).contains(&y);
        let source = RgbImage::from_fn(600, 400, |x, y| {
            if spot(x, y) {
                Rgb([60, 40, 30])
            } else {
                Rgb([(200 + x / 60) as u8, (150 + y / 50) as u8, 120])
            }
        });
        let destination = RgbImage::from_fn(800, 600, |x, y| Rgb([(90 + x / 40) as u8, 110, (70 + y / 30) as u8]));

        let mut merger = merger();
        let stages = merger.prepare(&source, &destination).unwrap();
        assert_eq!(merger.extractor.detector_mut().calls, 2);

        // Both faces have the same relative geometry, so the warped source
        // mask lands on the destination mask.
        let dst_area = mask::region_area(&stages.destination_mask.mask);
        let warped_area = mask::region_area(&stages.warped_mask);
        assert!(dst_area > 50_000, "destination area {dst_area}");
        assert!(warped_area > 50_000, "warped area {warped_area}");
        let mismatched = stages
            .destination_mask
            .mask
            .pixels()
            .zip(stages.warped_mask.pixels())
            .filter(|(a, b)| a[0] != b[0])
            .count();
        assert!(mismatched * 10 < dst_area, "{mismatched} of {dst_area} pixels differ");

        let out = blend::blend(&merger.blender, &stages.corrected_face, &destination, &stages.warped_mask);
        assert_eq!(out.dimensions(), (800, 600));
        assert_eq!(out.get_pixel(5, 5), destination.get_pixel(5, 5));

        // No visible seam: the mask's outer ring follows the destination.
        let in_mask = |x: i64, y: i64| {
            x >= 0 && y >= 0 && x < 800 && y < 600 && stages.warped_mask.get_pixel(x as u32, y as u32)[0] > 0
        };
        let mut ring = 0;
        for (x, y, p) in out.enumerate_pixels() {
            let (xi, yi) = (x as i64, y as i64);
            if !in_mask(xi, yi) {
                assert_eq!(p, destination.get_pixel(x, y), "({x}, {y}) outside the mask changed");
                continue;
            }
            let edge = !(in_mask(xi - 1, yi) && in_mask(xi + 1, yi) && in_mask(xi, yi - 1) && in_mask(xi, yi + 1));
            if !edge {
                continue;
            }
            ring += 1;
            let d = destination.get_pixel(x, y);
            for c in 0..3 {
                assert!((p[c] as i32 - d[c] as i32).abs() <= 4, "seam at ({x}, {y}): {p:?} vs {d:?}");
            }
        }
        assert!(ring > 500, "ring {ring}");

        // Inside, the spot keeps its contrast against nearby skin.
        let locate = |sx: f64, sy: f64| {
            let (x, y) = stages.transform.apply(sx, sy);
            (x.round() as u32, y.round() as u32)
        };
        let (spot_x, spot_y) = locate(300.0, 248.0);
        let (skin_x, skin_y) = locate(250.0, 248.0);
        assert!(in_mask(spot_x as i64, spot_y as i64) && in_mask(skin_x as i64, skin_y as i64));
        let corrected = &stages.corrected_face;
        for c in 0..3 {
            let want = corrected.get_pixel(skin_x, skin_y)[c] as i32 - corrected.get_pixel(spot_x, spot_y)[c] as i32;
            let got = out.get_pixel(skin_x, skin_y)[c] as i32 - out.get_pixel(spot_x, spot_y)[c] as i32;
            assert!(want > 20, "channel {c}: corrected contrast {want}");
            assert!((got - want).abs() <= 4, "channel {c}: contrast {got}, expected {want}");
        }
    }

    #[test]
    fn test_result_file_name() {
        let name = result_file_name(Path::new("/tmp/captures/capture_3.png"), Path::new("targets/beach.jpg"));
        assert_eq!(name, "result_capture_3.png_on_beach.jpg.png");
    }
}
