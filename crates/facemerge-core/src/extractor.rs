//! Landmark extraction: the detection capability and the first-face extractor.

use crate::detector::{DetectorError, FaceDetector};
use crate::landmarker::{LandmarkRegressor, LandmarkerError};
use crate::types::LandmarkSet;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmark error: {0}")]
    Landmarker(#[from] LandmarkerError),
}

/// A face-landmark detection backend.
///
/// Returns every face found in the image, most preferred first. An image with
/// no face yields an empty vector, not an error.
pub trait LandmarkDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError>;
}

impl<D: LandmarkDetector + ?Sized> LandmarkDetector for Box<D> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
        (**self).detect(image)
    }
}

/// SCRFD face boxes refined by the 68-point landmark regressor.
pub struct OnnxLandmarkDetector {
    detector: FaceDetector,
    regressor: LandmarkRegressor,
}

impl OnnxLandmarkDetector {
    pub fn new(detector: FaceDetector, regressor: LandmarkRegressor) -> Self {
        Self { detector, regressor }
    }

    /// Load both ONNX models.
    pub fn load(detector_path: &Path, landmark_path: &Path, intra_threads: usize) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(detector_path, intra_threads)?;
        let regressor = LandmarkRegressor::load(landmark_path, intra_threads)?;
        Ok(Self::new(detector, regressor))
    }
}

impl LandmarkDetector for OnnxLandmarkDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
        let faces = self.detector.detect(image)?;
        faces
            .iter()
            .map(|face| self.regressor.predict(image, face).map_err(ExtractError::from))
            .collect()
    }
}

/// Returns the landmarks of the first face a detector reports.
pub struct LandmarkExtractor<D> {
    detector: D,
}

impl<D: LandmarkDetector> LandmarkExtractor<D> {
    pub fn new(detector: D) -> Self {
        Self { detector }
    }

    /// Landmarks of the first detected face, or `None` if there is no face.
    ///
    /// Additional faces are ignored.
    pub fn extract(&mut self, image: &RgbImage) -> Result<Option<LandmarkSet>, ExtractError> {
        let faces = self.detector.detect(image)?;
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "multiple faces detected; using the first");
        }
        Ok(faces.into_iter().next())
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    pub fn into_inner(self) -> D {
        self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Region};

    struct FixedDetector(Vec<LandmarkSet>);

    impl LandmarkDetector for FixedDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<LandmarkSet>, ExtractError> {
            Ok(self.0.clone())
        }
    }

    fn face_at(x: i32) -> LandmarkSet {
        LandmarkSet::new().with(Region::NoseTip, vec![Point::new(x, 0)])
    }

    #[test]
    fn test_extract_no_face_is_none() {
        let mut extractor = LandmarkExtractor::new(FixedDetector(vec![]));
        let image = RgbImage::new(4, 4);
        assert!(extractor.extract(&image).unwrap().is_none());
    }

    #[test]
    fn test_extract_returns_first_face_only() {
        let mut extractor = LandmarkExtractor::new(FixedDetector(vec![face_at(1), face_at(2)]));
        let image = RgbImage::new(4, 4);
        let set = extractor.extract(&image).unwrap().expect("face");
        assert_eq!(set, face_at(1));
    }

    #[test]
    fn test_boxed_detector() {
        let boxed: Box<dyn LandmarkDetector> = Box::new(FixedDetector(vec![face_at(3)]));
        let mut extractor = LandmarkExtractor::new(boxed);
        let image = RgbImage::new(4, 4);
        assert_eq!(extractor.extract(&image).unwrap(), Some(face_at(3)));
    }

    #[test]
    fn test_missing_models_report_not_found() {
        let err = OnnxLandmarkDetector::load(
            Path::new("/nonexistent/det.onnx"),
            Path::new("/nonexistent/lmk.onnx"),
            1,
        )
        .err()
        .expect("load must fail");
        assert!(matches!(err, ExtractError::Detector(DetectorError::ModelNotFound(_))));
    }
}
