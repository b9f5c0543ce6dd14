//! 68-point facial landmark regressor via ONNX Runtime.
//!
//! Crops a square window around each detected face box, resizes it to the
//! model's 112×112 input and regresses 68 landmarks normalized to the crop.
//! The points are grouped into named regions using the iBUG-300W layout.

use crate::types::{BoundingBox, LandmarkSet, Point, Region};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const LANDMARK_INPUT_SIZE: usize = 112;
const LANDMARK_SCALE: f32 = 255.0; // inputs in [0, 1]
const LANDMARK_COUNT: usize = 68;
/// Fraction of the face box added around it before cropping.
const CROP_MARGIN: f32 = 0.2;

/// iBUG-300W index ranges for each region.
const CHIN: RangeInclusive<usize> = 0..=16;
const LEFT_EYEBROW: RangeInclusive<usize> = 17..=21;
const RIGHT_EYEBROW: RangeInclusive<usize> = 22..=26;
const NOSE_BRIDGE: RangeInclusive<usize> = 27..=30;
const NOSE_TIP: RangeInclusive<usize> = 31..=35;
const LEFT_EYE: RangeInclusive<usize> = 36..=41;
const RIGHT_EYE: RangeInclusive<usize> = 42..=47;
/// Outer upper lip left to right, then inner upper lip right to left.
const TOP_LIP: [usize; 12] = [48, 49, 50, 51, 52, 53, 54, 64, 63, 62, 61, 60];
/// Outer lower lip right to left, then inner lower lip left to right.
const BOTTOM_LIP: [usize; 12] = [54, 55, 56, 57, 58, 59, 48, 60, 67, 66, 65, 64];

#[derive(Error, Debug)]
pub enum LandmarkerError {
    #[error("model file not found: {0} — place a 68-point landmark model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square crop window in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropWindow {
    x0: f32,
    y0: f32,
    side: f32,
}

impl CropWindow {
    /// Square window centered on the face box, enlarged by [`CROP_MARGIN`].
    fn around(face: &BoundingBox) -> Self {
        let side = face.width.max(face.height) * (1.0 + CROP_MARGIN);
        let cx = face.x + face.width / 2.0;
        let cy = face.y + face.height / 2.0;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }
}

/// 68-point landmark regressor.
pub struct LandmarkRegressor {
    session: Session,
    num_outputs: usize,
}

impl LandmarkRegressor {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, LandmarkerError> {
        if !model_path.exists() {
            return Err(LandmarkerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self { session, num_outputs })
    }

    /// Regress the landmark groups of one detected face.
    pub fn predict(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkerError> {
        let crop = CropWindow::around(face);
        let input = preprocess(image, &crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Some exports emit auxiliary pose tensors next to the landmarks; take
        // the first output with exactly 68 (x, y) pairs.
        for idx in 0..self.num_outputs {
            let (_, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LandmarkerError::InferenceFailed(format!("output {idx}: {e}")))?;
            if data.len() == LANDMARK_COUNT * 2 {
                let points = decode_landmarks(data, &crop);
                return Ok(group_landmarks(&points));
            }
        }

        Err(LandmarkerError::InferenceFailed(format!(
            "no output with {} values",
            LANDMARK_COUNT * 2
        )))
    }
}

/// Sample the crop window into a NCHW float tensor with bilinear interpolation.
/// Pixels outside the image are black.
fn preprocess(image: &RgbImage, crop: &CropWindow) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    let width = image.width() as i64;
    let height = image.height() as i64;
    let step = crop.side / size as f32;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < width && y >= 0 && y < height {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    for oy in 0..size {
        let sy = crop.y0 + (oy as f32 + 0.5) * step - 0.5;
        let y0 = sy.floor() as i64;
        let fy = sy - y0 as f32;

        for ox in 0..size {
            let sx = crop.x0 + (ox as f32 + 0.5) * step - 0.5;
            let x0 = sx.floor() as i64;
            let fx = sx - x0 as f32;

            for c in 0..3 {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                tensor[[0, c, oy, ox]] = val / LANDMARK_SCALE;
            }
        }
    }

    tensor
}

/// Map crop-normalized (x, y) pairs back to image coordinates.
fn decode_landmarks(raw: &[f32], crop: &CropWindow) -> [(f32, f32); LANDMARK_COUNT] {
    let mut points = [(0.0f32, 0.0f32); LANDMARK_COUNT];
    for (i, p) in points.iter_mut().enumerate() {
        *p = (
            crop.x0 + raw[i * 2] * crop.side,
            crop.y0 + raw[i * 2 + 1] * crop.side,
        );
    }
    points
}

/// Split 68 iBUG-ordered points into named regions.
pub fn group_landmarks(points: &[(f32, f32); LANDMARK_COUNT]) -> LandmarkSet {
    let pick = |indices: &[usize]| -> Vec<Point> {
        indices
            .iter()
            .map(|&i| Point::from_f32(points[i].0, points[i].1))
            .collect()
    };
    let range = |r: RangeInclusive<usize>| -> Vec<usize> { r.collect() };

    LandmarkSet::new()
        .with(Region::Chin, pick(&range(CHIN)))
        .with(Region::LeftEyebrow, pick(&range(LEFT_EYEBROW)))
        .with(Region::RightEyebrow, pick(&range(RIGHT_EYEBROW)))
        .with(Region::NoseBridge, pick(&range(NOSE_BRIDGE)))
        .with(Region::NoseTip, pick(&range(NOSE_TIP)))
        .with(Region::LeftEye, pick(&range(LEFT_EYE)))
        .with(Region::RightEye, pick(&range(RIGHT_EYE)))
        .with(Region::TopLip, pick(&TOP_LIP))
        .with(Region::BottomLip, pick(&BOTTOM_LIP))
}
