//! facemerge-core — Face merge engine.
//!
//! Detects facial landmarks (SCRFD boxes refined by a 68-point regressor on
//! ONNX Runtime), aligns the source face onto the destination through an exact
//! three-point affine transform, matches colors under the face mask and
//! composites the result with Poisson seamless cloning.

pub mod alignment;
pub mod blend;
pub mod color;
pub mod detector;
pub mod extractor;
pub mod landmarker;
pub mod mask;
pub mod pipeline;
pub mod types;

use std::path::PathBuf;

pub use alignment::{align, AffineTransform, AlignError};
pub use blend::{PoissonBlender, SeamlessBlender};
pub use extractor::{ExtractError, LandmarkDetector, LandmarkExtractor, OnnxLandmarkDetector};
pub use mask::{build_mask, FaceMask};
pub use pipeline::{result_file_name, FaceMerger, MergeError, MergeOptions, MergeStages};
pub use types::{BoundingBox, LandmarkSet, Point, Region};

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// 68-point landmark model file name inside the model directory.
pub const LANDMARK_MODEL_FILE: &str = "landmarks_68.onnx";

/// Model directory: `$FACEMERGE_MODEL_DIR`, else `$XDG_DATA_HOME/facemerge/models`
/// (falling back to `~/.local/share`).
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEMERGE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facemerge")
        .join("models")
}
