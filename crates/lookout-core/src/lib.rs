//! lookout-core: face detection, face crops and crop similarity.
//!
//! Detection uses SCRFD running via ONNX Runtime on the CPU. Registered faces
//! are kept as clamped RGB crops and compared by intensity-histogram
//! correlation, so matching itself needs no recognition model.

pub mod crop;
pub mod detector;
pub mod similarity;
pub mod types;

pub use crop::FaceCrop;
pub use detector::{DetectorConfig, DetectorError, FaceDetect, ScrfdDetector};
pub use types::{BoundingBox, CaseId, GalleryEntry, LinearScanMatcher, MatchResult, Matcher};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// Default directory holding ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/lookout/models")
}
