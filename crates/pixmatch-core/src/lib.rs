//! pixmatch-core — Face detection, embeddings, and photo domain types.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings,
//! both running via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod decode;
pub mod detector;
pub mod palette;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use decode::{decode_image, DecodeError};
pub use detector::{cap_faces, DetectorError, FaceDetect, ScrfdDetector};
pub use recognizer::{ArcFaceRecognizer, EmbeddingExtract, RecognizerError};
pub use types::{BoundingBox, Embedding, FaceObservation, Photo, PhotoId, PhotoStatus};

/// SCRFD detection model file name.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default ONNX model directory: `$XDG_DATA_HOME/pixmatch/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Per-user data directory: `$XDG_DATA_HOME/pixmatch`, or `~/.local/share/pixmatch`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("pixmatch")
}
