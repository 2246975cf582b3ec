//! Face embedding extraction.
//!
//! [`EmbeddingExtract`] turns one detected face into an identity vector.
//! [`ArcFaceRecognizer`] implements it with the w600k_r50 ArcFace model.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = alignment::ALIGNED_SIZE as usize;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("degenerate face region {x},{y} {width}x{height} for {image_width}x{image_height} image")]
    DegenerateRegion {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("recognizer session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Converts a face region into an L2-normalized embedding.
pub trait EmbeddingExtract: Send + Sync {
    fn extract(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError>;
}

/// Reject boxes that cannot be cropped from `image`.
pub fn checked_region(image: &RgbImage, face: &BoundingBox) -> Result<BoundingBox, RecognizerError> {
    let (image_width, image_height) = image.dimensions();
    face.clipped_to(image_width, image_height)
        .ok_or(RecognizerError::DegenerateRegion {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
            image_width,
            image_height,
        })
}

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    session: Mutex<Session>,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// 112×112 RGB crop → NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl EmbeddingExtract for ArcFaceRecognizer {
    fn extract(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let region = checked_region(image, face)?;

        let aligned = match &face.landmarks {
            Some(landmarks) => alignment::align_face(image, landmarks),
            None => alignment::crop_face(image, &region),
        };
        let input = Self::preprocess(&aligned);

        let mut session = self.session.lock().map_err(|_| RecognizerError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let embedding = Embedding {
            values: raw.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        };
        if !embedding.is_finite() {
            return Err(RecognizerError::InferenceFailed("non-finite embedding".into()));
        }

        Ok(embedding.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_channels_kept_apart() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = ArcFaceRecognizer::preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_checked_region_rejects_degenerate() {
        let image = RgbImage::new(100, 100);
        let zero_area = BoundingBox {
            x: 10.0, y: 10.0, width: 0.0, height: 20.0, confidence: 0.9, landmarks: None,
        };
        let outside = BoundingBox {
            x: 150.0, y: 10.0, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None,
        };
        assert!(matches!(
            checked_region(&image, &zero_area),
            Err(RecognizerError::DegenerateRegion { .. })
        ));
        assert!(matches!(
            checked_region(&image, &outside),
            Err(RecognizerError::DegenerateRegion { image_width: 100, .. })
        ));
    }

    #[test]
    fn test_checked_region_clips_overhang() {
        let image = RgbImage::new(100, 100);
        let face = BoundingBox {
            x: 90.0, y: -5.0, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None,
        };
        let region = checked_region(&image, &face).unwrap();
        assert_eq!((region.x, region.y, region.width, region.height), (90.0, 0.0, 10.0, 15.0));
    }
}
