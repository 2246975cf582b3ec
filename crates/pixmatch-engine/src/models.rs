use image::RgbImage;
use pixmatch_core::{
    cap_faces, decode_image, BoundingBox, DecodeError, DetectorError, Embedding, EmbeddingExtract,
    FaceDetect, RecognizerError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extraction error: {0}")]
    Extraction(#[from] RecognizerError),
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("{stage} worker aborted: {reason}")]
    Aborted { stage: &'static str, reason: String },
}

/// Detector and extractor pair shared by ingestion and queries.
///
/// Every call runs on the blocking pool under a timeout so a hung model
/// fails the request instead of wedging the pipeline. Detection results
/// are capped to `max_faces`, lowest confidence dropped first.
#[derive(Clone)]
pub struct FaceModels {
    detector: Arc<dyn FaceDetect>,
    extractor: Arc<dyn EmbeddingExtract>,
    timeout: Duration,
    max_faces: usize,
}

impl FaceModels {
    pub fn new(
        detector: Arc<dyn FaceDetect>,
        extractor: Arc<dyn EmbeddingExtract>,
        timeout: Duration,
        max_faces: usize,
    ) -> Self {
        Self {
            detector,
            extractor,
            timeout,
            max_faces,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn decode(&self, bytes: Vec<u8>) -> Result<Arc<RgbImage>, ModelError> {
        let image = run_blocking("decode", self.timeout, move || decode_image(&bytes)).await??;
        Ok(Arc::new(image))
    }

    pub async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<BoundingBox>, ModelError> {
        let detector = Arc::clone(&self.detector);
        let faces = run_blocking("detect", self.timeout, move || detector.detect(&image)).await??;
        let found = faces.len();
        let faces = cap_faces(faces, self.max_faces);
        if faces.len() < found {
            tracing::debug!(found, kept = faces.len(), "face cap applied");
        }
        Ok(faces)
    }

    pub async fn extract(
        &self,
        image: Arc<RgbImage>,
        face: BoundingBox,
    ) -> Result<Embedding, ModelError> {
        let extractor = Arc::clone(&self.extractor);
        let embedding =
            run_blocking("extract", self.timeout, move || extractor.extract(&image, &face))
                .await??;
        Ok(embedding)
    }

    /// Embeddings for every face, in detection order.
    pub async fn extract_all(
        &self,
        image: &Arc<RgbImage>,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ModelError> {
        let mut embeddings = Vec::with_capacity(faces.len());
        for face in faces {
            embeddings.push(self.extract(Arc::clone(image), face.clone()).await?);
        }
        Ok(embeddings)
    }
}

async fn run_blocking<R, F>(stage: &'static str, timeout: Duration, f: F) -> Result<R, ModelError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(ModelError::Aborted {
            stage,
            reason: join.to_string(),
        }),
        Err(_) => {
            tracing::warn!(stage, timeout_ms = timeout.as_millis() as u64, "model call timed out");
            Err(ModelError::Timeout { stage, timeout })
        }
    }
}
