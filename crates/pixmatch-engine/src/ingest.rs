use crate::models::{FaceModels, ModelError};
use crate::registry::{IngestState, PhotoRegistry, TransitionError};
use chrono::{DateTime, Utc};
use pixmatch_core::{
    DecodeError, DetectorError, FaceObservation, PhotoId, PhotoStatus, RecognizerError,
};
use pixmatch_gallery::{GalleryIndex, IndexError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
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
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl IngestError {
    /// The photo was retracted or purged while it was being ingested.
    pub fn is_withdrawn(&self) -> bool {
        matches!(
            self,
            IngestError::Transition(TransitionError::Retracted(_) | TransitionError::Unknown(_))
        )
    }
}

impl From<ModelError> for IngestError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Decode(e) => IngestError::Decode(e),
            ModelError::Detector(e) => IngestError::Detector(e),
            ModelError::Extraction(e) => IngestError::Extraction(e),
            ModelError::Timeout { stage, timeout } => IngestError::Timeout { stage, timeout },
            ModelError::Aborted { stage, reason } => IngestError::Aborted { stage, reason },
        }
    }
}

/// Raw photo handed over by the upload subsystem.
#[derive(Debug, Clone)]
pub struct Upload {
    pub photo_id: PhotoId,
    /// Where the storage layer keeps the original.
    pub location: String,
    pub bytes: Vec<u8>,
    pub uploaded_at: DateTime<Utc>,
}

impl Upload {
    /// Upload stamped now, located at its own id.
    pub fn new(photo_id: impl Into<PhotoId>, bytes: Vec<u8>) -> Self {
        let photo_id = photo_id.into();
        Self {
            location: photo_id.to_string(),
            photo_id,
            bytes,
            uploaded_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_uploaded_at(mut self, uploaded_at: DateTime<Utc>) -> Self {
        self.uploaded_at = uploaded_at;
        self
    }
}

/// Outcome of one ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub photo_id: PhotoId,
    pub status: PhotoStatus,
    /// Faces indexed for the photo.
    pub faces: usize,
    pub error: Option<String>,
}

impl IngestReport {
    fn processed(photo_id: PhotoId, faces: usize) -> Self {
        Self {
            photo_id,
            status: PhotoStatus::Processed,
            faces,
            error: None,
        }
    }

    pub(crate) fn failed(photo_id: PhotoId, error: String) -> Self {
        Self {
            photo_id,
            status: PhotoStatus::Failed,
            faces: 0,
            error: Some(error),
        }
    }
}

/// Decode, detect, extract, and index one photo at a time.
pub struct Ingestor {
    models: FaceModels,
    index: Arc<GalleryIndex>,
    registry: Arc<PhotoRegistry>,
}

impl Ingestor {
    pub fn new(models: FaceModels, index: Arc<GalleryIndex>, registry: Arc<PhotoRegistry>) -> Self {
        Self {
            models,
            index,
            registry,
        }
    }

    /// Register and ingest `upload`.
    pub async fn ingest(&self, upload: Upload) -> IngestReport {
        self.register(&upload);
        self.run(upload).await
    }

    /// Record the upload as known before its ingestion is scheduled, so a
    /// retraction that arrives first is not lost.
    pub fn register(&self, upload: &Upload) {
        self.registry
            .register(&upload.photo_id, &upload.location, upload.uploaded_at);
    }

    /// Ingest a registered upload. Never fails: errors are recorded on the photo.
    pub async fn run(&self, upload: Upload) -> IngestReport {
        let photo_id = upload.photo_id.clone();
        let lock = self.registry.lock(&photo_id);
        let report = {
            let _guard = lock.lock().await;
            self.run_locked(upload).await
        };
        self.registry.release(&photo_id, lock);
        report
    }

    async fn run_locked(&self, upload: Upload) -> IngestReport {
        let photo_id = upload.photo_id.clone();
        let digest = digest(&upload.bytes);
        if self.registry.indexed_digest(&photo_id).as_deref() == Some(digest.as_str()) {
            let faces = self.index.observations(&photo_id).len();
            tracing::debug!(photo = %photo_id, faces, "identical bytes already indexed");
            return IngestReport::processed(photo_id, faces);
        }

        match self.attempt(upload, digest).await {
            Ok(faces) => {
                tracing::info!(photo = %photo_id, faces, "photo indexed");
                IngestReport::processed(photo_id, faces)
            }
            Err(err) if err.is_withdrawn() => {
                self.withdraw(&photo_id).await;
                tracing::info!(photo = %photo_id, "ingestion abandoned, photo withdrawn");
                IngestReport::failed(photo_id, err.to_string())
            }
            Err(err) => {
                tracing::warn!(photo = %photo_id, error = %err, "ingestion failed");
                self.registry.fail(&photo_id, err.to_string());
                IngestReport::failed(photo_id, err.to_string())
            }
        }
    }

    async fn attempt(&self, upload: Upload, digest: String) -> Result<usize, IngestError> {
        let Upload {
            photo_id,
            location,
            bytes,
            uploaded_at,
        } = upload;

        if self.registry.state(&photo_id).is_some_and(IngestState::is_settled) {
            // Whatever an earlier attempt indexed goes before this one starts.
            let id = photo_id.clone();
            self.write_index(move |index| index.remove(&id)).await?;
        }
        self.registry.begin(&photo_id, &location, uploaded_at)?;

        let image = self.models.decode(bytes).await?;
        self.registry.advance(&photo_id, IngestState::Detecting)?;
        let faces = self.models.detect(Arc::clone(&image)).await?;

        self.registry.advance(&photo_id, IngestState::Extracting)?;
        let embeddings = self.models.extract_all(&image, &faces).await?;
        let observations: Vec<FaceObservation> = faces
            .into_iter()
            .zip(embeddings)
            .map(|(bbox, embedding)| FaceObservation::new(photo_id.clone(), bbox, embedding))
            .collect();

        self.registry.ensure_live(&photo_id)?;
        let id = photo_id.clone();
        let count = self
            .write_index(move |index| index.insert(&id, uploaded_at, observations))
            .await?;
        // A retraction that landed during the insert is caught here.
        self.registry.complete(&photo_id, digest)?;
        Ok(count)
    }

    /// Run an index write. A store-backed index does SQLite I/O, so the write
    /// goes to the blocking pool.
    async fn write_index<T, F>(&self, write: F) -> Result<T, IngestError>
    where
        F: FnOnce(&GalleryIndex) -> Result<T, IndexError> + Send + 'static,
        T: Send + 'static,
    {
        if self.index.store().is_none() {
            return Ok(write(&*self.index)?);
        }
        let index = Arc::clone(&self.index);
        match tokio::task::spawn_blocking(move || write(&*index)).await {
            Ok(result) => Ok(result?),
            Err(err) => Err(IngestError::Aborted {
                stage: "index",
                reason: err.to_string(),
            }),
        }
    }

    /// Undo whatever a withdrawn photo's ingestion left behind.
    async fn withdraw(&self, photo_id: &PhotoId) {
        let id = photo_id.clone();
        if let Err(err) = self.write_index(move |index| index.remove(&id)).await {
            tracing::warn!(photo = %photo_id, error = %err, "failed to remove withdrawn photo");
        }
        if let Err(err) = self.registry.discard(photo_id) {
            tracing::warn!(photo = %photo_id, error = %err, "failed to drop withdrawn photo record");
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_upload_defaults_location_to_id() {
        let upload = Upload::new("IMG_0001", vec![1, 2, 3]).with_location("s3://event/IMG_0001.jpg");
        assert_eq!(upload.photo_id.as_str(), "IMG_0001");
        assert_eq!(upload.location, "s3://event/IMG_0001.jpg");
        assert_eq!(Upload::new("x", vec![]).location, "x");
    }

    #[test]
    fn test_withdrawn_errors() {
        let id = PhotoId::from("a");
        assert!(IngestError::from(TransitionError::Retracted(id.clone())).is_withdrawn());
        assert!(IngestError::from(TransitionError::Unknown(id)).is_withdrawn());
        assert!(!IngestError::from(DecodeError::Empty).is_withdrawn());
    }
}
