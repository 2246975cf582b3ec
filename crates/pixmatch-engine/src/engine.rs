use crate::config::{Config, ConfigError};
use crate::event::EventGallery;
use crate::ingest::{IngestReport, Ingestor, Upload};
use crate::models::FaceModels;
use crate::query::{QueryError, QueryOutcome, QueryPipeline, QueryPolicy};
use crate::registry::{GalleryStats, PhotoEntry};
use pixmatch_core::{
    ArcFaceRecognizer, DetectorError, EmbeddingExtract, FaceDetect, PhotoId, PhotoStatus,
    RecognizerError, ScrfdDetector,
};
use pixmatch_gallery::{CosineMatcher, IndexError, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

/// Tunables of a running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub similarity_threshold: f32,
    pub max_faces: usize,
    pub model_timeout: Duration,
    pub max_results: usize,
    pub query_policy: QueryPolicy,
    pub ingest_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            max_faces: config.max_faces,
            model_timeout: config.model_timeout(),
            max_results: config.max_results,
            query_policy: config.query_policy,
            ingest_concurrency: config.ingest_concurrency,
        }
    }
}

struct EngineInner {
    gallery: EventGallery,
    ingestor: Ingestor,
    queries: QueryPipeline,
    settings: EngineSettings,
}

/// Clone-safe handle to one event's retrieval engine.
///
/// `ingest` is driven by the upload subsystem, `query` by the customer
/// screen, `retract` by admin deletion. All three may run concurrently.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        detector: Arc<dyn FaceDetect>,
        extractor: Arc<dyn EmbeddingExtract>,
        gallery: EventGallery,
        settings: EngineSettings,
    ) -> Self {
        let models = FaceModels::new(
            detector,
            extractor,
            settings.model_timeout,
            settings.max_faces,
        );
        let ingestor = Ingestor::new(
            models.clone(),
            Arc::clone(gallery.index()),
            Arc::clone(gallery.registry()),
        );
        let queries = QueryPipeline::new(
            models,
            Arc::clone(gallery.index()),
            CosineMatcher::new(settings.similarity_threshold, settings.max_results),
            settings.query_policy,
        );

        Self {
            inner: Arc::new(EngineInner {
                gallery,
                ingestor,
                queries,
                settings,
            }),
        }
    }

    /// Load both ONNX models and open the configured gallery.
    ///
    /// Fails fast if the configuration is invalid or a model is missing.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        config.validate()?;

        let scrfd_path = config.scrfd_model_path();
        let detector = ScrfdDetector::load(&scrfd_path, config.detector_confidence)?;
        tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

        let arcface_path = config.arcface_model_path();
        let recognizer = ArcFaceRecognizer::load(&arcface_path)?;
        tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

        let gallery = EventGallery::open(config)?;
        tracing::info!(
            db = %config.db_path.display(),
            threshold = config.similarity_threshold,
            policy = %config.query_policy,
            "engine ready"
        );

        Ok(Self::new(
            Arc::new(detector),
            Arc::new(recognizer),
            gallery,
            EngineSettings::from(config),
        ))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn gallery(&self) -> &EventGallery {
        &self.inner.gallery
    }

    /// Ingest one photo and report where it ended up.
    pub async fn ingest(&self, photo_id: impl Into<PhotoId>, image_bytes: Vec<u8>) -> PhotoStatus {
        self.ingest_upload(Upload::new(photo_id, image_bytes))
            .await
            .status
    }

    pub async fn ingest_upload(&self, upload: Upload) -> IngestReport {
        self.inner.ingestor.ingest(upload).await
    }

    /// Ingest in the background. The photo is registered before this returns.
    pub fn submit(&self, upload: Upload) -> JoinHandle<IngestReport> {
        self.inner.ingestor.register(&upload);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.ingestor.run(upload).await })
    }

    /// Ingest `uploads` with bounded parallelism. Reports come back in input
    /// order; a failing photo never affects its siblings.
    pub async fn ingest_batch(&self, uploads: Vec<Upload>) -> Vec<IngestReport> {
        let permits = Arc::new(Semaphore::new(self.inner.settings.ingest_concurrency));
        let mut tasks = JoinSet::new();
        let mut slots = HashMap::new();
        let mut ids = Vec::with_capacity(uploads.len());

        for (slot, upload) in uploads.into_iter().enumerate() {
            self.inner.ingestor.register(&upload);
            ids.push(upload.photo_id.clone());
            let inner = Arc::clone(&self.inner);
            let permits = Arc::clone(&permits);
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                inner.ingestor.run(upload).await
            });
            slots.insert(handle.id(), slot);
        }

        let mut reports: Vec<Option<IngestReport>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, report)) => {
                    if let Some(&slot) = slots.get(&id) {
                        reports[slot] = Some(report);
                    }
                }
                Err(err) => {
                    if let Some(&slot) = slots.get(&err.id()) {
                        tracing::warn!(photo = %ids[slot], error = %err, "ingestion task aborted");
                        reports[slot] = Some(IngestReport::failed(ids[slot].clone(), err.to_string()));
                    }
                }
            }
        }

        let reports: Vec<IngestReport> = reports
            .into_iter()
            .zip(ids)
            .map(|(report, id)| {
                report.unwrap_or_else(|| IngestReport::failed(id, "ingestion task lost".into()))
            })
            .collect();
        let indexed = reports
            .iter()
            .filter(|r| r.status == PhotoStatus::Processed)
            .count();
        tracing::info!(photos = reports.len(), indexed, "batch ingested");
        reports
    }

    /// Find the event photos that contain the selfie's face.
    pub async fn query(&self, selfie_bytes: Vec<u8>) -> Result<QueryOutcome, QueryError> {
        self.inner.queries.run(selfie_bytes).await
    }

    /// Remove a photo from the gallery, including one still being ingested.
    pub fn retract(&self, photo_id: &PhotoId) -> Result<bool, EngineError> {
        self.inner.gallery.retract(photo_id)
    }

    /// Drop every photo and face of the event.
    pub fn purge(&self) -> Result<(), EngineError> {
        self.inner.gallery.purge()
    }

    pub fn photo(&self, photo_id: &PhotoId) -> Option<PhotoEntry> {
        self.inner.gallery.photo(photo_id)
    }

    pub fn photos(&self) -> Vec<PhotoEntry> {
        self.inner.gallery.photos()
    }

    pub fn stats(&self) -> GalleryStats {
        self.inner.gallery.stats()
    }
}
