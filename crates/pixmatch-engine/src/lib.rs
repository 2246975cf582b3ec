//! pixmatch-engine — Photo ingestion, selfie queries, and retraction for one event.
//!
//! [`Engine`] ties the face models from `pixmatch-core` to the gallery from
//! `pixmatch-gallery`. Uploaded photos go through the ingestion state machine
//! in the background; selfie queries run against whatever is indexed at the time.

pub mod config;
pub mod engine;
pub mod event;
pub mod ingest;
pub mod models;
pub mod query;
pub mod registry;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineError, EngineSettings};
pub use event::EventGallery;
pub use ingest::{IngestError, IngestReport, Ingestor, Upload};
pub use models::{FaceModels, ModelError};
pub use query::{select_faces, QueryError, QueryOutcome, QueryPipeline, QueryPolicy};
pub use registry::{GalleryStats, IngestState, PhotoEntry, PhotoRegistry, TransitionError};
