use crate::query::QueryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// `db_path` value that keeps the event gallery in memory only.
pub const IN_MEMORY_DB: &str = ":memory:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Engine configuration, loaded from `PIXMATCH_*` environment variables or a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite gallery file, or `:memory:`.
    pub db_path: PathBuf,
    /// Cosine similarity a gallery face must exceed to match.
    pub similarity_threshold: f32,
    /// Faces kept per image, highest detector confidence first.
    pub max_faces: usize,
    /// Minimum detector score for a face to be reported.
    pub detector_confidence: f32,
    /// Timeout for one detector or extractor call, in milliseconds.
    pub model_timeout_ms: u64,
    /// Maximum photos in one match result.
    pub max_results: usize,
    /// How a selfie with several faces is queried.
    pub query_policy: QueryPolicy,
    /// Parallel ingestion tasks in a batch.
    pub ingest_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: pixmatch_core::default_model_dir(),
            db_path: pixmatch_core::data_dir().join("gallery.db"),
            similarity_threshold: 0.40,
            max_faces: 32,
            detector_confidence: 0.5,
            model_timeout_ms: 5000,
            max_results: 20,
            query_policy: QueryPolicy::default(),
            ingest_concurrency: 4,
        }
    }
}

impl Config {
    /// Load configuration from `PIXMATCH_*` environment variables with defaults.
    ///
    /// Unparseable values fall back to the default; call [`Config::validate`]
    /// to reject out-of-range ones.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let query_policy = match std::env::var("PIXMATCH_QUERY_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(value = %raw, error = %err, "ignoring PIXMATCH_QUERY_POLICY");
                defaults.query_policy
            }),
            Err(_) => defaults.query_policy,
        };

        Self {
            model_dir: std::env::var("PIXMATCH_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            db_path: std::env::var("PIXMATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            similarity_threshold: env_f32(
                "PIXMATCH_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            ),
            max_faces: env_usize("PIXMATCH_MAX_FACES", defaults.max_faces),
            detector_confidence: env_f32(
                "PIXMATCH_DETECTOR_CONFIDENCE",
                defaults.detector_confidence,
            ),
            model_timeout_ms: env_u64("PIXMATCH_MODEL_TIMEOUT_MS", defaults.model_timeout_ms),
            max_results: env_usize("PIXMATCH_MAX_RESULTS", defaults.max_results),
            query_policy,
            ingest_concurrency: env_usize(
                "PIXMATCH_INGEST_CONCURRENCY",
                defaults.ingest_concurrency,
            ),
        }
    }

    /// Load configuration from a TOML file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.similarity_threshold;
        if !t.is_finite() || !(-1.0..=1.0).contains(&t) {
            return Err(invalid("similarity_threshold", format!("{t} is outside [-1, 1]")));
        }
        let c = self.detector_confidence;
        if !c.is_finite() || !(0.0..=1.0).contains(&c) {
            return Err(invalid("detector_confidence", format!("{c} is outside [0, 1]")));
        }
        if self.max_faces == 0 {
            return Err(invalid("max_faces", "must be at least 1".into()));
        }
        if self.model_timeout_ms == 0 {
            return Err(invalid("model_timeout_ms", "must be positive".into()));
        }
        if self.max_results == 0 {
            return Err(invalid("max_results", "must be at least 1".into()));
        }
        if self.ingest_concurrency == 0 {
            return Err(invalid("ingest_concurrency", "must be at least 1".into()));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    /// Whether the gallery lives in memory only.
    pub fn in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY_DB
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(pixmatch_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(pixmatch_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
