use crate::models::{FaceModels, ModelError};
use pixmatch_core::{BoundingBox, DecodeError, DetectorError, RecognizerError};
use pixmatch_gallery::{CosineMatcher, GalleryIndex, IndexError, MatchResult, Matcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a selfie with more than one detected face is queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPolicy {
    /// Query with the face that has the largest bounding box.
    #[default]
    #[serde(rename = "largest")]
    LargestFace,
    /// Query with every face and merge the matches.
    #[serde(rename = "union")]
    Union,
    /// Refuse the selfie with [`QueryError::AmbiguousQuery`].
    #[serde(rename = "reject")]
    Reject,
}

impl QueryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPolicy::LargestFace => "largest",
            QueryPolicy::Union => "union",
            QueryPolicy::Reject => "reject",
        }
    }
}

impl fmt::Display for QueryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "largest" | "largest-face" => Ok(QueryPolicy::LargestFace),
            "union" => Ok(QueryPolicy::Union),
            "reject" => Ok(QueryPolicy::Reject),
            other => Err(format!("unknown query policy: {other}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
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
    #[error("selfie contains {faces} faces; retake with one face")]
    AmbiguousQuery { faces: usize },
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl From<ModelError> for QueryError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Decode(e) => QueryError::Decode(e),
            ModelError::Detector(e) => QueryError::Detector(e),
            ModelError::Extraction(e) => QueryError::Extraction(e),
            ModelError::Timeout { stage, timeout } => QueryError::Timeout { stage, timeout },
            ModelError::Aborted { stage, reason } => QueryError::Aborted { stage, reason },
        }
    }
}

/// Result of a selfie query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Matched photos, possibly none.
    Matches(MatchResult),
    /// The selfie itself has no detectable face.
    NoFaceDetected,
}

impl QueryOutcome {
    pub fn matches(&self) -> Option<&MatchResult> {
        match self {
            QueryOutcome::Matches(result) => Some(result),
            QueryOutcome::NoFaceDetected => None,
        }
    }

    pub fn is_no_face(&self) -> bool {
        matches!(self, QueryOutcome::NoFaceDetected)
    }
}

/// Faces of a selfie to query with under `policy`.
pub fn select_faces(
    policy: QueryPolicy,
    mut faces: Vec<BoundingBox>,
) -> Result<Vec<BoundingBox>, QueryError> {
    if faces.len() <= 1 {
        return Ok(faces);
    }
    match policy {
        QueryPolicy::Union => Ok(faces),
        QueryPolicy::Reject => Err(QueryError::AmbiguousQuery { faces: faces.len() }),
        QueryPolicy::LargestFace => {
            // Equal areas fall back to detector confidence, then detection order.
            let mut best = 0;
            for (i, face) in faces.iter().enumerate().skip(1) {
                let current = &faces[best];
                let larger = face
                    .area()
                    .total_cmp(&current.area())
                    .then(face.confidence.total_cmp(&current.confidence))
                    .is_gt();
                if larger {
                    best = i;
                }
            }
            Ok(vec![faces.swap_remove(best)])
        }
    }
}

/// Selfie in, matched photos out.
pub struct QueryPipeline {
    models: FaceModels,
    index: Arc<GalleryIndex>,
    matcher: CosineMatcher,
    policy: QueryPolicy,
}

impl QueryPipeline {
    pub fn new(
        models: FaceModels,
        index: Arc<GalleryIndex>,
        matcher: CosineMatcher,
        policy: QueryPolicy,
    ) -> Self {
        Self {
            models,
            index,
            matcher,
            policy,
        }
    }

    pub fn policy(&self) -> QueryPolicy {
        self.policy
    }

    pub async fn run(&self, selfie: Vec<u8>) -> Result<QueryOutcome, QueryError> {
        let image = self.models.decode(selfie).await?;
        let detected = self.models.detect(Arc::clone(&image)).await?;
        if detected.is_empty() {
            tracing::debug!("no face in selfie");
            return Ok(QueryOutcome::NoFaceDetected);
        }

        let detected_count = detected.len();
        let faces = select_faces(self.policy, detected)?;
        let embeddings = self.models.extract_all(&image, &faces).await?;
        let result = self.matcher.find(&self.index, &embeddings)?;

        tracing::info!(
            faces = detected_count,
            queried = faces.len(),
            policy = %self.policy,
            photos = result.len(),
            "selfie query complete"
        );
        Ok(QueryOutcome::Matches(result))
    }
}
