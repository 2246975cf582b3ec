use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Caller-assigned identifier of an uploaded photo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(String);

impl PhotoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhotoId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PhotoId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Processing status of a photo as seen by the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoStatus {
    Pending,
    Processed,
    Failed,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Processed => "processed",
            PhotoStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhotoStatus::Pending),
            "processed" => Ok(PhotoStatus::Processed),
            "failed" => Ok(PhotoStatus::Failed),
            other => Err(format!("unknown photo status: {other}")),
        }
    }
}

/// An uploaded photo and where ingestion left it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    /// Storage location reported by the upload subsystem (path or object key).
    pub location: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: PhotoStatus,
    /// Reason recorded by the last failed ingestion attempt.
    pub failure: Option<String>,
    /// Hex SHA-256 of the bytes that were last ingested successfully.
    pub digest: Option<String>,
}

impl Photo {
    pub fn pending(id: PhotoId, location: impl Into<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id,
            location: location.into(),
            uploaded_at,
            status: PhotoStatus::Pending,
            failure: None,
            digest: None,
        }
    }
}

/// Face region in pixel coordinates, with the detector's score and optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersect the box with a `width` × `height` image.
    ///
    /// Returns `None` when the box is non-finite or nothing of it lies inside the image.
    pub fn clipped_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let finite = [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return None;
        }

        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.width).min(width as f32);
        let y2 = (self.y + self.height).min(height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }

        Some(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: self.confidence,
            landmarks: self.landmarks,
        })
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy of this embedding. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity in [-1, 1]; 0.0 when either side is a zero vector.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold((0.0f32, 0.0f32, 0.0f32), |(d, na, nb), (a, b)| {
                (d + a * b, na + a * a, nb + b * b)
            });

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// One detected face inside one photo. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub id: Uuid,
    pub photo_id: PhotoId,
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

impl FaceObservation {
    pub fn new(photo_id: PhotoId, bbox: BoundingBox, embedding: Embedding) -> Self {
        Self {
            id: Uuid::new_v4(),
            photo_id,
            bbox,
            embedding,
        }
    }

    /// Detector confidence for this face.
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}
