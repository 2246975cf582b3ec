//! Durable gallery persistence.
//!
//! The index writes through a [`GalleryStore`] before it publishes anything in
//! memory. [`SqliteGalleryStore`] keeps one event's photos and face observations
//! in a single SQLite file (or in memory).

use chrono::{DateTime, Utc};
use pixmatch_core::{BoundingBox, Embedding, FaceObservation, Photo, PhotoId, PhotoStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    id          TEXT PRIMARY KEY,
    location    TEXT NOT NULL DEFAULT '',
    uploaded_at TEXT NOT NULL,
    status      TEXT NOT NULL,
    failure     TEXT,
    digest      TEXT
);

CREATE TABLE IF NOT EXISTS face_observations (
    id            TEXT PRIMARY KEY,
    photo_id      TEXT NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    ordinal       INTEGER NOT NULL,
    x             REAL NOT NULL,
    y             REAL NOT NULL,
    width         REAL NOT NULL,
    height        REAL NOT NULL,
    confidence    REAL NOT NULL,
    landmarks     TEXT,
    embedding     BLOB NOT NULL,
    model_version TEXT
);

CREATE INDEX IF NOT EXISTS idx_face_observations_photo ON face_observations(photo_id);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// All observations of one indexed photo, as loaded at startup.
#[derive(Debug, Clone)]
pub struct StoredFaces {
    pub photo_id: PhotoId,
    pub uploaded_at: DateTime<Utc>,
    pub observations: Vec<FaceObservation>,
}

/// Persistence behind a gallery index.
pub trait GalleryStore: Send + Sync {
    /// Insert or update a photo record.
    fn save_photo(&self, photo: &Photo) -> Result<(), StoreError>;

    fn load_photos(&self) -> Result<Vec<Photo>, StoreError>;

    /// Atomically replace a photo's observations and mark the photo processed.
    fn replace_faces(
        &self,
        photo_id: &PhotoId,
        uploaded_at: DateTime<Utc>,
        faces: &[FaceObservation],
    ) -> Result<(), StoreError>;

    /// Delete a photo's observations; returns how many were removed.
    fn delete_faces(&self, photo_id: &PhotoId) -> Result<usize, StoreError>;

    /// Delete a photo record and, by cascade, its observations.
    fn delete_photo(&self, photo_id: &PhotoId) -> Result<bool, StoreError>;

    fn load_faces(&self) -> Result<Vec<StoredFaces>, StoreError>;

    /// Drop every photo and observation of the event.
    fn purge(&self) -> Result<(), StoreError>;
}

pub struct SqliteGalleryStore {
    conn: Mutex<Connection>,
}

impl SqliteGalleryStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        tracing::info!(path = %path.display(), "opened gallery store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    /// Status column for one photo, if the photo is known.
    pub fn photo_status(&self, photo_id: &PhotoId) -> Result<Option<PhotoStatus>, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT status FROM photos WHERE id = ?1", [photo_id.as_str()], |row| row.get(0))
                .optional()?;
            raw.map(|s| s.parse().map_err(StoreError::Corrupt)).transpose()
        })
    }

    #[cfg(test)]
    fn face_rows(&self, photo_id: &PhotoId) -> usize {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM face_observations WHERE photo_id = ?1",
                [photo_id.as_str()],
                |row| row.get::<_, i64>(0),
            )? as usize)
        })
        .unwrap()
    }
}

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!("embedding blob of {} bytes", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

impl GalleryStore for SqliteGalleryStore {
    fn save_photo(&self, photo: &Photo) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO photos (id, location, uploaded_at, status, failure, digest)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    location = excluded.location,
                    uploaded_at = excluded.uploaded_at,
                    status = excluded.status,
                    failure = excluded.failure,
                    digest = excluded.digest
                "#,
                params![
                    photo.id.as_str(),
                    photo.location,
                    photo.uploaded_at.to_rfc3339(),
                    photo.status.as_str(),
                    photo.failure,
                    photo.digest,
                ],
            )?;
            Ok(())
        })
    }

    fn load_photos(&self) -> Result<Vec<Photo>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, location, uploaded_at, status, failure, digest FROM photos ORDER BY uploaded_at, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut photos = Vec::new();
            for row in rows {
                let (id, location, uploaded_at, status, failure, digest) = row?;
                photos.push(Photo {
                    id: PhotoId::new(id),
                    location,
                    uploaded_at: parse_time(&uploaded_at)?,
                    status: status.parse().map_err(StoreError::Corrupt)?,
                    failure,
                    digest,
                });
            }
            Ok(photos)
        })
    }

    fn replace_faces(
        &self,
        photo_id: &PhotoId,
        uploaded_at: DateTime<Utc>,
        faces: &[FaceObservation],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            // Dropping `tx` on any early return rolls the whole photo back.
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO photos (id, uploaded_at, status) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET status = excluded.status, failure = NULL
                "#,
                params![photo_id.as_str(), uploaded_at.to_rfc3339(), PhotoStatus::Processed.as_str()],
            )?;
            tx.execute(
                "DELETE FROM face_observations WHERE photo_id = ?1",
                [photo_id.as_str()],
            )?;

            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO face_observations
                        (id, photo_id, ordinal, x, y, width, height, confidence, landmarks, embedding, model_version)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                )?;
                for (ordinal, face) in faces.iter().enumerate() {
                    let landmarks = face
                        .bbox
                        .landmarks
                        .map(|l| serde_json::to_string(&l))
                        .transpose()
                        .map_err(|e| StoreError::Corrupt(format!("landmarks: {e}")))?;
                    stmt.execute(params![
                        face.id.to_string(),
                        photo_id.as_str(),
                        ordinal as i64,
                        face.bbox.x,
                        face.bbox.y,
                        face.bbox.width,
                        face.bbox.height,
                        face.bbox.confidence,
                        landmarks,
                        embedding_to_bytes(&face.embedding.values),
                        face.embedding.model_version,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn delete_faces(&self, photo_id: &PhotoId) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM face_observations WHERE photo_id = ?1",
                [photo_id.as_str()],
            )?)
        })
    }

    fn delete_photo(&self, photo_id: &PhotoId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM photos WHERE id = ?1", [photo_id.as_str()])? > 0)
        })
    }

    fn load_faces(&self) -> Result<Vec<StoredFaces>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT f.id, f.photo_id, p.uploaded_at, f.x, f.y, f.width, f.height,
                       f.confidence, f.landmarks, f.embedding, f.model_version
                FROM face_observations f
                JOIN photos p ON p.id = f.photo_id
                ORDER BY p.uploaded_at, f.photo_id, f.ordinal
                "#,
            )?;

            let mut grouped: Vec<StoredFaces> = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let photo_id = PhotoId::new(row.get::<_, String>(1)?);
                let uploaded_at = parse_time(&row.get::<_, String>(2)?)?;
                let landmarks = row
                    .get::<_, Option<String>>(8)?
                    .map(|raw| serde_json::from_str::<[(f32, f32); 5]>(&raw))
                    .transpose()
                    .map_err(|e| StoreError::Corrupt(format!("landmarks: {e}")))?;

                let observation = FaceObservation {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id {id:?}: {e}")))?,
                    photo_id: photo_id.clone(),
                    bbox: BoundingBox {
                        x: row.get(3)?,
                        y: row.get(4)?,
                        width: row.get(5)?,
                        height: row.get(6)?,
                        confidence: row.get(7)?,
                        landmarks,
                    },
                    embedding: Embedding {
                        values: bytes_to_embedding(&row.get::<_, Vec<u8>>(9)?)?,
                        model_version: row.get(10)?,
                    },
                };

                match grouped.last_mut() {
                    Some(group) if group.photo_id == photo_id => group.observations.push(observation),
                    _ => grouped.push(StoredFaces {
                        photo_id,
                        uploaded_at,
                        observations: vec![observation],
                    }),
                }
            }
            Ok(grouped)
        })
    }

    fn purge(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM face_observations; DELETE FROM photos;")?;
            Ok(())
        })
    }
}
