//! Photo records and the per-photo ingestion state machine.
//!
//! `uploaded → detecting → extracting → indexed`, or `→ failed` from any
//! in-progress state. A finished photo (indexed or failed) re-enters at
//! `uploaded` when it is ingested again. Retraction leaves a tombstone so an
//! in-flight ingestion notices it at its next transition.

use chrono::{DateTime, Utc};
use pixmatch_core::{Photo, PhotoId, PhotoStatus};
use pixmatch_gallery::{GalleryStore, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Uploaded,
    Detecting,
    Extracting,
    Indexed,
    Failed,
}

impl IngestState {
    /// Forward transitions taken by a running ingestion.
    pub fn can_advance_to(self, next: IngestState) -> bool {
        use IngestState::*;
        matches!(
            (self, next),
            (Uploaded, Detecting)
                | (Detecting, Extracting)
                | (Extracting, Indexed)
                | (Uploaded | Detecting | Extracting, Failed)
        )
    }

    /// No ingestion is running for the photo.
    pub fn is_settled(self) -> bool {
        matches!(self, IngestState::Indexed | IngestState::Failed)
    }

    pub fn status(self) -> PhotoStatus {
        match self {
            IngestState::Indexed => PhotoStatus::Processed,
            IngestState::Failed => PhotoStatus::Failed,
            _ => PhotoStatus::Pending,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("photo {0} is not registered")]
    Unknown(PhotoId),
    #[error("photo {0} was retracted")]
    Retracted(PhotoId),
    #[error("photo {photo}: cannot move from {from:?} to {to:?}")]
    Invalid {
        photo: PhotoId,
        from: IngestState,
        to: IngestState,
    },
}

/// A photo record as shown to admins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoEntry {
    #[serde(flatten)]
    pub photo: Photo,
    pub state: IngestState,
}

/// Photo counts per status plus indexed faces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GalleryStats {
    pub photos: usize,
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
    pub faces: usize,
}

#[derive(Debug)]
struct Record {
    photo: Photo,
    state: IngestState,
    retracted: bool,
}

/// Every photo of the event and where its ingestion stands.
pub struct PhotoRegistry {
    records: Mutex<HashMap<PhotoId, Record>>,
    /// Serializes ingestions of the same photo id.
    locks: Mutex<HashMap<PhotoId, Arc<tokio::sync::Mutex<()>>>>,
    store: Option<Arc<dyn GalleryStore>>,
}

impl PhotoRegistry {
    pub fn new(store: Option<Arc<dyn GalleryStore>>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Registry rebuilt from the photos `store` already holds.
    ///
    /// A photo still pending was cut off mid-ingestion by a restart; it is
    /// marked failed so it can be retried.
    pub fn load(store: Arc<dyn GalleryStore>) -> Result<Self, StoreError> {
        let mut records = HashMap::new();
        for mut photo in store.load_photos()? {
            let state = match photo.status {
                PhotoStatus::Processed => IngestState::Indexed,
                PhotoStatus::Failed => IngestState::Failed,
                PhotoStatus::Pending => {
                    photo.status = PhotoStatus::Failed;
                    photo.failure = Some("ingestion interrupted".into());
                    store.save_photo(&photo)?;
                    tracing::warn!(photo = %photo.id, "interrupted ingestion marked failed");
                    IngestState::Failed
                }
            };
            records.insert(
                photo.id.clone(),
                Record {
                    photo,
                    state,
                    retracted: false,
                },
            );
        }
        tracing::info!(photos = records.len(), "photo registry loaded");

        Ok(Self {
            records: Mutex::new(records),
            locks: Mutex::new(HashMap::new()),
            store: Some(store),
        })
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PhotoId, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, photo: &Photo) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save_photo(photo) {
                tracing::warn!(photo = %photo.id, error = %err, "failed to persist photo record");
            }
        }
    }

    /// Advisory lock held for the whole ingestion of `photo_id`.
    pub fn lock(&self, photo_id: &PhotoId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(photo_id.clone()).or_default().clone()
    }

    /// Hand back a lock taken with [`lock`](Self::lock) once its guard is
    /// dropped. The entry of a withdrawn photo is dropped when nobody else
    /// holds or waits on it.
    pub fn release(&self, photo_id: &PhotoId, lock: Arc<tokio::sync::Mutex<()>>) {
        let withdrawn = self.records().get(photo_id).map_or(true, |r| r.retracted);
        if withdrawn {
            self.prune_lock(photo_id, Some(&lock));
        }
    }

    /// Drop the lock entry of `photo_id` if `held` (or nothing) is its only
    /// other owner.
    fn prune_lock(&self, photo_id: &PhotoId, held: Option<&Arc<tokio::sync::Mutex<()>>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = locks.get(photo_id) else {
            return;
        };
        let owners = match held {
            Some(held) if Arc::ptr_eq(entry, held) => 2,
            Some(_) => return,
            None => 1,
        };
        if Arc::strong_count(entry) == owners {
            locks.remove(photo_id);
        }
    }

    /// Announce an upload. A new photo is recorded as pending; a known one
    /// keeps its state until its ingestion begins. Clears any retraction.
    pub fn register(&self, photo_id: &PhotoId, location: &str, uploaded_at: DateTime<Utc>) {
        let mut records = self.records();
        match records.get_mut(photo_id) {
            Some(record) => record.retracted = false,
            None => {
                let photo = Photo::pending(photo_id.clone(), location, uploaded_at);
                self.persist(&photo);
                records.insert(
                    photo_id.clone(),
                    Record {
                        photo,
                        state: IngestState::Uploaded,
                        retracted: false,
                    },
                );
            }
        }
    }

    /// Start an ingestion attempt: the photo (re-)enters `uploaded`.
    ///
    /// Callers hold the photo's [`lock`](Self::lock), so an unsettled state
    /// here belongs to an attempt that was abandoned after a retraction.
    pub fn begin(
        &self,
        photo_id: &PhotoId,
        location: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let mut records = self.records();
        let record = live(&mut records, photo_id)?;
        if !(record.state.is_settled() || record.state == IngestState::Uploaded) {
            tracing::debug!(photo = %photo_id, state = ?record.state, "resetting abandoned attempt");
        }

        record.state = IngestState::Uploaded;
        record.photo.location = location.to_string();
        record.photo.uploaded_at = uploaded_at;
        record.photo.status = PhotoStatus::Pending;
        record.photo.failure = None;
        self.persist(&record.photo);
        tracing::debug!(photo = %photo_id, "ingestion started");
        Ok(())
    }

    pub fn advance(&self, photo_id: &PhotoId, next: IngestState) -> Result<(), TransitionError> {
        let mut records = self.records();
        let record = live(&mut records, photo_id)?;
        transition(record, photo_id, next)?;
        tracing::debug!(photo = %photo_id, state = ?next, "ingestion advanced");
        Ok(())
    }

    /// Mark the photo indexed. Fails if it was retracted or purged meanwhile,
    /// in which case the caller owns removing what it indexed.
    pub fn complete(&self, photo_id: &PhotoId, digest: String) -> Result<(), TransitionError> {
        let mut records = self.records();
        let record = live(&mut records, photo_id)?;
        transition(record, photo_id, IngestState::Indexed)?;
        record.photo.status = PhotoStatus::Processed;
        record.photo.digest = Some(digest);
        self.persist(&record.photo);
        Ok(())
    }

    /// Record a failed attempt against the photo.
    pub fn fail(&self, photo_id: &PhotoId, reason: String) {
        let mut records = self.records();
        let Ok(record) = live(&mut records, photo_id) else {
            return;
        };
        if transition(record, photo_id, IngestState::Failed).is_err() {
            tracing::warn!(photo = %photo_id, state = ?record.state, "failure reported outside an ingestion");
            record.state = IngestState::Failed;
        }
        record.photo.status = PhotoStatus::Failed;
        record.photo.failure = Some(reason);
        record.photo.digest = None;
        self.persist(&record.photo);
    }

    /// Tombstone the photo and drop its persisted record. Returns whether the
    /// photo was known.
    ///
    /// The tombstone forgets what was indexed, so an upload under the same id
    /// goes through the whole pipeline again.
    pub fn retract(&self, photo_id: &PhotoId) -> Result<bool, StoreError> {
        let known = {
            let mut records = self.records();
            match records.get_mut(photo_id) {
                Some(record) => {
                    let known = !record.retracted;
                    record.retracted = true;
                    record.photo.digest = None;
                    record.photo.status = PhotoStatus::Pending;
                    record.photo.failure = None;
                    if record.state.is_settled() {
                        record.state = IngestState::Uploaded;
                    }
                    known
                }
                None => false,
            }
        };
        self.prune_lock(photo_id, None);
        if let Some(store) = &self.store {
            store.delete_photo(photo_id)?;
        }
        Ok(known)
    }

    /// Drop the persisted record of a photo that was retracted or purged while
    /// it was being ingested. Returns false if it has been registered again since.
    pub fn discard(&self, photo_id: &PhotoId) -> Result<bool, StoreError> {
        let records = self.records();
        let withdrawn = records.get(photo_id).map_or(true, |r| r.retracted);
        if withdrawn {
            if let Some(store) = &self.store {
                store.delete_photo(photo_id)?;
            }
        }
        Ok(withdrawn)
    }

    /// Fails when the photo was retracted or purged.
    pub fn ensure_live(&self, photo_id: &PhotoId) -> Result<(), TransitionError> {
        live(&mut self.records(), photo_id).map(|_| ())
    }

    /// Forget every photo.
    pub fn clear(&self) {
        self.records().clear();
    }

    pub fn state(&self, photo_id: &PhotoId) -> Option<IngestState> {
        self.records().get(photo_id).map(|r| r.state)
    }

    /// Digest of the bytes behind the photo's current index entry.
    pub fn indexed_digest(&self, photo_id: &PhotoId) -> Option<String> {
        let records = self.records();
        let record = records.get(photo_id)?;
        if record.retracted || record.state != IngestState::Indexed {
            return None;
        }
        record.photo.digest.clone()
    }

    pub fn get(&self, photo_id: &PhotoId) -> Option<PhotoEntry> {
        self.records()
            .get(photo_id)
            .filter(|r| !r.retracted)
            .map(entry)
    }

    /// Every live photo, oldest upload first.
    pub fn list(&self) -> Vec<PhotoEntry> {
        let mut entries: Vec<PhotoEntry> = self
            .records()
            .values()
            .filter(|r| !r.retracted)
            .map(entry)
            .collect();
        entries.sort_by(|a, b| {
            a.photo
                .uploaded_at
                .cmp(&b.photo.uploaded_at)
                .then_with(|| a.photo.id.cmp(&b.photo.id))
        });
        entries
    }

    /// Per-status counts; `faces` is left for the caller to fill.
    pub fn stats(&self) -> GalleryStats {
        let mut stats = GalleryStats::default();
        for record in self.records().values().filter(|r| !r.retracted) {
            stats.photos += 1;
            match record.state.status() {
                PhotoStatus::Pending => stats.pending += 1,
                PhotoStatus::Processed => stats.processed += 1,
                PhotoStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

fn live<'a>(
    records: &'a mut HashMap<PhotoId, Record>,
    photo_id: &PhotoId,
) -> Result<&'a mut Record, TransitionError> {
    match records.get_mut(photo_id) {
        None => Err(TransitionError::Unknown(photo_id.clone())),
        Some(record) if record.retracted => Err(TransitionError::Retracted(photo_id.clone())),
        Some(record) => Ok(record),
    }
}

fn transition(record: &mut Record, photo_id: &PhotoId, next: IngestState) -> Result<(), TransitionError> {
    if !record.state.can_advance_to(next) {
        return Err(TransitionError::Invalid {
            photo: photo_id.clone(),
            from: record.state,
            to: next,
        });
    }
    record.state = next;
    Ok(())
}

fn entry(record: &Record) -> PhotoEntry {
    PhotoEntry {
        photo: record.photo.clone(),
        state: record.state,
    }
}
