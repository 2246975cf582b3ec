use crate::config::Config;
use crate::engine::EngineError;
use crate::registry::{GalleryStats, PhotoEntry, PhotoRegistry};
use pixmatch_core::PhotoId;
use pixmatch_gallery::{GalleryIndex, SqliteGalleryStore, StoreError};
use std::sync::Arc;

/// One event's gallery: the face index plus the photo records behind it.
///
/// Created per event and torn down by [`EventGallery::purge`]. Cloning shares
/// the same gallery.
#[derive(Clone)]
pub struct EventGallery {
    index: Arc<GalleryIndex>,
    registry: Arc<PhotoRegistry>,
}

impl EventGallery {
    /// Open the gallery `config` points at, or an empty in-memory one for `:memory:`.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        if config.in_memory() {
            return Ok(Self::in_memory());
        }
        let store = Arc::new(SqliteGalleryStore::open(&config.db_path)?);
        Ok(Self::from_index(GalleryIndex::open(store)?)?)
    }

    pub fn in_memory() -> Self {
        Self {
            index: Arc::new(GalleryIndex::in_memory()),
            registry: Arc::new(PhotoRegistry::new(None)),
        }
    }

    /// Wrap an index; photo records come from the index's store when it has one.
    pub fn from_index(index: GalleryIndex) -> Result<Self, StoreError> {
        let registry = match index.store() {
            Some(store) => PhotoRegistry::load(Arc::clone(store))?,
            None => PhotoRegistry::new(None),
        };
        Ok(Self {
            index: Arc::new(index),
            registry: Arc::new(registry),
        })
    }

    pub fn index(&self) -> &Arc<GalleryIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<PhotoRegistry> {
        &self.registry
    }

    /// Remove a photo and all of its faces. An ingestion still running for it
    /// is abandoned. Returns whether anything was known about the photo.
    pub fn retract(&self, photo_id: &PhotoId) -> Result<bool, EngineError> {
        let known = self.registry.retract(photo_id)?;
        let faces = self.index.remove(photo_id)?;
        tracing::info!(photo = %photo_id, known, faces, "photo retracted");
        Ok(known || faces > 0)
    }

    /// Drop every photo and face of the event.
    pub fn purge(&self) -> Result<(), EngineError> {
        let stats = self.stats();
        self.registry.clear();
        self.index.clear()?;
        tracing::info!(photos = stats.photos, faces = stats.faces, "event gallery purged");
        Ok(())
    }

    pub fn photo(&self, photo_id: &PhotoId) -> Option<PhotoEntry> {
        self.registry.get(photo_id)
    }

    pub fn photos(&self) -> Vec<PhotoEntry> {
        self.registry.list()
    }

    pub fn stats(&self) -> GalleryStats {
        GalleryStats {
            faces: self.index.len(),
            ..self.registry.stats()
        }
    }
}
