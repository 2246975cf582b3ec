//! Per-event gallery of face observations with exact cosine search.
//!
//! Each indexed photo keeps its observations next to an `n × d` matrix of
//! L2-normalized embeddings, so scoring a photo is one matrix–vector product.
//! A photo's entry is built completely before it is published under the write
//! lock, which makes insert all-or-nothing for concurrent readers.

use crate::store::{GalleryStore, StoreError};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use pixmatch_core::{Embedding, FaceObservation, PhotoId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding dimension {actual} does not match gallery dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty or contains non-finite values")]
    InvalidEmbedding,
    #[error("observation belongs to photo {found}, not {expected}")]
    ForeignObservation { expected: PhotoId, found: PhotoId },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One photo's observations as published in the index.
#[derive(Debug)]
struct IndexedPhoto {
    uploaded_at: DateTime<Utc>,
    observations: Vec<FaceObservation>,
    /// Row `i` is the normalized embedding of `observations[i]`.
    matrix: Array2<f32>,
}

#[derive(Debug, Default)]
struct IndexState {
    photos: HashMap<PhotoId, Arc<IndexedPhoto>>,
    dim: Option<usize>,
    faces: usize,
}

/// A face observation that scored above the search threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFace {
    pub observation: FaceObservation,
    pub uploaded_at: DateTime<Utc>,
    pub similarity: f32,
    /// Position of the observation within its photo.
    pub ordinal: usize,
}

impl ScoredFace {
    pub fn photo_id(&self) -> &PhotoId {
        &self.observation.photo_id
    }
}

/// Ranking shared by search and matching: similarity descending, then earlier
/// upload, then photo id, then observation order.
pub fn rank(a: &ScoredFace, b: &ScoredFace) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then(a.uploaded_at.cmp(&b.uploaded_at))
        .then_with(|| a.photo_id().cmp(b.photo_id()))
        .then(a.ordinal.cmp(&b.ordinal))
}

/// Face gallery for one event.
pub struct GalleryIndex {
    state: RwLock<IndexState>,
    /// Serializes writers of the same photo so store and memory agree on the winner.
    photo_locks: Mutex<HashMap<PhotoId, Arc<Mutex<()>>>>,
    store: Option<Arc<dyn GalleryStore>>,
}

impl Default for GalleryIndex {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl GalleryIndex {
    /// Index without persistence; contents live as long as the value.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            photo_locks: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Index backed by `store`, rebuilt from what the store already holds.
    pub fn open(store: Arc<dyn GalleryStore>) -> Result<Self, IndexError> {
        let mut state = IndexState::default();
        for stored in store.load_faces()? {
            let entry = build_entry(&stored.photo_id, stored.uploaded_at, stored.observations, &mut state.dim)?;
            state.faces += entry.observations.len();
            state.photos.insert(stored.photo_id, Arc::new(entry));
        }

        tracing::info!(
            photos = state.photos.len(),
            faces = state.faces,
            dim = ?state.dim,
            "gallery index loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            photo_locks: Mutex::new(HashMap::new()),
            store: Some(store),
        })
    }

    pub fn store(&self) -> Option<&Arc<dyn GalleryStore>> {
        self.store.as_ref()
    }

    fn photo_lock(&self, photo_id: &PhotoId) -> Arc<Mutex<()>> {
        let mut locks = self.photo_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(photo_id.clone()).or_default().clone()
    }

    /// Replace every observation of `photo_id` with `observations`.
    ///
    /// Either all observations become visible or none do; on error the photo's
    /// previous entry (if any) is left untouched. An empty list clears the photo.
    /// Returns the number of observations indexed.
    pub fn insert(
        &self,
        photo_id: &PhotoId,
        uploaded_at: DateTime<Utc>,
        observations: Vec<FaceObservation>,
    ) -> Result<usize, IndexError> {
        let lock = self.photo_lock(photo_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut dim = self.dim();
        let entry = build_entry(photo_id, uploaded_at, observations, &mut dim)?;

        if let Some(store) = &self.store {
            store.replace_faces(photo_id, uploaded_at, &entry.observations)?;
        }

        let count = entry.observations.len();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Another photo may have fixed the dimension while this one was being built.
        if let (Some(expected), Some(actual)) = (state.dim, dim) {
            if count > 0 && expected != actual {
                let previous = state.photos.get(photo_id).cloned();
                drop(state);
                if let Some(store) = &self.store {
                    match previous {
                        Some(prev) => store.replace_faces(photo_id, prev.uploaded_at, &prev.observations)?,
                        None => {
                            store.delete_faces(photo_id)?;
                        }
                    }
                }
                return Err(IndexError::DimensionMismatch { expected, actual });
            }
        }

        let previous = if count == 0 {
            state.photos.remove(photo_id)
        } else {
            state.dim = state.dim.or(dim);
            state.photos.insert(photo_id.clone(), Arc::new(entry))
        };
        state.faces = state.faces + count - previous.map_or(0, |p| p.observations.len());

        tracing::debug!(photo = %photo_id, faces = count, total = state.faces, "photo indexed");
        Ok(count)
    }

    /// Remove every observation of `photo_id`. Returns how many were removed.
    pub fn remove(&self, photo_id: &PhotoId) -> Result<usize, IndexError> {
        let lock = self.photo_lock(photo_id);
        let removed = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.remove_locked(photo_id)
        };
        self.prune_lock(photo_id, &lock);
        removed
    }

    fn remove_locked(&self, photo_id: &PhotoId) -> Result<usize, IndexError> {
        if let Some(store) = &self.store {
            store.delete_faces(photo_id)?;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state.photos.remove(photo_id).map_or(0, |p| p.observations.len());
        state.faces -= removed;
        if removed > 0 {
            tracing::debug!(photo = %photo_id, faces = removed, "photo removed from index");
        }
        Ok(removed)
    }

    /// Forget the write lock of `photo_id` unless another writer holds or
    /// waits on it. `held` is the caller's own handle.
    fn prune_lock(&self, photo_id: &PhotoId, held: &Arc<Mutex<()>>) {
        let mut locks = self.photo_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(photo_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, held) && Arc::strong_count(entry) == 2)
        {
            locks.remove(photo_id);
        }
    }

    /// Up to `k` observations with similarity strictly above `threshold`, best first.
    pub fn search(&self, query: &Embedding, k: usize, threshold: f32) -> Result<Vec<ScoredFace>, IndexError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(dim) = state.dim else {
            return Ok(Vec::new());
        };
        if query.dim() != dim {
            return Err(IndexError::DimensionMismatch { expected: dim, actual: query.dim() });
        }
        if !query.is_finite() {
            return Err(IndexError::InvalidEmbedding);
        }

        let q = Array1::from(query.normalized().values);
        let mut candidates: Vec<(f32, &Arc<IndexedPhoto>, usize)> = Vec::new();
        for photo in state.photos.values() {
            let scores = photo.matrix.dot(&q);
            for (ordinal, &score) in scores.iter().enumerate() {
                if score > threshold {
                    candidates.push((score, photo, ordinal));
                }
            }
        }

        let mut hits: Vec<ScoredFace> = candidates
            .into_iter()
            .map(|(similarity, photo, ordinal)| ScoredFace {
                observation: photo.observations[ordinal].clone(),
                uploaded_at: photo.uploaded_at,
                similarity,
                ordinal,
            })
            .collect();
        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    /// Observations currently indexed for `photo_id`, in insertion order.
    pub fn observations(&self, photo_id: &PhotoId) -> Vec<FaceObservation> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .photos
            .get(photo_id)
            .map(|p| p.observations.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, photo_id: &PhotoId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.photos.contains_key(photo_id)
    }

    /// Number of indexed face observations.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).faces
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of photos with at least one indexed face.
    pub fn photo_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).photos.len()
    }

    /// Embedding dimension fixed by the first indexed face.
    pub fn dim(&self) -> Option<usize> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).dim
    }

    /// Drop the whole gallery, in memory and in the store.
    pub fn clear(&self) -> Result<(), IndexError> {
        if let Some(store) = &self.store {
            store.purge()?;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = IndexState::default();
        self.photo_locks.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::info!("gallery cleared");
        Ok(())
    }
}

/// Validate observations and pack their normalized embeddings into a matrix.
///
/// `dim` is the gallery dimension; it is set here when still unknown.
fn build_entry(
    photo_id: &PhotoId,
    uploaded_at: DateTime<Utc>,
    observations: Vec<FaceObservation>,
    dim: &mut Option<usize>,
) -> Result<IndexedPhoto, IndexError> {
    let Some(first) = observations.first() else {
        return Ok(IndexedPhoto {
            uploaded_at,
            observations,
            matrix: Array2::zeros((0, dim.unwrap_or(0))),
        });
    };

    let d = dim.unwrap_or(first.embedding.dim());
    let mut flat = Vec::with_capacity(observations.len() * d);
    for obs in &observations {
        if &obs.photo_id != photo_id {
            return Err(IndexError::ForeignObservation {
                expected: photo_id.clone(),
                found: obs.photo_id.clone(),
            });
        }
        if obs.embedding.dim() == 0 || !obs.embedding.is_finite() {
            return Err(IndexError::InvalidEmbedding);
        }
        if obs.embedding.dim() != d {
            return Err(IndexError::DimensionMismatch { expected: d, actual: obs.embedding.dim() });
        }
        flat.extend(obs.embedding.normalized().values);
    }

    let matrix = Array2::from_shape_vec((observations.len(), d), flat)
        .map_err(|_| IndexError::DimensionMismatch { expected: d, actual: 0 })?;
    *dim = Some(d);

    Ok(IndexedPhoto {
        uploaded_at,
        observations,
        matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteGalleryStore, StoredFaces};
    use chrono::TimeZone;
    use pixmatch_core::{BoundingBox, Photo};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn obs(photo: &str, values: &[f32]) -> FaceObservation {
        FaceObservation::new(
            PhotoId::from(photo),
            BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9, landmarks: None },
            Embedding::new(values.to_vec()),
        )
    }

    fn ids(hits: &[ScoredFace]) -> Vec<&str> {
        hits.iter().map(|h| h.photo_id().as_str()).collect()
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl GalleryStore for BrokenStore {
        fn save_photo(&self, _: &Photo) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk full".into()))
        }
        fn load_photos(&self) -> Result<Vec<Photo>, StoreError> {
            Ok(Vec::new())
        }
        fn replace_faces(&self, _: &PhotoId, _: DateTime<Utc>, _: &[FaceObservation]) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk full".into()))
        }
        fn delete_faces(&self, _: &PhotoId) -> Result<usize, StoreError> {
            Ok(0)
        }
        fn delete_photo(&self, _: &PhotoId) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn load_faces(&self) -> Result<Vec<StoredFaces>, StoreError> {
            Ok(Vec::new())
        }
        fn purge(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_insert_and_search_ranked() {
        let index = GalleryIndex::in_memory();
        index.insert(&"a".into(), at(0), vec![obs("a", &[1.0, 0.0, 0.0])]).unwrap();
        index.insert(&"b".into(), at(1), vec![obs("b", &[0.9, 0.1, 0.0]), obs("b", &[0.0, 0.0, 1.0])]).unwrap();
        index.insert(&"c".into(), at(2), vec![obs("c", &[0.0, 1.0, 0.0])]).unwrap();

        let hits = index.search(&Embedding::new(vec![1.0, 0.0, 0.0]), 10, 0.5).unwrap();
        assert_eq!(ids(&hits), vec!["a", "b"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].ordinal, 0);
        assert_eq!(index.len(), 4);
        assert_eq!(index.photo_count(), 3);
    }

    #[test]
    fn test_search_respects_k_and_strict_threshold() {
        let index = GalleryIndex::in_memory();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            index.insert(&(*id).into(), at(i as i64), vec![obs(id, &[1.0, 0.0])]).unwrap();
        }
        let q = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(index.search(&q, 2, 0.0).unwrap().len(), 2);
        // similarity exactly at the threshold is not reported
        assert!(index.search(&q, 10, 1.0).unwrap().is_empty());
    }

    #[test]
    fn test_ties_break_by_upload_time_then_id() {
        let index = GalleryIndex::in_memory();
        index.insert(&"late".into(), at(10), vec![obs("late", &[1.0, 0.0])]).unwrap();
        index.insert(&"z-early".into(), at(1), vec![obs("z-early", &[2.0, 0.0])]).unwrap();
        index.insert(&"a-early".into(), at(1), vec![obs("a-early", &[1.0, 0.0])]).unwrap();

        let hits = index.search(&Embedding::new(vec![1.0, 0.0]), 10, 0.0).unwrap();
        assert_eq!(ids(&hits), vec!["a-early", "z-early", "late"]);
    }

    #[test]
    fn test_search_is_deterministic() {
        let index = GalleryIndex::in_memory();
        for i in 0..50 {
            let id = format!("p{i}");
            let angle = i as f32 * 0.01;
            index.insert(&id.as_str().into(), at(i % 7), vec![obs(&id, &[angle.cos(), angle.sin()])]).unwrap();
        }
        let q = Embedding::new(vec![1.0, 0.05]);
        let first = index.search(&q, 20, 0.9).unwrap();
        for _ in 0..5 {
            assert_eq!(index.search(&q, 20, 0.9).unwrap(), first);
        }
    }

    #[test]
    fn test_reinsert_replaces() {
        let index = GalleryIndex::in_memory();
        let a: PhotoId = "a".into();
        index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0]), obs("a", &[0.0, 1.0])]).unwrap();
        index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.observations(&a).len(), 1);

        index.insert(&a, at(0), vec![]).unwrap();
        assert!(!index.contains(&a));
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_rejects_partial_batch() {
        let index = GalleryIndex::in_memory();
        index.insert(&"a".into(), at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();

        let bad = vec![obs("b", &[1.0, 0.0]), obs("b", &[1.0, 0.0, 0.0])];
        assert!(matches!(
            index.insert(&"b".into(), at(1), bad),
            Err(IndexError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(!index.contains(&"b".into()));
        assert_eq!(index.len(), 1);

        let nan = vec![obs("c", &[f32::NAN, 0.0])];
        assert!(matches!(index.insert(&"c".into(), at(2), nan), Err(IndexError::InvalidEmbedding)));

        let foreign = vec![obs("a", &[1.0, 0.0])];
        assert!(matches!(
            index.insert(&"d".into(), at(3), foreign),
            Err(IndexError::ForeignObservation { .. })
        ));
    }

    #[test]
    fn test_store_failure_leaves_no_observations() {
        let index = GalleryIndex::open(Arc::new(BrokenStore)).unwrap();
        let a: PhotoId = "a".into();
        let result = index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0]), obs("a", &[0.0, 1.0])]);
        assert!(matches!(result, Err(IndexError::Store(_))));
        assert!(index.observations(&a).is_empty());
        assert!(index.is_empty());
        assert!(index.search(&Embedding::new(vec![1.0, 0.0]), 10, -1.0).unwrap().is_empty());
    }

    #[test]
    fn test_mid_transaction_failure_is_all_or_nothing() {
        let store = Arc::new(SqliteGalleryStore::open_in_memory().unwrap());
        let index = GalleryIndex::open(store.clone()).unwrap();
        let a: PhotoId = "a".into();
        index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();

        // duplicate observation ids fail on the second row inside the transaction
        let dup = obs("a", &[0.0, 1.0]);
        assert!(index.insert(&a, at(0), vec![dup.clone(), dup]).is_err());

        let kept = index.observations(&a);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].embedding.values, vec![1.0, 0.0]);
        assert_eq!(store.load_faces().unwrap()[0].observations.len(), 1);
    }

    #[test]
    fn test_remove() {
        let index = GalleryIndex::in_memory();
        let a: PhotoId = "a".into();
        index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0]), obs("a", &[0.5, 0.5])]).unwrap();
        assert_eq!(index.remove(&a).unwrap(), 2);
        assert_eq!(index.remove(&a).unwrap(), 0);
        assert!(index.search(&Embedding::new(vec![1.0, 0.0]), 10, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_remove_drops_idle_write_lock() {
        let index = GalleryIndex::in_memory();
        let a: PhotoId = "a".into();
        index.insert(&a, at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();
        assert_eq!(index.photo_locks.lock().unwrap().len(), 1);

        index.remove(&a).unwrap();
        assert!(index.photo_locks.lock().unwrap().is_empty());

        // A writer still holding the lock keeps the entry alive.
        let held = index.photo_lock(&a);
        index.remove(&a).unwrap();
        assert_eq!(index.photo_locks.lock().unwrap().len(), 1);
        drop(held);
    }

    #[test]
    fn test_reopen_from_store() {
        let store = Arc::new(SqliteGalleryStore::open_in_memory().unwrap());
        {
            let index = GalleryIndex::open(store.clone()).unwrap();
            index.insert(&"a".into(), at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();
            index.insert(&"b".into(), at(1), vec![obs("b", &[0.0, 1.0]), obs("b", &[0.7, 0.7])]).unwrap();
            index.remove(&"a".into()).unwrap();
        }

        let index = GalleryIndex::open(store).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.dim(), Some(2));
        assert!(!index.contains(&"a".into()));
        let hits = index.search(&Embedding::new(vec![1.0, 1.0]), 1, 0.5).unwrap();
        assert_eq!(hits[0].ordinal, 1);
    }

    #[test]
    fn test_query_dimension_checked() {
        let index = GalleryIndex::in_memory();
        assert!(index.search(&Embedding::new(vec![1.0]), 5, 0.0).unwrap().is_empty());
        index.insert(&"a".into(), at(0), vec![obs("a", &[1.0, 0.0])]).unwrap();
        assert!(matches!(
            index.search(&Embedding::new(vec![1.0]), 5, 0.0),
            Err(IndexError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_concurrent_inserts_and_searches() {
        let index = Arc::new(GalleryIndex::in_memory());
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("t{t}-{i}");
                        let faces = vec![obs(&id, &[1.0, t as f32]), obs(&id, &[t as f32, 1.0])];
                        index.insert(&id.as_str().into(), at(i), faces).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let index = index.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let hits = index.search(&Embedding::new(vec![1.0, 1.0]), usize::MAX, -1.0).unwrap();
                    // a photo is either fully visible (2 faces) or absent
                    let mut per_photo: HashMap<PhotoId, usize> = HashMap::new();
                    for h in hits {
                        *per_photo.entry(h.observation.photo_id).or_default() += 1;
                    }
                    assert!(per_photo.values().all(|&n| n == 2));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(index.photo_count(), 200);
        assert_eq!(index.len(), 400);
    }

    #[test]
    fn test_concurrent_same_photo_reinserts_converge() {
        let index = Arc::new(GalleryIndex::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                std::thread::spawn(move || {
                    let faces = (0..=t % 3).map(|_| obs("same", &[1.0, 0.0])).collect();
                    index.insert(&"same".into(), at(0), faces).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // whichever insert won, exactly one observation set is visible
        assert_eq!(index.len(), index.observations(&"same".into()).len());
        assert_eq!(index.photo_count(), 1);
    }
}
