use crate::index::{rank, GalleryIndex, IndexError, ScoredFace};
use pixmatch_core::{Embedding, FaceObservation, PhotoId};
use serde::Serialize;
use std::collections::HashMap;

/// Photos matched by a query, best first, each photo at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    pub matches: Vec<PhotoMatch>,
}

/// A matched photo and the observation in it that scored best.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoMatch {
    pub photo_id: PhotoId,
    pub observation: FaceObservation,
    pub similarity: f32,
}

impl MatchResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn photo_ids(&self) -> Vec<&PhotoId> {
        self.matches.iter().map(|m| &m.photo_id).collect()
    }
}

/// Strategy for turning query embeddings into matched photos.
pub trait Matcher {
    /// Search with every embedding in `queries` and merge the hits.
    fn find(&self, index: &GalleryIndex, queries: &[Embedding]) -> Result<MatchResult, IndexError>;
}

/// Exact cosine matcher over a [`GalleryIndex`].
///
/// `threshold` trades false negatives (a customer's photo missed) against
/// false positives (a stranger's photo shown); it is never hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
    /// Maximum number of photos returned.
    pub max_results: usize,
}

impl CosineMatcher {
    pub fn new(threshold: f32, max_results: usize) -> Self {
        Self { threshold, max_results }
    }
}

impl Matcher for CosineMatcher {
    fn find(&self, index: &GalleryIndex, queries: &[Embedding]) -> Result<MatchResult, IndexError> {
        let mut best: HashMap<PhotoId, ScoredFace> = HashMap::new();

        for query in queries {
            // Every face above threshold is needed: per-photo dedup happens after the scan.
            for hit in index.search(query, usize::MAX, self.threshold)? {
                match best.get(hit.photo_id()) {
                    Some(current) if rank(current, &hit).is_le() => {}
                    _ => {
                        best.insert(hit.photo_id().clone(), hit);
                    }
                }
            }
        }

        let mut ranked: Vec<ScoredFace> = best.into_values().collect();
        ranked.sort_by(rank);
        ranked.truncate(self.max_results);

        tracing::debug!(
            queries = queries.len(),
            photos = ranked.len(),
            threshold = self.threshold,
            "match complete"
        );

        Ok(MatchResult {
            matches: ranked
                .into_iter()
                .map(|hit| PhotoMatch {
                    photo_id: hit.observation.photo_id.clone(),
                    similarity: hit.similarity,
                    observation: hit.observation,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pixmatch_core::BoundingBox;
    use std::collections::HashSet;

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

    fn ids(result: &MatchResult) -> Vec<&str> {
        result.matches.iter().map(|m| m.photo_id.as_str()).collect()
    }

    /// Photo A: one face E_a. Photo B: E_b1 close to E_a, E_b2 far from it.
    fn scenario() -> (GalleryIndex, Embedding, FaceObservation) {
        let index = GalleryIndex::in_memory();
        let e_a = [1.0, 0.0, 0.0, 0.0];
        let b1 = obs("B", &[0.95, 0.2, 0.1, 0.0]);
        index.insert(&"A".into(), at(0), vec![obs("A", &e_a)]).unwrap();
        index
            .insert(&"B".into(), at(1), vec![obs("B", &[0.0, 0.0, 0.2, 1.0]), b1.clone()])
            .unwrap();
        index.insert(&"C".into(), at(2), vec![obs("C", &[0.0, 1.0, 0.0, 0.0])]).unwrap();
        (index, Embedding::new(e_a.to_vec()), b1)
    }

    #[test]
    fn test_group_photo_matched_once_via_best_face() {
        let (index, e_a, b1) = scenario();
        let result = CosineMatcher::new(0.6, 20).find(&index, &[e_a]).unwrap();

        assert_eq!(ids(&result), vec!["A", "B"]);
        assert_eq!(result.matches[1].observation, b1);
        assert!(result.matches[0].similarity > result.matches[1].similarity);
    }

    #[test]
    fn test_below_threshold_is_empty_not_error() {
        let (index, _, _) = scenario();
        let probe = Embedding::new(vec![-1.0, 0.0, 0.0, 0.0]);
        let result = CosineMatcher::new(0.4, 20).find(&index, &[probe]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_threshold_monotonicity() {
        let (index, e_a, _) = scenario();
        let probe = Embedding::new(vec![0.7, 0.5, 0.3, 0.4]);
        let mut previous = usize::MAX;
        for step in 0..=20 {
            let threshold = -1.0 + step as f32 * 0.1;
            let size = CosineMatcher::new(threshold, 100)
                .find(&index, &[e_a.clone(), probe.clone()])
                .unwrap()
                .len();
            assert!(size <= previous, "threshold {threshold}: {size} > {previous}");
            previous = size;
        }
    }

    #[test]
    fn test_union_dedupes_and_keeps_best_score() {
        let (index, e_a, _) = scenario();
        let e_c = Embedding::new(vec![0.0, 1.0, 0.0, 0.0]);
        let result = CosineMatcher::new(0.1, 20).find(&index, &[e_a, e_c]).unwrap();

        let unique: HashSet<_> = result.photo_ids().into_iter().collect();
        assert_eq!(unique.len(), result.len());
        assert_eq!(ids(&result)[..2], ["A", "C"]);
        assert!((result.matches[1].similarity - 1.0).abs() < 1e-6);
        assert!(ids(&result).contains(&"B"));
    }

    #[test]
    fn test_max_results_truncates_after_dedup() {
        let (index, e_a, _) = scenario();
        let result = CosineMatcher::new(-1.0, 2).find(&index, &[e_a]).unwrap();
        assert_eq!(ids(&result), vec!["A", "B"]);
    }

    #[test]
    fn test_no_queries_no_matches() {
        let (index, _, _) = scenario();
        assert!(CosineMatcher::new(0.0, 20).find(&index, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_retracted_photo_no_longer_matches() {
        let (index, e_a, _) = scenario();
        index.remove(&"A".into()).unwrap();
        let result = CosineMatcher::new(0.6, 20).find(&index, &[e_a]).unwrap();
        assert_eq!(ids(&result), vec!["B"]);
    }
}
