//! pixmatch-gallery — Face gallery for one event.
//!
//! Holds every indexed face observation, persists it through a
//! [`GalleryStore`], and answers nearest-neighbour queries for the matcher.

pub mod index;
pub mod matcher;
pub mod store;

pub use index::{GalleryIndex, IndexError, ScoredFace};
pub use matcher::{CosineMatcher, MatchResult, Matcher, PhotoMatch};
pub use store::{GalleryStore, SqliteGalleryStore, StoreError, StoredFaces};
