//! Vector index contract and shared scoring helpers.
//!
//! # Responsibility
//! - Define per-project nearest-neighbour retrieval over embedding vectors.
//! - Provide cosine scoring and deterministic ranking shared by backends.
//!
//! # Invariants
//! - Vectors are partitioned by project; a search never returns another
//!   project's fragment.
//! - Every stored and queried vector has the index's fixed dimension.
//! - Results are ordered by descending score, ties by ascending fragment id.
//! - Callers never receive partial results: a failing backend returns
//!   `IndexError::Unavailable`.

use crate::model::memory::FragmentId;
use crate::model::project::ProjectId;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod memory;
mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug)]
pub enum IndexError {
    /// The backend could not serve the request.
    Unavailable {
        project_id: Option<ProjectId>,
        message: String,
    },
    DimensionMismatch {
        expected: usize,
        actual: usize,
    },
    /// A caller-supplied vector holds NaN or infinite components.
    NonFiniteVector,
    InvalidData(String),
}

impl IndexError {
    pub(crate) fn unavailable(project_id: Option<ProjectId>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            project_id,
            message: message.into(),
        }
    }
}

impl Display for IndexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable {
                project_id: Some(project_id),
                message,
            } => write!(f, "vector index unavailable for project {project_id}: {message}"),
            Self::Unavailable {
                project_id: None,
                message,
            } => write!(f, "vector index unavailable: {message}"),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "vector dimension mismatch: expected {expected}, got {actual}"
            ),
            Self::NonFiniteVector => write!(f, "vector contains non-finite values"),
            Self::InvalidData(message) => write!(f, "invalid persisted vector data: {message}"),
        }
    }
}

impl Error for IndexError {}

impl From<rusqlite::Error> for IndexError {
    fn from(value: rusqlite::Error) -> Self {
        Self::unavailable(None, value.to_string())
    }
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub fragment_id: FragmentId,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Per-project nearest-neighbour index over fragment embeddings.
pub trait VectorIndex: Send + Sync {
    /// Fixed vector dimension accepted by this index.
    fn dimension(&self) -> usize;

    /// Inserts or replaces the vector of one fragment.
    fn upsert(&self, project_id: ProjectId, fragment_id: FragmentId, vector: &[f32])
        -> IndexResult<()>;

    /// Removes one vector. Returns `false` when nothing was stored; deleting
    /// twice is not an error.
    fn delete(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool>;

    /// Returns up to `k` hits ranked by descending cosine similarity.
    fn search(&self, project_id: ProjectId, query: &[f32], k: usize)
        -> IndexResult<Vec<IndexHit>>;

    /// Whether the project holds a vector for `fragment_id`.
    fn contains(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool>;

    /// Lists every fragment id with a stored vector in the project.
    fn ids(&self, project_id: ProjectId) -> IndexResult<Vec<FragmentId>>;

    /// Removes all vectors of a project and returns how many were removed.
    fn drop_project(&self, project_id: ProjectId) -> IndexResult<usize>;
}

/// Searches several projects and re-ranks the union by score.
///
/// Fails as a whole when any project search fails.
pub fn search_many(
    index: &dyn VectorIndex,
    project_ids: &[ProjectId],
    query: &[f32],
    k: usize,
) -> IndexResult<Vec<IndexHit>> {
    let mut hits = Vec::new();
    for project_id in project_ids {
        hits.extend(index.search(*project_id, query, k)?);
    }
    Ok(rank_hits(hits, k))
}

/// Cosine similarity computed in `f64`. Zero-norm inputs score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sorts by descending score (ties by ascending id) and keeps the top `k`.
pub fn rank_hits(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.fragment_id.cmp(&b.fragment_id))
}

pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> IndexResult<()> {
    if vector.len() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(IndexError::NonFiniteVector);
    }
    Ok(())
}

pub(crate) fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|value| *value == 0.0)
}

/// Scores `candidates` against `query` and returns the ranked top `k`.
pub(crate) fn score_candidates<'a>(
    query: &[f32],
    candidates: impl IntoIterator<Item = (FragmentId, &'a [f32])>,
    k: usize,
) -> Vec<IndexHit> {
    if k == 0 || is_zero_vector(query) {
        return Vec::new();
    }
    let hits = candidates
        .into_iter()
        .map(|(fragment_id, stored)| IndexHit {
            fragment_id,
            score: cosine_similarity(query, stored) as f32,
        })
        .collect();
    rank_hits(hits, k)
}
