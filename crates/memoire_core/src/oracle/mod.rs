//! External collaborator contracts: embedding generator, decision oracle and
//! synthesis oracle.
//!
//! # Responsibility
//! - Define the request/response shapes exchanged with model-backed
//!   collaborators.
//! - Keep transport concerns out of the engine; implementations live with
//!   the embedding application.
//!
//! # Invariants
//! - Oracle output is untrusted text; it is parsed and validated by
//!   [`decision::CurationDecision::parse`] before any write.
//! - Embeddings returned to the engine always have the generator's declared
//!   dimension (see [`embed_checked`]).

use crate::model::memory::{ContextId, FragmentId};
use crate::model::project::ProjectId;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod decision;
mod embedding_cache;

pub use embedding_cache::{CachedEmbeddingGenerator, EmbeddingCacheStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// The generator could not be reached or failed to answer.
    Unavailable(String),
    /// The generator answered with a vector of the wrong shape.
    InvalidOutput(String),
}

impl Display for EmbeddingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "embedding generator unavailable: {message}"),
            Self::InvalidOutput(message) => write!(f, "invalid embedding output: {message}"),
        }
    }
}

impl Error for EmbeddingError {}

/// Transport failure of a decision or synthesis oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleError {
    pub message: String,
}

impl OracleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for OracleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "oracle unavailable: {}", self.message)
    }
}

impl Error for OracleError {}

/// Text to fixed-dimension vector.
pub trait EmbeddingGenerator: Send + Sync {
    /// Model identifier; part of the embedding cache key.
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Decides how new content is split, filed and which fragments it supersedes.
pub trait DecisionOracle: Send + Sync {
    /// Returns the raw decision document (JSON text).
    fn decide(&self, request: &CurationRequest) -> Result<String, OracleError>;
}

/// Turns ranked fragments into an answer for a recall query.
pub trait SynthesisOracle: Send + Sync {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<String, OracleError>;
}

/// Input handed to the decision oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurationRequest {
    pub new_content: String,
    pub candidate_fragments: Vec<CandidateFragment>,
    pub candidate_contexts: Vec<CandidateContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateFragment {
    pub id: FragmentId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateContext {
    pub id: ContextId,
    pub label: String,
}

/// Input handed to the synthesis oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub query: String,
    pub focus: Option<String>,
    /// Ranked best first.
    pub fragments: Vec<SynthesisFragment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisFragment {
    pub id: FragmentId,
    pub project_id: ProjectId,
    pub content: String,
    pub score: f32,
}

/// Embeds `text` and checks the result against the generator's dimension.
pub fn embed_checked(
    generator: &dyn EmbeddingGenerator,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    let vector = generator.embed(text)?;
    if vector.len() != generator.dimension() {
        return Err(EmbeddingError::InvalidOutput(format!(
            "model {} returned {} values, expected {}",
            generator.model(),
            vector.len(),
            generator.dimension()
        )));
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(EmbeddingError::InvalidOutput(format!(
            "model {} returned non-finite values",
            generator.model()
        )));
    }
    Ok(vector)
}
