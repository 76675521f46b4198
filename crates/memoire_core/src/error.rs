//! Engine-level error taxonomy.
//!
//! # Responsibility
//! - Map store, index and collaborator failures onto the categories callers
//!   act on.
//!
//! # Invariants
//! - Errors name the failing id and store where one exists.
//! - The engine never retries; every variant is surfaced exactly once.

use crate::index::IndexError;
use crate::model::{EntityKind, ValidationError};
use crate::oracle::decision::DecisionError;
use crate::oracle::{EmbeddingError, OracleError};
use crate::repo::metadata_store::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    NotFound { kind: EntityKind, id: Uuid },
    /// A write would dangle or cross projects.
    ConstraintViolation(String),
    IndexUnavailable(IndexError),
    MetadataUnavailable(RepoError),
    /// The decision oracle answered with an unusable decision; nothing was
    /// written.
    OracleContractViolation(String),
    /// The decision oracle could not be reached.
    OracleUnavailable(OracleError),
    SynthesisUnavailable(OracleError),
    EmbeddingUnavailable(EmbeddingError),
    /// Blank names, labels or content, or vectors of the wrong dimension.
    InvalidInput(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: EntityKind, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stable machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::MetadataUnavailable(_) => "metadata_unavailable",
            Self::OracleContractViolation(_) => "oracle_contract_violation",
            Self::OracleUnavailable(_) => "oracle_unavailable",
            Self::SynthesisUnavailable(_) => "synthesis_unavailable",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::ConstraintViolation(message) => write!(f, "constraint violation: {message}"),
            Self::IndexUnavailable(err) => write!(f, "{err}"),
            Self::MetadataUnavailable(err) => write!(f, "{err}"),
            Self::OracleContractViolation(message) => {
                write!(f, "oracle contract violation: {message}")
            }
            Self::OracleUnavailable(err) => write!(f, "decision {err}"),
            Self::SynthesisUnavailable(err) => write!(f, "synthesis {err}"),
            Self::EmbeddingUnavailable(err) => write!(f, "{err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IndexUnavailable(err) => Some(err),
            Self::MetadataUnavailable(err) => Some(err),
            Self::OracleUnavailable(err) => Some(err),
            Self::SynthesisUnavailable(err) => Some(err),
            Self::EmbeddingUnavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::InvalidInput(err.to_string()),
            RepoError::NotFound { kind, id } => Self::NotFound { kind, id },
            RepoError::ConstraintViolation(message) => Self::ConstraintViolation(message),
            other => Self::MetadataUnavailable(other),
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::DimensionMismatch { .. } | IndexError::NonFiniteVector => {
                Self::InvalidInput(value.to_string())
            }
            other => Self::IndexUnavailable(other),
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(value: ValidationError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

impl From<DecisionError> for EngineError {
    fn from(value: DecisionError) -> Self {
        Self::OracleContractViolation(value.to_string())
    }
}

impl From<EmbeddingError> for EngineError {
    fn from(value: EmbeddingError) -> Self {
        Self::EmbeddingUnavailable(value)
    }
}
