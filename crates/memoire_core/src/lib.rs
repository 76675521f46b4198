//! Ingestion and consistency engine for Memoire.
//!
//! Persists natural-language memory as fragments filed under contexts, keeps
//! a metadata store and a vector index consistent with each other, and
//! serves ranked recall. This crate is the single source of truth for the
//! graph invariants.

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod logging;
pub mod model;
pub mod oracle;
pub mod repo;
pub mod service;

pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use index::{InMemoryVectorIndex, IndexError, IndexHit, SqliteVectorIndex, VectorIndex};
pub use logging::{default_log_level, init_logging, init_logging_from_env, logging_status};
pub use model::memory::{
    AnchorId, AnchorPriority, CognitiveAnchor, ContextId, FragmentId, MemoryContext,
    MemoryFragment,
};
pub use model::project::{Project, ProjectId};
pub use model::task::{Task, TaskId, TaskStatus, TaskUpdate};
pub use model::{EntityKind, ValidationError};
pub use oracle::{
    CachedEmbeddingGenerator, CurationRequest, DecisionOracle, EmbeddingError,
    EmbeddingGenerator, OracleError, SynthesisOracle, SynthesisRequest,
};
pub use repo::metadata_store::{
    MetadataStore, ProjectStats, RepoError, RepoResult, SqliteMetadataStore,
};
pub use repo::task_repo::TaskRepository;
pub use service::coordinator::{DualStoreCoordinator, ScoredFragment};
pub use service::curator::{IngestionCurator, IngestionReport};
pub use service::memory_service::{Collaborators, MemoryService};
pub use service::recall::{RecallEngine, RecallOutcome, RecallRequest};
pub use service::repair::{RepairReport, RepairSweep};
pub use service::task_service::TaskService;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
