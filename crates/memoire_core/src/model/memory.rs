//! Memory graph records: fragments, contexts and cognitive anchors.
//!
//! # Invariants
//! - `MemoryFragment::context_ids` and `MemoryContext::member_ids` are two
//!   read projections of one membership relation; for every fragment `F`
//!   and context `C`, `C ∈ F.context_ids ⟺ F ∈ C.member_ids`.
//! - A fragment's embedding lives in the vector index only, never here.

use super::project::ProjectId;
use super::{label_key, normalize_label, now_epoch_ms, require_text, EntityKind, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type FragmentId = Uuid;
pub type ContextId = Uuid;
pub type AnchorId = Uuid;

/// Source label for fragments stored verbatim by a caller.
pub const SOURCE_USER: &str = "user";
/// Source label stamped on fragments written by curated ingestion.
pub const SOURCE_CURATED_INGESTION: &str = "curated_ingestion";
/// Source label stamped on fragments produced by a merge.
pub const SOURCE_MERGE: &str = "merge";

/// One stored unit of memory content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub id: FragmentId,
    pub project_id: ProjectId,
    pub content: String,
    /// Origin of the write (`user`, `curated_ingestion`, `merge`, ...).
    pub source: String,
    /// Contexts this fragment belongs to. Sorted for deterministic output.
    pub context_ids: BTreeSet<ContextId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MemoryFragment {
    pub fn new(
        project_id: ProjectId,
        content: impl Into<String>,
        source: impl Into<String>,
        context_ids: BTreeSet<ContextId>,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            id: Uuid::new_v4(),
            project_id,
            content: content.into(),
            source: source.into(),
            context_ids,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.content, EntityKind::Fragment, "content")
    }
}

/// Named thematic grouping of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub id: ContextId,
    pub project_id: ProjectId,
    pub label: String,
    pub description: String,
    pub member_ids: BTreeSet<FragmentId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MemoryContext {
    pub fn new(
        project_id: ProjectId,
        label: impl AsRef<str>,
        description: impl Into<String>,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            id: Uuid::new_v4(),
            project_id,
            label: normalize_label(label.as_ref()),
            description: description.into().trim().to_string(),
            member_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn label_key(&self) -> String {
        label_key(&self.label)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.label, EntityKind::Context, "label")
    }
}

/// Relative importance of an anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl AnchorPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Lightweight navigation tag pointing at fragments and contexts.
///
/// References only need to exist at write time; deleting a referenced
/// fragment or context silently drops the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CognitiveAnchor {
    pub id: AnchorId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub priority: AnchorPriority,
    pub fragment_ids: BTreeSet<FragmentId>,
    pub context_ids: BTreeSet<ContextId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CognitiveAnchor {
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        let now = now_epoch_ms();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into().trim().to_string(),
            description: String::new(),
            priority: AnchorPriority::default(),
            fragment_ids: BTreeSet::new(),
            context_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text(&self.title, EntityKind::Anchor, "title")
    }
}
