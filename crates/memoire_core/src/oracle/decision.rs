//! Decision document parsing.
//!
//! # Responsibility
//! - Turn raw oracle text into a typed [`CurationDecision`].
//! - Reject schema violations before the curator touches any store.
//!
//! # Invariants
//! - Parsed proposal content is trimmed and non-blank.
//! - Context references are either a UUID or a normalized, non-blank label.
//! - `ids_to_delete` holds each id at most once, in first-seen order.
//!
//! Project-scoped checks (ids owned by the project, context ids that exist)
//! need the stores and run in the curator.

use crate::model::memory::{ContextId, FragmentId};
use crate::model::normalize_label;
use serde::Deserialize;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    /// Not JSON, or JSON that does not match the decision schema.
    Malformed(String),
    BlankContent { index: usize },
    BlankContextRef { index: usize },
    BlankContextName { index: usize },
    InvalidFragmentId(String),
}

impl Display for DecisionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(message) => write!(f, "malformed decision: {message}"),
            Self::BlankContent { index } => {
                write!(f, "fragments_to_create[{index}] has blank content")
            }
            Self::BlankContextRef { index } => {
                write!(f, "fragments_to_create[{index}] cites a blank context")
            }
            Self::BlankContextName { index } => {
                write!(f, "contexts_to_create[{index}] has a blank name")
            }
            Self::InvalidFragmentId(value) => {
                write!(f, "ids_to_delete holds a non-uuid value `{value}`")
            }
        }
    }
}

impl Error for DecisionError {}

/// A context cited by a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextRef {
    Id(ContextId),
    /// Normalized label; may name an existing context or a new one.
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentProposal {
    pub content: String,
    pub contexts: Vec<ContextRef>,
}

/// Description for a label the oracle wants created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    pub label: String,
    pub description: String,
}

/// Validated oracle decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurationDecision {
    pub fragments_to_create: Vec<FragmentProposal>,
    pub ids_to_delete: Vec<FragmentId>,
    pub contexts_to_create: Vec<ContextSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDecision {
    fragments_to_create: Vec<RawFragment>,
    ids_to_delete: Vec<String>,
    #[serde(default)]
    contexts_to_create: Vec<RawContext>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFragment {
    content: String,
    #[serde(default, alias = "context_labels_or_ids")]
    contexts: Vec<String>,
    /// Single-context form.
    #[serde(default)]
    context_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContext {
    name: String,
    #[serde(default)]
    description: String,
}

impl CurationDecision {
    /// Parses and schema-validates a raw decision document.
    ///
    /// Accepts the document wrapped in a Markdown code fence.
    pub fn parse(raw: &str) -> Result<Self, DecisionError> {
        let document: RawDecision = serde_json::from_str(strip_code_fence(raw))
            .map_err(|err| DecisionError::Malformed(err.to_string()))?;

        let mut fragments_to_create = Vec::with_capacity(document.fragments_to_create.len());
        for (index, fragment) in document.fragments_to_create.into_iter().enumerate() {
            let content = fragment.content.trim();
            if content.is_empty() {
                return Err(DecisionError::BlankContent { index });
            }
            let mut contexts: Vec<ContextRef> = Vec::new();
            for value in fragment.contexts.iter().chain(fragment.context_name.iter()) {
                let reference = parse_context_ref(value)
                    .ok_or(DecisionError::BlankContextRef { index })?;
                if !contexts.contains(&reference) {
                    contexts.push(reference);
                }
            }
            fragments_to_create.push(FragmentProposal {
                content: content.to_string(),
                contexts,
            });
        }

        let mut seen = HashSet::new();
        let mut ids_to_delete = Vec::with_capacity(document.ids_to_delete.len());
        for value in &document.ids_to_delete {
            let id = Uuid::parse_str(value.trim())
                .map_err(|_| DecisionError::InvalidFragmentId(value.clone()))?;
            if seen.insert(id) {
                ids_to_delete.push(id);
            }
        }

        let mut contexts_to_create = Vec::with_capacity(document.contexts_to_create.len());
        for (index, context) in document.contexts_to_create.into_iter().enumerate() {
            let label = normalize_label(&context.name);
            if label.is_empty() {
                return Err(DecisionError::BlankContextName { index });
            }
            contexts_to_create.push(ContextSpec {
                label,
                description: context.description.trim().to_string(),
            });
        }

        Ok(Self {
            fragments_to_create,
            ids_to_delete,
            contexts_to_create,
        })
    }
}

fn parse_context_ref(value: &str) -> Option<ContextRef> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Uuid::parse_str(trimmed) {
        Ok(id) => Some(ContextRef::Id(id)),
        Err(_) => Some(ContextRef::Label(normalize_label(trimmed))),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
