//! Domain model for projects, the fragment/context memory graph, anchors
//! and tasks.
//!
//! # Responsibility
//! - Define the canonical records shared by stores, coordinator and services.
//! - Own identity aliases and input normalization rules.
//!
//! # Invariants
//! - Every entity is identified by a stable UUID that is never reused.
//! - Context labels compare by [`label_key`], never by raw text.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod memory;
pub mod project;
pub mod task;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Entity families addressed by id in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Fragment,
    Context,
    Anchor,
    Task,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Fragment => "fragment",
            Self::Context => "context",
            Self::Anchor => "anchor",
            Self::Task => "task",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-time validation failures for model records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field is blank after trimming.
    BlankField {
        kind: EntityKind,
        field: &'static str,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankField { kind, field } => {
                write!(f, "{kind} field `{field}` must not be blank")
            }
        }
    }
}

impl Error for ValidationError {}

pub(crate) fn require_text(
    value: &str,
    kind: EntityKind,
    field: &'static str,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::BlankField { kind, field });
    }
    Ok(())
}

/// Trims a context label and collapses inner whitespace runs.
pub fn normalize_label(label: &str) -> String {
    WHITESPACE_RE.replace_all(label.trim(), " ").into_owned()
}

/// Comparison key for context labels: normalized and lowercased.
///
/// `"  Q3   Finance "` and `"q3 finance"` share one key, so a project never
/// holds two contexts for the same theme.
pub fn label_key(label: &str) -> String {
    normalize_label(label).to_lowercase()
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
