//! Engine configuration.
//!
//! # Responsibility
//! - Hold the tunables of curation, recall, the embedding cache and the
//!   repair sweep.
//! - Load them from JSON, then apply `MEMOIRE_*` environment overrides.
//!
//! # Invariants
//! - A config handed to the engine has passed [`EngineConfig::validate`].

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

pub const ENV_SIMILARITY_THRESHOLD: &str = "MEMOIRE_SIMILARITY_THRESHOLD";
pub const ENV_MAX_RESULTS: &str = "MEMOIRE_MAX_RESULTS";
pub const ENV_DEDUP_THRESHOLD: &str = "MEMOIRE_DEDUP_THRESHOLD";
pub const ENV_EMBEDDING_DIMENSION: &str = "MEMOIRE_EMBEDDING_DIMENSION";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidValue { field: &'static str, message: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::InvalidValue { field, message } => {
                write!(f, "invalid config value for `{field}`: {message}")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidate fragments handed to the decision oracle (K).
    pub candidate_limit: usize,
    /// Minimum cosine similarity for a candidate fragment.
    pub candidate_threshold: f32,
    /// Similarity at or above which two proposals are one fragment.
    pub dedup_threshold: f32,
    pub recall_limit: usize,
    /// Recall hits below this similarity are dropped.
    pub recall_threshold: f32,
    pub embedding_dimension: usize,
    pub embedding_cache_ttl_secs: u64,
    /// Upper bound on cached embeddings.
    pub embedding_cache_capacity: u64,
    /// Minimum age before the repair sweep touches an inconsistent entity.
    pub repair_grace_period_secs: u64,
    /// Context receiving proposals that cite no context.
    pub general_context_label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 10,
            candidate_threshold: 0.4,
            dedup_threshold: 0.95,
            recall_limit: 10,
            recall_threshold: 0.0,
            embedding_dimension: 768,
            embedding_cache_ttl_secs: 24 * 60 * 60,
            embedding_cache_capacity: 10_000,
            repair_grace_period_secs: 300,
            general_context_label: "general".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, then validates.
    ///
    /// `MEMOIRE_SIMILARITY_THRESHOLD` sets both the candidate and recall
    /// thresholds; `MEMOIRE_MAX_RESULTS` sets both limits.
    pub fn apply_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_SIMILARITY_THRESHOLD) {
            let threshold = parse_env::<f32>(ENV_SIMILARITY_THRESHOLD, &value)?;
            self.candidate_threshold = threshold;
            self.recall_threshold = threshold;
        }
        if let Some(value) = lookup(ENV_MAX_RESULTS) {
            let limit = parse_env::<usize>(ENV_MAX_RESULTS, &value)?;
            self.candidate_limit = limit;
            self.recall_limit = limit;
        }
        if let Some(value) = lookup(ENV_DEDUP_THRESHOLD) {
            self.dedup_threshold = parse_env(ENV_DEDUP_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_EMBEDDING_DIMENSION) {
            self.embedding_dimension = parse_env(ENV_EMBEDDING_DIMENSION, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit_interval("candidate_threshold", self.candidate_threshold)?;
        check_unit_interval("dedup_threshold", self.dedup_threshold)?;
        check_unit_interval("recall_threshold", self.recall_threshold)?;
        check_positive("candidate_limit", self.candidate_limit)?;
        check_positive("recall_limit", self.recall_limit)?;
        check_positive("embedding_dimension", self.embedding_dimension)?;
        if self.embedding_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding_cache_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.general_context_label.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "general_context_label",
                message: "must not be blank".to_string(),
            });
        }
        Ok(())
    }

    pub fn embedding_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_cache_ttl_secs)
    }

    pub fn repair_grace_period(&self) -> Duration {
        Duration::from_secs(self.repair_grace_period_secs)
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            field,
            message: format!("cannot parse `{value}`"),
        })
}

fn check_unit_interval(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            field,
            message: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(())
}

fn check_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
