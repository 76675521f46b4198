//! Ranked retrieval across projects, raw or synthesized.
//!
//! # Invariants
//! - For a fixed store state and query embedding, the raw path returns the
//!   same ordered list on every call (score desc, fragment id asc).
//! - The synthesis oracle is never called on the raw path, nor when nothing
//!   was found.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::project::ProjectId;
use crate::model::EntityKind;
use crate::oracle::{
    embed_checked, EmbeddingGenerator, SynthesisFragment, SynthesisOracle, SynthesisRequest,
};
use crate::service::coordinator::{DualStoreCoordinator, ScoredFragment};
use log::{error, info};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecallRequest {
    /// Projects to search; empty means every project.
    pub project_ids: Vec<ProjectId>,
    pub query: String,
    pub focus: Option<String>,
    /// Return the ranked fragments without calling the synthesis oracle.
    pub raw_fragments: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecallOutcome {
    Fragments(Vec<ScoredFragment>),
    Synthesized {
        text: String,
        fragments: Vec<ScoredFragment>,
    },
    /// Synthesis was requested but no fragment cleared the threshold.
    NothingFound,
}

pub struct RecallEngine {
    coordinator: Arc<DualStoreCoordinator>,
    embedder: Arc<dyn EmbeddingGenerator>,
    synthesizer: Arc<dyn SynthesisOracle>,
    config: EngineConfig,
}

impl RecallEngine {
    pub fn new(
        coordinator: Arc<DualStoreCoordinator>,
        embedder: Arc<dyn EmbeddingGenerator>,
        synthesizer: Arc<dyn SynthesisOracle>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator,
            embedder,
            synthesizer,
            config,
        }
    }

    pub fn recall(&self, request: &RecallRequest) -> EngineResult<RecallOutcome> {
        let started_at = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(EngineError::InvalidInput(
                "query must not be blank".to_string(),
            ));
        }
        let project_ids = self.resolve_projects(&request.project_ids)?;
        let vector = embed_checked(self.embedder.as_ref(), query)?;
        let fragments = self.coordinator.similar_fragments(
            &project_ids,
            &vector,
            self.config.recall_limit,
            self.config.recall_threshold,
        )?;

        info!(
            "event=recall module=recall status=ok projects={} hits={} raw={} duration_ms={}",
            project_ids.len(),
            fragments.len(),
            request.raw_fragments,
            started_at.elapsed().as_millis()
        );
        if request.raw_fragments {
            return Ok(RecallOutcome::Fragments(fragments));
        }
        if fragments.is_empty() {
            return Ok(RecallOutcome::NothingFound);
        }

        let synthesis = SynthesisRequest {
            query: query.to_string(),
            focus: request
                .focus
                .as_deref()
                .map(str::trim)
                .filter(|focus| !focus.is_empty())
                .map(str::to_string),
            fragments: fragments
                .iter()
                .map(|scored| SynthesisFragment {
                    id: scored.fragment.id,
                    project_id: scored.fragment.project_id,
                    content: scored.fragment.content.clone(),
                    score: scored.score,
                })
                .collect(),
        };
        let text = self.synthesizer.synthesize(&synthesis).map_err(|err| {
            error!("event=recall module=recall status=error error_code=synthesis_unavailable error={err}");
            EngineError::SynthesisUnavailable(err)
        })?;
        Ok(RecallOutcome::Synthesized { text, fragments })
    }

    fn resolve_projects(&self, requested: &[ProjectId]) -> EngineResult<Vec<ProjectId>> {
        let metadata = self.coordinator.metadata();
        if requested.is_empty() {
            return Ok(metadata
                .list_projects()?
                .into_iter()
                .map(|project| project.id)
                .collect());
        }
        let unique: BTreeSet<ProjectId> = requested.iter().copied().collect();
        for project_id in &unique {
            if metadata.get_project(*project_id)?.is_none() {
                return Err(EngineError::not_found(EntityKind::Project, *project_id));
            }
        }
        Ok(unique.into_iter().collect())
    }
}
