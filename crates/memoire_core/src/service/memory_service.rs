//! Memory use-case service.
//!
//! # Responsibility
//! - Wire stores, collaborators and engine components behind one entry
//!   point for callers.
//! - Own project lifecycle, including the cascade across both stores.
//!
//! # Invariants
//! - The vector index, the embedding generator and the config agree on one
//!   embedding dimension; construction fails otherwise.
//! - Every graph mutation goes through the coordinator.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::index::VectorIndex;
use crate::model::memory::{
    AnchorId, CognitiveAnchor, ContextId, FragmentId, MemoryContext, MemoryFragment, SOURCE_USER,
};
use crate::model::project::{Project, ProjectId};
use crate::model::EntityKind;
use crate::oracle::{embed_checked, DecisionOracle, EmbeddingGenerator, SynthesisOracle};
use crate::repo::metadata_store::{MetadataStore, ProjectStats};
use crate::service::coordinator::{
    ContextDeletion, ContextWrite, DualStoreCoordinator, FragmentDraft, MergeOutcome,
    MergeRequest, ProjectDeletion,
};
use crate::service::curator::{IngestionCurator, IngestionReport};
use crate::service::recall::{RecallEngine, RecallOutcome, RecallRequest};
use crate::service::repair::{RepairReport, RepairSweep};
use log::{error, info};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Model-backed collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingGenerator>,
    pub decision_oracle: Arc<dyn DecisionOracle>,
    pub synthesizer: Arc<dyn SynthesisOracle>,
}

/// Partial project update. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Context label with its member count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSummary {
    pub id: ContextId,
    pub label: String,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    pub project: Project,
    pub stats: ProjectStats,
    pub contexts: Vec<ContextSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub metadata_ok: bool,
    pub index_ok: bool,
    pub embedding_model: String,
    pub embedding_dimension: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.metadata_ok && self.index_ok
    }
}

pub struct MemoryService {
    coordinator: Arc<DualStoreCoordinator>,
    curator: IngestionCurator,
    recall: RecallEngine,
    repair: RepairSweep,
    embedder: Arc<dyn EmbeddingGenerator>,
}

impl MemoryService {
    /// Builds the engine over the given stores and collaborators.
    ///
    /// # Errors
    /// - `InvalidInput` when the config is invalid or the embedding
    ///   dimensions of config, index and generator disagree.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        index: Arc<dyn VectorIndex>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|err| EngineError::InvalidInput(err.to_string()))?;
        let dimensions = [
            ("config", config.embedding_dimension),
            ("index", index.dimension()),
            ("embedder", collaborators.embedder.dimension()),
        ];
        if dimensions.iter().any(|(_, value)| *value != config.embedding_dimension) {
            return Err(EngineError::InvalidInput(format!(
                "embedding dimensions disagree: {dimensions:?}"
            )));
        }

        let coordinator = Arc::new(DualStoreCoordinator::new(metadata, index));
        let curator = IngestionCurator::new(
            Arc::clone(&coordinator),
            Arc::clone(&collaborators.embedder),
            collaborators.decision_oracle,
            config.clone(),
        );
        let recall = RecallEngine::new(
            Arc::clone(&coordinator),
            Arc::clone(&collaborators.embedder),
            collaborators.synthesizer,
            config.clone(),
        );
        let repair = RepairSweep::new(Arc::clone(&coordinator), config.repair_grace_period());
        info!(
            "event=service_init module=service status=ok model={} dimension={}",
            collaborators.embedder.model(),
            config.embedding_dimension
        );
        Ok(Self {
            coordinator,
            curator,
            recall,
            repair,
            embedder: collaborators.embedder,
        })
    }

    pub fn coordinator(&self) -> &DualStoreCoordinator {
        &self.coordinator
    }

    fn metadata(&self) -> &dyn MetadataStore {
        self.coordinator.metadata()
    }

    pub fn create_project(&self, name: &str, description: &str) -> EngineResult<Project> {
        let project = Project::new(name, description);
        project.validate()?;
        self.metadata().create_project(&project)?;
        info!(
            "event=project_create module=service status=ok project_id={}",
            project.id
        );
        Ok(project)
    }

    pub fn get_project(&self, id: ProjectId) -> EngineResult<Project> {
        self.metadata()
            .get_project(id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Project, id))
    }

    pub fn list_projects(&self) -> EngineResult<Vec<Project>> {
        Ok(self.metadata().list_projects()?)
    }

    pub fn update_project(&self, id: ProjectId, update: &ProjectUpdate) -> EngineResult<Project> {
        let mut project = self.get_project(id)?;
        if let Some(name) = &update.name {
            project.name = name.trim().to_string();
        }
        if let Some(description) = &update.description {
            project.description = description.trim().to_string();
        }
        self.metadata().update_project(&project)?;
        self.get_project(id)
    }

    /// Deletes a project with all its fragments, contexts, anchors and tasks
    /// from both stores.
    pub fn delete_project(&self, id: ProjectId) -> EngineResult<ProjectDeletion> {
        self.coordinator.delete_project(id)
    }

    /// Curated ingestion of free-form content.
    pub fn remember(&self, project_id: ProjectId, content: &str) -> EngineResult<IngestionReport> {
        self.curator.ingest(project_id, content)
    }

    /// Stores content verbatim as one fragment, without the decision oracle.
    pub fn store_fragment(
        &self,
        project_id: ProjectId,
        content: &str,
        context_ids: BTreeSet<ContextId>,
    ) -> EngineResult<MemoryFragment> {
        let vector = self.embed_content(content)?;
        self.coordinator.create_fragment(FragmentDraft {
            project_id,
            content: content.to_string(),
            source: SOURCE_USER.to_string(),
            vector,
            context_ids,
        })
    }

    pub fn recall(&self, request: &RecallRequest) -> EngineResult<RecallOutcome> {
        self.recall.recall(request)
    }

    pub fn create_context(
        &self,
        project_id: ProjectId,
        label: &str,
        description: &str,
    ) -> EngineResult<ContextWrite> {
        self.coordinator.create_context(project_id, label, description)
    }

    pub fn list_contexts(&self, project_id: ProjectId) -> EngineResult<Vec<MemoryContext>> {
        self.get_project(project_id)?;
        Ok(self.metadata().list_contexts(project_id)?)
    }

    pub fn find_context(
        &self,
        project_id: ProjectId,
        label: &str,
    ) -> EngineResult<Option<MemoryContext>> {
        Ok(self.metadata().find_context_by_label(project_id, label)?)
    }

    pub fn list_fragments(
        &self,
        project_id: ProjectId,
        limit: Option<u32>,
    ) -> EngineResult<Vec<MemoryFragment>> {
        self.get_project(project_id)?;
        Ok(self.metadata().list_fragments(project_id, limit)?)
    }

    pub fn get_fragment(&self, id: FragmentId) -> EngineResult<MemoryFragment> {
        self.metadata()
            .get_fragment(id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Fragment, id))
    }

    pub fn fragments_by_context(&self, context_id: ContextId) -> EngineResult<Vec<MemoryFragment>> {
        Ok(self.metadata().list_fragments_by_context(context_id)?)
    }

    pub fn contexts_for_fragment(&self, fragment_id: FragmentId) -> EngineResult<Vec<MemoryContext>> {
        let fragment = self.get_fragment(fragment_id)?;
        let mut contexts = Vec::with_capacity(fragment.context_ids.len());
        for context_id in &fragment.context_ids {
            if let Some(context) = self.metadata().get_context(*context_id)? {
                contexts.push(context);
            }
        }
        Ok(contexts)
    }

    pub fn add_to_context(&self, fragment_id: FragmentId, context_id: ContextId) -> EngineResult<bool> {
        self.coordinator.add_membership(fragment_id, context_id)
    }

    pub fn remove_from_context(
        &self,
        fragment_id: FragmentId,
        context_id: ContextId,
    ) -> EngineResult<bool> {
        self.coordinator.remove_membership(fragment_id, context_id)
    }

    pub fn delete_fragment(&self, id: FragmentId) -> EngineResult<MemoryFragment> {
        self.coordinator.delete_fragment(id)
    }

    pub fn delete_context(&self, id: ContextId) -> EngineResult<ContextDeletion> {
        self.coordinator.delete_context(id)
    }

    /// Merges fragments into one, embedding the merged content.
    pub fn merge_fragments(
        &self,
        source_ids: Vec<FragmentId>,
        merged_content: &str,
        context_ids: BTreeSet<ContextId>,
    ) -> EngineResult<MergeOutcome> {
        let merged_vector = self.embed_content(merged_content)?;
        self.coordinator.merge_fragments(MergeRequest {
            source_ids,
            merged_content: merged_content.to_string(),
            merged_vector,
            context_ids,
        })
    }

    pub fn create_anchor(&self, anchor: &CognitiveAnchor) -> EngineResult<AnchorId> {
        Ok(self.metadata().create_anchor(anchor)?)
    }

    pub fn get_anchor(&self, id: AnchorId) -> EngineResult<CognitiveAnchor> {
        self.metadata()
            .get_anchor(id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Anchor, id))
    }

    pub fn list_anchors(&self, project_id: ProjectId) -> EngineResult<Vec<CognitiveAnchor>> {
        Ok(self.metadata().list_anchors(project_id)?)
    }

    pub fn project_summary(&self, project_id: ProjectId) -> EngineResult<ProjectSummary> {
        let project = self.get_project(project_id)?;
        let stats = self.metadata().project_stats(project_id)?;
        let contexts = self
            .metadata()
            .list_contexts(project_id)?
            .into_iter()
            .map(|context| ContextSummary {
                id: context.id,
                members: context.member_ids.len(),
                label: context.label,
            })
            .collect();
        Ok(ProjectSummary {
            project,
            stats,
            contexts,
        })
    }

    pub fn run_repair(&self) -> EngineResult<RepairReport> {
        self.repair.run()
    }

    pub fn run_repair_for_project(&self, project_id: ProjectId) -> EngineResult<RepairReport> {
        self.repair.run_for_project(project_id)
    }

    fn embed_content(&self, content: &str) -> EngineResult<Vec<f32>> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::InvalidInput(
                "content must not be blank".to_string(),
            ));
        }
        Ok(embed_checked(self.embedder.as_ref(), content)?)
    }

    /// Checks both stores. Never calls the embedding generator.
    pub fn health_check(&self) -> HealthReport {
        let metadata_ok = match self.metadata().check_health() {
            Ok(()) => true,
            Err(err) => {
                error!("event=health_check module=service status=error store=metadata error={err}");
                false
            }
        };
        let index_ok = match self.coordinator.index().ids(ProjectId::nil()) {
            Ok(_) => true,
            Err(err) => {
                error!("event=health_check module=service status=error store=index error={err}");
                false
            }
        };
        HealthReport {
            metadata_ok,
            index_ok,
            embedding_model: self.embedder.model().to_string(),
            embedding_dimension: self.embedder.dimension(),
        }
    }
}
