//! Curated ingestion: turn raw content into graph mutations.
//!
//! # Responsibility
//! - Gather candidate fragments and contexts, ask the decision oracle, and
//!   apply its decision through the coordinator.
//! - Collapse near-duplicate proposals before they reach the stores.
//!
//! # Invariants
//! - The decision is fully validated, and every proposal embedded, before
//!   the first write.
//! - Write order is contexts, fragment creates, membership attaches, then
//!   deletes.
//! - A failed create undoes this ingestion's earlier creates; deletes of
//!   vanished fragments are no-ops.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::index::cosine_similarity;
use crate::model::memory::{ContextId, FragmentId, MemoryContext, SOURCE_CURATED_INGESTION};
use crate::model::project::ProjectId;
use crate::model::{label_key, EntityKind};
use crate::oracle::decision::{ContextRef, CurationDecision};
use crate::oracle::{
    embed_checked, CandidateContext, CandidateFragment, CurationRequest, DecisionOracle,
    EmbeddingGenerator,
};
use crate::service::coordinator::{DualStoreCoordinator, FragmentDraft};
use log::{error, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

const GENERAL_CONTEXT_DESCRIPTION: &str = "Fragments without a more specific context.";

/// What one ingestion changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub project_id: ProjectId,
    pub created_fragment_ids: Vec<FragmentId>,
    pub created_context_ids: Vec<ContextId>,
    /// Existing fragments that absorbed a near-duplicate proposal.
    pub updated_fragment_ids: Vec<FragmentId>,
    pub deleted_fragment_ids: Vec<FragmentId>,
    /// Delete ids that had already vanished.
    pub skipped_delete_ids: Vec<FragmentId>,
    /// Proposals folded into another proposal or an existing fragment.
    pub collapsed_proposals: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Target {
    Existing(ContextId),
    /// Index into `Plan::new_contexts`.
    New(usize),
}

#[derive(Debug, Clone)]
struct NewContext {
    label: String,
    description: String,
}

#[derive(Debug, Clone)]
struct PlannedFragment {
    content: String,
    targets: BTreeSet<Target>,
}

#[derive(Debug, Clone)]
struct Plan {
    fragments: Vec<PlannedFragment>,
    new_contexts: Vec<NewContext>,
    deletes: Vec<FragmentId>,
}

#[derive(Debug, Clone)]
enum Action {
    Create {
        content: String,
        vector: Vec<f32>,
        targets: BTreeSet<Target>,
    },
    /// File the proposal's contexts on an existing near-duplicate instead.
    Attach {
        fragment_id: FragmentId,
        content: String,
        vector: Vec<f32>,
        targets: BTreeSet<Target>,
    },
}

/// Writes performed so far; undone when a later create fails.
#[derive(Default)]
struct Applied {
    created_contexts: Vec<ContextId>,
    created_fragments: Vec<FragmentId>,
    attached: Vec<(FragmentId, ContextId)>,
}

pub struct IngestionCurator {
    coordinator: Arc<DualStoreCoordinator>,
    embedder: Arc<dyn EmbeddingGenerator>,
    oracle: Arc<dyn DecisionOracle>,
    config: EngineConfig,
}

impl IngestionCurator {
    pub fn new(
        coordinator: Arc<DualStoreCoordinator>,
        embedder: Arc<dyn EmbeddingGenerator>,
        oracle: Arc<dyn DecisionOracle>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator,
            embedder,
            oracle,
            config,
        }
    }

    /// Ingests `content` into a project.
    ///
    /// # Errors
    /// - `InvalidInput` for blank content, `NotFound` for an unknown project.
    /// - `EmbeddingUnavailable` / `OracleUnavailable` before any write.
    /// - `OracleContractViolation` when the decision is unusable; nothing is
    ///   written.
    /// - Store errors from the apply phase, after compensation.
    pub fn ingest(&self, project_id: ProjectId, content: &str) -> EngineResult<IngestionReport> {
        let started_at = Instant::now();
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::InvalidInput(
                "content must not be blank".to_string(),
            ));
        }
        let metadata = self.coordinator.metadata();
        if metadata.get_project(project_id)?.is_none() {
            return Err(EngineError::not_found(EntityKind::Project, project_id));
        }
        info!("event=ingest module=curator status=start project_id={project_id}");

        let vector = embed_checked(self.embedder.as_ref(), content)?;
        let candidates = self.coordinator.similar_fragments(
            &[project_id],
            &vector,
            self.config.candidate_limit,
            self.config.candidate_threshold,
        )?;
        let contexts = metadata.list_contexts(project_id)?;

        let mut candidate_contexts: Vec<CandidateContext> = Vec::new();
        let mut offered: HashSet<ContextId> = HashSet::new();
        let by_id: HashMap<ContextId, &MemoryContext> =
            contexts.iter().map(|context| (context.id, context)).collect();
        let cited = candidates
            .iter()
            .flat_map(|candidate| candidate.fragment.context_ids.iter().copied());
        for context_id in cited.chain(contexts.iter().map(|context| context.id)) {
            if let Some(context) = by_id.get(&context_id) {
                if offered.insert(context_id) {
                    candidate_contexts.push(CandidateContext {
                        id: context_id,
                        label: context.label.clone(),
                    });
                }
            }
        }

        let request = CurationRequest {
            new_content: content.to_string(),
            candidate_fragments: candidates
                .iter()
                .map(|candidate| CandidateFragment {
                    id: candidate.fragment.id,
                    content: candidate.fragment.content.clone(),
                })
                .collect(),
            candidate_contexts,
        };
        let raw = self.oracle.decide(&request).map_err(|err| {
            error!(
                "event=ingest module=curator status=error project_id={project_id} error_code=oracle_unavailable error={err}"
            );
            EngineError::OracleUnavailable(err)
        })?;

        let offered_fragments: HashSet<FragmentId> =
            request.candidate_fragments.iter().map(|c| c.id).collect();
        let plan = CurationDecision::parse(&raw)
            .map_err(EngineError::from)
            .and_then(|decision| self.plan(project_id, decision, &contexts, &offered_fragments))
            .map_err(|err| {
                warn!(
                    "event=ingest module=curator status=error project_id={project_id} error_code={} error={err}",
                    err.code()
                );
                err
            })?;

        let mut report = IngestionReport {
            project_id,
            ..IngestionReport::default()
        };
        let actions = self.dedup(project_id, &plan, &mut report)?;
        self.apply(project_id, &plan, actions, &mut report)?;

        info!(
            "event=ingest module=curator status=ok project_id={project_id} created={} contexts_created={} updated={} deleted={} skipped_deletes={} collapsed={} duration_ms={}",
            report.created_fragment_ids.len(),
            report.created_context_ids.len(),
            report.updated_fragment_ids.len(),
            report.deleted_fragment_ids.len(),
            report.skipped_delete_ids.len(),
            report.collapsed_proposals,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Checks a parsed decision against the project and resolves every
    /// context reference.
    fn plan(
        &self,
        project_id: ProjectId,
        decision: CurationDecision,
        contexts: &[MemoryContext],
        offered_fragments: &HashSet<FragmentId>,
    ) -> EngineResult<Plan> {
        let metadata = self.coordinator.metadata();
        for id in &decision.ids_to_delete {
            if offered_fragments.contains(id) {
                continue;
            }
            match metadata.get_fragment(*id)? {
                Some(fragment) if fragment.project_id == project_id => {}
                Some(_) => {
                    return Err(EngineError::OracleContractViolation(format!(
                        "ids_to_delete holds fragment {id} of another project"
                    )))
                }
                None => {
                    return Err(EngineError::OracleContractViolation(format!(
                        "ids_to_delete holds unknown fragment {id}"
                    )))
                }
            }
        }

        let existing_by_key: HashMap<String, ContextId> = contexts
            .iter()
            .map(|context| (context.label_key(), context.id))
            .collect();
        let descriptions: HashMap<String, &str> = decision
            .contexts_to_create
            .iter()
            .map(|spec| (label_key(&spec.label), spec.description.as_str()))
            .collect();

        let mut new_contexts: Vec<NewContext> = Vec::new();
        let mut new_by_key: HashMap<String, usize> = HashMap::new();
        let mut resolve_label = |label: &str, fallback_description: &str| -> Target {
            let key = label_key(label);
            if let Some(id) = existing_by_key.get(&key) {
                return Target::Existing(*id);
            }
            let index = *new_by_key.entry(key.clone()).or_insert_with(|| {
                new_contexts.push(NewContext {
                    label: label.to_string(),
                    description: descriptions
                        .get(&key)
                        .copied()
                        .unwrap_or(fallback_description)
                        .to_string(),
                });
                new_contexts.len() - 1
            });
            Target::New(index)
        };

        let mut fragments = Vec::with_capacity(decision.fragments_to_create.len());
        for proposal in decision.fragments_to_create {
            let mut targets = BTreeSet::new();
            for reference in &proposal.contexts {
                match reference {
                    ContextRef::Id(id) => {
                        if !contexts.iter().any(|context| context.id == *id) {
                            return Err(EngineError::OracleContractViolation(format!(
                                "proposal cites unknown context {id}"
                            )));
                        }
                        targets.insert(Target::Existing(*id));
                    }
                    ContextRef::Label(label) => {
                        targets.insert(resolve_label(label, ""));
                    }
                }
            }
            if targets.is_empty() {
                targets.insert(resolve_label(
                    &self.config.general_context_label,
                    GENERAL_CONTEXT_DESCRIPTION,
                ));
            }
            fragments.push(PlannedFragment {
                content: proposal.content,
                targets,
            });
        }

        Ok(Plan {
            fragments,
            new_contexts,
            deletes: decision.ids_to_delete,
        })
    }

    /// Embeds every proposal and collapses near-duplicates, first within the
    /// batch, then against stored fragments that are not being deleted.
    fn dedup(
        &self,
        project_id: ProjectId,
        plan: &Plan,
        report: &mut IngestionReport,
    ) -> EngineResult<Vec<Action>> {
        let threshold = f64::from(self.config.dedup_threshold);
        let mut kept: Vec<(String, Vec<f32>, BTreeSet<Target>)> = Vec::new();
        for proposal in &plan.fragments {
            let vector = embed_checked(self.embedder.as_ref(), &proposal.content)?;
            let duplicate = kept
                .iter_mut()
                .find(|(_, earlier, _)| cosine_similarity(earlier, &vector) >= threshold);
            match duplicate {
                Some((_, _, targets)) => {
                    targets.extend(proposal.targets.iter().copied());
                    report.collapsed_proposals += 1;
                }
                None => kept.push((proposal.content.clone(), vector, proposal.targets.clone())),
            }
        }

        let deleting: HashSet<FragmentId> = plan.deletes.iter().copied().collect();
        let mut actions = Vec::with_capacity(kept.len());
        for (content, vector, targets) in kept {
            let existing = self
                .coordinator
                .similar_fragments(
                    &[project_id],
                    &vector,
                    plan.deletes.len() + 1,
                    self.config.dedup_threshold,
                )?
                .into_iter()
                .find(|hit| !deleting.contains(&hit.fragment.id));
            match existing {
                Some(hit) => {
                    report.collapsed_proposals += 1;
                    actions.push(Action::Attach {
                        fragment_id: hit.fragment.id,
                        content,
                        vector,
                        targets,
                    });
                }
                None => actions.push(Action::Create {
                    content,
                    vector,
                    targets,
                }),
            }
        }
        Ok(actions)
    }

    fn apply(
        &self,
        project_id: ProjectId,
        plan: &Plan,
        actions: Vec<Action>,
        report: &mut IngestionReport,
    ) -> EngineResult<()> {
        let mut applied = Applied::default();
        if let Err(err) = self.apply_creates(project_id, plan, actions, report, &mut applied) {
            error!(
                "event=ingest module=curator status=error project_id={project_id} error_code={} stage=create error={err}",
                err.code()
            );
            self.compensate(project_id, &applied);
            return Err(err);
        }
        report.created_context_ids = applied.created_contexts;
        report.created_fragment_ids = applied.created_fragments;

        for id in &plan.deletes {
            match self.coordinator.delete_fragment(*id) {
                Ok(_) => report.deleted_fragment_ids.push(*id),
                Err(EngineError::NotFound { .. }) => report.skipped_delete_ids.push(*id),
                Err(err) => {
                    error!(
                        "event=ingest module=curator status=error project_id={project_id} error_code={} stage=delete fragment_id={id} error={err}",
                        err.code()
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn apply_creates(
        &self,
        project_id: ProjectId,
        plan: &Plan,
        actions: Vec<Action>,
        report: &mut IngestionReport,
        applied: &mut Applied,
    ) -> EngineResult<()> {
        let used: HashSet<usize> = actions
            .iter()
            .flat_map(|action| match action {
                Action::Create { targets, .. } | Action::Attach { targets, .. } => targets.iter(),
            })
            .filter_map(|target| match target {
                Target::New(index) => Some(*index),
                Target::Existing(_) => None,
            })
            .collect();

        let mut new_ids: HashMap<usize, ContextId> = HashMap::new();
        for (index, spec) in plan.new_contexts.iter().enumerate() {
            if !used.contains(&index) {
                continue;
            }
            let write =
                self.coordinator
                    .create_context(project_id, &spec.label, &spec.description)?;
            if write.created {
                applied.created_contexts.push(write.context.id);
            }
            new_ids.insert(index, write.context.id);
        }
        let resolve = |targets: &BTreeSet<Target>| -> BTreeSet<ContextId> {
            targets
                .iter()
                .filter_map(|target| match target {
                    Target::Existing(id) => Some(*id),
                    Target::New(index) => new_ids.get(index).copied(),
                })
                .collect()
        };

        let mut attaches = Vec::new();
        for action in actions {
            match action {
                Action::Create {
                    content,
                    vector,
                    targets,
                } => {
                    let fragment = self.create(project_id, content, vector, resolve(&targets))?;
                    applied.created_fragments.push(fragment);
                }
                attach @ Action::Attach { .. } => attaches.push(attach),
            }
        }

        for action in attaches {
            let Action::Attach {
                fragment_id,
                content,
                vector,
                targets,
            } = action
            else {
                continue;
            };
            let context_ids = resolve(&targets);
            match self.attach(fragment_id, &context_ids, applied) {
                Ok(()) => report.updated_fragment_ids.push(fragment_id),
                Err(EngineError::ConstraintViolation(message)) => {
                    warn!(
                        "event=ingest module=curator status=fallback project_id={project_id} fragment_id={fragment_id} reason=attach_target_vanished detail={message}"
                    );
                    let fragment = self.create(project_id, content, vector, context_ids)?;
                    applied.created_fragments.push(fragment);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn create(
        &self,
        project_id: ProjectId,
        content: String,
        vector: Vec<f32>,
        context_ids: BTreeSet<ContextId>,
    ) -> EngineResult<FragmentId> {
        let fragment = self.coordinator.create_fragment(FragmentDraft {
            project_id,
            content,
            source: SOURCE_CURATED_INGESTION.to_string(),
            vector,
            context_ids,
        })?;
        Ok(fragment.id)
    }

    fn attach(
        &self,
        fragment_id: FragmentId,
        context_ids: &BTreeSet<ContextId>,
        applied: &mut Applied,
    ) -> EngineResult<()> {
        for context_id in context_ids {
            if self.coordinator.add_membership(fragment_id, *context_id)? {
                applied.attached.push((fragment_id, *context_id));
            }
        }
        Ok(())
    }

    fn compensate(&self, project_id: ProjectId, applied: &Applied) {
        for (fragment_id, context_id) in applied.attached.iter().rev() {
            if let Err(err) = self.coordinator.remove_membership(*fragment_id, *context_id) {
                error!(
                    "event=ingest_compensate module=curator status=error project_id={project_id} fragment_id={fragment_id} context_id={context_id} error={err}"
                );
            }
        }
        for fragment_id in applied.created_fragments.iter().rev() {
            match self.coordinator.delete_fragment(*fragment_id) {
                Ok(_) | Err(EngineError::NotFound { .. }) => {}
                Err(err) => error!(
                    "event=ingest_compensate module=curator status=error project_id={project_id} fragment_id={fragment_id} error={err}"
                ),
            }
        }
        for context_id in applied.created_contexts.iter().rev() {
            if let Err(err) = self.coordinator.delete_context_if_empty(*context_id) {
                error!(
                    "event=ingest_compensate module=curator status=error project_id={project_id} context_id={context_id} error={err}"
                );
            }
        }
        info!(
            "event=ingest_compensate module=curator status=ok project_id={project_id} fragments={} contexts={} memberships={}",
            applied.created_fragments.len(),
            applied.created_contexts.len(),
            applied.attached.len()
        );
    }
}
