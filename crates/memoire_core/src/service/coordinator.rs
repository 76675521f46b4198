//! Dual-store write coordination.
//!
//! # Responsibility
//! - Apply every fragment/context mutation across the metadata store and the
//!   vector index as one logical operation.
//! - Serialize membership mutations per context.
//!
//! # Invariants
//! - Create order: metadata row (with memberships) first, vector second; a
//!   failed vector write deletes the metadata row again.
//! - Delete order: memberships, vector, metadata row; a failed vector delete
//!   restores the memberships.
//! - A fragment is only deleted while every context it belongs to is locked.
//! - Merged fragments exist before any merge source is deleted.
//!
//! Compensation is best effort. A failing compensation is logged and leaves
//! work for the repair sweep; the original error is surfaced either way.

use crate::error::{EngineError, EngineResult};
use crate::index::{check_dimension, search_many, VectorIndex};
use crate::model::memory::{
    ContextId, FragmentId, MemoryContext, MemoryFragment, SOURCE_MERGE,
};
use crate::model::project::ProjectId;
use crate::model::EntityKind;
use crate::repo::metadata_store::{MetadataStore, RepoError};
use crate::service::locks::{ContextLockGuard, ContextLockTable};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Input of [`DualStoreCoordinator::create_fragment`].
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDraft {
    pub project_id: ProjectId,
    pub content: String,
    pub source: String,
    pub vector: Vec<f32>,
    pub context_ids: BTreeSet<ContextId>,
}

/// Result of [`DualStoreCoordinator::create_context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWrite {
    pub context: MemoryContext,
    /// `false` when a context with the same label already existed.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDeletion {
    pub context_id: ContextId,
    pub deleted_fragment_ids: Vec<FragmentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub source_ids: Vec<FragmentId>,
    pub merged_content: String,
    pub merged_vector: Vec<f32>,
    /// Extra contexts for the merged fragment, on top of the sources' ones.
    pub context_ids: BTreeSet<ContextId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: MemoryFragment,
    pub deleted_source_ids: Vec<FragmentId>,
    /// Sources that had already vanished; they are skipped.
    pub missing_source_ids: Vec<FragmentId>,
}

/// A fragment joined with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFragment {
    pub fragment: MemoryFragment,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectDeletion {
    pub project_id: ProjectId,
    pub vectors_removed: usize,
}

/// Applies graph mutations to both stores in a fixed order.
pub struct DualStoreCoordinator {
    metadata: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
    locks: ContextLockTable,
}

impl DualStoreCoordinator {
    pub fn new(metadata: Arc<dyn MetadataStore>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            metadata,
            index,
            locks: ContextLockTable::new(),
        }
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub(crate) fn locks(&self) -> &ContextLockTable {
        &self.locks
    }

    /// Creates a context, or returns the existing one with the same label.
    pub fn create_context(
        &self,
        project_id: ProjectId,
        label: &str,
        description: &str,
    ) -> EngineResult<ContextWrite> {
        let context = MemoryContext::new(project_id, label, description);
        context.validate()?;
        let (context, created) = self.metadata.insert_context_if_absent(&context)?;
        if created {
            info!(
                "event=context_create module=coordinator status=ok project_id={project_id} context_id={}",
                context.id
            );
        }
        Ok(ContextWrite { context, created })
    }

    /// Creates a fragment in both stores.
    ///
    /// # Errors
    /// - `InvalidInput` for blank content or a vector of the wrong dimension.
    /// - `NotFound` for an unknown project.
    /// - `ConstraintViolation` for a missing or foreign context.
    /// - `IndexUnavailable` after the metadata row has been compensated.
    pub fn create_fragment(&self, draft: FragmentDraft) -> EngineResult<MemoryFragment> {
        let _guard = self.locks.acquire(draft.context_ids.iter().copied());
        self.create_fragment_locked(draft)
    }

    /// Deletes a fragment from every context, the index and the metadata
    /// store, in that order.
    pub fn delete_fragment(&self, fragment_id: FragmentId) -> EngineResult<MemoryFragment> {
        let (_guard, _) = self
            .locks
            .lock_until_stable(|| self.context_ids_of(fragment_id))?;
        let fragment = self
            .metadata
            .get_fragment(fragment_id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Fragment, fragment_id))?;
        self.delete_fragment_locked(&fragment)?;
        Ok(fragment)
    }

    /// Deletes a context and, bottom-up, every member fragment.
    ///
    /// Members leave all their other contexts before they are deleted. If a
    /// member delete fails, the members already deleted stay deleted and the
    /// context row is kept with its remaining members.
    pub fn delete_context(&self, context_id: ContextId) -> EngineResult<ContextDeletion> {
        let started_at = Instant::now();
        let (_guard, _) = self.locks.lock_until_stable(|| {
            let mut ids = BTreeSet::from([context_id]);
            if let Some(context) = self.metadata.get_context(context_id)? {
                for fragment in self.metadata.get_fragments(&Vec::from_iter(context.member_ids))? {
                    ids.extend(fragment.context_ids);
                }
            }
            Ok::<_, EngineError>(ids)
        })?;

        let context = self
            .metadata
            .get_context(context_id)?
            .ok_or_else(|| EngineError::not_found(EntityKind::Context, context_id))?;

        let mut deleted_fragment_ids = Vec::with_capacity(context.member_ids.len());
        for member_id in &context.member_ids {
            let Some(fragment) = self.metadata.get_fragment(*member_id)? else {
                continue;
            };
            if let Err(err) = self.delete_fragment_locked(&fragment) {
                error!(
                    "event=context_delete module=coordinator status=error context_id={context_id} fragment_id={member_id} deleted={} error_code={} error={err}",
                    deleted_fragment_ids.len(),
                    err.code()
                );
                return Err(err);
            }
            deleted_fragment_ids.push(*member_id);
        }
        self.metadata.delete_context_row(context_id)?;

        info!(
            "event=context_delete module=coordinator status=ok project_id={} context_id={context_id} fragments_deleted={} duration_ms={}",
            context.project_id,
            deleted_fragment_ids.len(),
            started_at.elapsed().as_millis()
        );
        Ok(ContextDeletion {
            context_id,
            deleted_fragment_ids,
        })
    }

    /// Deletes a context only if it has no members.
    ///
    /// Returns `false` when the context has members or no longer exists.
    pub fn delete_context_if_empty(&self, context_id: ContextId) -> EngineResult<bool> {
        let _guard = self.locks.acquire([context_id]);
        match self.metadata.get_context(context_id)? {
            Some(context) if context.member_ids.is_empty() => {
                match self.metadata.delete_context_row(context_id) {
                    Ok(()) => Ok(true),
                    Err(RepoError::NotFound { .. }) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            _ => Ok(false),
        }
    }

    /// Replaces source fragments with one merged fragment.
    ///
    /// The merged fragment belongs to the union of the sources' contexts and
    /// `request.context_ids`. Sources that have already vanished (for
    /// instance consumed by a concurrent merge) are reported as missing; when
    /// every source is missing the merge fails with `NotFound`.
    pub fn merge_fragments(&self, request: MergeRequest) -> EngineResult<MergeOutcome> {
        let Some(first_source) = request.source_ids.first().copied() else {
            return Err(EngineError::InvalidInput(
                "merge needs at least one source fragment".to_string(),
            ));
        };
        check_dimension(self.index.dimension(), &request.merged_vector)?;

        let (_guard, _) = self.locks.lock_until_stable(|| {
            let mut ids = request.context_ids.clone();
            for fragment in self.metadata.get_fragments(&request.source_ids)? {
                ids.extend(fragment.context_ids);
            }
            Ok::<_, EngineError>(ids)
        })?;

        let sources = self.metadata.get_fragments(&request.source_ids)?;
        let Some(project_id) = sources.first().map(|fragment| fragment.project_id) else {
            return Err(EngineError::not_found(EntityKind::Fragment, first_source));
        };
        if let Some(foreign) = sources.iter().find(|f| f.project_id != project_id) {
            return Err(EngineError::ConstraintViolation(format!(
                "merge source {} belongs to another project",
                foreign.id
            )));
        }

        let mut context_ids = request.context_ids.clone();
        for source in &sources {
            context_ids.extend(source.context_ids.iter().copied());
        }
        let merged = self.create_fragment_locked(FragmentDraft {
            project_id,
            content: request.merged_content,
            source: SOURCE_MERGE.to_string(),
            vector: request.merged_vector,
            context_ids,
        })?;

        let mut missing_source_ids: Vec<FragmentId> = request
            .source_ids
            .iter()
            .filter(|id| !sources.iter().any(|source| source.id == **id))
            .copied()
            .collect();
        let mut deleted_source_ids = Vec::with_capacity(sources.len());
        for source in &sources {
            match self.delete_fragment_locked(source) {
                Ok(()) => deleted_source_ids.push(source.id),
                Err(EngineError::NotFound { .. }) => missing_source_ids.push(source.id),
                Err(err) => {
                    error!(
                        "event=fragment_merge module=coordinator status=error merged_id={} source_id={} error_code={} error={err}",
                        merged.id,
                        source.id,
                        err.code()
                    );
                    return Err(err);
                }
            }
        }

        info!(
            "event=fragment_merge module=coordinator status=ok project_id={project_id} merged_id={} sources_deleted={} sources_missing={}",
            merged.id,
            deleted_source_ids.len(),
            missing_source_ids.len()
        );
        Ok(MergeOutcome {
            merged,
            deleted_source_ids,
            missing_source_ids,
        })
    }

    /// Adds a fragment to a context.
    ///
    /// Holds the target context and every context the fragment already
    /// belongs to, so the edge cannot slip in while the fragment is being
    /// merged or deleted.
    pub fn add_membership(
        &self,
        fragment_id: FragmentId,
        context_id: ContextId,
    ) -> EngineResult<bool> {
        let (_guard, _) = self.lock_fragment_and(fragment_id, context_id)?;
        Ok(self.metadata.add_membership(fragment_id, context_id)?)
    }

    /// Removes a fragment from a context under the same locks as
    /// [`Self::add_membership`].
    pub fn remove_membership(
        &self,
        fragment_id: FragmentId,
        context_id: ContextId,
    ) -> EngineResult<bool> {
        let (_guard, _) = self.lock_fragment_and(fragment_id, context_id)?;
        Ok(self.metadata.remove_membership(fragment_id, context_id)?)
    }

    /// Searches one or more projects and joins the hits with their metadata.
    ///
    /// Hits below `threshold` and vectors without a metadata row are dropped;
    /// order is descending score, ties by ascending fragment id. Orphan
    /// vectors never take a slot: the index is searched again with a wider
    /// window until `k` fragments are joined or the index has no more hits.
    pub fn similar_fragments(
        &self,
        project_ids: &[ProjectId],
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> EngineResult<Vec<ScoredFragment>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut window = k;
        loop {
            let hits = search_many(self.index.as_ref(), project_ids, vector, window)?;
            let exhausted = hits.len() < window
                || hits.last().map_or(true, |hit| hit.score < threshold);
            let hits: Vec<_> = hits
                .into_iter()
                .filter(|hit| hit.score >= threshold)
                .collect();
            let ids: Vec<FragmentId> = hits.iter().map(|hit| hit.fragment_id).collect();
            let fragments = self.metadata.get_fragments(&ids)?;

            let mut scored = Vec::with_capacity(fragments.len());
            let mut orphans = 0usize;
            for hit in hits {
                match fragments.iter().find(|fragment| fragment.id == hit.fragment_id) {
                    Some(fragment) => scored.push(ScoredFragment {
                        fragment: fragment.clone(),
                        score: hit.score,
                    }),
                    None => orphans += 1,
                }
            }

            if scored.len() >= k || exhausted {
                if orphans > 0 {
                    debug!(
                        "event=similar_fragments module=coordinator status=orphans_skipped orphans={orphans} window={window}"
                    );
                }
                scored.truncate(k);
                return Ok(scored);
            }
            window = window.saturating_mul(2);
        }
    }

    /// Drops a project's vectors, then deletes the project and everything it
    /// owns from the metadata store.
    pub fn delete_project(&self, project_id: ProjectId) -> EngineResult<ProjectDeletion> {
        if self.metadata.get_project(project_id)?.is_none() {
            return Err(EngineError::not_found(EntityKind::Project, project_id));
        }
        let vectors_removed = self.index.drop_project(project_id)?;
        if let Err(err) = self.metadata.delete_project(project_id) {
            error!(
                "event=project_delete module=coordinator status=error project_id={project_id} vectors_removed={vectors_removed} error={err}"
            );
            return Err(err.into());
        }
        info!(
            "event=project_delete module=coordinator status=ok project_id={project_id} vectors_removed={vectors_removed}"
        );
        Ok(ProjectDeletion {
            project_id,
            vectors_removed,
        })
    }

    /// Fragment create body; the caller holds the locks of `draft.context_ids`.
    pub(crate) fn create_fragment_locked(
        &self,
        draft: FragmentDraft,
    ) -> EngineResult<MemoryFragment> {
        let started_at = Instant::now();
        let fragment = MemoryFragment::new(
            draft.project_id,
            draft.content.trim(),
            draft.source,
            draft.context_ids,
        );
        fragment.validate()?;
        check_dimension(self.index.dimension(), &draft.vector)?;

        self.metadata.insert_fragment(&fragment)?;
        if let Err(err) = self
            .index
            .upsert(fragment.project_id, fragment.id, &draft.vector)
        {
            self.compensate_fragment_row(&fragment);
            error!(
                "event=fragment_create module=coordinator status=error project_id={} fragment_id={} error_code=vector_upsert_failed error={err}",
                fragment.project_id, fragment.id
            );
            return Err(err.into());
        }

        info!(
            "event=fragment_create module=coordinator status=ok project_id={} fragment_id={} contexts={} duration_ms={}",
            fragment.project_id,
            fragment.id,
            fragment.context_ids.len(),
            started_at.elapsed().as_millis()
        );
        Ok(fragment)
    }

    /// Fragment delete body; the caller holds the locks of every context the
    /// fragment belongs to.
    pub(crate) fn delete_fragment_locked(&self, fragment: &MemoryFragment) -> EngineResult<()> {
        let removed = self.metadata.remove_all_memberships(fragment.id)?;

        if let Err(err) = self.index.delete(fragment.project_id, fragment.id) {
            for context_id in &removed {
                if let Err(restore_err) = self.metadata.add_membership(fragment.id, *context_id) {
                    error!(
                        "event=fragment_delete module=coordinator status=error fragment_id={} context_id={context_id} error_code=membership_restore_failed error={restore_err}",
                        fragment.id
                    );
                }
            }
            error!(
                "event=fragment_delete module=coordinator status=error project_id={} fragment_id={} error_code=vector_delete_failed error={err}",
                fragment.project_id, fragment.id
            );
            return Err(err.into());
        }

        if let Err(err) = self.metadata.delete_fragment_row(fragment.id) {
            warn!(
                "event=fragment_delete module=coordinator status=error project_id={} fragment_id={} error_code=row_delete_failed error={err}",
                fragment.project_id, fragment.id
            );
            return Err(err.into());
        }

        info!(
            "event=fragment_delete module=coordinator status=ok project_id={} fragment_id={} contexts_left={}",
            fragment.project_id,
            fragment.id,
            removed.len()
        );
        Ok(())
    }

    fn compensate_fragment_row(&self, fragment: &MemoryFragment) {
        match self.metadata.delete_fragment_row(fragment.id) {
            Ok(()) => info!(
                "event=fragment_compensate module=coordinator status=ok fragment_id={}",
                fragment.id
            ),
            Err(err) => error!(
                "event=fragment_compensate module=coordinator status=error fragment_id={} error={err}",
                fragment.id
            ),
        }
    }

    fn lock_fragment_and(
        &self,
        fragment_id: FragmentId,
        context_id: ContextId,
    ) -> EngineResult<(ContextLockGuard<'_>, BTreeSet<ContextId>)> {
        self.locks.lock_until_stable(|| {
            let mut ids = self.context_ids_of(fragment_id)?;
            ids.insert(context_id);
            Ok::<_, EngineError>(ids)
        })
    }

    fn context_ids_of(&self, fragment_id: FragmentId) -> EngineResult<BTreeSet<ContextId>> {
        Ok(self
            .metadata
            .get_fragment(fragment_id)?
            .map(|fragment| fragment.context_ids)
            .unwrap_or_default())
    }
}
