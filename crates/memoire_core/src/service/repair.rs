//! Eventual-consistency repair sweep.
//!
//! # Responsibility
//! - Remove what an interrupted multi-store operation can leave behind:
//!   dangling membership rows, fragments without a vector, vectors without
//!   a fragment, and empty contexts.
//!
//! # Invariants
//! - Running the sweep twice in a row changes nothing the second time.
//! - Fragments and contexts younger than the grace period are never touched,
//!   so in-flight creates are safe.
//! - Every removal re-checks its condition right before deleting.

use crate::error::{EngineError, EngineResult};
use crate::model::memory::FragmentId;
use crate::model::now_epoch_ms;
use crate::model::project::ProjectId;
use crate::model::EntityKind;
use crate::service::coordinator::DualStoreCoordinator;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub projects_scanned: usize,
    pub dangling_memberships_removed: usize,
    pub vectorless_fragments_removed: usize,
    pub orphan_vectors_removed: usize,
    pub empty_contexts_removed: usize,
}

impl RepairReport {
    pub fn total_removed(&self) -> usize {
        self.dangling_memberships_removed
            + self.vectorless_fragments_removed
            + self.orphan_vectors_removed
            + self.empty_contexts_removed
    }
}

pub struct RepairSweep {
    coordinator: Arc<DualStoreCoordinator>,
    grace_period: Duration,
}

impl RepairSweep {
    pub fn new(coordinator: Arc<DualStoreCoordinator>, grace_period: Duration) -> Self {
        Self {
            coordinator,
            grace_period,
        }
    }

    /// Sweeps every project.
    pub fn run(&self) -> EngineResult<RepairReport> {
        let started_at = Instant::now();
        let mut report = RepairReport {
            dangling_memberships_removed: self
                .coordinator
                .metadata()
                .purge_dangling_memberships()?,
            ..RepairReport::default()
        };
        for project in self.coordinator.metadata().list_projects()? {
            self.sweep_project(project.id, &mut report)?;
        }
        log_report(&report, started_at);
        Ok(report)
    }

    /// Sweeps one project.
    pub fn run_for_project(&self, project_id: ProjectId) -> EngineResult<RepairReport> {
        let started_at = Instant::now();
        if self.coordinator.metadata().get_project(project_id)?.is_none() {
            return Err(EngineError::not_found(EntityKind::Project, project_id));
        }
        let mut report = RepairReport {
            dangling_memberships_removed: self
                .coordinator
                .metadata()
                .purge_dangling_memberships()?,
            ..RepairReport::default()
        };
        self.sweep_project(project_id, &mut report)?;
        log_report(&report, started_at);
        Ok(report)
    }

    fn sweep_project(&self, project_id: ProjectId, report: &mut RepairReport) -> EngineResult<()> {
        let metadata = self.coordinator.metadata();
        let index = self.coordinator.index();
        let cutoff = now_epoch_ms().saturating_sub(grace_ms(self.grace_period));

        let fragments = metadata.list_fragments(project_id, None)?;
        let known: HashSet<FragmentId> = fragments.iter().map(|fragment| fragment.id).collect();
        let indexed: HashSet<FragmentId> = index.ids(project_id)?.into_iter().collect();

        for fragment in fragments
            .iter()
            .filter(|fragment| fragment.created_at < cutoff && !indexed.contains(&fragment.id))
        {
            if index.contains(project_id, fragment.id)? {
                continue;
            }
            match self.coordinator.delete_fragment(fragment.id) {
                Ok(_) => {
                    warn!(
                        "event=repair module=repair status=fixed kind=vectorless_fragment project_id={project_id} fragment_id={}",
                        fragment.id
                    );
                    report.vectorless_fragments_removed += 1;
                }
                Err(EngineError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        for fragment_id in indexed.iter().filter(|id| !known.contains(id)) {
            if metadata.get_fragment(*fragment_id)?.is_some() {
                continue;
            }
            if index.delete(project_id, *fragment_id)? {
                warn!(
                    "event=repair module=repair status=fixed kind=orphan_vector project_id={project_id} fragment_id={fragment_id}"
                );
                report.orphan_vectors_removed += 1;
            }
        }

        for context in metadata.list_empty_contexts(project_id, cutoff)? {
            if self.coordinator.delete_context_if_empty(context.id)? {
                info!(
                    "event=repair module=repair status=fixed kind=empty_context project_id={project_id} context_id={}",
                    context.id
                );
                report.empty_contexts_removed += 1;
            }
        }

        report.projects_scanned += 1;
        Ok(())
    }
}

fn grace_ms(grace_period: Duration) -> i64 {
    i64::try_from(grace_period.as_millis()).unwrap_or(i64::MAX)
}

fn log_report(report: &RepairReport, started_at: Instant) {
    info!(
        "event=repair module=repair status=ok projects={} dangling_memberships={} vectorless_fragments={} orphan_vectors={} empty_contexts={} duration_ms={}",
        report.projects_scanned,
        report.dangling_memberships_removed,
        report.vectorless_fragments_removed,
        report.orphan_vectors_removed,
        report.empty_contexts_removed,
        started_at.elapsed().as_millis()
    );
}
