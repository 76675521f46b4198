//! CLI entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `memoire_core` linkage.
//! - Run offline maintenance (listing, repair sweep) over database files.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use log::info;
use memoire_core::{
    DualStoreCoordinator, MetadataStore, RepairSweep, SqliteMetadataStore, SqliteVectorIndex,
};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    memoire_core::init_logging_from_env().context("failed to initialize logging")?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Ping => println!("memoire_core ping={}", memoire_core::ping()),
        Commands::Version => println!("memoire_core version={}", memoire_core::core_version()),
        Commands::Projects { metadata_db } => {
            let store = SqliteMetadataStore::open(&metadata_db)
                .with_context(|| format!("failed to open {}", metadata_db.display()))?;
            for project in store.list_projects()? {
                let stats = store.project_stats(project.id)?;
                println!(
                    "{} name={:?} fragments={} contexts={} anchors={} tasks_open={}",
                    project.id,
                    project.name,
                    stats.fragments,
                    stats.contexts,
                    stats.anchors,
                    stats.tasks_pending + stats.tasks_in_progress
                );
            }
        }
        Commands::Repair {
            metadata_db,
            vectors_db,
            dimension,
            grace_secs,
            project,
        } => {
            let metadata = SqliteMetadataStore::open(&metadata_db)
                .with_context(|| format!("failed to open {}", metadata_db.display()))?;
            let index = SqliteVectorIndex::open(&vectors_db, dimension)
                .with_context(|| format!("failed to open {}", vectors_db.display()))?;
            let coordinator = Arc::new(DualStoreCoordinator::new(
                Arc::new(metadata),
                Arc::new(index),
            ));
            let sweep = RepairSweep::new(coordinator, Duration::from_secs(grace_secs));
            let report = match project {
                Some(project_id) => sweep.run_for_project(project_id)?,
                None => sweep.run()?,
            };
            info!(
                "event=cli_repair module=cli status=ok removed={}",
                report.total_removed()
            );
            println!(
                "projects={} dangling_memberships={} vectorless_fragments={} orphan_vectors={} empty_contexts={}",
                report.projects_scanned,
                report.dangling_memberships_removed,
                report.vectorless_fragments_removed,
                report.orphan_vectors_removed,
                report.empty_contexts_removed
            );
        }
    }
    Ok(())
}
