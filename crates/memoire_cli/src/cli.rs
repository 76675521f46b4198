//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Memoire maintenance CLI.
///
/// Smoke checks and offline maintenance over a metadata database and a
/// vector index file.
#[derive(Parser, Debug)]
#[command(name = "memoire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check core crate linkage
    Ping,

    /// Print the core crate version
    Version,

    /// List projects with their entity counts
    Projects {
        /// Metadata database file
        metadata_db: PathBuf,
    },

    /// Run the consistency repair sweep
    Repair {
        /// Metadata database file
        metadata_db: PathBuf,

        /// Vector index database file
        vectors_db: PathBuf,

        /// Embedding dimension of the vector index
        #[arg(long, env = "MEMOIRE_EMBEDDING_DIMENSION", default_value_t = 768)]
        dimension: usize,

        /// Minimum age in seconds before an inconsistent entity is removed
        #[arg(long, default_value_t = 300)]
        grace_secs: u64,

        /// Restrict the sweep to one project
        #[arg(long)]
        project: Option<Uuid>,
    },
}
