//! SQLite-file-backed vector index.
//!
//! # Invariants
//! - Lives in its own database file, separate from the metadata store.
//! - Vectors are stored as little-endian `f32` blobs; the index dimension is
//!   recorded once in `index_meta` and checked on every open.

use super::{check_dimension, score_candidates, IndexError, IndexHit, IndexResult, VectorIndex};
use crate::model::memory::FragmentId;
use crate::model::now_epoch_ms;
use crate::model::project::ProjectId;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const VECTOR_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vectors (
    project_id TEXT NOT NULL,
    fragment_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (project_id, fragment_id)
);
";

/// Brute-force cosine index persisted in SQLite.
pub struct SqliteVectorIndex {
    dimension: usize,
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    /// Opens (or creates) an index file with the given dimension.
    ///
    /// # Errors
    /// - `DimensionMismatch` when the file was created with another dimension.
    /// - `Unavailable` when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> IndexResult<Self> {
        Self::bootstrap(Connection::open(path)?, dimension, "file")
    }

    pub fn open_in_memory(dimension: usize) -> IndexResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?, dimension, "memory")
    }

    fn bootstrap(conn: Connection, dimension: usize, mode: &'static str) -> IndexResult<Self> {
        info!("event=index_open module=index status=start mode={mode} dimension={dimension}");
        match prepare_schema(&conn, dimension) {
            Ok(()) => {
                info!("event=index_open module=index status=ok mode={mode}");
                Ok(Self {
                    dimension,
                    conn: Mutex::new(conn),
                })
            }
            Err(err) => {
                error!("event=index_open module=index status=error mode={mode} error={err}");
                Err(err)
            }
        }
    }

    fn lock(&self, project_id: ProjectId) -> IndexResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IndexError::unavailable(Some(project_id), "index connection lock poisoned"))
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn upsert(
        &self,
        project_id: ProjectId,
        fragment_id: FragmentId,
        vector: &[f32],
    ) -> IndexResult<()> {
        check_dimension(self.dimension, vector)?;
        let conn = self.lock(project_id)?;
        conn.execute(
            "INSERT INTO vectors (project_id, fragment_id, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (project_id, fragment_id) DO UPDATE SET
                embedding = excluded.embedding,
                updated_at = excluded.updated_at;",
            params![
                project_id.to_string(),
                fragment_id.to_string(),
                f32_vec_to_bytes(vector),
                now_epoch_ms(),
            ],
        )
        .map_err(|err| scoped(project_id, err))?;
        Ok(())
    }

    fn delete(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        let conn = self.lock(project_id)?;
        let changed = conn
            .execute(
                "DELETE FROM vectors WHERE project_id = ?1 AND fragment_id = ?2;",
                params![project_id.to_string(), fragment_id.to_string()],
            )
            .map_err(|err| scoped(project_id, err))?;
        Ok(changed > 0)
    }

    fn search(
        &self,
        project_id: ProjectId,
        query: &[f32],
        k: usize,
    ) -> IndexResult<Vec<IndexHit>> {
        check_dimension(self.dimension, query)?;
        let conn = self.lock(project_id)?;
        let mut stmt = conn
            .prepare("SELECT fragment_id, embedding FROM vectors WHERE project_id = ?1;")
            .map_err(|err| scoped(project_id, err))?;
        let mut rows = stmt
            .query([project_id.to_string()])
            .map_err(|err| scoped(project_id, err))?;

        let mut stored = Vec::new();
        while let Some(row) = rows.next().map_err(|err| scoped(project_id, err))? {
            let id_text: String = row.get(0).map_err(|err| scoped(project_id, err))?;
            let blob: Vec<u8> = row.get(1).map_err(|err| scoped(project_id, err))?;
            let fragment_id = parse_fragment_id(&id_text)?;
            stored.push((fragment_id, bytes_to_f32_vec(&blob, self.dimension)?));
        }

        Ok(score_candidates(
            query,
            stored.iter().map(|(id, vector)| (*id, vector.as_slice())),
            k,
        ))
    }

    fn contains(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        let conn = self.lock(project_id)?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM vectors WHERE project_id = ?1 AND fragment_id = ?2);",
            params![project_id.to_string(), fragment_id.to_string()],
            |row| row.get::<_, bool>(0),
        )
        .map_err(|err| scoped(project_id, err))
    }

    fn ids(&self, project_id: ProjectId) -> IndexResult<Vec<FragmentId>> {
        let conn = self.lock(project_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT fragment_id FROM vectors WHERE project_id = ?1 ORDER BY fragment_id ASC;",
            )
            .map_err(|err| scoped(project_id, err))?;
        let mut rows = stmt
            .query([project_id.to_string()])
            .map_err(|err| scoped(project_id, err))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().map_err(|err| scoped(project_id, err))? {
            let id_text: String = row.get(0).map_err(|err| scoped(project_id, err))?;
            ids.push(parse_fragment_id(&id_text)?);
        }
        ids.sort();
        Ok(ids)
    }

    fn drop_project(&self, project_id: ProjectId) -> IndexResult<usize> {
        let conn = self.lock(project_id)?;
        let removed = conn
            .execute(
                "DELETE FROM vectors WHERE project_id = ?1;",
                [project_id.to_string()],
            )
            .map_err(|err| scoped(project_id, err))?;
        Ok(removed)
    }
}

fn prepare_schema(conn: &Connection, dimension: usize) -> IndexResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(VECTOR_SCHEMA_SQL)?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'dimension';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        Some(value) => {
            let expected = value.parse::<usize>().map_err(|_| {
                IndexError::InvalidData(format!("invalid stored dimension `{value}`"))
            })?;
            if expected != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
        }
        None => {
            conn.execute(
                "INSERT INTO index_meta (key, value) VALUES ('dimension', ?1);",
                [dimension.to_string()],
            )?;
        }
    }
    Ok(())
}

fn scoped(project_id: ProjectId, err: rusqlite::Error) -> IndexError {
    IndexError::unavailable(Some(project_id), err.to_string())
}

fn parse_fragment_id(value: &str) -> IndexResult<FragmentId> {
    Uuid::parse_str(value).map_err(|_| {
        IndexError::InvalidData(format!("invalid uuid value `{value}` in vectors.fragment_id"))
    })
}

/// Converts an f32 slice to little-endian bytes.
fn f32_vec_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8], dimension: usize) -> IndexResult<Vec<f32>> {
    if bytes.len() != dimension * 4 {
        return Err(IndexError::InvalidData(format!(
            "embedding blob has {} bytes, expected {}",
            bytes.len(),
            dimension * 4
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
