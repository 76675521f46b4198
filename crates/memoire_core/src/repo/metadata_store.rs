//! Metadata store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist projects, fragments, contexts, memberships and anchors.
//! - Own referential integrity of the fragment/context graph.
//!
//! # Invariants
//! - Membership is one relation (`context_members`); both directions of the
//!   graph are read from it, so they cannot disagree.
//! - Membership writes are single-row set updates, never whole-set rewrites.
//! - A membership or anchor reference to a missing or foreign-project entity
//!   is rejected with `ConstraintViolation`.
//! - All writes for one call commit in a single immediate transaction.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::memory::{
    AnchorId, AnchorPriority, CognitiveAnchor, ContextId, FragmentId, MemoryContext,
    MemoryFragment,
};
use crate::model::project::{Project, ProjectId};
use crate::model::{label_key, now_epoch_ms, EntityKind, ValidationError};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const FRAGMENT_SELECT_SQL: &str = "SELECT
    id,
    project_id,
    content,
    source,
    created_at,
    updated_at
FROM fragments";

const CONTEXT_SELECT_SQL: &str = "SELECT
    id,
    project_id,
    label,
    description,
    created_at,
    updated_at
FROM contexts";

pub type RepoResult<T> = Result<T, RepoError>;

/// Metadata store error.
#[derive(Debug)]
pub enum RepoError {
    Validation(ValidationError),
    Db(DbError),
    NotFound { kind: EntityKind, id: Uuid },
    /// A write would leave a dangling or cross-project reference.
    ConstraintViolation(String),
    InvalidData(String),
    /// The store cannot serve requests (e.g. its connection lock is poisoned).
    Unavailable(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "metadata store error: {err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::ConstraintViolation(message) => write!(f, "constraint violation: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted metadata: {message}"),
            Self::Unavailable(message) => write!(f, "metadata store unavailable: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, message) = &value {
            if code.code == ErrorCode::ConstraintViolation {
                return Self::ConstraintViolation(
                    message.clone().unwrap_or_else(|| code.to_string()),
                );
            }
        }
        Self::Db(DbError::Sqlite(value))
    }
}

/// Per-project entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectStats {
    pub fragments: u64,
    pub contexts: u64,
    pub anchors: u64,
    pub tasks_pending: u64,
    pub tasks_in_progress: u64,
    pub tasks_completed: u64,
}

/// Relational store for everything except embedding vectors.
pub trait MetadataStore: Send + Sync {
    fn check_health(&self) -> RepoResult<()>;

    fn create_project(&self, project: &Project) -> RepoResult<ProjectId>;
    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>>;
    fn list_projects(&self) -> RepoResult<Vec<Project>>;
    fn update_project(&self, project: &Project) -> RepoResult<()>;
    /// Deletes a project; fragments, contexts, memberships, anchors and
    /// tasks cascade.
    fn delete_project(&self, id: ProjectId) -> RepoResult<()>;
    fn project_stats(&self, id: ProjectId) -> RepoResult<ProjectStats>;

    /// Inserts a fragment row together with its initial membership set.
    fn insert_fragment(&self, fragment: &MemoryFragment) -> RepoResult<FragmentId>;
    fn get_fragment(&self, id: FragmentId) -> RepoResult<Option<MemoryFragment>>;
    /// Loads the fragments that exist among `ids`, in input order.
    fn get_fragments(&self, ids: &[FragmentId]) -> RepoResult<Vec<MemoryFragment>>;
    fn list_fragments(
        &self,
        project_id: ProjectId,
        limit: Option<u32>,
    ) -> RepoResult<Vec<MemoryFragment>>;
    fn list_fragments_by_context(&self, context_id: ContextId) -> RepoResult<Vec<MemoryFragment>>;
    fn list_fragment_ids(&self, project_id: ProjectId) -> RepoResult<Vec<FragmentId>>;
    fn delete_fragment_row(&self, id: FragmentId) -> RepoResult<()>;

    /// Inserts a context unless the project already has one with the same
    /// label key. Returns the stored context and whether it was inserted.
    fn insert_context_if_absent(&self, context: &MemoryContext)
        -> RepoResult<(MemoryContext, bool)>;
    fn get_context(&self, id: ContextId) -> RepoResult<Option<MemoryContext>>;
    fn list_contexts(&self, project_id: ProjectId) -> RepoResult<Vec<MemoryContext>>;
    fn find_context_by_label(
        &self,
        project_id: ProjectId,
        label: &str,
    ) -> RepoResult<Option<MemoryContext>>;
    fn delete_context_row(&self, id: ContextId) -> RepoResult<()>;
    /// Contexts without members created strictly before `created_before`.
    fn list_empty_contexts(
        &self,
        project_id: ProjectId,
        created_before: i64,
    ) -> RepoResult<Vec<MemoryContext>>;

    /// Adds one membership edge. Returns `false` when it already existed.
    fn add_membership(&self, fragment_id: FragmentId, context_id: ContextId) -> RepoResult<bool>;
    /// Removes one membership edge. Returns `false` when it did not exist.
    fn remove_membership(&self, fragment_id: FragmentId, context_id: ContextId)
        -> RepoResult<bool>;
    /// Removes every membership edge of a fragment and returns the contexts
    /// it was removed from.
    fn remove_all_memberships(&self, fragment_id: FragmentId) -> RepoResult<Vec<ContextId>>;
    /// Deletes membership rows whose fragment or context no longer exists.
    fn purge_dangling_memberships(&self) -> RepoResult<usize>;

    fn create_anchor(&self, anchor: &CognitiveAnchor) -> RepoResult<AnchorId>;
    fn get_anchor(&self, id: AnchorId) -> RepoResult<Option<CognitiveAnchor>>;
    fn list_anchors(&self, project_id: ProjectId) -> RepoResult<Vec<CognitiveAnchor>>;
}

/// SQLite-backed metadata store.
///
/// One connection guarded by a mutex; every trait call holds the lock for
/// the duration of its transaction.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Opens (and migrates) a metadata database file.
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> RepoResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps an already migrated connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| RepoError::Unavailable("metadata connection lock poisoned".to_string()))?;
        f(&mut guard)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> RepoResult<T>,
    ) -> RepoResult<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn check_health(&self) -> RepoResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1;", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn create_project(&self, project: &Project) -> RepoResult<ProjectId> {
        project.validate()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5);",
                params![
                    project.id.to_string(),
                    project.name.as_str(),
                    project.description.as_str(),
                    project.created_at,
                    project.updated_at,
                ],
            )?;
            Ok(project.id)
        })
    }

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>> {
        self.with_conn(|conn| load_project(conn, id))
    }

    fn list_projects(&self) -> RepoResult<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at, updated_at
                 FROM projects
                 ORDER BY created_at ASC, id ASC;",
            )?;
            let mut rows = stmt.query([])?;
            let mut projects = Vec::new();
            while let Some(row) = rows.next()? {
                projects.push(parse_project_row(row)?);
            }
            Ok(projects)
        })
    }

    fn update_project(&self, project: &Project) -> RepoResult<()> {
        project.validate()?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE projects
                 SET name = ?2, description = ?3, updated_at = ?4
                 WHERE id = ?1;",
                params![
                    project.id.to_string(),
                    project.name.as_str(),
                    project.description.as_str(),
                    now_epoch_ms(),
                ],
            )?;
            if changed == 0 {
                return Err(not_found(EntityKind::Project, project.id));
            }
            Ok(())
        })
    }

    fn delete_project(&self, id: ProjectId) -> RepoResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM projects WHERE id = ?1;", [id.to_string()])?;
            if changed == 0 {
                return Err(not_found(EntityKind::Project, id));
            }
            Ok(())
        })
    }

    fn project_stats(&self, id: ProjectId) -> RepoResult<ProjectStats> {
        self.with_conn(|conn| {
            ensure_project_exists(conn, id)?;
            let project = id.to_string();
            let count = |sql: &str| -> RepoResult<u64> {
                let value: i64 = conn.query_row(sql, [project.as_str()], |row| row.get(0))?;
                u64::try_from(value)
                    .map_err(|_| RepoError::InvalidData(format!("negative count {value}")))
            };
            Ok(ProjectStats {
                fragments: count("SELECT COUNT(*) FROM fragments WHERE project_id = ?1;")?,
                contexts: count("SELECT COUNT(*) FROM contexts WHERE project_id = ?1;")?,
                anchors: count("SELECT COUNT(*) FROM anchors WHERE project_id = ?1;")?,
                tasks_pending: count(
                    "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'pending';",
                )?,
                tasks_in_progress: count(
                    "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'in_progress';",
                )?,
                tasks_completed: count(
                    "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'completed';",
                )?,
            })
        })
    }

    fn insert_fragment(&self, fragment: &MemoryFragment) -> RepoResult<FragmentId> {
        fragment.validate()?;
        self.with_tx(|tx| {
            ensure_project_exists(tx, fragment.project_id)?;
            for context_id in &fragment.context_ids {
                ensure_context_in_project(tx, *context_id, fragment.project_id)?;
            }

            tx.execute(
                "INSERT INTO fragments (id, project_id, content, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                params![
                    fragment.id.to_string(),
                    fragment.project_id.to_string(),
                    fragment.content.as_str(),
                    fragment.source.as_str(),
                    fragment.created_at,
                    fragment.updated_at,
                ],
            )?;
            for context_id in &fragment.context_ids {
                insert_membership(tx, *context_id, fragment.id)?;
            }
            Ok(fragment.id)
        })
    }

    fn get_fragment(&self, id: FragmentId) -> RepoResult<Option<MemoryFragment>> {
        self.with_conn(|conn| load_fragment(conn, id))
    }

    fn get_fragments(&self, ids: &[FragmentId]) -> RepoResult<Vec<MemoryFragment>> {
        self.with_conn(|conn| {
            let mut fragments = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(fragment) = load_fragment(conn, *id)? {
                    fragments.push(fragment);
                }
            }
            Ok(fragments)
        })
    }

    fn list_fragments(
        &self,
        project_id: ProjectId,
        limit: Option<u32>,
    ) -> RepoResult<Vec<MemoryFragment>> {
        self.with_conn(|conn| {
            let limit = limit.map_or(-1, i64::from);
            let mut stmt = conn.prepare(&format!(
                "{FRAGMENT_SELECT_SQL}
                 WHERE project_id = ?1
                 ORDER BY created_at DESC, id ASC
                 LIMIT ?2;"
            ))?;
            let mut rows = stmt.query(params![project_id.to_string(), limit])?;
            let mut fragments = Vec::new();
            while let Some(row) = rows.next()? {
                fragments.push(parse_fragment_row(conn, row)?);
            }
            Ok(fragments)
        })
    }

    fn list_fragments_by_context(&self, context_id: ContextId) -> RepoResult<Vec<MemoryFragment>> {
        self.with_conn(|conn| {
            if load_context(conn, context_id)?.is_none() {
                return Err(not_found(EntityKind::Context, context_id));
            }
            let mut stmt = conn.prepare(
                "SELECT f.id, f.project_id, f.content, f.source, f.created_at, f.updated_at
                 FROM fragments f
                 INNER JOIN context_members m ON m.fragment_id = f.id
                 WHERE m.context_id = ?1
                 ORDER BY f.created_at ASC, f.id ASC;",
            )?;
            let mut rows = stmt.query([context_id.to_string()])?;
            let mut fragments = Vec::new();
            while let Some(row) = rows.next()? {
                fragments.push(parse_fragment_row(conn, row)?);
            }
            Ok(fragments)
        })
    }

    fn list_fragment_ids(&self, project_id: ProjectId) -> RepoResult<Vec<FragmentId>> {
        self.with_conn(|conn| {
            query_ids(
                conn,
                "SELECT id FROM fragments WHERE project_id = ?1 ORDER BY id ASC;",
                project_id,
                "fragments.id",
            )
        })
    }

    fn delete_fragment_row(&self, id: FragmentId) -> RepoResult<()> {
        self.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM fragments WHERE id = ?1;", [id.to_string()])?;
            if changed == 0 {
                return Err(not_found(EntityKind::Fragment, id));
            }
            Ok(())
        })
    }

    fn insert_context_if_absent(
        &self,
        context: &MemoryContext,
    ) -> RepoResult<(MemoryContext, bool)> {
        context.validate()?;
        let key = context.label_key();
        self.with_tx(|tx| {
            ensure_project_exists(tx, context.project_id)?;
            let changed = tx.execute(
                "INSERT INTO contexts (
                    id, project_id, label, label_key, description, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (project_id, label_key) DO NOTHING;",
                params![
                    context.id.to_string(),
                    context.project_id.to_string(),
                    context.label.as_str(),
                    key.as_str(),
                    context.description.as_str(),
                    context.created_at,
                    context.updated_at,
                ],
            )?;
            let stored = load_context_by_key(tx, context.project_id, &key)?.ok_or_else(|| {
                RepoError::InvalidData(format!("context `{key}` missing after insert"))
            })?;
            Ok((stored, changed == 1))
        })
    }

    fn get_context(&self, id: ContextId) -> RepoResult<Option<MemoryContext>> {
        self.with_conn(|conn| load_context(conn, id))
    }

    fn list_contexts(&self, project_id: ProjectId) -> RepoResult<Vec<MemoryContext>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONTEXT_SELECT_SQL}
                 WHERE project_id = ?1
                 ORDER BY created_at ASC, id ASC;"
            ))?;
            let mut rows = stmt.query([project_id.to_string()])?;
            let mut contexts = Vec::new();
            while let Some(row) = rows.next()? {
                contexts.push(parse_context_row(conn, row)?);
            }
            Ok(contexts)
        })
    }

    fn find_context_by_label(
        &self,
        project_id: ProjectId,
        label: &str,
    ) -> RepoResult<Option<MemoryContext>> {
        self.with_conn(|conn| load_context_by_key(conn, project_id, &label_key(label)))
    }

    fn delete_context_row(&self, id: ContextId) -> RepoResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM contexts WHERE id = ?1;", [id.to_string()])?;
            if changed == 0 {
                return Err(not_found(EntityKind::Context, id));
            }
            Ok(())
        })
    }

    fn list_empty_contexts(
        &self,
        project_id: ProjectId,
        created_before: i64,
    ) -> RepoResult<Vec<MemoryContext>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONTEXT_SELECT_SQL}
                 WHERE project_id = ?1
                   AND created_at < ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM context_members m WHERE m.context_id = contexts.id
                   )
                 ORDER BY created_at ASC, id ASC;"
            ))?;
            let mut rows = stmt.query(params![project_id.to_string(), created_before])?;
            let mut contexts = Vec::new();
            while let Some(row) = rows.next()? {
                contexts.push(parse_context_row(conn, row)?);
            }
            Ok(contexts)
        })
    }

    fn add_membership(&self, fragment_id: FragmentId, context_id: ContextId) -> RepoResult<bool> {
        self.with_tx(|tx| {
            let project_id = fragment_project(tx, fragment_id)?.ok_or_else(|| {
                RepoError::ConstraintViolation(format!("fragment {fragment_id} does not exist"))
            })?;
            ensure_context_in_project(tx, context_id, project_id)?;
            insert_membership(tx, context_id, fragment_id)
        })
    }

    fn remove_membership(
        &self,
        fragment_id: FragmentId,
        context_id: ContextId,
    ) -> RepoResult<bool> {
        self.with_tx(|tx| {
            let project_id = fragment_project(tx, fragment_id)?.ok_or_else(|| {
                RepoError::ConstraintViolation(format!("fragment {fragment_id} does not exist"))
            })?;
            ensure_context_in_project(tx, context_id, project_id)?;
            let changed = tx.execute(
                "DELETE FROM context_members WHERE context_id = ?1 AND fragment_id = ?2;",
                params![context_id.to_string(), fragment_id.to_string()],
            )?;
            if changed > 0 {
                touch_context(tx, context_id)?;
            }
            Ok(changed > 0)
        })
    }

    fn remove_all_memberships(&self, fragment_id: FragmentId) -> RepoResult<Vec<ContextId>> {
        self.with_tx(|tx| {
            if fragment_project(tx, fragment_id)?.is_none() {
                return Err(not_found(EntityKind::Fragment, fragment_id));
            }
            let context_ids = load_membership_ids(
                tx,
                "SELECT context_id FROM context_members WHERE fragment_id = ?1 ORDER BY context_id;",
                fragment_id,
                "context_members.context_id",
            )?;
            tx.execute(
                "DELETE FROM context_members WHERE fragment_id = ?1;",
                [fragment_id.to_string()],
            )?;
            for context_id in &context_ids {
                touch_context(tx, *context_id)?;
            }
            Ok(context_ids.into_iter().collect())
        })
    }

    fn purge_dangling_memberships(&self) -> RepoResult<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM context_members
                 WHERE NOT EXISTS (
                        SELECT 1 FROM fragments f WHERE f.id = context_members.fragment_id
                    )
                    OR NOT EXISTS (
                        SELECT 1 FROM contexts c WHERE c.id = context_members.context_id
                    );",
                [],
            )?;
            Ok(removed)
        })
    }

    fn create_anchor(&self, anchor: &CognitiveAnchor) -> RepoResult<AnchorId> {
        anchor.validate()?;
        self.with_tx(|tx| {
            ensure_project_exists(tx, anchor.project_id)?;
            for fragment_id in &anchor.fragment_ids {
                match fragment_project(tx, *fragment_id)? {
                    Some(owner) if owner == anchor.project_id => {}
                    Some(_) => {
                        return Err(RepoError::ConstraintViolation(format!(
                            "fragment {fragment_id} belongs to another project"
                        )))
                    }
                    None => {
                        return Err(RepoError::ConstraintViolation(format!(
                            "fragment {fragment_id} does not exist"
                        )))
                    }
                }
            }
            for context_id in &anchor.context_ids {
                ensure_context_in_project(tx, *context_id, anchor.project_id)?;
            }

            let anchor_id = anchor.id.to_string();
            tx.execute(
                "INSERT INTO anchors (
                    id, project_id, title, description, priority, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                params![
                    anchor_id.as_str(),
                    anchor.project_id.to_string(),
                    anchor.title.as_str(),
                    anchor.description.as_str(),
                    anchor.priority.as_str(),
                    anchor.created_at,
                    anchor.updated_at,
                ],
            )?;
            for fragment_id in &anchor.fragment_ids {
                tx.execute(
                    "INSERT INTO anchor_fragments (anchor_id, fragment_id) VALUES (?1, ?2);",
                    params![anchor_id.as_str(), fragment_id.to_string()],
                )?;
            }
            for context_id in &anchor.context_ids {
                tx.execute(
                    "INSERT INTO anchor_contexts (anchor_id, context_id) VALUES (?1, ?2);",
                    params![anchor_id.as_str(), context_id.to_string()],
                )?;
            }
            Ok(anchor.id)
        })
    }

    fn get_anchor(&self, id: AnchorId) -> RepoResult<Option<CognitiveAnchor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, title, description, priority, created_at, updated_at
                 FROM anchors
                 WHERE id = ?1;",
            )?;
            let mut rows = stmt.query([id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(parse_anchor_row(conn, row)?)),
                None => Ok(None),
            }
        })
    }

    fn list_anchors(&self, project_id: ProjectId) -> RepoResult<Vec<CognitiveAnchor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, title, description, priority, created_at, updated_at
                 FROM anchors
                 WHERE project_id = ?1
                 ORDER BY created_at ASC, id ASC;",
            )?;
            let mut rows = stmt.query([project_id.to_string()])?;
            let mut anchors = Vec::new();
            while let Some(row) = rows.next()? {
                anchors.push(parse_anchor_row(conn, row)?);
            }
            Ok(anchors)
        })
    }
}

pub(crate) fn not_found(kind: EntityKind, id: Uuid) -> RepoError {
    RepoError::NotFound { kind, id }
}

pub(crate) fn ensure_project_exists(conn: &Connection, id: ProjectId) -> RepoResult<()> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1);",
        [id.to_string()],
        |row| row.get(0),
    )?;
    if exists == 1 {
        Ok(())
    } else {
        Err(not_found(EntityKind::Project, id))
    }
}

fn ensure_context_in_project(
    conn: &Connection,
    context_id: ContextId,
    project_id: ProjectId,
) -> RepoResult<()> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT project_id FROM contexts WHERE id = ?1;",
            [context_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        None => Err(RepoError::ConstraintViolation(format!(
            "context {context_id} does not exist"
        ))),
        Some(owner) if parse_uuid(&owner, "contexts.project_id")? != project_id => {
            Err(RepoError::ConstraintViolation(format!(
                "context {context_id} belongs to another project"
            )))
        }
        Some(_) => Ok(()),
    }
}

fn fragment_project(conn: &Connection, fragment_id: FragmentId) -> RepoResult<Option<ProjectId>> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT project_id FROM fragments WHERE id = ?1;",
            [fragment_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    owner
        .map(|value| parse_uuid(&value, "fragments.project_id"))
        .transpose()
}

fn insert_membership(
    conn: &Connection,
    context_id: ContextId,
    fragment_id: FragmentId,
) -> RepoResult<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO context_members (context_id, fragment_id, added_at)
         VALUES (?1, ?2, ?3);",
        params![context_id.to_string(), fragment_id.to_string(), now_epoch_ms()],
    )?;
    if changed > 0 {
        touch_context(conn, context_id)?;
    }
    Ok(changed > 0)
}

fn touch_context(conn: &Connection, context_id: ContextId) -> RepoResult<()> {
    conn.execute(
        "UPDATE contexts SET updated_at = ?2 WHERE id = ?1;",
        params![context_id.to_string(), now_epoch_ms()],
    )?;
    Ok(())
}

fn load_project(conn: &Connection, id: ProjectId) -> RepoResult<Option<Project>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, created_at, updated_at
         FROM projects
         WHERE id = ?1;",
    )?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_project_row(row)?)),
        None => Ok(None),
    }
}

fn load_fragment(conn: &Connection, id: FragmentId) -> RepoResult<Option<MemoryFragment>> {
    let mut stmt = conn.prepare(&format!("{FRAGMENT_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_fragment_row(conn, row)?)),
        None => Ok(None),
    }
}

fn load_context(conn: &Connection, id: ContextId) -> RepoResult<Option<MemoryContext>> {
    let mut stmt = conn.prepare(&format!("{CONTEXT_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_context_row(conn, row)?)),
        None => Ok(None),
    }
}

fn load_context_by_key(
    conn: &Connection,
    project_id: ProjectId,
    key: &str,
) -> RepoResult<Option<MemoryContext>> {
    let mut stmt = conn.prepare(&format!(
        "{CONTEXT_SELECT_SQL} WHERE project_id = ?1 AND label_key = ?2;"
    ))?;
    let mut rows = stmt.query(params![project_id.to_string(), key])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_context_row(conn, row)?)),
        None => Ok(None),
    }
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<Project> {
    let id: String = row.get("id")?;
    Ok(Project {
        id: parse_uuid(&id, "projects.id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_fragment_row(conn: &Connection, row: &Row<'_>) -> RepoResult<MemoryFragment> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "fragments.id")?;
    let project_text: String = row.get("project_id")?;
    let context_ids = load_membership_ids(
        conn,
        "SELECT context_id FROM context_members WHERE fragment_id = ?1 ORDER BY context_id;",
        id,
        "context_members.context_id",
    )?;
    Ok(MemoryFragment {
        id,
        project_id: parse_uuid(&project_text, "fragments.project_id")?,
        content: row.get("content")?,
        source: row.get("source")?,
        context_ids,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_context_row(conn: &Connection, row: &Row<'_>) -> RepoResult<MemoryContext> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "contexts.id")?;
    let project_text: String = row.get("project_id")?;
    let member_ids = load_membership_ids(
        conn,
        "SELECT fragment_id FROM context_members WHERE context_id = ?1 ORDER BY fragment_id;",
        id,
        "context_members.fragment_id",
    )?;
    Ok(MemoryContext {
        id,
        project_id: parse_uuid(&project_text, "contexts.project_id")?,
        label: row.get("label")?,
        description: row.get("description")?,
        member_ids,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_anchor_row(conn: &Connection, row: &Row<'_>) -> RepoResult<CognitiveAnchor> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "anchors.id")?;
    let project_text: String = row.get("project_id")?;
    let priority_text: String = row.get("priority")?;
    let priority = AnchorPriority::parse(&priority_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid anchor priority `{priority_text}` in anchors.priority"
        ))
    })?;
    Ok(CognitiveAnchor {
        id,
        project_id: parse_uuid(&project_text, "anchors.project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        priority,
        fragment_ids: load_membership_ids(
            conn,
            "SELECT fragment_id FROM anchor_fragments WHERE anchor_id = ?1 ORDER BY fragment_id;",
            id,
            "anchor_fragments.fragment_id",
        )?,
        context_ids: load_membership_ids(
            conn,
            "SELECT context_id FROM anchor_contexts WHERE anchor_id = ?1 ORDER BY context_id;",
            id,
            "anchor_contexts.context_id",
        )?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn load_membership_ids(
    conn: &Connection,
    sql: &str,
    owner: Uuid,
    column: &'static str,
) -> RepoResult<BTreeSet<Uuid>> {
    Ok(query_ids(conn, sql, owner, column)?.into_iter().collect())
}

fn query_ids(
    conn: &Connection,
    sql: &str,
    owner: Uuid,
    column: &'static str,
) -> RepoResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([owner.to_string()])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let value: String = row.get(0)?;
        ids.push(parse_uuid(&value, column)?);
    }
    Ok(ids)
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}
