//! Task repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide plain CRUD over project-scoped `tasks` rows.
//!
//! # Invariants
//! - Write paths call `Task::validate()` before SQL mutations.
//! - Read paths reject unknown status values instead of masking them.

use super::metadata_store::{
    ensure_project_exists, not_found, parse_uuid, RepoError, RepoResult, SqliteMetadataStore,
};
use crate::model::now_epoch_ms;
use crate::model::project::ProjectId;
use crate::model::task::{Task, TaskId, TaskStatus, TaskUpdate};
use crate::model::EntityKind;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::sync::Arc;

const TASK_SELECT_SQL: &str = "SELECT
    id,
    project_id,
    title,
    description,
    status,
    created_at,
    updated_at
FROM tasks";

/// Repository interface for task CRUD operations.
pub trait TaskRepository: Send + Sync {
    fn create_task(&self, task: &Task) -> RepoResult<TaskId>;
    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>>;
    /// Lists a project's tasks, optionally filtered by status, oldest first.
    fn list_tasks(&self, project_id: ProjectId, status: Option<TaskStatus>)
        -> RepoResult<Vec<Task>>;
    /// Applies a partial update and returns the stored task.
    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> RepoResult<Task>;
    fn delete_task(&self, id: TaskId) -> RepoResult<()>;
}

impl TaskRepository for SqliteMetadataStore {
    fn create_task(&self, task: &Task) -> RepoResult<TaskId> {
        task.validate()?;
        self.with_conn(|conn| {
            ensure_project_exists(conn, task.project_id)?;
            conn.execute(
                "INSERT INTO tasks (
                    id, project_id, title, description, status, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
                params![
                    task.id.to_string(),
                    task.project_id.to_string(),
                    task.title.as_str(),
                    task.description.as_str(),
                    task.status.as_str(),
                    task.created_at,
                    task.updated_at,
                ],
            )?;
            Ok(task.id)
        })
    }

    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        self.with_conn(|conn| load_task(conn, id))
    }

    fn list_tasks(
        &self,
        project_id: ProjectId,
        status: Option<TaskStatus>,
    ) -> RepoResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut sql = format!("{TASK_SELECT_SQL} WHERE project_id = ?");
            let mut bind_values = vec![Value::Text(project_id.to_string())];
            if let Some(status) = status {
                sql.push_str(" AND status = ?");
                bind_values.push(Value::Text(status.as_str().to_string()));
            }
            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bind_values))?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(parse_task_row(row)?);
            }
            Ok(tasks)
        })
    }

    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> RepoResult<Task> {
        self.with_conn(|conn| {
            let mut task = load_task(conn, id)?.ok_or_else(|| not_found(EntityKind::Task, id))?;
            if let Some(title) = &update.title {
                task.title = title.trim().to_string();
            }
            if let Some(description) = &update.description {
                task.description = description.clone();
            }
            if let Some(status) = update.status {
                task.status = status;
            }
            task.validate()?;
            task.updated_at = now_epoch_ms();

            conn.execute(
                "UPDATE tasks
                 SET title = ?2, description = ?3, status = ?4, updated_at = ?5
                 WHERE id = ?1;",
                params![
                    task.id.to_string(),
                    task.title.as_str(),
                    task.description.as_str(),
                    task.status.as_str(),
                    task.updated_at,
                ],
            )?;
            Ok(task)
        })
    }

    fn delete_task(&self, id: TaskId) -> RepoResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM tasks WHERE id = ?1;", [id.to_string()])?;
            if changed == 0 {
                return Err(not_found(EntityKind::Task, id));
            }
            Ok(())
        })
    }
}

/// Lets a task service share the store handed to the memory service.
impl<R: TaskRepository + ?Sized> TaskRepository for Arc<R> {
    fn create_task(&self, task: &Task) -> RepoResult<TaskId> {
        (**self).create_task(task)
    }

    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        (**self).get_task(id)
    }

    fn list_tasks(
        &self,
        project_id: ProjectId,
        status: Option<TaskStatus>,
    ) -> RepoResult<Vec<Task>> {
        (**self).list_tasks(project_id, status)
    }

    fn update_task(&self, id: TaskId, update: &TaskUpdate) -> RepoResult<Task> {
        (**self).update_task(id, update)
    }

    fn delete_task(&self, id: TaskId) -> RepoResult<()> {
        (**self).delete_task(id)
    }
}

fn load_task(conn: &Connection, id: TaskId) -> RepoResult<Option<Task>> {
    let mut stmt = conn.prepare(&format!("{TASK_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_task_row(row)?)),
        None => Ok(None),
    }
}

fn parse_task_row(row: &Row<'_>) -> RepoResult<Task> {
    let id_text: String = row.get("id")?;
    let project_text: String = row.get("project_id")?;
    let status_text: String = row.get("status")?;
    let status = TaskStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid task status `{status_text}` in tasks.status"))
    })?;

    Ok(Task {
        id: parse_uuid(&id_text, "tasks.id")?,
        project_id: parse_uuid(&project_text, "tasks.project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
