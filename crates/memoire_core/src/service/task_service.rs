//! Task use-case service.
//!
//! # Responsibility
//! - Provide stable task CRUD entry points for core callers.
//! - Delegate persistence to repository implementations.
//!
//! # Invariants
//! - Service APIs never bypass repository validation/persistence contracts.
//! - Service layer remains storage-agnostic.

use crate::model::project::ProjectId;
use crate::model::task::{Task, TaskId, TaskStatus, TaskUpdate};
use crate::repo::metadata_store::RepoResult;
use crate::repo::task_repo::TaskRepository;

/// Use-case service wrapper for task CRUD operations.
pub struct TaskService<R: TaskRepository> {
    repo: R,
}

impl<R: TaskRepository> TaskService<R> {
    /// Creates a service using the provided repository implementation.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Creates a pending task in a project.
    ///
    /// # Contract
    /// - Uses `TaskStatus::Pending`.
    /// - Returns the stored task.
    pub fn create_task(
        &self,
        project_id: ProjectId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> RepoResult<Task> {
        let task = Task::new(project_id, title, description);
        self.repo.create_task(&task)?;
        Ok(task)
    }

    pub fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        self.repo.get_task(id)
    }

    /// Lists a project's tasks, optionally only those in `status`.
    pub fn list_tasks(
        &self,
        project_id: ProjectId,
        status: Option<TaskStatus>,
    ) -> RepoResult<Vec<Task>> {
        self.repo.list_tasks(project_id, status)
    }

    /// Applies a partial update.
    ///
    /// Returns repository-level not-found or validation errors unchanged.
    pub fn update_task(&self, id: TaskId, update: &TaskUpdate) -> RepoResult<Task> {
        self.repo.update_task(id, update)
    }

    /// Moves a task to `status`.
    pub fn set_status(&self, id: TaskId, status: TaskStatus) -> RepoResult<Task> {
        self.repo.update_task(
            id,
            &TaskUpdate {
                status: Some(status),
                ..TaskUpdate::default()
            },
        )
    }

    pub fn delete_task(&self, id: TaskId) -> RepoResult<()> {
        self.repo.delete_task(id)
    }
}
