//! Task storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use texflow_core::{Credits, ModelId, TaskId, UserId};

use crate::task::{FileRef, Task, TaskStatus};

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable task records; the single writer path for task state.
///
/// Every mutation applies the state-machine guard under the store's lock, so
/// a redelivered message can never move a task out of a terminal state.
pub trait TaskStore: Send + Sync {
    /// Create a new pending task.
    fn create(&self, user_id: UserId, file: FileRef, model_id: ModelId)
        -> Result<Task, TaskStoreError>;

    /// Get a task by id.
    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// All tasks submitted by one user, oldest first.
    fn list_for_user(&self, user_id: UserId) -> Result<Vec<Task>, TaskStoreError>;

    /// `pending → in_progress` (idempotent when already in progress).
    fn mark_in_progress(&self, task_id: TaskId) -> Result<Task, TaskStoreError>;

    /// `→ done`, recording output and the charged amount.
    fn complete(
        &self,
        task_id: TaskId,
        output: &str,
        credits_charged: Credits,
    ) -> Result<Task, TaskStoreError>;

    /// `→ error` (idempotent against an already-error task).
    fn fail(&self, task_id: TaskId, error_message: &str) -> Result<Task, TaskStoreError>;
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn create(
        &self,
        user_id: UserId,
        file: FileRef,
        model_id: ModelId,
    ) -> Result<Task, TaskStoreError> {
        (**self).create(user_id, file, model_id)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(task_id)
    }

    fn list_for_user(&self, user_id: UserId) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list_for_user(user_id)
    }

    fn mark_in_progress(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        (**self).mark_in_progress(task_id)
    }

    fn complete(
        &self,
        task_id: TaskId,
        output: &str,
        credits_charged: Credits,
    ) -> Result<Task, TaskStoreError> {
        (**self).complete(task_id, output, credits_charged)
    }

    fn fail(&self, task_id: TaskId, error_message: &str) -> Result<Task, TaskStoreError> {
        (**self).fail(task_id, error_message)
    }
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn mutate<F>(&self, task_id: TaskId, f: F) -> Result<Task, TaskStoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), TaskStoreError>,
    {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(TaskStoreError::NotFound(task_id))?;
        f(task)?;
        Ok(task.clone())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(
        &self,
        user_id: UserId,
        file: FileRef,
        model_id: ModelId,
    ) -> Result<Task, TaskStoreError> {
        let task = Task::new(user_id, file, model_id);
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.tasks.read().unwrap().get(&task_id).cloned())
    }

    fn list_for_user(&self, user_id: UserId) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.tasks.read().unwrap();
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }

    fn mark_in_progress(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        self.mutate(task_id, |t| t.mark_in_progress())
    }

    fn complete(
        &self,
        task_id: TaskId,
        output: &str,
        credits_charged: Credits,
    ) -> Result<Task, TaskStoreError> {
        self.mutate(task_id, |t| t.complete(output, credits_charged))
    }

    fn fail(&self, task_id: TaskId, error_message: &str) -> Result<Task, TaskStoreError> {
        self.mutate(task_id, |t| t.fail(error_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (InMemoryTaskStore, Task) {
        let store = InMemoryTaskStore::new();
        let task = store
            .create(UserId::new(), FileRef::new("formula.png"), ModelId::new())
            .unwrap();
        (store, task)
    }

    #[test]
    fn create_then_get() {
        let (store, task) = setup();
        let fetched = store.get(task.id).unwrap().unwrap();
        assert_eq!(fetched, task);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[test]
    fn missing_task_is_none_for_get_and_error_for_mutation() {
        let (store, _) = setup();
        let missing = TaskId::new();

        assert!(store.get(missing).unwrap().is_none());
        assert!(matches!(
            store.mark_in_progress(missing),
            Err(TaskStoreError::NotFound(_))
        ));
    }

    #[test]
    fn transitions_are_guarded_under_the_store() {
        let (store, task) = setup();

        store.mark_in_progress(task.id).unwrap();
        let done = store
            .complete(task.id, "x^2", Credits::from_minor(250))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);

        // Redelivered completion is rejected; the stored record is untouched.
        assert!(matches!(
            store.complete(task.id, "stale", Credits::from_minor(999)),
            Err(TaskStoreError::InvalidTransition { .. })
        ));
        let current = store.get(task.id).unwrap().unwrap();
        assert_eq!(current.output.as_deref(), Some("x^2"));
        assert_eq!(current.credits_charged, Some(Credits::from_minor(250)));
    }

    #[test]
    fn list_for_user_is_oldest_first_and_scoped() {
        let store = InMemoryTaskStore::new();
        let user = UserId::new();
        let other = UserId::new();

        let first = store
            .create(user, FileRef::new("a.png"), ModelId::new())
            .unwrap();
        let second = store
            .create(user, FileRef::new("b.png"), ModelId::new())
            .unwrap();
        store
            .create(other, FileRef::new("c.png"), ModelId::new())
            .unwrap();

        let listed = store.list_for_user(user).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[test]
    fn observed_status_sequence_is_monotonic() {
        let (store, task) = setup();
        let mut observed = vec![store.get(task.id).unwrap().unwrap().status];

        store.mark_in_progress(task.id).unwrap();
        observed.push(store.get(task.id).unwrap().unwrap().status);

        store.fail(task.id, "backend down").unwrap();
        observed.push(store.get(task.id).unwrap().unwrap().status);

        // Late writes of any kind no longer change the status.
        let _ = store.mark_in_progress(task.id);
        let _ = store.complete(task.id, "x", Credits::ZERO);
        let _ = store.fail(task.id, "again");
        observed.push(store.get(task.id).unwrap().unwrap().status);

        assert_eq!(
            observed,
            vec![
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::Error,
                TaskStatus::Error,
            ]
        );
    }
}
