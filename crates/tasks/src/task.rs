//! Task record and status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use texflow_core::{Credits, Entity, ModelId, TaskId, UserId};

use crate::store::TaskStoreError;

/// Task execution status.
///
/// `pending → in_progress → {done, error}`; `done` and `error` are terminal
/// and no transition leaves a terminal state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a worker to pick it up.
    Pending,
    /// A worker is running inference for it.
    InProgress,
    /// Recognized successfully; credits were charged.
    Done,
    /// Failed terminally; no charge.
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the submitted file (the core never persists file bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
    pub content_type: String,
}

impl FileRef {
    pub fn new(filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let content_type = content_type_for(&filename).to_string();
        Self {
            filename,
            content_type,
        }
    }
}

/// Content type derived from the filename extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        "image/png"
    }
}

/// One user-submitted recognition request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub file: FileRef,
    pub model_id: ModelId,
    pub status: TaskStatus,
    /// Set at most once, only when the task completes.
    pub credits_charged: Option<Credits>,
    pub input_ref: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Task {
    type Id = TaskId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Task {
    /// Create a fresh pending task.
    pub fn new(user_id: UserId, file: FileRef, model_id: ModelId) -> Self {
        let now = Utc::now();
        let input_ref = Some(file.filename.clone());
        Self {
            id: TaskId::new(),
            user_id,
            file,
            model_id,
            status: TaskStatus::Pending,
            credits_charged: None,
            input_ref,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn guard_not_terminal(&self, to: TaskStatus) -> Result<(), TaskStoreError> {
        if self.status.is_terminal() {
            return Err(TaskStoreError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// `pending → in_progress`. No-op when already in progress; rejected when
    /// the task is terminal (a duplicate/late dispatch).
    pub fn mark_in_progress(&mut self) -> Result<(), TaskStoreError> {
        if self.status == TaskStatus::InProgress {
            return Ok(());
        }
        self.guard_not_terminal(TaskStatus::InProgress)?;
        self.status = TaskStatus::InProgress;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `→ done`, recording the output and the charge.
    ///
    /// Accepts `pending → done` as well: the worker's in-progress update is
    /// best-effort and settlement must not depend on it having landed.
    pub fn complete(&mut self, output: &str, credits_charged: Credits) -> Result<(), TaskStoreError> {
        self.guard_not_terminal(TaskStatus::Done)?;
        self.status = TaskStatus::Done;
        self.output = Some(output.to_string());
        self.error_message = None;
        self.credits_charged = Some(credits_charged);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `→ error` (terminal, no charge). Idempotent against an already-error task.
    pub fn fail(&mut self, error_message: &str) -> Result<(), TaskStoreError> {
        if self.status == TaskStatus::Error {
            return Ok(());
        }
        self.guard_not_terminal(TaskStatus::Error)?;
        self.status = TaskStatus::Error;
        self.error_message = Some(error_message.to_string());
        self.output = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        Task::new(UserId::new(), FileRef::new("formula.png"), ModelId::new())
    }

    #[test]
    fn fresh_task_is_pending() {
        let task = test_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.credits_charged.is_none());
        assert_eq!(task.input_ref.as_deref(), Some("formula.png"));
    }

    #[test]
    fn happy_path_transitions() {
        let mut task = test_task();

        task.mark_in_progress().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        task.complete("x^2", Credits::from_minor(250)).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.output.as_deref(), Some("x^2"));
        assert_eq!(task.credits_charged, Some(Credits::from_minor(250)));
    }

    #[test]
    fn mark_in_progress_is_idempotent() {
        let mut task = test_task();
        task.mark_in_progress().unwrap();
        task.mark_in_progress().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn complete_accepts_pending_task() {
        // The worker's in-progress update is best-effort; completion must
        // still land when it was missed.
        let mut task = test_task();
        task.complete("x^2", Credits::from_minor(250)).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut task = test_task();
        task.mark_in_progress().unwrap();
        task.complete("x^2", Credits::from_minor(250)).unwrap();

        assert!(matches!(
            task.mark_in_progress(),
            Err(TaskStoreError::InvalidTransition {
                from: TaskStatus::Done,
                ..
            })
        ));
        assert!(matches!(
            task.complete("y", Credits::ZERO),
            Err(TaskStoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            task.fail("late failure"),
            Err(TaskStoreError::InvalidTransition { .. })
        ));
        // The charge was not clobbered.
        assert_eq!(task.credits_charged, Some(Credits::from_minor(250)));
    }

    #[test]
    fn fail_is_idempotent_on_error_tasks() {
        let mut task = test_task();
        task.fail("bad image").unwrap();
        task.fail("bad image, again").unwrap();

        assert_eq!(task.status, TaskStatus::Error);
        // First error message wins.
        assert_eq!(task.error_message.as_deref(), Some("bad image"));
        assert!(task.credits_charged.is_none());
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for("a.JPG"), "image/jpeg");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a.gif"), "image/gif");
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("noext"), "image/png");
    }
}
