//! Recognition tasks: durable records and their state machine.
//!
//! The task store is the single source of truth for task state. Every
//! transition is a guarded compare-and-swap on the current status, which is
//! what makes duplicate broker deliveries safe downstream.

pub mod store;
pub mod task;

pub use store::{InMemoryTaskStore, TaskStore, TaskStoreError};
pub use task::{content_type_for, FileRef, Task, TaskStatus};
