//! Settlement: the only writer that turns a result message into durable
//! financial and task-status effects, exactly once per task.
//!
//! Idempotency is layered: the terminal-task check discards duplicate
//! deliveries up front, and the ledger's correlation-key spend absorbs any
//! race that slips past it. Acknowledgment always follows the durable write.

pub mod dead_letter;
pub mod processor;

pub use dead_letter::DeadLetterWatcher;
pub use processor::{ConsumerConfig, ResultProcessor};
