//! Queue topology for the recognition pipeline.
//!
//! Logical wire names follow the deployed broker layout: a dispatch exchange
//! fanning into one task queue consumed by competing workers, a result
//! exchange fanning into one result queue, and a shared dead-letter queue.

use crate::broker::{Broker, BrokerError, QueueOptions};
use crate::retry::RetryPolicy;

/// Dispatch exchange / routing key (wire contract).
pub const TASK_EXCHANGE: &str = "formula_tasks";
pub const TASK_ROUTING_KEY: &str = "formula.recognition";

/// Result exchange / routing key (wire contract).
pub const RESULT_EXCHANGE: &str = "formula_results";
pub const RESULT_ROUTING_KEY: &str = "formula.result";

/// Queue names and retry policy for one pipeline deployment.
#[derive(Debug, Clone)]
pub struct Topology {
    pub task_queue: String,
    pub result_queue: String,
    pub dead_letter_queue: String,
    pub retry: RetryPolicy,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            task_queue: "formula_recognition_queue".to_string(),
            result_queue: "formula_results_queue".to_string(),
            dead_letter_queue: "formula_dead_letter_queue".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Topology {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Declare all queues (idempotent). The task and result queues dead-letter
    /// into the shared dead-letter queue with the configured attempt bound.
    pub fn declare<B>(&self, broker: &B) -> Result<(), BrokerError>
    where
        B: Broker + ?Sized,
    {
        broker.declare_queue(&self.dead_letter_queue, QueueOptions::default())?;
        broker.declare_queue(
            &self.task_queue,
            QueueOptions::dead_lettering_to(&self.dead_letter_queue, self.retry),
        )?;
        broker.declare_queue(
            &self.result_queue,
            QueueOptions::dead_lettering_to(&self.dead_letter_queue, self.retry),
        )?;
        Ok(())
    }
}
