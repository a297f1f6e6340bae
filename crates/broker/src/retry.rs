//! Bounded-redelivery policy.

use serde::{Deserialize, Serialize};

/// Retry policy for transient infrastructure failures.
///
/// `max_attempts` counts deliveries of a message, the first one included: a
/// message rejected with requeue on its `max_attempts`-th delivery routes to
/// the dead-letter queue instead of being requeued. Deterministic failures
/// never come through here; workers convert those to failed results.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// No redelivery at all: first rejection dead-letters.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1 }
    }

    /// Whether a message already delivered `attempt` times may be requeued.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
