//! Broker client abstraction (mechanics only).
//!
//! The contract, independent of transport:
//!
//! - `publish` is fire-and-forget but durable (the message survives a broker
//!   restart).
//! - `subscribe` attaches a competing consumer to a queue: each message is
//!   handed to exactly one consumer at a time.
//! - A delivery must be explicitly acknowledged after durable processing, or
//!   rejected (optionally requeueing). Unacknowledged deliveries are
//!   redelivered after the consumer disconnects — that is how a crashed
//!   worker's in-flight task gets retried.
//! - Consumers pull one delivery, process it, then pull the next (effective
//!   prefetch of 1): round-robin load distribution, bounded blast radius.

use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Identifies one delivery of one message to one consumer.
pub type DeliveryTag = u64;

/// Broker client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(DeliveryTag),
}

/// One message handed to a consumer, with its acknowledgment handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// 1-based count of deliveries of this message, this one included.
    pub attempt: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.attempt > 1
    }
}

/// Declaration-time queue settings.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Queue that receives messages rejected without requeue or past the
    /// delivery-attempt bound. No dead-letter routing when unset.
    pub dead_letter_to: Option<String>,
    /// Bound on delivery attempts before dead-lettering.
    pub max_delivery_attempts: Option<u32>,
}

impl QueueOptions {
    pub fn dead_lettering_to(queue: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            dead_letter_to: Some(queue.into()),
            max_delivery_attempts: Some(retry.max_attempts),
        }
    }
}

/// Thin broker client.
pub trait Broker: Send + Sync {
    /// Declare a queue (idempotent).
    fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Durably enqueue a message.
    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Attach a competing consumer to a queue.
    fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError>;

    /// Number of messages currently waiting in a queue (not in flight).
    fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        (**self).declare_queue(queue, options)
    }

    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(queue, body)
    }

    fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        (**self).subscribe(queue)
    }

    fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        (**self).queue_depth(queue)
    }
}

/// A consumer attached to one queue.
///
/// Dropping a consumer with unacknowledged deliveries returns them to the
/// queue for redelivery.
pub trait QueueConsumer: Send {
    /// Block for up to `timeout` waiting for the next delivery.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery after processing it durably.
    fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue`, the message goes back to the queue
    /// unless its delivery-attempt bound is exhausted; without, it routes to
    /// the dead-letter queue.
    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}
