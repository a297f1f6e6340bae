//! Message broker topology and the thin client abstraction over it.
//!
//! Queues carry opaque JSON bytes; the typed envelopes in [`message`] are the
//! wire contract and are validated at the boundary. Delivery is durable
//! at-least-once with explicit acknowledgment: consumers must ack after
//! durably processing, or reject (optionally requeueing) on failure.
//! Unacknowledged deliveries return to the queue when a consumer goes away.

pub mod broker;
pub mod in_memory;
pub mod message;
pub mod retry;
pub mod topology;

pub use broker::{Broker, BrokerError, Delivery, DeliveryTag, QueueConsumer, QueueOptions};
pub use in_memory::InMemoryBroker;
pub use message::{DispatchMessage, ImageInfo, ResultMessage};
pub use retry::RetryPolicy;
pub use topology::Topology;
