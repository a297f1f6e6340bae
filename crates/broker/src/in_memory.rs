//! In-memory broker for tests/dev.
//!
//! Faithful to the client contract: competing consumers, blocking receive
//! with timeout, per-delivery attempt counts, requeue-or-dead-letter on
//! reject, and redelivery of unacknowledged messages when a consumer drops.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag, QueueConsumer, QueueOptions};

#[derive(Debug)]
struct StoredMessage {
    body: Vec<u8>,
    /// Times this message has been delivered so far.
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<DeliveryTag, StoredMessage>,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    state: Mutex<QueueState>,
    ready_cv: Condvar,
}

#[derive(Debug, Default)]
struct Shared {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    next_tag: AtomicU64,
}

impl Shared {
    fn queue(&self, name: &str) -> Result<Arc<Queue>, BrokerError> {
        self.queues
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    fn enqueue(&self, name: &str, msg: StoredMessage) -> Result<(), BrokerError> {
        let queue = self.queue(name)?;
        let mut state = queue.state.lock().unwrap();
        state.ready.push_back(msg);
        queue.ready_cv.notify_one();
        Ok(())
    }

    /// Requeue a delivered message, or route it to the dead-letter queue when
    /// its attempt bound is exhausted (or requeueing was not requested).
    fn requeue_or_dead_letter(
        &self,
        queue_name: &str,
        queue: &Queue,
        msg: StoredMessage,
        requeue: bool,
    ) {
        let within_bound = queue
            .options
            .max_delivery_attempts
            .is_none_or(|max| msg.attempt < max);

        if requeue && within_bound {
            let mut state = queue.state.lock().unwrap();
            state.ready.push_back(msg);
            queue.ready_cv.notify_one();
            return;
        }

        match &queue.options.dead_letter_to {
            Some(dlq) => {
                debug!(queue = queue_name, dead_letter_queue = %dlq, attempt = msg.attempt,
                    "dead-lettering message");
                // Attempt count resets in the dead-letter queue.
                if let Err(e) = self.enqueue(dlq, StoredMessage { body: msg.body, attempt: 0 }) {
                    warn!(queue = queue_name, error = %e, "dead-letter queue missing, dropping message");
                }
            }
            None => {
                warn!(queue = queue_name, attempt = msg.attempt,
                    "no dead-letter queue configured, dropping message");
            }
        }
    }
}

/// In-memory broker.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Broker for InMemoryBroker {
    fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut queues = self.shared.queues.write().unwrap();
        queues.entry(queue.to_string()).or_insert_with(|| {
            Arc::new(Queue {
                options,
                state: Mutex::new(QueueState::default()),
                ready_cv: Condvar::new(),
            })
        });
        Ok(())
    }

    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.shared.enqueue(queue, StoredMessage { body, attempt: 0 })
    }

    fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, BrokerError> {
        let q = self.shared.queue(queue)?;
        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            queue_name: queue.to_string(),
            queue: q,
            unacked: HashSet::new(),
        }))
    }

    fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let q = self.shared.queue(queue)?;
        let state = q.state.lock().unwrap();
        Ok(state.ready.len())
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    queue_name: String,
    queue: Arc<Queue>,
    unacked: HashSet<DeliveryTag>,
}

impl InMemoryConsumer {
    fn take_in_flight(&mut self, tag: DeliveryTag) -> Result<StoredMessage, BrokerError> {
        if !self.unacked.remove(&tag) {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        let mut state = self.queue.state.lock().unwrap();
        state
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

impl QueueConsumer for InMemoryConsumer {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock().unwrap();

        loop {
            if let Some(mut msg) = state.ready.pop_front() {
                msg.attempt += 1;
                let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
                let delivery = Delivery {
                    tag,
                    body: msg.body.clone(),
                    attempt: msg.attempt,
                };
                state.in_flight.insert(tag, msg);
                self.unacked.insert(tag);
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timed_out) = self
                .queue
                .ready_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.take_in_flight(tag).map(|_| ())
    }

    fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let msg = self.take_in_flight(tag)?;
        self.shared
            .requeue_or_dead_letter(&self.queue_name, &self.queue, msg, requeue);
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    /// A disconnected consumer's unacknowledged deliveries go back for
    /// redelivery, subject to the same attempt bound.
    fn drop(&mut self) {
        let tags: Vec<_> = self.unacked.drain().collect();
        for tag in tags {
            let msg = {
                let mut state = self.queue.state.lock().unwrap();
                state.in_flight.remove(&tag)
            };
            if let Some(msg) = msg {
                self.shared
                    .requeue_or_dead_letter(&self.queue_name, &self.queue, msg, true);
            }
        }
    }
}
