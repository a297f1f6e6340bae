//! The worker receive loop and pool.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use texflow_broker::{
    Broker, BrokerError, Delivery, DispatchMessage, QueueConsumer, ResultMessage, Topology,
};
use texflow_core::WorkerId;
use texflow_tasks::{TaskStore, TaskStoreError};

use crate::handle::WorkerHandle;
use crate::recognizer::{RecognizeError, Recognizer};
use crate::validate;

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// How long a blocking receive waits before re-checking for shutdown.
    pub tick: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new("worker"),
            tick: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(name),
            ..Self::default()
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// One inference worker: a competing consumer on the task queue.
#[derive(Debug)]
pub struct RecognitionWorker;

impl RecognitionWorker {
    /// Spawn the worker on its own thread.
    ///
    /// The consumer is attached before the thread starts, so no dispatch
    /// published after this call returns can be missed.
    pub fn spawn<B, S, R>(
        config: WorkerConfig,
        broker: B,
        tasks: S,
        recognizer: R,
        topology: Topology,
    ) -> Result<WorkerHandle, BrokerError>
    where
        B: Broker + 'static,
        S: TaskStore + 'static,
        R: Recognizer + 'static,
    {
        let consumer = broker.subscribe(&topology.task_queue)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.worker_id.to_string();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                worker_loop(&config, &broker, consumer, &tasks, &recognizer, &topology, &shutdown_rx)
            })
            .expect("failed to spawn recognition worker thread");

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn worker_loop<B, S, R>(
    config: &WorkerConfig,
    broker: &B,
    mut consumer: Box<dyn QueueConsumer>,
    tasks: &S,
    recognizer: &R,
    topology: &Topology,
    shutdown_rx: &mpsc::Receiver<()>,
) where
    B: Broker,
    S: TaskStore,
    R: Recognizer,
{
    info!(worker = %config.worker_id, "recognition worker started");

    loop {
        // Shutdown check between deliveries only: the current message is
        // always drained to completion (drain, not abort).
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match consumer.recv_timeout(config.tick) {
            Ok(Some(delivery)) => {
                if let Err(e) =
                    process_delivery(config, broker, consumer.as_mut(), tasks, recognizer, topology, delivery)
                {
                    warn!(worker = %config.worker_id, error = %e, "delivery handling failed");
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(worker = %config.worker_id, error = %e, "task queue receive failed");
                break;
            }
        }
    }

    info!(worker = %config.worker_id, "recognition worker stopped");
}

fn process_delivery<B, S, R>(
    config: &WorkerConfig,
    broker: &B,
    consumer: &mut dyn QueueConsumer,
    tasks: &S,
    recognizer: &R,
    topology: &Topology,
    delivery: Delivery,
) -> Result<(), BrokerError>
where
    B: Broker,
    S: TaskStore,
    R: Recognizer,
{
    let msg = match DispatchMessage::from_bytes(&delivery.body) {
        Ok(m) => m,
        Err(e) => {
            warn!(worker = %config.worker_id, error = %e, "malformed dispatch payload");
            return consumer.reject(delivery.tag, false);
        }
    };

    debug!(worker = %config.worker_id, task_id = %msg.task_id, attempt = delivery.attempt,
        "processing dispatch");
    let started = Instant::now();

    // Deterministic validation failures never retry: report and move on.
    let image = match validate::decode_payload(&msg.image_data) {
        Ok(image) => image,
        Err(e) => {
            let result = ResultMessage::failure(
                msg.task_id,
                msg.user_id,
                config.worker_id.clone(),
                format!("validation: {e}"),
                started.elapsed().as_secs_f64(),
                None,
            );
            return publish_then_ack(broker, consumer, topology, delivery.tag, &result);
        }
    };

    // Best-effort status update; correctness does not depend on it. A task
    // already in a terminal state signals a duplicate/late dispatch.
    match tasks.mark_in_progress(msg.task_id) {
        Ok(_) => {}
        Err(TaskStoreError::InvalidTransition { from, .. }) => {
            debug!(worker = %config.worker_id, task_id = %msg.task_id, status = %from,
                "dispatch for settled task, discarding");
            return consumer.ack(delivery.tag);
        }
        Err(e) => {
            warn!(worker = %config.worker_id, task_id = %msg.task_id, error = %e,
                "could not mark task in progress");
        }
    }

    let result = match recognizer.recognize(&image) {
        Ok(recognition) => ResultMessage::success(
            msg.task_id,
            msg.user_id,
            config.worker_id.clone(),
            recognition.latex,
            recognition.confidence,
            started.elapsed().as_secs_f64(),
            image.info,
        ),
        Err(e) if e.is_transient() => {
            // Only adapter-unavailability goes back to the broker; the
            // bounded retry policy decides requeue vs dead-letter.
            warn!(worker = %config.worker_id, task_id = %msg.task_id, error = %e,
                attempt = delivery.attempt, "transient inference failure, requeueing");
            return consumer.reject(delivery.tag, true);
        }
        Err(e) => ResultMessage::failure(
            msg.task_id,
            msg.user_id,
            config.worker_id.clone(),
            e.to_string(),
            started.elapsed().as_secs_f64(),
            Some(image.info),
        ),
    };

    publish_then_ack(broker, consumer, topology, delivery.tag, &result)
}

/// Publish the result, then acknowledge the dispatch — in that order.
///
/// If the worker dies between the two, redelivery reprocesses the task; the
/// guarded task transitions and the idempotent charge make that safe.
fn publish_then_ack<B>(
    broker: &B,
    consumer: &mut dyn QueueConsumer,
    topology: &Topology,
    tag: texflow_broker::DeliveryTag,
    result: &ResultMessage,
) -> Result<(), BrokerError>
where
    B: Broker,
{
    let body = match result.to_bytes() {
        Ok(body) => body,
        Err(e) => {
            error!(task_id = %result.task_id, error = %e, "result encoding failed");
            return consumer.reject(tag, true);
        }
    };

    if let Err(e) = broker.publish(&topology.result_queue, body) {
        warn!(task_id = %result.task_id, error = %e, "result publish failed, requeueing dispatch");
        return consumer.reject(tag, true);
    }

    consumer.ack(tag)
}

/// A pool of competing consumers over one task queue.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` workers named `worker-1..=worker-count`.
    pub fn spawn<B, S, R>(
        count: usize,
        broker: B,
        tasks: S,
        recognizer: R,
        topology: &Topology,
    ) -> Result<Self, BrokerError>
    where
        B: Broker + Clone + 'static,
        S: TaskStore + Clone + 'static,
        R: Recognizer + Clone + 'static,
    {
        let mut handles = Vec::with_capacity(count);
        for i in 1..=count {
            handles.push(RecognitionWorker::spawn(
                WorkerConfig::named(format!("worker-{i}")),
                broker.clone(),
                tasks.clone(),
                recognizer.clone(),
                topology.clone(),
            )?);
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drain and stop every worker.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}
