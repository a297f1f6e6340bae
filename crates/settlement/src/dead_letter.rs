//! Dead-letter watcher.
//!
//! Messages land on the dead-letter queue when they are malformed or when
//! their retry budget is exhausted. The watcher's one job is to make sure the
//! task they reference reaches a terminal state: a task must never sit in
//! `pending`/`in_progress` forever because its messages stopped flowing.

use std::sync::mpsc;
use std::thread;

use tracing::{debug, info, warn};

use texflow_broker::{
    Broker, BrokerError, Delivery, DispatchMessage, QueueConsumer, ResultMessage, Topology,
};
use texflow_core::TaskId;
use texflow_tasks::{TaskStore, TaskStoreError};
use texflow_worker::WorkerHandle;

use crate::processor::ConsumerConfig;

/// Reason recorded on tasks whose dispatch exhausted its retry budget.
pub const DEAD_LETTER_REASON: &str = "infrastructure failure: delivery attempts exhausted";

/// Consumes the dead-letter queue and terminally fails the referenced tasks.
#[derive(Debug)]
pub struct DeadLetterWatcher;

impl DeadLetterWatcher {
    pub fn spawn<B, S>(
        config: ConsumerConfig,
        broker: B,
        tasks: S,
        topology: Topology,
    ) -> Result<WorkerHandle, BrokerError>
    where
        B: Broker + 'static,
        S: TaskStore + 'static,
    {
        let consumer = broker.subscribe(&topology.dead_letter_queue)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || watcher_loop(&config, consumer, &tasks, &shutdown_rx))
            .expect("failed to spawn dead-letter watcher thread");

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn watcher_loop<S>(
    config: &ConsumerConfig,
    mut consumer: Box<dyn QueueConsumer>,
    tasks: &S,
    shutdown_rx: &mpsc::Receiver<()>,
) where
    S: TaskStore,
{
    info!(watcher = %config.name, "dead-letter watcher started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match consumer.recv_timeout(config.tick) {
            Ok(Some(delivery)) => handle_dead_letter(config, consumer.as_mut(), tasks, delivery),
            Ok(None) => continue,
            Err(e) => {
                warn!(watcher = %config.name, error = %e, "dead-letter queue receive failed");
                break;
            }
        }
    }

    info!(watcher = %config.name, "dead-letter watcher stopped");
}

fn handle_dead_letter<S>(
    config: &ConsumerConfig,
    consumer: &mut dyn QueueConsumer,
    tasks: &S,
    delivery: Delivery,
) where
    S: TaskStore,
{
    match correlate(&delivery.body) {
        Some(task_id) => {
            warn!(watcher = %config.name, %task_id, "message dead-lettered, failing task");
            fail_task(config, tasks, task_id);
        }
        None => {
            // Undecodable either way: nothing to correlate, just record it.
            warn!(watcher = %config.name, bytes = delivery.body.len(),
                "undecodable dead-lettered message");
        }
    }

    // The dead letter is recorded (log + terminal task state); drop it.
    let _ = consumer.ack(delivery.tag);
}

/// Extract the task id from either envelope kind.
fn correlate(body: &[u8]) -> Option<TaskId> {
    if let Ok(msg) = DispatchMessage::from_bytes(body) {
        return Some(msg.task_id);
    }
    if let Ok(msg) = ResultMessage::from_bytes(body) {
        return Some(msg.task_id);
    }
    None
}

fn fail_task<S: TaskStore>(config: &ConsumerConfig, tasks: &S, task_id: TaskId) {
    match tasks.fail(task_id, DEAD_LETTER_REASON) {
        Ok(_) => {}
        Err(TaskStoreError::InvalidTransition { from, .. }) => {
            // Already settled through the normal path; nothing to repair.
            debug!(watcher = %config.name, %task_id, status = %from,
                "dead-lettered message for settled task");
        }
        Err(e) => {
            warn!(watcher = %config.name, %task_id, error = %e,
                "could not fail task for dead-lettered message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use texflow_broker::InMemoryBroker;
    use texflow_core::{Credits, ModelId, UserId};
    use texflow_tasks::{FileRef, InMemoryTaskStore, TaskStatus};

    const TICK: Duration = Duration::from_millis(50);

    fn rig() -> (Arc<InMemoryBroker>, Arc<InMemoryTaskStore>, Topology) {
        let broker = InMemoryBroker::arc();
        let topology = Topology::default();
        topology.declare(broker.as_ref()).unwrap();
        (broker, InMemoryTaskStore::arc(), topology)
    }

    fn watch_one(
        broker: &Arc<InMemoryBroker>,
        tasks: &Arc<InMemoryTaskStore>,
        topology: &Topology,
    ) {
        let config = ConsumerConfig::named("dlq-test");
        let mut consumer = broker.subscribe(&topology.dead_letter_queue).unwrap();
        let delivery = consumer.recv_timeout(TICK).unwrap().unwrap();
        handle_dead_letter(&config, consumer.as_mut(), tasks.as_ref(), delivery);
    }

    #[test]
    fn dead_lettered_dispatch_fails_its_task() {
        let (broker, tasks, topology) = rig();
        let task = tasks
            .create(UserId::new(), FileRef::new("formula.png"), ModelId::new())
            .unwrap();

        let msg = DispatchMessage {
            task_id: task.id,
            user_id: task.user_id,
            image_data: "aGVsbG8=".to_string(),
            filename: "formula.png".to_string(),
            model_id: task.model_id,
            timestamp: Utc::now(),
        };
        broker
            .publish(&topology.dead_letter_queue, msg.to_bytes().unwrap())
            .unwrap();

        watch_one(&broker, &tasks, &topology);

        let task = tasks.get(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_message.as_deref(), Some(DEAD_LETTER_REASON));
        assert_eq!(broker.queue_depth(&topology.dead_letter_queue).unwrap(), 0);
    }

    #[test]
    fn settled_task_is_left_alone() {
        let (broker, tasks, topology) = rig();
        let task = tasks
            .create(UserId::new(), FileRef::new("formula.png"), ModelId::new())
            .unwrap();
        tasks.complete(task.id, "x^2", Credits::from_minor(250)).unwrap();

        let msg = DispatchMessage {
            task_id: task.id,
            user_id: task.user_id,
            image_data: "aGVsbG8=".to_string(),
            filename: "formula.png".to_string(),
            model_id: task.model_id,
            timestamp: Utc::now(),
        };
        broker
            .publish(&topology.dead_letter_queue, msg.to_bytes().unwrap())
            .unwrap();

        watch_one(&broker, &tasks, &topology);

        let task = tasks.get(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[test]
    fn undecodable_dead_letter_is_drained() {
        let (broker, tasks, topology) = rig();
        broker
            .publish(&topology.dead_letter_queue, b"????".to_vec())
            .unwrap();

        watch_one(&broker, &tasks, &topology);

        assert_eq!(broker.queue_depth(&topology.dead_letter_queue).unwrap(), 0);
    }

    #[test]
    fn spawned_watcher_runs_in_background() {
        let (broker, tasks, topology) = rig();
        let task = tasks
            .create(UserId::new(), FileRef::new("formula.png"), ModelId::new())
            .unwrap();

        let handle = DeadLetterWatcher::spawn(
            ConsumerConfig::named("dead-letter-watcher").with_tick(Duration::from_millis(10)),
            Arc::clone(&broker),
            Arc::clone(&tasks),
            topology.clone(),
        )
        .unwrap();

        let msg = DispatchMessage {
            task_id: task.id,
            user_id: task.user_id,
            image_data: "aGVsbG8=".to_string(),
            filename: "formula.png".to_string(),
            model_id: task.model_id,
            timestamp: Utc::now(),
        };
        broker
            .publish(&topology.dead_letter_queue, msg.to_bytes().unwrap())
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if tasks.get(task.id).unwrap().unwrap().status == TaskStatus::Error {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "watcher timed out");
            std::thread::sleep(Duration::from_millis(10));
        }

        handle.shutdown();
    }
}
