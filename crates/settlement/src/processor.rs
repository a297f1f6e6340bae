//! The result processor loop.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use texflow_broker::{Broker, BrokerError, Delivery, QueueConsumer, ResultMessage, Topology};
use texflow_catalog::ModelCatalog;
use texflow_tasks::{Task, TaskStore, TaskStoreError};
use texflow_wallet::{LedgerError, WalletLedger};
use texflow_worker::WorkerHandle;

/// Configuration for a settlement-side consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    /// How long a blocking receive waits before re-checking for shutdown.
    pub tick: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "result-processor".to_string(),
            tick: Duration::from_millis(250),
        }
    }
}

impl ConsumerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Consumes the result queue and settles each task exactly once.
///
/// Several instances may run in parallel; the terminal-state guard and the
/// ledger's correlation-key idempotency keep concurrent settlement safe.
#[derive(Debug)]
pub struct ResultProcessor;

impl ResultProcessor {
    pub fn spawn<B, S, L, C>(
        config: ConsumerConfig,
        broker: B,
        tasks: S,
        ledger: L,
        catalog: C,
        topology: Topology,
    ) -> Result<WorkerHandle, BrokerError>
    where
        B: Broker + 'static,
        S: TaskStore + 'static,
        L: WalletLedger + 'static,
        C: ModelCatalog + 'static,
    {
        let consumer = broker.subscribe(&topology.result_queue)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                processor_loop(&config, consumer, &tasks, &ledger, &catalog, &shutdown_rx)
            })
            .expect("failed to spawn result processor thread");

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn processor_loop<S, L, C>(
    config: &ConsumerConfig,
    mut consumer: Box<dyn QueueConsumer>,
    tasks: &S,
    ledger: &L,
    catalog: &C,
    shutdown_rx: &mpsc::Receiver<()>,
) where
    S: TaskStore,
    L: WalletLedger,
    C: ModelCatalog,
{
    info!(processor = %config.name, "result processor started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match consumer.recv_timeout(config.tick) {
            Ok(Some(delivery)) => {
                if let Err(e) =
                    settle_delivery(config, consumer.as_mut(), tasks, ledger, catalog, delivery)
                {
                    warn!(processor = %config.name, error = %e, "delivery handling failed");
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(processor = %config.name, error = %e, "result queue receive failed");
                break;
            }
        }
    }

    info!(processor = %config.name, "result processor stopped");
}

pub(crate) fn settle_delivery<S, L, C>(
    config: &ConsumerConfig,
    consumer: &mut dyn QueueConsumer,
    tasks: &S,
    ledger: &L,
    catalog: &C,
    delivery: Delivery,
) -> Result<(), BrokerError>
where
    S: TaskStore,
    L: WalletLedger,
    C: ModelCatalog,
{
    let msg = match ResultMessage::from_bytes(&delivery.body) {
        Ok(m) => m,
        Err(e) => {
            warn!(processor = %config.name, error = %e, "malformed result payload");
            return consumer.reject(delivery.tag, false);
        }
    };
    if let Err(e) = msg.validate() {
        warn!(processor = %config.name, task_id = %msg.task_id, error = %e,
            "inconsistent result payload");
        return consumer.reject(delivery.tag, false);
    }

    let task = match tasks.get(msg.task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!(processor = %config.name, task_id = %msg.task_id,
                "result for unknown task, discarding");
            return consumer.ack(delivery.tag);
        }
        Err(e) => {
            warn!(processor = %config.name, task_id = %msg.task_id, error = %e,
                "task lookup failed, requeueing result");
            return consumer.reject(delivery.tag, true);
        }
    };

    // Primary idempotency guard: an already-settled task means this is a
    // duplicate delivery.
    if task.status.is_terminal() {
        debug!(processor = %config.name, task_id = %task.id, status = %task.status,
            "task already settled, discarding duplicate result");
        return consumer.ack(delivery.tag);
    }

    if msg.success {
        settle_success(config, consumer, tasks, ledger, catalog, &task, &msg, delivery.tag)
    } else {
        let reason = msg.error.as_deref().unwrap_or("unknown error");
        finish(config, consumer, delivery.tag, tasks.fail(task.id, reason).map(|_| ()))
    }
}

#[allow(clippy::too_many_arguments)]
fn settle_success<S, L, C>(
    config: &ConsumerConfig,
    consumer: &mut dyn QueueConsumer,
    tasks: &S,
    ledger: &L,
    catalog: &C,
    task: &Task,
    msg: &ResultMessage,
    tag: texflow_broker::DeliveryTag,
) -> Result<(), BrokerError>
where
    S: TaskStore,
    L: WalletLedger,
    C: ModelCatalog,
{
    let cost = match catalog.credit_cost(task.model_id) {
        Ok(cost) => cost,
        Err(e) => {
            // Deterministic: the model vanished from the catalog. No charge.
            warn!(processor = %config.name, task_id = %task.id, error = %e,
                "model missing at settlement");
            let outcome = tasks
                .fail(task.id, &format!("settlement failed: {e}"))
                .map(|_| ());
            return finish(config, consumer, tag, outcome);
        }
    };

    let wallet = match ledger.wallet_for_owner(task.user_id) {
        Ok(wallet) => wallet,
        Err(e) => {
            warn!(processor = %config.name, task_id = %task.id, error = %e,
                "wallet lookup failed, requeueing result");
            return consumer.reject(tag, true);
        }
    };

    match ledger.spend(wallet.id, cost, task.id) {
        Ok(outcome) => {
            let txn = outcome.transaction();
            debug!(processor = %config.name, task_id = %task.id, amount = %txn.amount,
                post_balance = %txn.post_balance, "charged");
            // validate() guarantees latex_code on success results.
            let latex = msg.latex_code.as_deref().unwrap_or_default();
            finish(config, consumer, tag, tasks.complete(task.id, latex, cost).map(|_| ()))
        }
        Err(LedgerError::InsufficientFunds { balance, required, .. }) => {
            // Defined terminal failure, never retried (credits are pre-checked
            // at submission; settlement is the backstop).
            info!(processor = %config.name, task_id = %task.id, %balance, %required,
                "insufficient credits at settlement");
            finish(
                config,
                consumer,
                tag,
                tasks.fail(task.id, "insufficient credits at settlement").map(|_| ()),
            )
        }
        Err(e @ LedgerError::Validation(_)) => {
            // A non-positive cost is a catalog data bug; deterministic.
            warn!(processor = %config.name, task_id = %task.id, error = %e,
                "spend rejected at settlement");
            finish(
                config,
                consumer,
                tag,
                tasks.fail(task.id, &format!("settlement failed: {e}")).map(|_| ()),
            )
        }
        Err(e) => {
            warn!(processor = %config.name, task_id = %task.id, error = %e,
                "ledger unavailable, requeueing result");
            consumer.reject(tag, true)
        }
    }
}

/// Ack after a durable task-store write; requeue on infrastructure errors.
///
/// A concurrent settler winning the terminal transition is not an error —
/// the charge was idempotent, so the duplicate is simply acknowledged.
fn finish(
    config: &ConsumerConfig,
    consumer: &mut dyn QueueConsumer,
    tag: texflow_broker::DeliveryTag,
    write: Result<(), TaskStoreError>,
) -> Result<(), BrokerError> {
    match write {
        Ok(()) => consumer.ack(tag),
        Err(TaskStoreError::InvalidTransition { task_id, from, to }) => {
            debug!(processor = %config.name, %task_id, %from, %to,
                "lost settlement race, discarding duplicate");
            consumer.ack(tag)
        }
        Err(TaskStoreError::NotFound(task_id)) => {
            warn!(processor = %config.name, %task_id, "task vanished during settlement");
            consumer.ack(tag)
        }
        Err(e @ TaskStoreError::Storage(_)) => {
            warn!(processor = %config.name, error = %e, "task write failed, requeueing result");
            consumer.reject(tag, true)
        }
    }
}
