//! Task admission.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tracing::{info, warn};

use texflow_broker::{Broker, BrokerError, DispatchMessage, Topology};
use texflow_catalog::ModelCatalog;
use texflow_core::{DomainError, ModelId, UserId};
use texflow_tasks::{FileRef, Task, TaskStore, TaskStoreError};
use texflow_wallet::{LedgerError, WalletLedger};

/// Submission error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Validation or funds rejection; surfaced synchronously to the caller.
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("task store error: {0}")]
    Store(#[from] TaskStoreError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("dispatch encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Accepts user submissions: validates, records the pending task, and
/// publishes the dispatch message.
///
/// Credits are only pre-checked here, not reserved; the actual charge happens
/// at settlement, on success.
pub struct SubmissionService<B, S, L, C> {
    broker: B,
    tasks: S,
    ledger: L,
    catalog: C,
    topology: Topology,
}

impl<B, S, L, C> SubmissionService<B, S, L, C>
where
    B: Broker,
    S: TaskStore,
    L: WalletLedger,
    C: ModelCatalog,
{
    pub fn new(broker: B, tasks: S, ledger: L, catalog: C, topology: Topology) -> Self {
        Self {
            broker,
            tasks,
            ledger,
            catalog,
            topology,
        }
    }

    /// Admit one recognition request.
    ///
    /// `image_data` is the base64-encoded image payload. Returns the created
    /// task (status `pending`) once its dispatch message is on the queue.
    pub fn submit(
        &self,
        user_id: UserId,
        image_data: &str,
        filename: &str,
        model_id: ModelId,
    ) -> Result<Task, SubmitError> {
        let model = self
            .catalog
            .get(model_id)
            .ok_or_else(|| DomainError::validation(format!("model not found: {model_id}")))?;
        if !model.active {
            return Err(DomainError::validation(format!("model is not active: {}", model.name)).into());
        }

        // Structural check only; full image validation happens on the worker.
        BASE64
            .decode(image_data)
            .map_err(|e| DomainError::validation(format!("invalid base64 image data: {e}")))?;

        let wallet = self.ledger.wallet_for_owner(user_id)?;
        if wallet.balance < model.credit_cost {
            return Err(
                DomainError::insufficient_funds(wallet.balance, model.credit_cost).into(),
            );
        }

        let task = self
            .tasks
            .create(user_id, FileRef::new(filename), model_id)?;

        let dispatch = DispatchMessage {
            task_id: task.id,
            user_id,
            image_data: image_data.to_string(),
            filename: filename.to_string(),
            model_id,
            timestamp: Utc::now(),
        };
        let body = dispatch.to_bytes()?;

        if let Err(e) = self.broker.publish(&self.topology.task_queue, body) {
            // The record exists but can never be dispatched; fail it now
            // rather than leave it pending forever.
            warn!(task_id = %task.id, error = %e, "dispatch publish failed, failing task");
            let _ = self.tasks.fail(task.id, "dispatch publish failed");
            return Err(e.into());
        }

        info!(task_id = %task.id, user_id = %user_id, model = %model.name, "task submitted");
        Ok(task)
    }
}
