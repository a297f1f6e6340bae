//! Wallet and transaction records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use texflow_core::{Credits, Entity, TaskId, TransactionId, UserId, WalletId};

/// Direction of a ledger transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    TopUp,
    Spend,
}

/// One immutable ledger entry.
///
/// `amount` is always positive; the kind carries the sign. `post_balance`
/// snapshots the wallet balance immediately after this transaction applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub amount: Credits,
    pub post_balance: Credits,
    /// Correlation key for spends: the task this charge settles.
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed contribution of this transaction to the balance, in minor units.
    pub fn signed_minor(&self) -> i64 {
        match self.kind {
            TransactionKind::TopUp => self.amount.minor(),
            TransactionKind::Spend => -self.amount.minor(),
        }
    }
}

impl Entity for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A user's prepaid credit wallet. Owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: UserId,
    pub balance: Credits,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner_id: UserId, opening_balance: Credits) -> Self {
        Self {
            id: WalletId::new(),
            owner_id,
            balance: opening_balance,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Wallet {
    type Id = WalletId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
