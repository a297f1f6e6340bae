//! Wallet ledger: balance accounting with idempotent spend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use texflow_core::{Credits, TaskId, TransactionId, UserId, WalletId};

use crate::wallet::{Transaction, TransactionKind, Wallet};

/// Ledger error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("wallet not found: {0}")]
    NotFound(WalletId),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient funds in wallet {wallet_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        wallet_id: WalletId,
        balance: Credits,
        required: Credits,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of a spend call.
///
/// Settlement treats both variants as success; `AlreadyCharged` surfaces a
/// replayed delivery to callers that want to observe it (tests, metrics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendOutcome {
    Charged(Transaction),
    AlreadyCharged(Transaction),
}

impl SpendOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SpendOutcome::Charged(t) | SpendOutcome::AlreadyCharged(t) => t,
        }
    }
}

/// Credit accounting.
///
/// Implementations must execute each mutation — including the spend's
/// correlation-key lookup — as one isolated operation per wallet, so two
/// concurrent spends can never both read a stale balance.
pub trait WalletLedger: Send + Sync {
    /// Create a wallet for an owner. One wallet per owner.
    fn create_wallet(&self, owner_id: UserId, opening_balance: Credits)
        -> Result<Wallet, LedgerError>;

    /// The owner's wallet, created with a zero balance on first use.
    fn wallet_for_owner(&self, owner_id: UserId) -> Result<Wallet, LedgerError>;

    /// Get a wallet by id.
    fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, LedgerError>;

    /// Current balance.
    fn balance(&self, wallet_id: WalletId) -> Result<Credits, LedgerError> {
        self.get(wallet_id)?
            .map(|w| w.balance)
            .ok_or(LedgerError::NotFound(wallet_id))
    }

    /// Credit the wallet. `amount` must be positive.
    fn top_up(&self, wallet_id: WalletId, amount: Credits) -> Result<Transaction, LedgerError>;

    /// Debit the wallet for one task, idempotently.
    ///
    /// A spend already recorded for `task_id` is returned as
    /// [`SpendOutcome::AlreadyCharged`] without touching the balance.
    fn spend(
        &self,
        wallet_id: WalletId,
        amount: Credits,
        task_id: TaskId,
    ) -> Result<SpendOutcome, LedgerError>;

    /// Most recent transactions first, up to `limit`.
    fn transactions(&self, wallet_id: WalletId, limit: usize)
        -> Result<Vec<Transaction>, LedgerError>;
}

impl<L> WalletLedger for Arc<L>
where
    L: WalletLedger + ?Sized,
{
    fn create_wallet(
        &self,
        owner_id: UserId,
        opening_balance: Credits,
    ) -> Result<Wallet, LedgerError> {
        (**self).create_wallet(owner_id, opening_balance)
    }

    fn wallet_for_owner(&self, owner_id: UserId) -> Result<Wallet, LedgerError> {
        (**self).wallet_for_owner(owner_id)
    }

    fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        (**self).get(wallet_id)
    }

    fn top_up(&self, wallet_id: WalletId, amount: Credits) -> Result<Transaction, LedgerError> {
        (**self).top_up(wallet_id, amount)
    }

    fn spend(
        &self,
        wallet_id: WalletId,
        amount: Credits,
        task_id: TaskId,
    ) -> Result<SpendOutcome, LedgerError> {
        (**self).spend(wallet_id, amount, task_id)
    }

    fn transactions(
        &self,
        wallet_id: WalletId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        (**self).transactions(wallet_id, limit)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    wallets: HashMap<WalletId, Wallet>,
    owners: HashMap<UserId, WalletId>,
    transactions: HashMap<WalletId, Vec<Transaction>>,
    /// System-wide correlation index: task -> its one spend transaction.
    spends_by_task: HashMap<TaskId, (WalletId, TransactionId)>,
}

/// In-memory ledger for tests/dev.
///
/// One lock covers wallets, transactions and the correlation index, so the
/// existing-spend check and the balance mutation are a single critical
/// section.
#[derive(Debug, Default)]
pub struct InMemoryWalletLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn insert_wallet(state: &mut LedgerState, owner_id: UserId, opening_balance: Credits) -> Wallet {
    let wallet = Wallet::new(owner_id, opening_balance);
    state.owners.insert(owner_id, wallet.id);
    state.transactions.insert(wallet.id, Vec::new());
    state.wallets.insert(wallet.id, wallet.clone());
    wallet
}

impl WalletLedger for InMemoryWalletLedger {
    fn create_wallet(
        &self,
        owner_id: UserId,
        opening_balance: Credits,
    ) -> Result<Wallet, LedgerError> {
        if opening_balance.is_negative() {
            return Err(LedgerError::Validation(
                "opening balance must not be negative".to_string(),
            ));
        }

        let mut state = self.state.write().unwrap();
        if state.owners.contains_key(&owner_id) {
            return Err(LedgerError::Validation(format!(
                "owner {owner_id} already has a wallet"
            )));
        }

        Ok(insert_wallet(&mut state, owner_id, opening_balance))
    }

    fn wallet_for_owner(&self, owner_id: UserId) -> Result<Wallet, LedgerError> {
        // Find-or-create under one write lock so two concurrent callers
        // cannot race each other into a duplicate wallet.
        let mut state = self.state.write().unwrap();
        if let Some(wallet_id) = state.owners.get(&owner_id) {
            return Ok(state.wallets[wallet_id].clone());
        }
        Ok(insert_wallet(&mut state, owner_id, Credits::ZERO))
    }

    fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.state.read().unwrap().wallets.get(&wallet_id).cloned())
    }

    fn top_up(&self, wallet_id: WalletId, amount: Credits) -> Result<Transaction, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(
                "top-up amount must be positive".to_string(),
            ));
        }

        let mut state = self.state.write().unwrap();
        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(LedgerError::NotFound(wallet_id))?;

        let post_balance = wallet
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Storage("balance overflow".to_string()))?;
        wallet.balance = post_balance;

        let txn = Transaction {
            id: TransactionId::new(),
            wallet_id,
            kind: TransactionKind::TopUp,
            amount,
            post_balance,
            task_id: None,
            created_at: Utc::now(),
        };
        state
            .transactions
            .get_mut(&wallet_id)
            .expect("transaction log exists for every wallet")
            .push(txn.clone());
        Ok(txn)
    }

    fn spend(
        &self,
        wallet_id: WalletId,
        amount: Credits,
        task_id: TaskId,
    ) -> Result<SpendOutcome, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(
                "spend amount must be positive".to_string(),
            ));
        }

        let mut state = self.state.write().unwrap();

        // Correlation-key replay check, inside the same critical section as
        // the balance mutation.
        if let Some((spent_wallet, txn_id)) = state.spends_by_task.get(&task_id).copied() {
            let existing = state.transactions[&spent_wallet]
                .iter()
                .find(|t| t.id == txn_id)
                .cloned()
                .expect("indexed spend transaction exists");
            return Ok(SpendOutcome::AlreadyCharged(existing));
        }

        let wallet = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(LedgerError::NotFound(wallet_id))?;

        if amount > wallet.balance {
            return Err(LedgerError::InsufficientFunds {
                wallet_id,
                balance: wallet.balance,
                required: amount,
            });
        }

        let post_balance = wallet
            .balance
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::Storage("balance underflow".to_string()))?;
        wallet.balance = post_balance;

        let txn = Transaction {
            id: TransactionId::new(),
            wallet_id,
            kind: TransactionKind::Spend,
            amount,
            post_balance,
            task_id: Some(task_id),
            created_at: Utc::now(),
        };
        state.spends_by_task.insert(task_id, (wallet_id, txn.id));
        state
            .transactions
            .get_mut(&wallet_id)
            .expect("transaction log exists for every wallet")
            .push(txn.clone());
        Ok(SpendOutcome::Charged(txn))
    }

    fn transactions(
        &self,
        wallet_id: WalletId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.state.read().unwrap();
        let log = state
            .transactions
            .get(&wallet_id)
            .ok_or(LedgerError::NotFound(wallet_id))?;
        Ok(log.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn funded_wallet(ledger: &InMemoryWalletLedger, minor: i64) -> Wallet {
        let wallet = ledger
            .create_wallet(UserId::new(), Credits::ZERO)
            .unwrap();
        ledger.top_up(wallet.id, Credits::from_minor(minor)).unwrap();
        ledger.get(wallet.id).unwrap().unwrap()
    }

    #[test]
    fn top_up_records_transaction_and_post_balance() {
        let ledger = InMemoryWalletLedger::new();
        let wallet = ledger.create_wallet(UserId::new(), Credits::ZERO).unwrap();

        let txn = ledger.top_up(wallet.id, Credits::from_whole(10)).unwrap();
        assert_eq!(txn.kind, TransactionKind::TopUp);
        assert_eq!(txn.amount, Credits::from_whole(10));
        assert_eq!(txn.post_balance, Credits::from_whole(10));
        assert!(txn.task_id.is_none());

        assert_eq!(ledger.balance(wallet.id).unwrap(), Credits::from_whole(10));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let ledger = InMemoryWalletLedger::new();
        let wallet = ledger.create_wallet(UserId::new(), Credits::ZERO).unwrap();

        assert!(matches!(
            ledger.top_up(wallet.id, Credits::ZERO),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.spend(wallet.id, Credits::from_minor(-100), TaskId::new()),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn spend_debits_once_and_replays_idempotently() {
        let ledger = InMemoryWalletLedger::new();
        let wallet = funded_wallet(&ledger, 1000);
        let task = TaskId::new();

        let first = ledger
            .spend(wallet.id, Credits::from_minor(250), task)
            .unwrap();
        let SpendOutcome::Charged(txn) = &first else {
            panic!("first spend must charge");
        };
        assert_eq!(txn.post_balance, Credits::from_minor(750));
        assert_eq!(txn.task_id, Some(task));

        // Replay: same transaction back, no balance movement.
        let replay = ledger
            .spend(wallet.id, Credits::from_minor(250), task)
            .unwrap();
        assert!(matches!(replay, SpendOutcome::AlreadyCharged(_)));
        assert_eq!(replay.transaction().id, txn.id);
        assert_eq!(ledger.balance(wallet.id).unwrap(), Credits::from_minor(750));

        let spends: Vec<_> = ledger
            .transactions(wallet.id, 100)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Spend)
            .collect();
        assert_eq!(spends.len(), 1);
    }

    #[test]
    fn overdraft_is_rejected_without_a_transaction() {
        let ledger = InMemoryWalletLedger::new();
        let wallet = funded_wallet(&ledger, 100);

        let err = ledger
            .spend(wallet.id, Credits::from_minor(250), TaskId::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        assert_eq!(ledger.balance(wallet.id).unwrap(), Credits::from_minor(100));
        let txns = ledger.transactions(wallet.id, 100).unwrap();
        assert_eq!(txns.len(), 1); // only the top-up
    }

    #[test]
    fn one_wallet_per_owner_created_on_first_use() {
        let ledger = InMemoryWalletLedger::new();
        let owner = UserId::new();

        let first = ledger.wallet_for_owner(owner).unwrap();
        let second = ledger.wallet_for_owner(owner).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.balance, Credits::ZERO);

        assert!(matches!(
            ledger.create_wallet(owner, Credits::ZERO),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn transactions_are_most_recent_first_and_limited() {
        let ledger = InMemoryWalletLedger::new();
        let wallet = ledger.create_wallet(UserId::new(), Credits::ZERO).unwrap();

        for i in 1..=5 {
            ledger.top_up(wallet.id, Credits::from_minor(i)).unwrap();
        }

        let recent = ledger.transactions(wallet.id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].amount, Credits::from_minor(5));
        assert_eq!(recent[1].amount, Credits::from_minor(4));
    }

    #[test]
    fn concurrent_spends_cannot_double_charge_one_task() {
        use std::sync::Arc;

        let ledger = InMemoryWalletLedger::arc();
        let wallet = ledger.create_wallet(UserId::new(), Credits::ZERO).unwrap();
        ledger.top_up(wallet.id, Credits::from_whole(10)).unwrap();
        let task = TaskId::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let wallet_id = wallet.id;
            handles.push(std::thread::spawn(move || {
                ledger.spend(wallet_id, Credits::from_minor(250), task)
            }));
        }

        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let charged = outcomes
            .iter()
            .filter(|o| matches!(o, SpendOutcome::Charged(_)))
            .count();
        assert_eq!(charged, 1);
        assert_eq!(ledger.balance(wallet.id).unwrap(), Credits::from_minor(750));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any interleaving of top-ups and spends, the balance
        /// equals the signed sum of recorded transactions and never goes
        /// negative.
        #[test]
        fn balance_is_signed_sum_and_never_negative(
            ops in prop::collection::vec((any::<bool>(), 1i64..10_000i64), 1..40)
        ) {
            let ledger = InMemoryWalletLedger::new();
            let wallet = ledger.create_wallet(UserId::new(), Credits::ZERO).unwrap();

            for (is_top_up, minor) in ops {
                let amount = Credits::from_minor(minor);
                if is_top_up {
                    ledger.top_up(wallet.id, amount).unwrap();
                } else {
                    // Overdrafts are rejected and leave no trace.
                    let _ = ledger.spend(wallet.id, amount, TaskId::new());
                }

                let balance = ledger.balance(wallet.id).unwrap();
                prop_assert!(!balance.is_negative());

                let signed_sum: i64 = ledger
                    .transactions(wallet.id, usize::MAX)
                    .unwrap()
                    .iter()
                    .map(Transaction::signed_minor)
                    .sum();
                prop_assert_eq!(balance.minor(), signed_sum);
            }
        }
    }
}
