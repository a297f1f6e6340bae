//! Prepaid credit wallets and the append-only transaction ledger.
//!
//! Invariants enforced here:
//! - a wallet's balance always equals the running sum of its transactions'
//!   signed amounts;
//! - a spend never takes the balance negative;
//! - at most one spend transaction exists per task (idempotent settlement).

pub mod ledger;
pub mod wallet;

pub use ledger::{InMemoryWalletLedger, LedgerError, SpendOutcome, WalletLedger};
pub use wallet::{Transaction, TransactionKind, Wallet};
