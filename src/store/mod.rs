//! Shadow ledger persistence.
//!
//! Holds per-user per-currency balances and the durable transaction
//! audit log. Two backends implement the same port: an in-memory
//! store for tests and sandbox runs, and a SQLite store for the
//! daemon. The port's key guarantee is atomicity of
//! `debit_for_settlement`: the transaction row and the sender debit
//! happen together or not at all.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{Currency, RemitError, Transaction, TransactionStatus, VirtualAccount};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// The requested transition is illegal from the row's current
    /// status (already terminal, or compensation re-attempted).
    #[error("Transaction {id} is already {from}")]
    AlreadyFinal { id: String, from: TransactionStatus },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for RemitError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientBalance { needed, available } => {
                RemitError::InsufficientBalance { needed, available }
            }
            other => RemitError::Storage(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Storage port for shadow balances and the transaction audit log.
#[async_trait]
pub trait ShadowLedger: Send + Sync {
    async fn get_account(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<Option<VirtualAccount>, StoreError>;

    /// Create or replace an account row (bootstrap / sandbox seeding).
    async fn upsert_account(&self, account: VirtualAccount) -> Result<(), StoreError>;

    /// The atomic local leg: insert the PROCESSING transaction row and
    /// debit the sender by `tx.total_source_debit()`, conditioned on
    /// `available >= total_source_debit`. Both happen or neither does.
    async fn debit_for_settlement(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Persist a FAILED transaction for audit without touching any
    /// balance (pre-debit failures, e.g. insufficient liquidity).
    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Record the issued remote request id and move the row to
    /// EXTERNAL_REQUESTED.
    async fn mark_external_requested(
        &self,
        tx_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError>;

    /// Terminal success: store external transaction ids and
    /// `completed_at`. Idempotent for rows already COMPLETED (a
    /// reconciled transaction must never debit twice); illegal from
    /// FAILED.
    async fn finalize(
        &self,
        tx_id: &str,
        external_tx_ids: &[String],
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Terminal failure with money back: atomically credit
    /// `total_source_debit` to the sender and mark the row FAILED with
    /// `reason`. Guarded to run at most once — legal only from
    /// PROCESSING or EXTERNAL_REQUESTED.
    async fn compensate(&self, tx_id: &str, reason: &str) -> Result<Transaction, StoreError>;

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StoreError>;

    /// Non-terminal rows (PROCESSING or EXTERNAL_REQUESTED) created
    /// before `cutoff`, oldest first. Feeds the reconciliation sweep:
    /// a PROCESSING row past the cutoff means the process died between
    /// the local debit and the external request.
    async fn stuck_in_flight(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError>;
}
