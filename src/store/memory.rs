//! In-memory shadow ledger backend.
//!
//! Deterministic and dependency-free; used by tests and sandbox runs.
//! A single mutex over the whole state makes `debit_for_settlement`
//! trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ShadowLedger, StoreError};
use crate::types::{Currency, Transaction, TransactionStatus, VirtualAccount};

#[derive(Default)]
struct Inner {
    accounts: HashMap<(String, Currency), VirtualAccount>,
    transactions: HashMap<String, Transaction>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account and return the store (builder-style, for tests).
    pub fn with_account(self, account: VirtualAccount) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .accounts
                .insert((account.user_id.clone(), account.currency), account);
        }
        self
    }
}

#[async_trait]
impl ShadowLedger for MemoryStore {
    async fn get_account(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<Option<VirtualAccount>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.accounts.get(&(user_id.to_string(), currency)).cloned())
    }

    async fn upsert_account(&self, account: VirtualAccount) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .accounts
            .insert((account.user_id.clone(), account.currency), account);
        Ok(())
    }

    async fn debit_for_settlement(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.transactions.contains_key(&tx.id) {
            return Err(StoreError::Backend(format!("duplicate transaction id {}", tx.id)));
        }

        let needed = tx.total_source_debit();
        let key = (tx.sender_id.clone(), tx.source_currency);
        let account = inner
            .accounts
            .get_mut(&key)
            .ok_or_else(|| StoreError::AccountNotFound(tx.sender_id.clone()))?;

        if !account.can_cover(needed) {
            return Err(StoreError::InsufficientBalance {
                needed,
                available: account.available(),
            });
        }

        // Same lock scope: the debit and the row insert are one step.
        account.balance -= needed;
        inner.transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn mark_external_requested(
        &self,
        tx_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| StoreError::TransactionNotFound(tx_id.to_string()))?;
        if tx.status.is_terminal() {
            return Err(StoreError::AlreadyFinal { id: tx.id.clone(), from: tx.status });
        }
        tx.status = TransactionStatus::ExternalRequested;
        tx.external_request_id = Some(request_id.to_string());
        Ok(())
    }

    async fn finalize(
        &self,
        tx_id: &str,
        external_tx_ids: &[String],
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| StoreError::TransactionNotFound(tx_id.to_string()))?;
        match tx.status {
            TransactionStatus::Completed => Ok(()), // reconciliation may finalize twice
            TransactionStatus::Failed => {
                Err(StoreError::AlreadyFinal { id: tx.id.clone(), from: tx.status })
            }
            _ => {
                tx.status = TransactionStatus::Completed;
                tx.external_tx_ids = external_tx_ids.to_vec();
                tx.completed_at = Some(completed_at);
                Ok(())
            }
        }
    }

    async fn compensate(&self, tx_id: &str, reason: &str) -> Result<Transaction, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let (sender, currency, refund) = {
            let tx = inner
                .transactions
                .get(tx_id)
                .ok_or_else(|| StoreError::TransactionNotFound(tx_id.to_string()))?;
            if !tx.status.compensatable() {
                return Err(StoreError::AlreadyFinal { id: tx.id.clone(), from: tx.status });
            }
            (tx.sender_id.clone(), tx.source_currency, tx.total_source_debit())
        };

        let account = inner
            .accounts
            .get_mut(&(sender.clone(), currency))
            .ok_or_else(|| StoreError::AccountNotFound(sender))?;
        account.balance += refund;

        let tx = inner.transactions.get_mut(tx_id).unwrap();
        tx.status = TransactionStatus::Failed;
        tx.failure_reason = Some(reason.to_string());
        Ok(tx.clone())
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transactions.get(tx_id).cloned())
    }

    async fn stuck_in_flight(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut stuck: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| !tx.status.is_terminal() && tx.created_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|tx| tx.created_at);
        Ok(stuck)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
