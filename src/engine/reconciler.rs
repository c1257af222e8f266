//! Reconciliation of transactions with an unknown external outcome.
//!
//! A transaction parked in `EXTERNAL_REQUESTED` was debited locally
//! but its remote payout never confirmed or failed in-band. The
//! reconciler polls the remote transfer-request: confirmed requests
//! finalize (the local debit already happened, so no second debit),
//! rejected or never-accepted requests compensate, and still-pending
//! requests stay parked until the next sweep.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::ledger::{ExternalLedger, LedgerError, RequestStatus};
use crate::store::ShadowLedger;
use crate::types::{RemitError, Transaction, TransactionStatus};

pub struct Reconciler {
    store: Arc<dyn ShadowLedger>,
    ledger: Arc<dyn ExternalLedger>,
    stuck_after: Duration,
}

/// Outcome counts of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ShadowLedger>,
        ledger: Arc<dyn ExternalLedger>,
        stuck_after: Duration,
    ) -> Self {
        Self { store, ledger, stuck_after }
    }

    /// Reconcile one transaction by id.
    pub async fn reconcile_by_id(&self, tx_id: &str) -> Result<TransactionStatus, RemitError> {
        let tx = self
            .store
            .get_transaction(tx_id)
            .await?
            .ok_or_else(|| RemitError::Storage(format!("transaction not found: {tx_id}")))?;
        self.reconcile(&tx).await
    }

    /// Resolve one parked transaction against the remote ledger.
    /// Returns the resulting terminal status, or
    /// `RemitError::ReconciliationRequired` when the remote request is
    /// still unresolved and needs another pass.
    pub async fn reconcile(&self, tx: &Transaction) -> Result<TransactionStatus, RemitError> {
        if tx.status.is_terminal() {
            return Ok(tx.status);
        }

        let request_id = match tx.external_request_id.as_deref() {
            Some(id) => id,
            None => {
                // PROCESSING row with no request issued: nothing moved
                // remotely, so compensating is safe.
                warn!(tx_id = %tx.id, "no transfer-request on record; compensating");
                self.store.compensate(&tx.id, "EXTERNAL_REQUEST_FAILED").await?;
                return Ok(TransactionStatus::Failed);
            }
        };

        match self.ledger.get_transfer_request(request_id).await {
            Ok(state) => match state.status {
                RequestStatus::Confirmed => {
                    self.store.finalize(&tx.id, &state.external_tx_ids, Utc::now()).await?;
                    info!(tx_id = %tx.id, request_id, "reconciled to COMPLETED");
                    Ok(TransactionStatus::Completed)
                }
                RequestStatus::Rejected => {
                    self.store.compensate(&tx.id, "EXTERNAL_CHALLENGE_REJECTED").await?;
                    info!(tx_id = %tx.id, request_id, "reconciled to FAILED");
                    Ok(TransactionStatus::Failed)
                }
                RequestStatus::Requested => {
                    // Genuinely still in flight remotely. Needs eyes if
                    // it persists across sweeps.
                    warn!(tx_id = %tx.id, request_id, "transfer-request still unresolved");
                    Err(RemitError::ReconciliationRequired(tx.id.clone()))
                }
            },
            Err(LedgerError::NotFound(_)) => {
                // The ledger never accepted the request, so no payout
                // can exist for it.
                self.store.compensate(&tx.id, "EXTERNAL_REQUEST_FAILED").await?;
                info!(tx_id = %tx.id, request_id, "request unknown remotely; compensated");
                Ok(TransactionStatus::Failed)
            }
            Err(e) => {
                warn!(tx_id = %tx.id, request_id, error = %e, "reconciliation read failed");
                Err(RemitError::Ledger(e.to_string()))
            }
        }
    }

    /// One pass over all in-flight transactions older than the stuck
    /// threshold, oldest first — EXTERNAL_REQUESTED rows and PROCESSING
    /// rows stranded by a crash between debit and request alike.
    /// Per-transaction failures are counted and skipped so one bad row
    /// cannot stall the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, RemitError> {
        let cutoff = Utc::now() - self.stuck_after;
        let stuck = self.store.stuck_in_flight(cutoff).await?;
        if stuck.is_empty() {
            return Ok(SweepReport::default());
        }
        info!(count = stuck.len(), "reconciliation sweep starting");

        let mut report = SweepReport::default();
        for tx in &stuck {
            match self.reconcile(tx).await {
                Ok(TransactionStatus::Completed) => report.completed += 1,
                Ok(TransactionStatus::Failed) => report.failed += 1,
                Ok(_) => report.still_pending += 1,
                Err(RemitError::ReconciliationRequired(_)) => report.still_pending += 1,
                Err(e) => {
                    error!(tx_id = %tx.id, error = %e, "reconciliation failed for transaction");
                    report.errors += 1;
                }
            }
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            still_pending = report.still_pending,
            errors = report.errors,
            "reconciliation sweep finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MockExternalLedger, RequestState};
    use crate::store::memory::MemoryStore;
    use crate::types::{Currency, VirtualAccount};
    use rust_decimal_macros::dec;

    fn parked_tx(id: &str, request_id: Option<&str>, age_minutes: i64) -> Transaction {
        Transaction {
            id: id.to_string(),
            sender_id: "alice".to_string(),
            source_amount: dec!(100),
            source_currency: Currency::Eur,
            target_amount: dec!(2561.00),
            target_currency: Currency::Czk,
            exchange_rate: dec!(25.61),
            platform_fee: dec!(0.99),
            exchange_margin: dec!(39.00),
            status: TransactionStatus::Processing,
            failure_reason: None,
            external_request_id: request_id.map(str::to_string),
            external_tx_ids: Vec::new(),
            created_at: Utc::now() - Duration::minutes(age_minutes),
            completed_at: None,
        }
    }

    async fn park(store: &MemoryStore, tx: &Transaction) {
        store.debit_for_settlement(tx).await.unwrap();
        if let Some(req) = tx.external_request_id.as_deref() {
            store.mark_external_requested(&tx.id, req).await.unwrap();
        }
    }

    fn reconciler(store: Arc<MemoryStore>, ledger: MockExternalLedger) -> Reconciler {
        Reconciler::new(store, Arc::new(ledger), Duration::minutes(5))
    }

    fn funded_store() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_account(VirtualAccount::new("alice", Currency::Eur, dec!(1000))),
        )
    }

    #[tokio::test]
    async fn test_confirmed_request_finalizes_without_second_debit() {
        let store = funded_store();
        let tx = parked_tx("t1", Some("req-1"), 20);
        park(&store, &tx).await;

        let mut ledger = MockExternalLedger::new();
        ledger.expect_get_transfer_request().returning(|_| {
            Ok(RequestState {
                status: RequestStatus::Confirmed,
                external_tx_ids: vec!["ext-1".to_string()],
            })
        });

        let status = reconciler(store.clone(), ledger).reconcile_by_id("t1").await.unwrap();
        assert_eq!(status, TransactionStatus::Completed);

        // Exactly one debit of 100.99, from the original settlement.
        let acct = store.get_account("alice", Currency::Eur).await.unwrap().unwrap();
        assert_eq!(acct.balance, dec!(899.01));
        let row = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(row.external_tx_ids, vec!["ext-1"]);
    }

    #[tokio::test]
    async fn test_rejected_request_compensates() {
        let store = funded_store();
        let tx = parked_tx("t1", Some("req-1"), 20);
        park(&store, &tx).await;

        let mut ledger = MockExternalLedger::new();
        ledger.expect_get_transfer_request().returning(|_| {
            Ok(RequestState { status: RequestStatus::Rejected, external_tx_ids: Vec::new() })
        });

        let status = reconciler(store.clone(), ledger).reconcile_by_id("t1").await.unwrap();
        assert_eq!(status, TransactionStatus::Failed);

        let acct = store.get_account("alice", Currency::Eur).await.unwrap().unwrap();
        assert_eq!(acct.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_unknown_request_compensates() {
        let store = funded_store();
        let tx = parked_tx("t1", Some("req-gone"), 20);
        park(&store, &tx).await;

        let mut ledger = MockExternalLedger::new();
        ledger
            .expect_get_transfer_request()
            .returning(|id| Err(LedgerError::NotFound(id.to_string())));

        let status = reconciler(store.clone(), ledger).reconcile_by_id("t1").await.unwrap();
        assert_eq!(status, TransactionStatus::Failed);
        let acct = store.get_account("alice", Currency::Eur).await.unwrap().unwrap();
        assert_eq!(acct.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_still_requested_raises_alert_and_stays_parked() {
        let store = funded_store();
        let tx = parked_tx("t1", Some("req-1"), 20);
        park(&store, &tx).await;

        let mut ledger = MockExternalLedger::new();
        ledger.expect_get_transfer_request().returning(|_| {
            Ok(RequestState { status: RequestStatus::Requested, external_tx_ids: Vec::new() })
        });

        let err = reconciler(store.clone(), ledger).reconcile_by_id("t1").await.unwrap_err();
        assert_eq!(err.code(), "RECONCILIATION_REQUIRED");
        let row = store.get_transaction("t1").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::ExternalRequested);
    }

    #[tokio::test]
    async fn test_sweep_compensates_stranded_processing_row() {
        // Debited, then the process died before a transfer-request was
        // ever issued: the sweep must refund, not strand the funds.
        let store = funded_store();
        park(&store, &parked_tx("t-stranded", None, 60)).await;

        // No ledger expectation: there is no request id to poll.
        let report = reconciler(store.clone(), MockExternalLedger::new()).sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.errors, 0);

        let acct = store.get_account("alice", Currency::Eur).await.unwrap().unwrap();
        assert_eq!(acct.balance, dec!(1000));
        let row = store.get_transaction("t-stranded").await.unwrap().unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("EXTERNAL_REQUEST_FAILED"));
    }

    #[tokio::test]
    async fn test_terminal_rows_untouched() {
        let store = funded_store();
        let tx = parked_tx("t1", Some("req-1"), 20);
        park(&store, &tx).await;
        store.finalize("t1", &["ext-1".to_string()], Utc::now()).await.unwrap();

        // No ledger expectation: a remote call would panic.
        let status = reconciler(store.clone(), MockExternalLedger::new())
            .reconcile_by_id("t1")
            .await
            .unwrap();
        assert_eq!(status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_resolves_only_stale_rows() {
        let store = funded_store();
        park(&store, &parked_tx("t-stale", Some("req-stale"), 30)).await;
        park(&store, &parked_tx("t-fresh", Some("req-fresh"), 1)).await;

        let mut ledger = MockExternalLedger::new();
        ledger.expect_get_transfer_request().returning(|id| {
            assert_eq!(id, "req-stale"); // fresh row must not be polled
            Ok(RequestState {
                status: RequestStatus::Confirmed,
                external_tx_ids: vec!["ext-1".to_string()],
            })
        });

        let report = reconciler(store.clone(), ledger).sweep().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.errors, 0);

        let stale = store.get_transaction("t-stale").await.unwrap().unwrap();
        assert_eq!(stale.status, TransactionStatus::Completed);
        let fresh = store.get_transaction("t-fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, TransactionStatus::ExternalRequested);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_errors() {
        let store = funded_store();
        park(&store, &parked_tx("t-err", Some("req-err"), 40)).await;
        park(&store, &parked_tx("t-ok", Some("req-ok"), 30)).await;

        let mut ledger = MockExternalLedger::new();
        ledger.expect_get_transfer_request().returning(|id| {
            if id == "req-err" {
                Err(LedgerError::Unavailable("503".to_string()))
            } else {
                Ok(RequestState {
                    status: RequestStatus::Confirmed,
                    external_tx_ids: vec!["ext-ok".to_string()],
                })
            }
        });

        let report = reconciler(store.clone(), ledger).sweep().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.completed, 1);

        let ok = store.get_transaction("t-ok").await.unwrap().unwrap();
        assert_eq!(ok.status, TransactionStatus::Completed);
        let err = store.get_transaction("t-err").await.unwrap().unwrap();
        assert_eq!(err.status, TransactionStatus::ExternalRequested);
    }
}
