//! The remittance settlement state machine.
//!
//! One call to [`SettlementEngine::execute_remittance`] drives a
//! transaction through validate → price → liquidity → local debit →
//! external request → challenge. Pricing happens exactly once and the
//! quote is frozen into the transaction row; everything after the
//! debit either finishes, compensates, or parks the row in
//! `EXTERNAL_REQUESTED` for the reconciler. A failed settlement never
//! leaves the sender short: compensation credits back the exact debit.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{LimitsConfig, PricingConfig};
use crate::ledger::{ChallengeStatus, Destination, ExternalLedger, LedgerError};
use crate::liquidity::LiquidityManager;
use crate::pricing::Quote;
use crate::rates::RateProvider;
use crate::store::ShadowLedger;
use crate::types::{
    Currency, RemitError, RemittanceReceipt, SettlementStatus, Transaction, TransactionStatus,
};

pub struct SettlementEngine {
    store: Arc<dyn ShadowLedger>,
    ledger: Arc<dyn ExternalLedger>,
    rates: Arc<dyn RateProvider>,
    liquidity: LiquidityManager,
    limits: LimitsConfig,
    pricing: PricingConfig,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn ShadowLedger>,
        ledger: Arc<dyn ExternalLedger>,
        rates: Arc<dyn RateProvider>,
        liquidity: LiquidityManager,
        limits: LimitsConfig,
        pricing: PricingConfig,
    ) -> Self {
        Self { store, ledger, rates, liquidity, limits, pricing }
    }

    /// Settle one remittance: debit `source_amount` (plus fee) from the
    /// sender's shadow balance and pay out the converted amount to
    /// `recipient_ref` from the counterpart currency's pool. The source
    /// currency is the sender's funding account; with exactly two pools
    /// the target follows from it.
    pub async fn execute_remittance(
        &self,
        sender_id: &str,
        recipient_ref: &str,
        source_amount: Decimal,
        description: &str,
    ) -> Result<RemittanceReceipt, RemitError> {
        // -- validate ------------------------------------------------------
        if source_amount < self.limits.min_amount || source_amount > self.limits.max_amount {
            return Err(RemitError::ValidationFailed(format!(
                "amount {source_amount} outside limits [{}, {}]",
                self.limits.min_amount, self.limits.max_amount
            )));
        }
        let source = self.funding_currency(sender_id).await?;
        let target = source.counterpart();
        let destination = Destination::parse(recipient_ref)
            .map_err(|e| RemitError::ValidationFailed(e.to_string()))?;

        // -- price once ----------------------------------------------------
        let interbank_rate = self.rates.get_rate(source, target).await?;
        let quote = Quote::compute(source_amount, interbank_rate, source, target, &self.pricing);
        info!(
            sender = sender_id,
            %source_amount,
            %source,
            %target,
            customer_rate = %quote.customer_rate,
            target_amount = %quote.target_amount,
            fee = %quote.platform_fee,
            "priced remittance"
        );

        // -- pooled liquidity, before any money moves -----------------------
        if let Err(err) = self
            .liquidity
            .check_settlement(source, source_amount, target, quote.target_amount)
            .await
        {
            if matches!(err, RemitError::InsufficientLiquidity { .. }) {
                // Audit row only; the sender was never debited.
                let mut tx = self.new_transaction(sender_id, source_amount, source, target, &quote);
                tx.status = TransactionStatus::Failed;
                tx.failure_reason = Some(err.code().to_string());
                self.store.record_failed(&tx).await?;
                warn!(tx_id = %tx.id, error = %err, "settlement refused: pool liquidity");
            }
            return Err(err);
        }

        // -- atomic local debit ---------------------------------------------
        let tx = self.new_transaction(sender_id, source_amount, source, target, &quote);
        self.store.debit_for_settlement(&tx).await?;

        // -- external payout request ----------------------------------------
        let pool = self.liquidity.pool(target)?;
        let intent = match self
            .ledger
            .create_transfer_request(pool, &destination, quote.target_amount, target, description)
            .await
        {
            Ok(intent) => intent,
            Err(e) => {
                // Creating a request moves no money, so compensation
                // is safe even when the failure was a timeout.
                warn!(tx_id = %tx.id, error = %e, "transfer-request failed; compensating");
                self.store.compensate(&tx.id, "EXTERNAL_REQUEST_FAILED").await?;
                return Err(RemitError::ExternalRequestFailed(e.to_string()));
            }
        };
        self.store.mark_external_requested(&tx.id, &intent.request_id).await?;

        // -- authorization challenge ----------------------------------------
        let challenge_id = match intent.challenge_id {
            Some(id) => id,
            None => {
                warn!(
                    tx_id = %tx.id,
                    request_id = %intent.request_id,
                    "transfer-request issued without a challenge; leaving for reconciliation"
                );
                return Ok(self.receipt(&tx.id, SettlementStatus::Pending, &quote, target));
            }
        };

        // The sandbox ledger's challenge answer echoes the challenge id.
        match self
            .ledger
            .complete_challenge(&intent.request_id, &challenge_id, &challenge_id)
            .await
        {
            Ok(outcome) => match outcome.status {
                ChallengeStatus::Completed => {
                    self.store.finalize(&tx.id, &outcome.external_tx_ids, Utc::now()).await?;
                    info!(
                        tx_id = %tx.id,
                        external_tx_ids = ?outcome.external_tx_ids,
                        "settlement completed"
                    );
                    self.audit_pools(source, target).await;
                    Ok(self.receipt(&tx.id, SettlementStatus::Completed, &quote, target))
                }
                ChallengeStatus::Pending => {
                    warn!(tx_id = %tx.id, "challenge still pending; leaving for reconciliation");
                    Ok(self.receipt(&tx.id, SettlementStatus::Pending, &quote, target))
                }
                ChallengeStatus::Rejected => {
                    self.store.compensate(&tx.id, "EXTERNAL_CHALLENGE_REJECTED").await?;
                    Err(RemitError::ExternalChallengeRejected(format!(
                        "challenge {challenge_id} rejected"
                    )))
                }
            },
            Err(LedgerError::Rejected(msg)) => {
                self.store.compensate(&tx.id, "EXTERNAL_CHALLENGE_REJECTED").await?;
                Err(RemitError::ExternalChallengeRejected(msg))
            }
            Err(e) => {
                // Money may have moved. Never compensate here; the
                // reconciler polls the request until it resolves.
                warn!(
                    tx_id = %tx.id,
                    request_id = %intent.request_id,
                    error = %e,
                    "challenge outcome unknown; leaving EXTERNAL_REQUESTED"
                );
                Ok(self.receipt(&tx.id, SettlementStatus::Pending, &quote, target))
            }
        }
    }

    /// The currency of the sender's shadow account. A sender holding
    /// accounts in more than one pooled currency is rejected: the
    /// funding leg would be ambiguous.
    async fn funding_currency(&self, sender_id: &str) -> Result<Currency, RemitError> {
        let mut found = None;
        for &currency in Currency::ALL {
            if self.store.get_account(sender_id, currency).await?.is_some() {
                if found.is_some() {
                    return Err(RemitError::ValidationFailed(format!(
                        "sender {sender_id} holds accounts in multiple currencies"
                    )));
                }
                found = Some(currency);
            }
        }
        found.ok_or_else(|| RemitError::ValidationFailed(format!("unknown sender: {sender_id}")))
    }

    fn new_transaction(
        &self,
        sender_id: &str,
        source_amount: Decimal,
        source: Currency,
        target: Currency,
        quote: &Quote,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            source_amount,
            source_currency: source,
            target_amount: quote.target_amount,
            target_currency: target,
            exchange_rate: quote.customer_rate,
            platform_fee: quote.platform_fee,
            exchange_margin: quote.exchange_margin,
            status: TransactionStatus::Processing,
            failure_reason: None,
            external_request_id: None,
            external_tx_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn receipt(
        &self,
        tx_id: &str,
        settlement: SettlementStatus,
        quote: &Quote,
        target: Currency,
    ) -> RemittanceReceipt {
        RemittanceReceipt {
            transaction_id: tx_id.to_string(),
            settlement,
            target_amount: quote.target_amount,
            target_currency: target,
            customer_rate: quote.customer_rate,
            platform_fee: quote.platform_fee,
            total_debit: quote.total_source_debit,
        }
    }

    /// Post-settlement audit read of both pool balances. Failures are
    /// logged and swallowed: the settlement already committed.
    async fn audit_pools(&self, source: Currency, target: Currency) {
        for currency in [source, target] {
            let pool = match self.liquidity.pool(currency) {
                Ok(pool) => pool,
                Err(_) => continue,
            };
            match self.ledger.get_account(&pool.bank_ref, &pool.account_ref).await {
                Ok(snapshot) => {
                    info!(%currency, balance = %snapshot.balance, "pool balance after settlement");
                }
                Err(e) => {
                    warn!(%currency, error = %e, "pool audit read failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
