//! Master account liquidity checks.
//!
//! Each currency has one pooled master account at the external ledger;
//! every payout in that currency is funded from that pool. Liquidity
//! decisions always read the live remote balance. A cached figure can
//! hide a drained pool, and a payout attempted against one fails
//! halfway through a settlement instead of up front.

use futures::future::try_join;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ledger::ExternalLedger;
use crate::types::{Currency, MasterAccount, RemitError};

pub struct LiquidityManager {
    pools: HashMap<Currency, MasterAccount>,
    ledger: Arc<dyn ExternalLedger>,
}

impl LiquidityManager {
    pub fn new(pools: HashMap<Currency, MasterAccount>, ledger: Arc<dyn ExternalLedger>) -> Self {
        Self { pools, ledger }
    }

    /// The pooled master account for `currency`.
    pub fn pool(&self, currency: Currency) -> Result<&MasterAccount, RemitError> {
        self.pools.get(&currency).ok_or_else(|| {
            RemitError::ValidationFailed(format!("no master account configured for {currency}"))
        })
    }

    /// Live balance check of one pool against `required`.
    pub async fn check(&self, currency: Currency, required: Decimal) -> Result<(), RemitError> {
        let pool = self.pool(currency)?;
        let snapshot = self
            .ledger
            .get_account(&pool.bank_ref, &pool.account_ref)
            .await
            .map_err(|e| RemitError::Ledger(e.to_string()))?;

        if snapshot.balance < required {
            warn!(
                %currency,
                %required,
                available = %snapshot.balance,
                "pool liquidity insufficient"
            );
            return Err(RemitError::InsufficientLiquidity {
                currency,
                required,
                available: snapshot.balance,
            });
        }
        debug!(%currency, %required, available = %snapshot.balance, "pool liquidity ok");
        Ok(())
    }

    /// Check both legs of a cross-currency settlement concurrently:
    /// the source pool must cover the source amount and the target
    /// pool must cover the payout. Runs before any money moves, so a
    /// failure here leaves the sender untouched.
    pub async fn check_settlement(
        &self,
        source: Currency,
        source_amount: Decimal,
        target: Currency,
        target_amount: Decimal,
    ) -> Result<(), RemitError> {
        try_join(
            self.check(source, source_amount),
            self.check(target, target_amount),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
