//! Exchange rate lookup.
//!
//! The engine calls the provider at most once per transaction and
//! freezes the returned rate into the transaction record immediately,
//! so a retried settlement never re-prices.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::types::{Currency, RemitError};

/// Abstraction over spot-rate sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Current interbank rate for one unit of `base` in `quote`.
    async fn get_rate(&self, base: Currency, quote: Currency) -> Result<Decimal, RemitError>;
}

/// Rate provider backed by the `[rates]` config table.
///
/// Used by the daemon and the sandbox; production deployments swap in
/// a live market-data provider behind the same trait.
pub struct ConfigRateProvider {
    rates: HashMap<String, Decimal>,
}

impl ConfigRateProvider {
    pub fn new(rates: HashMap<String, Decimal>) -> Self {
        Self { rates }
    }

    fn key(base: Currency, quote: Currency) -> String {
        format!("{}_{}", base.code(), quote.code())
    }
}

#[async_trait]
impl RateProvider for ConfigRateProvider {
    async fn get_rate(&self, base: Currency, quote: Currency) -> Result<Decimal, RemitError> {
        if base == quote {
            return Ok(Decimal::ONE);
        }
        self.rates
            .get(&Self::key(base, quote))
            .copied()
            .ok_or(RemitError::RateUnavailable { base, quote })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
