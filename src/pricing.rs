//! Deterministic remittance pricing.
//!
//! Pricing has no hidden state: identical `(source_amount,
//! interbank_rate)` inputs always produce identical outputs. Revenue is
//! embedded in the customer rate (worse than interbank by a configured
//! margin fraction) plus a fixed fee step function over the source
//! amount. Monetary outputs are rounded exactly once, at the end, to
//! the owning currency's minor units, round-half-up; rates and
//! intermediate values stay at full precision.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::PricingConfig;
use crate::types::Currency;

/// A frozen price for one remittance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    /// Raw market rate, as supplied by the rate provider.
    pub interbank_rate: Decimal,
    /// Marked-up rate applied to the customer.
    pub customer_rate: Decimal,
    /// Payout in the destination currency.
    pub target_amount: Decimal,
    /// Fixed fee in the source currency.
    pub platform_fee: Decimal,
    /// Rate-markup revenue, in the destination currency.
    pub exchange_margin: Decimal,
    /// Amount debited from the sender: source amount + fee.
    pub total_source_debit: Decimal,
}

impl Quote {
    /// Price `source_amount` of `source` into `target` at `interbank_rate`.
    pub fn compute(
        source_amount: Decimal,
        interbank_rate: Decimal,
        source: Currency,
        target: Currency,
        cfg: &PricingConfig,
    ) -> Self {
        let customer_rate = interbank_rate * (Decimal::ONE - cfg.margin_fraction);
        let platform_fee = fee_for(source_amount, cfg);

        // Full-precision intermediates; one terminal rounding per output.
        let target_raw = source_amount * customer_rate;
        let margin_raw = source_amount * (interbank_rate - customer_rate);

        Self {
            interbank_rate,
            customer_rate,
            target_amount: round_money(target_raw, target),
            platform_fee: round_money(platform_fee, source),
            exchange_margin: round_money(margin_raw, target),
            total_source_debit: round_money(source_amount + platform_fee, source),
        }
    }

    /// Per-unit spread between the interbank and customer rates.
    pub fn rate_spread(&self) -> Decimal {
        self.interbank_rate - self.customer_rate
    }
}

/// Fee step function: the first tier whose `up_to` covers the amount,
/// falling through to the open-ended final tier.
fn fee_for(source_amount: Decimal, cfg: &PricingConfig) -> Decimal {
    for tier in &cfg.fee_tiers {
        match tier.up_to {
            Some(bound) if source_amount <= bound => return tier.fee,
            Some(_) => continue,
            None => return tier.fee,
        }
    }
    // validate() guarantees a trailing open-ended tier.
    cfg.fee_tiers.last().map(|t| t.fee).unwrap_or(Decimal::ZERO)
}

/// Round to the currency's minor units, half away from zero.
fn round_money(value: Decimal, currency: Currency) -> Decimal {
    value.round_dp_with_strategy(currency.minor_units(), RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
