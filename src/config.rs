//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (ledger credentials) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

use crate::types::{Currency, MasterAccount};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub limits: LimitsConfig,
    pub pricing: PricingConfig,
    pub ledger: LedgerConfig,
    pub store: StoreConfig,
    /// Spot rates keyed by "BASE_QUOTE", e.g. "EUR_CZK".
    pub rates: HashMap<String, Decimal>,
    /// Per-currency master account references, keyed by ISO code.
    pub master_accounts: HashMap<String, MasterAccountConfig>,
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
}

/// Per-transaction source-amount bounds.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    /// Markup applied to the interbank rate, as a fraction (0.015 = 1.5%).
    pub margin_fraction: Decimal,
    /// Fee step function over the source amount. Tiers are ordered by
    /// ascending `up_to`; the final tier omits `up_to` and is open-ended.
    pub fee_tiers: Vec<FeeTier>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeeTier {
    #[serde(default)]
    pub up_to: Option<Decimal>,
    pub fee: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub username_env: String,
    pub password_env: String,
    pub timeout_secs: u64,
    /// Tokens within this many seconds of expiry are refreshed proactively.
    pub token_refresh_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MasterAccountConfig {
    pub bank_ref: String,
    pub account_ref: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationConfig {
    /// EXTERNAL_REQUESTED rows older than this are swept.
    pub stuck_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Build the per-currency master account handles.
    /// Every pooled currency must have exactly one entry.
    pub fn master_accounts(&self) -> Result<HashMap<Currency, MasterAccount>> {
        let mut out = HashMap::new();
        for currency in Currency::ALL {
            let entry = self
                .master_accounts
                .get(currency.code())
                .with_context(|| format!("No master account configured for {currency}"))?;
            out.insert(
                *currency,
                MasterAccount::new(*currency, entry.bank_ref.clone(), entry.account_ref.clone()),
            );
        }
        Ok(out)
    }

    fn validate(&self) -> Result<()> {
        if self.limits.min_amount <= Decimal::ZERO || self.limits.max_amount < self.limits.min_amount
        {
            anyhow::bail!(
                "Invalid limits: min={} max={}",
                self.limits.min_amount,
                self.limits.max_amount
            );
        }
        if self.pricing.margin_fraction < Decimal::ZERO
            || self.pricing.margin_fraction >= Decimal::ONE
        {
            anyhow::bail!("margin_fraction must be in [0, 1): {}", self.pricing.margin_fraction);
        }
        if self.pricing.fee_tiers.is_empty() {
            anyhow::bail!("At least one fee tier is required");
        }
        if self.pricing.fee_tiers.last().and_then(|t| t.up_to).is_some() {
            anyhow::bail!("Final fee tier must be open-ended (no up_to)");
        }
        let mut prev: Option<Decimal> = None;
        for tier in &self.pricing.fee_tiers {
            if let (Some(prev), Some(cur)) = (prev, tier.up_to) {
                if cur <= prev {
                    anyhow::bail!("Fee tiers must have strictly ascending up_to bounds");
                }
            }
            prev = tier.up_to.or(prev);
        }
        Ok(())
    }
}
