//! Shared types for the remittance engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that ledger, pricing,
//! store, and engine modules can depend on them without
//! circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Currency
// ---------------------------------------------------------------------------

/// A pooled settlement currency.
///
/// Exactly two currencies are pooled: each has one shared master
/// account at the external ledger funding all outbound payouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Czk,
}

impl Currency {
    /// All pooled currencies (useful for iteration).
    pub const ALL: &'static [Currency] = &[Currency::Eur, Currency::Czk];

    /// ISO 4217 code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Czk => "CZK",
        }
    }

    /// Minor-unit precision for terminal rounding (cents / haléře).
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::Eur => 2,
            Currency::Czk => 2,
        }
    }

    /// The other pooled currency. With exactly two pools, a payout in
    /// one currency is always funded by a debit in the other.
    pub fn counterpart(&self) -> Currency {
        match self {
            Currency::Eur => Currency::Czk,
            Currency::Czk => Currency::Eur,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for Currency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EUR" => Ok(Currency::Eur),
            "CZK" => Ok(Currency::Czk),
            _ => Err(anyhow::anyhow!("Unsupported currency: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// A user's shadow balance in one currency.
///
/// Not a real bank account: the real funds sit pooled in the
/// per-currency master account. Invariant: `balance >= reserved >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub user_id: String,
    pub currency: Currency,
    pub balance: Decimal,
    pub reserved: Decimal,
    /// Reference of the backing account at the external ledger, if any.
    pub external_ref: Option<String>,
}

impl VirtualAccount {
    pub fn new(user_id: impl Into<String>, currency: Currency, balance: Decimal) -> Self {
        Self {
            user_id: user_id.into(),
            currency,
            balance,
            reserved: Decimal::ZERO,
            external_ref: None,
        }
    }

    /// Spendable portion of the balance.
    pub fn available(&self) -> Decimal {
        self.balance - self.reserved
    }

    /// Whether the account can cover a debit of `amount`.
    pub fn can_cover(&self, amount: Decimal) -> bool {
        self.available() >= amount
    }
}

impl fmt::Display for VirtualAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} balance={} reserved={} available={}",
            self.user_id,
            self.currency,
            self.balance,
            self.reserved,
            self.available(),
        )
    }
}

/// The pooled real balance for one currency at the external ledger.
///
/// Exactly one exists per currency and it is shared across all users
/// of that currency. Always passed explicitly so tests can substitute
/// fake pools; `cached_balance` is informational only — liquidity
/// decisions read the live balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAccount {
    pub currency: Currency,
    pub bank_ref: String,
    pub account_ref: String,
    pub cached_balance: Option<Decimal>,
}

impl MasterAccount {
    pub fn new(
        currency: Currency,
        bank_ref: impl Into<String>,
        account_ref: impl Into<String>,
    ) -> Self {
        Self {
            currency,
            bank_ref: bank_ref.into(),
            account_ref: account_ref.into(),
            cached_balance: None,
        }
    }
}

impl fmt::Display for MasterAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pool {}/{}", self.currency, self.bank_ref, self.account_ref)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Persisted settlement state. Authoritative: the engine's in-flight
/// phases (validated, priced, liquidity-checked) leave no row; a row
/// exists from the atomic local debit onwards, or as a `Failed` audit
/// record. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Sender debited locally; external payout not yet requested.
    Processing,
    /// External transfer-request created, challenge not yet resolved.
    ExternalRequested,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    /// Whether compensation is still a legal transition.
    pub fn compensatable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Processing | TransactionStatus::ExternalRequested
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::ExternalRequested => "EXTERNAL_REQUESTED",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "EXTERNAL_REQUESTED" => Ok(TransactionStatus::ExternalRequested),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown transaction status: {s}")),
        }
    }
}

/// The durable audit record of one remittance.
///
/// Pricing fields are frozen at creation — a retried settlement never
/// re-prices. Immutable once terminal, except audit metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender_id: String,
    pub source_amount: Decimal,
    pub source_currency: Currency,
    pub target_amount: Decimal,
    pub target_currency: Currency,
    /// Customer rate actually applied (interbank × (1 − margin)).
    pub exchange_rate: Decimal,
    pub platform_fee: Decimal,
    /// Revenue embedded in the rate markup, in target-currency units.
    pub exchange_margin: Decimal,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    /// Remote transfer-request id, once one was issued.
    pub external_request_id: Option<String>,
    /// Remote transaction ids reported by a completed challenge.
    pub external_tx_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Total amount debited from the sender.
    pub fn total_source_debit(&self) -> Decimal {
        self.source_amount + self.platform_fee
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} -> {} {} @ {} fee={} ({})",
            self.id,
            self.sender_id,
            self.source_amount,
            self.source_currency,
            self.target_amount,
            self.target_currency,
            self.exchange_rate,
            self.platform_fee,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Remittance outcome
// ---------------------------------------------------------------------------

/// How far a settlement got when control returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    /// Funds confirmed moved at the external ledger.
    Completed,
    /// Outcome unknown at the external ledger; poll until
    /// reconciliation resolves it. Never silently retried.
    Pending,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStatus::Completed => write!(f, "COMPLETED"),
            SettlementStatus::Pending => write!(f, "PENDING"),
        }
    }
}

/// Returned to callers of `execute_remittance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceReceipt {
    pub transaction_id: String,
    pub settlement: SettlementStatus,
    pub target_amount: Decimal,
    pub target_currency: Currency,
    pub customer_rate: Decimal,
    pub platform_fee: Decimal,
    pub total_debit: Decimal,
}

impl fmt::Display for RemittanceReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} -> {} {} @ {} (fee {}, debit {})",
            self.transaction_id,
            self.settlement,
            self.target_amount,
            self.target_currency,
            self.customer_rate,
            self.platform_fee,
            self.total_debit,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error taxonomy for the settlement engine.
#[derive(Debug, thiserror::Error)]
pub enum RemitError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Exchange rate unavailable for {base}/{quote}")]
    RateUnavailable { base: Currency, quote: Currency },

    #[error("Insufficient pooled liquidity in {currency}: need {required}, have {available}")]
    InsufficientLiquidity {
        currency: Currency,
        required: Decimal,
        available: Decimal,
    },

    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("External transfer-request failed: {0}")]
    ExternalRequestFailed(String),

    #[error("External challenge rejected: {0}")]
    ExternalChallengeRejected(String),

    #[error("External outcome ambiguous: {0}")]
    ExternalAmbiguous(String),

    #[error("Transaction {0} requires reconciliation")]
    ReconciliationRequired(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl RemitError {
    /// Stable machine-readable code for callers and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            RemitError::ValidationFailed(_) => "VALIDATION_FAILED",
            RemitError::RateUnavailable { .. } => "RATE_UNAVAILABLE",
            RemitError::InsufficientLiquidity { .. } => "INSUFFICIENT_LIQUIDITY",
            RemitError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            RemitError::ExternalRequestFailed(_) => "EXTERNAL_REQUEST_FAILED",
            RemitError::ExternalChallengeRejected(_) => "EXTERNAL_CHALLENGE_REJECTED",
            RemitError::ExternalAmbiguous(_) => "EXTERNAL_AMBIGUOUS",
            RemitError::ReconciliationRequired(_) => "RECONCILIATION_REQUIRED",
            RemitError::Storage(_) => "STORAGE",
            RemitError::Ledger(_) => "LEDGER",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
