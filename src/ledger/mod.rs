//! External core-banking ledger integration.
//!
//! Defines the `ExternalLedger` trait plus the HTTP client
//! implementation. The remote ledger moves real money through a
//! two-step protocol: a transfer-request is created first and moves
//! nothing; only a completed authorization challenge settles it.
//! "Requested but not yet authorized" is therefore a first-class,
//! recoverable state, never collapsed into success/failure.

pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;

use crate::types::{Currency, MasterAccount};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by the remote ledger binding.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Remote ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Not found at remote ledger: {0}")]
    NotFound(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Remote ledger rejected the request: {0}")]
    Rejected(String),

    #[error("Remote ledger authentication failed: {0}")]
    Auth(String),

    /// The call may or may not have taken effect remotely. Callers must
    /// treat this as unknown, never as a definitive failure.
    #[error("Remote outcome unknown: {0}")]
    Ambiguous(String),
}

// ---------------------------------------------------------------------------
// Wire-facing domain types
// ---------------------------------------------------------------------------

/// Balance snapshot of one remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub currency: Currency,
}

/// Where a payout goes: an account at a partner bank inside the
/// ledger, or an external routing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Internal { bank_ref: String, account_ref: String },
    Routing(String),
}

impl Destination {
    /// Parse a caller-supplied recipient reference.
    ///
    /// `bank/account` selects an internal account pair; any other
    /// single token is treated as an external routing code.
    pub fn parse(recipient_ref: &str) -> Result<Self, LedgerError> {
        let trimmed = recipient_ref.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(LedgerError::InvalidDestination(format!(
                "unresolvable recipient reference: {recipient_ref:?}"
            )));
        }
        match trimmed.split_once('/') {
            Some((bank, account)) => {
                if bank.is_empty() || account.is_empty() || account.contains('/') {
                    return Err(LedgerError::InvalidDestination(format!(
                        "malformed account pair: {trimmed:?}"
                    )));
                }
                Ok(Destination::Internal {
                    bank_ref: bank.to_string(),
                    account_ref: account.to_string(),
                })
            }
            None => Ok(Destination::Routing(trimmed.to_string())),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Internal { bank_ref, account_ref } => {
                write!(f, "{bank_ref}/{account_ref}")
            }
            Destination::Routing(code) => write!(f, "routing:{code}"),
        }
    }
}

/// The ephemeral handle to a pending remote transfer-request. Never
/// persisted beyond the request id stored on the transaction row.
#[derive(Debug, Clone)]
pub struct TransferIntent {
    pub request_id: String,
    pub challenge_id: Option<String>,
}

/// Result of answering an authorization challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Completed,
    Pending,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ChallengeOutcome {
    pub status: ChallengeStatus,
    pub external_tx_ids: Vec<String>,
}

/// Tri-state of a transfer-request as observed by reconciliation.
/// The protocol has no abort for an accepted-but-unconfirmed request,
/// so this is explicit rather than assumed transactional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Requested,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct RequestState {
    pub status: RequestStatus,
    pub external_tx_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the remote core-banking ledger.
///
/// All calls are blocking I/O for their caller and carry the client's
/// timeout. Reads (`get_account`, `get_transfer_request`) are
/// idempotent and safe to retry; the two write operations are not.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalLedger: Send + Sync {
    /// Read one account's live balance.
    async fn get_account(
        &self,
        bank_ref: &str,
        account_ref: &str,
    ) -> Result<AccountSnapshot, LedgerError>;

    /// Create a transfer-request out of a master account. Moves no
    /// money by itself.
    async fn create_transfer_request(
        &self,
        from: &MasterAccount,
        destination: &Destination,
        amount: Decimal,
        currency: Currency,
        description: &str,
    ) -> Result<TransferIntent, LedgerError>;

    /// Answer the authorization challenge for a pending request.
    /// A timeout maps to `LedgerError::Ambiguous`: money may have moved.
    async fn complete_challenge(
        &self,
        request_id: &str,
        challenge_id: &str,
        answer: &str,
    ) -> Result<ChallengeOutcome, LedgerError>;

    /// Idempotent status read of an existing transfer-request, used by
    /// reconciliation. `NotFound` means the request was never accepted.
    async fn get_transfer_request(&self, request_id: &str)
        -> Result<RequestState, LedgerError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_internal_pair() {
        let dest = Destination::parse("sandbox-bank/acct-123").unwrap();
        assert_eq!(
            dest,
            Destination::Internal {
                bank_ref: "sandbox-bank".to_string(),
                account_ref: "acct-123".to_string(),
            }
        );
        assert_eq!(format!("{dest}"), "sandbox-bank/acct-123");
    }

    #[test]
    fn test_parse_routing_code() {
        let dest = Destination::parse("CZ6508000000192000145399").unwrap();
        assert_eq!(dest, Destination::Routing("CZ6508000000192000145399".to_string()));
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(Destination::parse("").is_err());
        assert!(Destination::parse("   ").is_err());
        assert!(Destination::parse("two words").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_pairs() {
        assert!(Destination::parse("/acct").is_err());
        assert!(Destination::parse("bank/").is_err());
        assert!(Destination::parse("a/b/c").is_err());
    }

    #[test]
    fn test_ledger_error_display() {
        let e = LedgerError::Ambiguous("challenge call timed out".to_string());
        assert!(format!("{e}").contains("unknown"));
    }
}
