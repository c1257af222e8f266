//! HTTP binding to the remote core-banking ledger.
//!
//! Auth: a login call exchanges credentials for a short-lived bearer
//! token. The token is fetched lazily on first use, refreshed
//! proactively once it is inside a safety window of its expiry, and
//! any call rejected with 401 is retried exactly once after a forced
//! refresh.
//!
//! Timeouts: every call carries the client timeout. A timed-out
//! challenge completion is surfaced as `LedgerError::Ambiguous` —
//! money may have moved — while timed-out idempotent reads are
//! retried once and then surfaced as `Unavailable`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    AccountSnapshot, ChallengeOutcome, ChallengeStatus, Destination, ExternalLedger,
    LedgerError, RequestState, RequestStatus, TransferIntent,
};
use crate::config::LedgerConfig;
use crate::types::{Currency, MasterAccount};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    /// Token lifetime in seconds.
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    /// Decimal string; the ledger never sends floats.
    balance: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct TransferRequestResponse {
    id: String,
    #[serde(default)]
    challenge_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChallengeAnswer<'a> {
    answer: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    status: String,
    #[serde(default)]
    transaction_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RequestStateResponse {
    status: String,
    #[serde(default)]
    transaction_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Session {
    token: String,
    expires_at: Instant,
}

/// Bearer-token HTTP client for the remote ledger.
pub struct HttpLedgerClient {
    http: Client,
    base_url: String,
    username: String,
    password: Secret<String>,
    refresh_window: Duration,
    session: RwLock<Option<Session>>,
}

impl HttpLedgerClient {
    /// Build a client from config, resolving credentials from the
    /// env vars the config names.
    pub fn from_config(cfg: &LedgerConfig) -> Result<Self> {
        let username = crate::config::AppConfig::resolve_env(&cfg.username_env)?;
        let password = crate::config::AppConfig::resolve_env(&cfg.password_env)?;
        Self::with_credentials(
            cfg.base_url.clone(),
            username,
            password,
            Duration::from_secs(cfg.timeout_secs),
            Duration::from_secs(cfg.token_refresh_window_secs),
        )
    }

    /// Create a client with explicit credentials (for testing).
    pub fn with_credentials(
        base_url: String,
        username: String,
        password: String,
        timeout: Duration,
        refresh_window: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("remit/0.1.0 (settlement-engine)")
            .build()
            .context("Failed to build HTTP client for the ledger")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password: Secret::new(password),
            refresh_window,
            session: RwLock::new(None),
        })
    }

    // -- Authentication ----------------------------------------------------

    /// Exchange credentials for a bearer token and cache it.
    async fn login(&self) -> Result<(), LedgerError> {
        debug!("Authenticating with the ledger");

        let url = format!("{}/auth/login", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&LoginRequest {
                username: &self.username,
                password: self.password.expose_secret(),
            })
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("login request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Auth(format!("login failed {status}: {body}")));
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("malformed login response: {e}")))?;

        let expires_at = Instant::now() + Duration::from_secs(login.expires_in);
        *self.session.write().unwrap() = Some(Session { token: login.token, expires_at });

        debug!("Ledger authentication successful");
        Ok(())
    }

    /// Get a token with useful remaining lifetime, logging in if the
    /// cached one is absent or inside the refresh window.
    async fn ensure_token(&self) -> Result<String, LedgerError> {
        {
            let guard = self.session.read().unwrap();
            if let Some(ref session) = *guard {
                let remaining = session.expires_at.saturating_duration_since(Instant::now());
                if remaining > self.refresh_window {
                    return Ok(session.token.clone());
                }
            }
        }
        self.login().await?;
        let guard = self.session.read().unwrap();
        guard
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| LedgerError::Auth("token missing after login".to_string()))
    }

    fn clear_session(&self) {
        *self.session.write().unwrap() = None;
    }

    // -- Transport helpers ---------------------------------------------------

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<reqwest::Response, LedgerError> {
        let mut req = self.http.request(method, url).bearer_auth(token);
        if let Some(json) = body {
            req = req.json(json);
        }
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                LedgerError::Ambiguous(format!("request to {url} timed out"))
            } else {
                LedgerError::Unavailable(format!("request to {url} failed: {e}"))
            }
        })
    }

    /// Authenticated request with the retry-once-on-401 rule.
    async fn send_authed(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, LedgerError> {
        let token = self.ensure_token().await?;
        let resp = self.dispatch(method.clone(), url, body, &token).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            // Token invalidated server-side; refresh and retry exactly once.
            self.clear_session();
            warn!(url, "Ledger rejected the token, re-authenticating");
            let token = self.ensure_token().await?;
            return self.dispatch(method, url, body, &token).await;
        }

        Ok(resp)
    }

    // -- Response mapping ----------------------------------------------------

    fn to_snapshot(resp: AccountResponse) -> Result<AccountSnapshot, LedgerError> {
        let balance: Decimal = resp
            .balance
            .parse()
            .map_err(|_| LedgerError::Unavailable(format!("malformed balance: {}", resp.balance)))?;
        let currency: Currency = resp
            .currency
            .parse()
            .map_err(|_| LedgerError::Unavailable(format!("unknown currency: {}", resp.currency)))?;
        Ok(AccountSnapshot { balance, currency })
    }

    fn wire_destination(destination: &Destination) -> serde_json::Value {
        match destination {
            Destination::Internal { bank_ref, account_ref } => serde_json::json!({
                "bank_ref": bank_ref,
                "account_ref": account_ref,
            }),
            Destination::Routing(code) => serde_json::json!({
                "routing_code": code,
            }),
        }
    }

    fn parse_challenge(resp: ChallengeResponse) -> Result<ChallengeOutcome, LedgerError> {
        let status = match resp.status.as_str() {
            "COMPLETED" => ChallengeStatus::Completed,
            "PENDING" => ChallengeStatus::Pending,
            "REJECTED" => ChallengeStatus::Rejected,
            other => {
                return Err(LedgerError::Ambiguous(format!(
                    "unrecognized challenge status: {other}"
                )))
            }
        };
        Ok(ChallengeOutcome { status, external_tx_ids: resp.transaction_ids })
    }

    /// Classify a non-success transfer-request creation status. A 401
    /// surviving the retry-once rule is an auth outage, not a remote
    /// rejection of the transfer.
    fn create_request_error(status: StatusCode, body: String) -> LedgerError {
        match status {
            StatusCode::UNAUTHORIZED => LedgerError::Auth(format!("{status}: {body}")),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                LedgerError::InvalidDestination(body)
            }
            s if s.is_client_error() => LedgerError::Rejected(format!("{s}: {body}")),
            s => LedgerError::Unavailable(format!("{s}: {body}")),
        }
    }

    /// Classify a non-success challenge completion status. Client-side
    /// rejections mean the challenge was refused before processing;
    /// server-side failures after a money-moving call are unknown.
    fn challenge_error(status: StatusCode, body: String) -> LedgerError {
        match status {
            StatusCode::UNAUTHORIZED => LedgerError::Auth(format!("{status}: {body}")),
            s if s.is_client_error() => LedgerError::Rejected(format!("{s}: {body}")),
            s => LedgerError::Ambiguous(format!("{s}: {body}")),
        }
    }

    fn parse_request_state(resp: RequestStateResponse) -> Result<RequestState, LedgerError> {
        let status = match resp.status.as_str() {
            "REQUESTED" | "PENDING" => RequestStatus::Requested,
            "CONFIRMED" | "COMPLETED" => RequestStatus::Confirmed,
            "REJECTED" | "EXPIRED" => RequestStatus::Rejected,
            other => {
                return Err(LedgerError::Ambiguous(format!(
                    "unrecognized request status: {other}"
                )))
            }
        };
        Ok(RequestState { status, external_tx_ids: resp.transaction_ids })
    }

    async fn read_account(
        &self,
        bank_ref: &str,
        account_ref: &str,
    ) -> Result<AccountSnapshot, LedgerError> {
        let url = format!("{}/banks/{bank_ref}/accounts/{account_ref}", self.base_url);
        let resp = self.send_authed(Method::GET, &url, None).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                return Err(LedgerError::NotFound(format!("{bank_ref}/{account_ref}")))
            }
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(LedgerError::Unavailable(format!("account read {s}: {body}")));
            }
            _ => {}
        }

        let body: AccountResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("malformed account response: {e}")))?;
        Self::to_snapshot(body)
    }
}

// ---------------------------------------------------------------------------
// ExternalLedger implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExternalLedger for HttpLedgerClient {
    /// Live balance read. Idempotent, so one transient failure is
    /// retried before giving up.
    async fn get_account(
        &self,
        bank_ref: &str,
        account_ref: &str,
    ) -> Result<AccountSnapshot, LedgerError> {
        match self.read_account(bank_ref, account_ref).await {
            Err(LedgerError::Unavailable(first)) | Err(LedgerError::Ambiguous(first)) => {
                debug!(bank_ref, account_ref, error = %first, "Account read failed, retrying once");
                self.read_account(bank_ref, account_ref).await.map_err(|e| match e {
                    LedgerError::Ambiguous(msg) => LedgerError::Unavailable(msg),
                    other => other,
                })
            }
            other => other,
        }
    }

    async fn create_transfer_request(
        &self,
        from: &MasterAccount,
        destination: &Destination,
        amount: Decimal,
        currency: Currency,
        description: &str,
    ) -> Result<TransferIntent, LedgerError> {
        let url = format!("{}/transfer-requests", self.base_url);
        let body = serde_json::json!({
            "from": {
                "bank_ref": from.bank_ref,
                "account_ref": from.account_ref,
            },
            "to": Self::wire_destination(destination),
            "amount": amount.to_string(),
            "currency": currency.code(),
            "description": description,
        });

        let resp = self.send_authed(Method::POST, &url, Some(&body)).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::create_request_error(status, text));
        }

        let created: TransferRequestResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("malformed transfer-request response: {e}")))?;

        debug!(request_id = %created.id, "Transfer-request created");
        Ok(TransferIntent {
            request_id: created.id,
            challenge_id: created.challenge_id,
        })
    }

    async fn complete_challenge(
        &self,
        request_id: &str,
        challenge_id: &str,
        answer: &str,
    ) -> Result<ChallengeOutcome, LedgerError> {
        let url = format!(
            "{}/transfer-requests/{request_id}/challenges/{challenge_id}",
            self.base_url
        );
        let body = serde_json::to_value(ChallengeAnswer { answer })
            .map_err(|e| LedgerError::Unavailable(format!("challenge encode: {e}")))?;

        let resp = self.send_authed(Method::POST, &url, Some(&body)).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::challenge_error(status, text));
        }

        let outcome: ChallengeResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Ambiguous(format!("malformed challenge response: {e}")))?;
        Self::parse_challenge(outcome)
    }

    async fn get_transfer_request(
        &self,
        request_id: &str,
    ) -> Result<RequestState, LedgerError> {
        let url = format!("{}/transfer-requests/{request_id}", self.base_url);
        let resp = self.send_authed(Method::GET, &url, None).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(LedgerError::NotFound(request_id.to_string())),
            s if !s.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                return Err(LedgerError::Unavailable(format!("{s}: {text}")));
            }
            _ => {}
        }

        let state: RequestStateResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("malformed request state: {e}")))?;
        Self::parse_request_state(state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> HttpLedgerClient {
        HttpLedgerClient::with_credentials(
            "https://core.sandbox.example.com/".to_string(),
            "svc-remit".to_string(),
            "hunter2".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let c = client();
        assert_eq!(c.base_url, "https://core.sandbox.example.com");
    }

    // -- Response mapping --

    #[test]
    fn test_account_snapshot_mapping() {
        let resp: AccountResponse =
            serde_json::from_str(r#"{"balance": "2561.00", "currency": "CZK"}"#).unwrap();
        let snapshot = HttpLedgerClient::to_snapshot(resp).unwrap();
        assert_eq!(snapshot.balance, dec!(2561.00));
        assert_eq!(snapshot.currency, Currency::Czk);
    }

    #[test]
    fn test_account_snapshot_rejects_garbage() {
        let resp: AccountResponse =
            serde_json::from_str(r#"{"balance": "lots", "currency": "CZK"}"#).unwrap();
        assert!(HttpLedgerClient::to_snapshot(resp).is_err());

        let resp: AccountResponse =
            serde_json::from_str(r#"{"balance": "1.00", "currency": "XAU"}"#).unwrap();
        assert!(HttpLedgerClient::to_snapshot(resp).is_err());
    }

    #[test]
    fn test_wire_destination_internal() {
        let dest = Destination::Internal {
            bank_ref: "partner-bank".to_string(),
            account_ref: "acct-42".to_string(),
        };
        let wire = HttpLedgerClient::wire_destination(&dest);
        assert_eq!(wire["bank_ref"], "partner-bank");
        assert_eq!(wire["account_ref"], "acct-42");
    }

    #[test]
    fn test_wire_destination_routing() {
        let dest = Destination::Routing("CZ6508000000192000145399".to_string());
        let wire = HttpLedgerClient::wire_destination(&dest);
        assert_eq!(wire["routing_code"], "CZ6508000000192000145399");
        assert!(wire.get("bank_ref").is_none());
    }

    #[test]
    fn test_challenge_status_mapping() {
        let parse = |s: &str| {
            HttpLedgerClient::parse_challenge(ChallengeResponse {
                status: s.to_string(),
                transaction_ids: vec!["ext-1".to_string()],
            })
        };
        assert_eq!(parse("COMPLETED").unwrap().status, ChallengeStatus::Completed);
        assert_eq!(parse("PENDING").unwrap().status, ChallengeStatus::Pending);
        assert_eq!(parse("REJECTED").unwrap().status, ChallengeStatus::Rejected);
        assert!(matches!(parse("WAT"), Err(LedgerError::Ambiguous(_))));
    }

    #[test]
    fn test_challenge_carries_external_tx_ids() {
        let outcome = HttpLedgerClient::parse_challenge(ChallengeResponse {
            status: "COMPLETED".to_string(),
            transaction_ids: vec!["ext-1".to_string(), "ext-2".to_string()],
        })
        .unwrap();
        assert_eq!(outcome.external_tx_ids, vec!["ext-1", "ext-2"]);
    }

    #[test]
    fn test_request_state_mapping() {
        let parse = |s: &str| {
            HttpLedgerClient::parse_request_state(RequestStateResponse {
                status: s.to_string(),
                transaction_ids: vec![],
            })
        };
        assert_eq!(parse("REQUESTED").unwrap().status, RequestStatus::Requested);
        assert_eq!(parse("CONFIRMED").unwrap().status, RequestStatus::Confirmed);
        assert_eq!(parse("COMPLETED").unwrap().status, RequestStatus::Confirmed);
        assert_eq!(parse("REJECTED").unwrap().status, RequestStatus::Rejected);
        assert_eq!(parse("EXPIRED").unwrap().status, RequestStatus::Rejected);
        assert!(parse("???").is_err());
    }

    #[test]
    fn test_create_request_error_classification() {
        let classify =
            |code: u16| HttpLedgerClient::create_request_error(
                StatusCode::from_u16(code).unwrap(),
                "body".to_string(),
            );
        assert!(matches!(classify(401), LedgerError::Auth(_)));
        assert!(matches!(classify(400), LedgerError::InvalidDestination(_)));
        assert!(matches!(classify(422), LedgerError::InvalidDestination(_)));
        assert!(matches!(classify(403), LedgerError::Rejected(_)));
        assert!(matches!(classify(409), LedgerError::Rejected(_)));
        assert!(matches!(classify(500), LedgerError::Unavailable(_)));
        assert!(matches!(classify(503), LedgerError::Unavailable(_)));
    }

    #[test]
    fn test_challenge_error_classification() {
        let classify = |code: u16| {
            HttpLedgerClient::challenge_error(
                StatusCode::from_u16(code).unwrap(),
                "body".to_string(),
            )
        };
        assert!(matches!(classify(401), LedgerError::Auth(_)));
        assert!(matches!(classify(403), LedgerError::Rejected(_)));
        // Server-side failure after a money-moving call: unknown.
        assert!(matches!(classify(500), LedgerError::Ambiguous(_)));
        assert!(matches!(classify(502), LedgerError::Ambiguous(_)));
    }

    #[test]
    fn test_login_response_shape() {
        let login: LoginResponse =
            serde_json::from_str(r#"{"token": "tok-abc", "expires_in": 900}"#).unwrap();
        assert_eq!(login.token, "tok-abc");
        assert_eq!(login.expires_in, 900);
    }

    #[test]
    fn test_transfer_request_response_optional_challenge() {
        let created: TransferRequestResponse =
            serde_json::from_str(r#"{"id": "req-1"}"#).unwrap();
        assert_eq!(created.id, "req-1");
        assert!(created.challenge_id.is_none());

        let created: TransferRequestResponse =
            serde_json::from_str(r#"{"id": "req-2", "challenge_id": "chg-9"}"#).unwrap();
        assert_eq!(created.challenge_id.as_deref(), Some("chg-9"));
    }
}
