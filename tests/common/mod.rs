//! Fake external ledger for integration testing.
//!
//! Provides a deterministic `ExternalLedger` implementation with
//! scriptable challenge outcomes and an inspectable call log — all
//! in-memory with no external dependencies.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use remit::config::{FeeTier, LimitsConfig, PricingConfig};
use remit::engine::{Reconciler, SettlementEngine};
use remit::ledger::{
    AccountSnapshot, ChallengeOutcome, ChallengeStatus, Destination, ExternalLedger,
    LedgerError, RequestState, RequestStatus, TransferIntent,
};
use remit::liquidity::LiquidityManager;
use remit::rates::ConfigRateProvider;
use remit::store::memory::MemoryStore;
use remit::types::{Currency, MasterAccount, VirtualAccount};

pub const SENDER: &str = "alice";
pub const RECIPIENT: &str = "partner-bank/acct-42";

/// How the fake ledger resolves an authorization challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeScript {
    /// Challenge completes in-band; funds move immediately.
    Complete,
    /// Challenge is rejected in-band; no funds move.
    Reject,
    /// The challenge call times out, but the transfer settled remotely.
    TimeoutThenConfirmed,
    /// The challenge call times out and the request was rejected remotely.
    TimeoutThenRejected,
}

struct RequestRecord {
    status: RequestStatus,
    external_tx_ids: Vec<String>,
    amount: Decimal,
    from_account: String,
}

struct Inner {
    /// Pool balances keyed by account_ref.
    pools: HashMap<String, (Decimal, Currency)>,
    requests: HashMap<String, RequestRecord>,
    next_id: u64,
    challenge_script: ChallengeScript,
    refuse_requests: bool,
    calls: Vec<String>,
}

/// A fake core-banking ledger for deterministic testing.
///
/// All state is in-memory. Pool balances, request outcomes, and
/// failures are fully controllable from test code.
pub struct FakeLedger {
    inner: Mutex<Inner>,
}

impl FakeLedger {
    pub fn new() -> Self {
        let mut pools = HashMap::new();
        pools.insert("pool-eur".to_string(), (dec!(100000), Currency::Eur));
        pools.insert("pool-czk".to_string(), (dec!(1000000), Currency::Czk));
        Self {
            inner: Mutex::new(Inner {
                pools,
                requests: HashMap::new(),
                next_id: 0,
                challenge_script: ChallengeScript::Complete,
                refuse_requests: false,
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_pool_balance(&self, account_ref: &str, balance: Decimal, currency: Currency) {
        let mut inner = self.inner.lock().unwrap();
        inner.pools.insert(account_ref.to_string(), (balance, currency));
    }

    pub fn set_challenge_script(&self, script: ChallengeScript) {
        self.inner.lock().unwrap().challenge_script = script;
    }

    /// Make all subsequent transfer-request creations fail.
    pub fn refuse_requests(&self) {
        self.inner.lock().unwrap().refuse_requests = true;
    }

    /// Names of all remote operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn pool_balance(&self, account_ref: &str) -> Decimal {
        self.inner.lock().unwrap().pools[account_ref].0
    }

    fn settle(inner: &mut Inner, request_id: &str) -> Vec<String> {
        let record = inner.requests.get_mut(request_id).unwrap();
        record.status = RequestStatus::Confirmed;
        record.external_tx_ids = vec![format!("ext-{request_id}")];
        let ids = record.external_tx_ids.clone();
        let (amount, from_account) = (record.amount, record.from_account.clone());
        if let Some(pool) = inner.pools.get_mut(&from_account) {
            pool.0 -= amount;
        }
        ids
    }
}

#[async_trait]
impl ExternalLedger for FakeLedger {
    async fn get_account(
        &self,
        _bank_ref: &str,
        account_ref: &str,
    ) -> Result<AccountSnapshot, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("get_account:{account_ref}"));
        match inner.pools.get(account_ref) {
            Some(&(balance, currency)) => Ok(AccountSnapshot { balance, currency }),
            None => Err(LedgerError::NotFound(account_ref.to_string())),
        }
    }

    async fn create_transfer_request(
        &self,
        from: &MasterAccount,
        _destination: &Destination,
        amount: Decimal,
        _currency: Currency,
        _description: &str,
    ) -> Result<TransferIntent, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push("create_transfer_request".to_string());
        if inner.refuse_requests {
            return Err(LedgerError::Unavailable("scripted outage".to_string()));
        }
        inner.next_id += 1;
        let request_id = format!("req-{}", inner.next_id);
        let challenge_id = format!("chl-{}", inner.next_id);
        inner.requests.insert(
            request_id.clone(),
            RequestRecord {
                status: RequestStatus::Requested,
                external_tx_ids: Vec::new(),
                amount,
                from_account: from.account_ref.clone(),
            },
        );
        Ok(TransferIntent { request_id, challenge_id: Some(challenge_id) })
    }

    async fn complete_challenge(
        &self,
        request_id: &str,
        _challenge_id: &str,
        _answer: &str,
    ) -> Result<ChallengeOutcome, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("complete_challenge:{request_id}"));
        if !inner.requests.contains_key(request_id) {
            return Err(LedgerError::NotFound(request_id.to_string()));
        }
        match inner.challenge_script {
            ChallengeScript::Complete => {
                let ids = Self::settle(&mut inner, request_id);
                Ok(ChallengeOutcome {
                    status: ChallengeStatus::Completed,
                    external_tx_ids: ids,
                })
            }
            ChallengeScript::Reject => {
                inner.requests.get_mut(request_id).unwrap().status = RequestStatus::Rejected;
                Ok(ChallengeOutcome {
                    status: ChallengeStatus::Rejected,
                    external_tx_ids: Vec::new(),
                })
            }
            ChallengeScript::TimeoutThenConfirmed => {
                Self::settle(&mut inner, request_id);
                Err(LedgerError::Ambiguous("challenge call timed out".to_string()))
            }
            ChallengeScript::TimeoutThenRejected => {
                inner.requests.get_mut(request_id).unwrap().status = RequestStatus::Rejected;
                Err(LedgerError::Ambiguous("challenge call timed out".to_string()))
            }
        }
    }

    async fn get_transfer_request(
        &self,
        request_id: &str,
    ) -> Result<RequestState, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("get_transfer_request:{request_id}"));
        match inner.requests.get(request_id) {
            Some(record) => Ok(RequestState {
                status: record.status,
                external_tx_ids: record.external_tx_ids.clone(),
            }),
            None => Err(LedgerError::NotFound(request_id.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

pub fn funded_store(balance: Decimal) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new().with_account(VirtualAccount::new(SENDER, Currency::Eur, balance)))
}

pub fn pools() -> HashMap<Currency, MasterAccount> {
    let mut pools = HashMap::new();
    pools.insert(Currency::Eur, MasterAccount::new(Currency::Eur, "pool-bank", "pool-eur"));
    pools.insert(Currency::Czk, MasterAccount::new(Currency::Czk, "pool-bank", "pool-czk"));
    pools
}

pub fn build_engine(store: Arc<MemoryStore>, ledger: Arc<FakeLedger>) -> SettlementEngine {
    let mut rates = HashMap::new();
    rates.insert("EUR_CZK".to_string(), dec!(26.0));

    SettlementEngine::new(
        store,
        ledger.clone(),
        Arc::new(ConfigRateProvider::new(rates)),
        LiquidityManager::new(pools(), ledger),
        LimitsConfig { min_amount: dec!(1), max_amount: dec!(10000) },
        PricingConfig {
            margin_fraction: dec!(0.015),
            fee_tiers: vec![
                FeeTier { up_to: Some(dec!(100)), fee: dec!(0.99) },
                FeeTier { up_to: Some(dec!(500)), fee: dec!(2.99) },
                FeeTier { up_to: None, fee: dec!(4.99) },
            ],
        },
    )
}

pub fn build_reconciler(store: Arc<MemoryStore>, ledger: Arc<FakeLedger>) -> Reconciler {
    Reconciler::new(store, ledger, chrono::Duration::minutes(5))
}
