//! SQLite shadow ledger backend.
//!
//! Money amounts are stored as decimal strings, never floats, and
//! timestamps as fixed-width RFC 3339 text so that lexicographic
//! ordering matches chronological ordering. The pool is capped at a
//! single connection, which serializes writers and makes the
//! select-then-update sections below race-free.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::{ShadowLedger, StoreError};
use crate::types::{Currency, Transaction, TransactionStatus, VirtualAccount};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and run the
    /// schema migration.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS virtual_accounts (
                user_id      TEXT NOT NULL,
                currency     TEXT NOT NULL,
                balance      TEXT NOT NULL,
                reserved     TEXT NOT NULL,
                external_ref TEXT,
                PRIMARY KEY (user_id, currency)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id                  TEXT PRIMARY KEY,
                sender_id           TEXT NOT NULL,
                source_amount       TEXT NOT NULL,
                source_currency     TEXT NOT NULL,
                target_amount       TEXT NOT NULL,
                target_currency     TEXT NOT NULL,
                exchange_rate       TEXT NOT NULL,
                platform_fee        TEXT NOT NULL,
                exchange_margin     TEXT NOT NULL,
                status              TEXT NOT NULL,
                failure_reason      TEXT,
                external_request_id TEXT,
                external_tx_ids     TEXT NOT NULL,
                created_at          TEXT NOT NULL,
                completed_at        TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_status_created \
             ON transactions (status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_dec(s: &str) -> Result<Decimal, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Backend(format!("bad decimal {s:?}: {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {s:?}: {e}")))
}

/// Fixed-width RFC 3339; keeps string comparison chronological.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_account(row: &SqliteRow) -> Result<VirtualAccount, StoreError> {
    Ok(VirtualAccount {
        user_id: row.try_get("user_id").map_err(backend)?,
        currency: row
            .try_get::<String, _>("currency")
            .map_err(backend)?
            .parse::<Currency>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        balance: parse_dec(&row.try_get::<String, _>("balance").map_err(backend)?)?,
        reserved: parse_dec(&row.try_get::<String, _>("reserved").map_err(backend)?)?,
        external_ref: row.try_get("external_ref").map_err(backend)?,
    })
}

fn row_to_tx(row: &SqliteRow) -> Result<Transaction, StoreError> {
    let status = row
        .try_get::<String, _>("status")
        .map_err(backend)?
        .parse::<TransactionStatus>()
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let external_tx_ids: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("external_tx_ids").map_err(backend)?)
            .map_err(|e| StoreError::Backend(format!("bad external_tx_ids: {e}")))?;
    let completed_at = match row.try_get::<Option<String>, _>("completed_at").map_err(backend)? {
        Some(s) => Some(parse_ts(&s)?),
        None => None,
    };
    Ok(Transaction {
        id: row.try_get("id").map_err(backend)?,
        sender_id: row.try_get("sender_id").map_err(backend)?,
        source_amount: parse_dec(&row.try_get::<String, _>("source_amount").map_err(backend)?)?,
        source_currency: row
            .try_get::<String, _>("source_currency")
            .map_err(backend)?
            .parse::<Currency>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        target_amount: parse_dec(&row.try_get::<String, _>("target_amount").map_err(backend)?)?,
        target_currency: row
            .try_get::<String, _>("target_currency")
            .map_err(backend)?
            .parse::<Currency>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        exchange_rate: parse_dec(&row.try_get::<String, _>("exchange_rate").map_err(backend)?)?,
        platform_fee: parse_dec(&row.try_get::<String, _>("platform_fee").map_err(backend)?)?,
        exchange_margin: parse_dec(
            &row.try_get::<String, _>("exchange_margin").map_err(backend)?,
        )?,
        status,
        failure_reason: row.try_get("failure_reason").map_err(backend)?,
        external_request_id: row.try_get("external_request_id").map_err(backend)?,
        external_tx_ids,
        created_at: parse_ts(&row.try_get::<String, _>("created_at").map_err(backend)?)?,
        completed_at,
    })
}

fn tx_ids_json(ids: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(ids).map_err(|e| StoreError::Backend(e.to_string()))
}

// ---------------------------------------------------------------------------
// ShadowLedger impl
// ---------------------------------------------------------------------------

#[async_trait]
impl ShadowLedger for SqliteStore {
    async fn get_account(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<Option<VirtualAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM virtual_accounts WHERE user_id = ? AND currency = ?",
        )
        .bind(user_id)
        .bind(currency.code())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn upsert_account(&self, account: VirtualAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO virtual_accounts (user_id, currency, balance, reserved, external_ref)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, currency) DO UPDATE SET
                balance = excluded.balance,
                reserved = excluded.reserved,
                external_ref = excluded.external_ref
            "#,
        )
        .bind(&account.user_id)
        .bind(account.currency.code())
        .bind(account.balance.to_string())
        .bind(account.reserved.to_string())
        .bind(&account.external_ref)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn debit_for_settlement(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;

        let duplicate = sqlx::query("SELECT 1 FROM transactions WHERE id = ?")
            .bind(&tx.id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(backend)?;
        if duplicate.is_some() {
            return Err(StoreError::Backend(format!("duplicate transaction id {}", tx.id)));
        }

        let row = sqlx::query(
            "SELECT * FROM virtual_accounts WHERE user_id = ? AND currency = ?",
        )
        .bind(&tx.sender_id)
        .bind(tx.source_currency.code())
        .fetch_optional(&mut *txn)
        .await
        .map_err(backend)?;
        let account = match row.as_ref() {
            Some(r) => row_to_account(r)?,
            None => return Err(StoreError::AccountNotFound(tx.sender_id.clone())),
        };

        let needed = tx.total_source_debit();
        if !account.can_cover(needed) {
            return Err(StoreError::InsufficientBalance {
                needed,
                available: account.available(),
            });
        }

        sqlx::query(
            "UPDATE virtual_accounts SET balance = ? WHERE user_id = ? AND currency = ?",
        )
        .bind((account.balance - needed).to_string())
        .bind(&tx.sender_id)
        .bind(tx.source_currency.code())
        .execute(&mut *txn)
        .await
        .map_err(backend)?;

        insert_transaction(&mut txn, tx).await?;
        txn.commit().await.map_err(backend)
    }

    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;
        insert_transaction(&mut txn, tx).await?;
        txn.commit().await.map_err(backend)
    }

    async fn mark_external_requested(
        &self,
        tx_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;
        let current = fetch_tx(&mut txn, tx_id).await?;
        if current.status.is_terminal() {
            return Err(StoreError::AlreadyFinal { id: current.id, from: current.status });
        }
        sqlx::query("UPDATE transactions SET status = ?, external_request_id = ? WHERE id = ?")
            .bind(TransactionStatus::ExternalRequested.as_str())
            .bind(request_id)
            .bind(tx_id)
            .execute(&mut *txn)
            .await
            .map_err(backend)?;
        txn.commit().await.map_err(backend)
    }

    async fn finalize(
        &self,
        tx_id: &str,
        external_tx_ids: &[String],
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;
        let current = fetch_tx(&mut txn, tx_id).await?;
        match current.status {
            TransactionStatus::Completed => return Ok(()),
            TransactionStatus::Failed => {
                return Err(StoreError::AlreadyFinal { id: current.id, from: current.status });
            }
            _ => {}
        }
        sqlx::query(
            "UPDATE transactions SET status = ?, external_tx_ids = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(TransactionStatus::Completed.as_str())
        .bind(tx_ids_json(external_tx_ids)?)
        .bind(fmt_ts(&completed_at))
        .bind(tx_id)
        .execute(&mut *txn)
        .await
        .map_err(backend)?;
        txn.commit().await.map_err(backend)
    }

    async fn compensate(&self, tx_id: &str, reason: &str) -> Result<Transaction, StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;
        let current = fetch_tx(&mut txn, tx_id).await?;
        if !current.status.compensatable() {
            return Err(StoreError::AlreadyFinal { id: current.id, from: current.status });
        }

        let row = sqlx::query(
            "SELECT * FROM virtual_accounts WHERE user_id = ? AND currency = ?",
        )
        .bind(&current.sender_id)
        .bind(current.source_currency.code())
        .fetch_optional(&mut *txn)
        .await
        .map_err(backend)?;
        let account = match row.as_ref() {
            Some(r) => row_to_account(r)?,
            None => return Err(StoreError::AccountNotFound(current.sender_id.clone())),
        };

        sqlx::query(
            "UPDATE virtual_accounts SET balance = ? WHERE user_id = ? AND currency = ?",
        )
        .bind((account.balance + current.total_source_debit()).to_string())
        .bind(&current.sender_id)
        .bind(current.source_currency.code())
        .execute(&mut *txn)
        .await
        .map_err(backend)?;

        sqlx::query("UPDATE transactions SET status = ?, failure_reason = ? WHERE id = ?")
            .bind(TransactionStatus::Failed.as_str())
            .bind(reason)
            .bind(tx_id)
            .execute(&mut *txn)
            .await
            .map_err(backend)?;

        let updated = fetch_tx(&mut txn, tx_id).await?;
        txn.commit().await.map_err(backend)?;
        Ok(updated)
    }

    async fn get_transaction(&self, tx_id: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn stuck_in_flight(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE status IN (?, ?) AND created_at < ? \
             ORDER BY created_at ASC",
        )
        .bind(TransactionStatus::Processing.as_str())
        .bind(TransactionStatus::ExternalRequested.as_str())
        .bind(fmt_ts(&cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_tx).collect()
    }
}

async fn fetch_tx(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tx_id: &str,
) -> Result<Transaction, StoreError> {
    let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
        .bind(tx_id)
        .fetch_optional(&mut **txn)
        .await
        .map_err(backend)?;
    match row.as_ref() {
        Some(r) => row_to_tx(r),
        None => Err(StoreError::TransactionNotFound(tx_id.to_string())),
    }
}

async fn insert_transaction(
    txn: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tx: &Transaction,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, sender_id, source_amount, source_currency, target_amount,
            target_currency, exchange_rate, platform_fee, exchange_margin,
            status, failure_reason, external_request_id, external_tx_ids,
            created_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&tx.id)
    .bind(&tx.sender_id)
    .bind(tx.source_amount.to_string())
    .bind(tx.source_currency.code())
    .bind(tx.target_amount.to_string())
    .bind(tx.target_currency.code())
    .bind(tx.exchange_rate.to_string())
    .bind(tx.platform_fee.to_string())
    .bind(tx.exchange_margin.to_string())
    .bind(tx.status.as_str())
    .bind(&tx.failure_reason)
    .bind(&tx.external_request_id)
    .bind(tx_ids_json(&tx.external_tx_ids)?)
    .bind(fmt_ts(&tx.created_at))
    .bind(tx.completed_at.as_ref().map(fmt_ts))
    .execute(&mut **txn)
    .await
    .map_err(backend)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
