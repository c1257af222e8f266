//! REMIT — Cross-Currency Remittance Settlement Engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the shadow ledger database, wires the external ledger client,
//! and runs the reconciliation sweep loop with graceful shutdown.
//! Settlements themselves are driven by callers of
//! [`remit::engine::SettlementEngine`]; this daemon keeps the parked
//! ones moving.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use remit::config;
use remit::engine::reconciler::SweepReport;
use remit::engine::Reconciler;
use remit::ledger::http::HttpLedgerClient;
use remit::store::sqlite::SqliteStore;

const BANNER: &str = r#"
 ____  _____ __  __ ___ _____
|  _ \| ____|  \/  |_ _|_   _|
| |_) |  _| | |\/| || |  | |
|  _ <| |___| |  | || |  | |
|_| \_\_____|_|  |_|___| |_|

  Cross-Currency Remittance Settlement Engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    println!("{BANNER}");
    info!(
        engine_name = %cfg.engine.name,
        database_url = %cfg.store.database_url,
        ledger_url = %cfg.ledger.base_url,
        sweep_interval_secs = cfg.reconciliation.sweep_interval_secs,
        "REMIT starting up"
    );

    // -- Wire components ---------------------------------------------------

    let store = Arc::new(SqliteStore::connect(&cfg.store.database_url).await?);
    let ledger = Arc::new(HttpLedgerClient::from_config(&cfg.ledger)?);

    let reconciler = Reconciler::new(
        store,
        ledger,
        chrono::Duration::seconds(cfg.reconciliation.stuck_after_secs as i64),
    );

    // -- Reconciliation loop -------------------------------------------------

    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.reconciliation.sweep_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.reconciliation.sweep_interval_secs,
        stuck_after_secs = cfg.reconciliation.stuck_after_secs,
        "Entering reconciliation loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconciler.sweep().await {
                    Ok(report) => {
                        if report != SweepReport::default() {
                            info!(
                                completed = report.completed,
                                failed = report.failed,
                                still_pending = report.still_pending,
                                errors = report.errors,
                                "Sweep complete"
                            );
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Sweep failed — continuing to next");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("REMIT shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remit=info"));

    let json_logging = std::env::var("REMIT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
