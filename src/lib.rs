//! REMIT — Cross-Currency Remittance Settlement Engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod pricing;
pub mod rates;
pub mod ledger;
pub mod liquidity;
pub mod store;
pub mod engine;
