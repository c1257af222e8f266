//! Settlement orchestration.
//!
//! `settlement` drives the happy path of a remittance end to end;
//! `reconciler` resolves transactions whose external outcome was
//! unknown when control returned to the caller.

pub mod reconciler;
pub mod settlement;

pub use reconciler::Reconciler;
pub use settlement::SettlementEngine;
