//! WagerBot backend library.
//!
//! Exposes the round lifecycle engine, the virtual-currency ledger and
//! the HTTP surface for use by the binary and integration tests.

pub mod api;
pub mod ledger;
pub mod models;
pub mod rounds;

pub use api::AppState;
pub use ledger::{Ledger, LedgerReason, SqliteLedger};
pub use models::Config;
pub use rounds::{
    MatchSides, OperationResult, Round, RoundEngine, RoundStatus, RoundStore, TimerScheduler,
    Wager, WagerOutcome, BETTING_WINDOW,
};
