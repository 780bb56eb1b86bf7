//! Timed wagering rounds: creation, admission, auto-close, settlement.

pub mod engine;
pub mod scheduler;
pub mod store;
pub mod types;

pub use engine::{MatchSides, RoundEngine, BETTING_WINDOW};
pub use scheduler::TimerScheduler;
pub use store::RoundStore;
pub use types::{
    NewRound, NewWager, OperationResult, Round, RoundError, RoundKind, RoundStatus, Side, Wager,
    WagerOutcome,
};
