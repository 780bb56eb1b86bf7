//! Round, wager and result types shared by the lifecycle engine and stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a round.
///
/// Free-text team names (and the fixed Yes/No labels of events) compare
/// case-insensitively; participant identities compare exactly. Keeping the
/// two shapes in one tagged type avoids silently conflating a user id with
/// a team name somewhere down the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum Side {
    Name(String),
    Participant(String),
}

impl Side {
    pub fn label(&self) -> &str {
        match self {
            Side::Name(s) | Side::Participant(s) => s,
        }
    }

    /// Whether a raw side string from a caller refers to this side.
    pub fn matches(&self, raw: &str) -> bool {
        match self {
            Side::Name(s) => s.eq_ignore_ascii_case(raw.trim()),
            Side::Participant(id) => id == raw.trim(),
        }
    }

    /// Two sides of the same round must not refer to the same thing.
    pub fn conflicts_with(&self, other: &Side) -> bool {
        match (self, other) {
            (Side::Name(a), Side::Name(b)) => a.eq_ignore_ascii_case(b),
            (Side::Participant(a), Side::Participant(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            Side::Name(_) => "name",
            Side::Participant(_) => "participant",
        }
    }

    pub(crate) fn from_parts(kind: &str, label: String) -> Side {
        match kind {
            "participant" => Side::Participant(label),
            _ => Side::Name(label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Match,
    Event,
}

impl RoundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundKind::Match => "match",
            RoundKind::Event => "event",
        }
    }

    pub fn from_str(s: &str) -> Option<RoundKind> {
        match s {
            "match" => Some(RoundKind::Match),
            "event" => Some(RoundKind::Event),
            _ => None,
        }
    }
}

/// Lifecycle status. Only moves forward: pending -> started -> done,
/// with canceled reachable from pending and started. Done and canceled
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Started,
    Done,
    Canceled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Started => "started",
            RoundStatus::Done => "done",
            RoundStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<RoundStatus> {
        match s {
            "pending" => Some(RoundStatus::Pending),
            "started" => Some(RoundStatus::Started),
            "done" => Some(RoundStatus::Done),
            "canceled" => Some(RoundStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Done | RoundStatus::Canceled)
    }
}

/// A single wagering opportunity: a match (two teams or two participants)
/// or a yes/no event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: i64,
    pub kind: RoundKind,
    pub side_a: Side,
    pub side_b: Side,
    pub description: Option<String>,
    pub related_user: Option<String>,
    pub status: RoundStatus,
    /// Label of the winning side, set only at settlement.
    pub winner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    /// Resolve a raw side string from a caller against this round's sides.
    pub fn side_for(&self, raw: &str) -> Option<&Side> {
        if self.side_a.matches(raw) {
            Some(&self.side_a)
        } else if self.side_b.matches(raw) {
            Some(&self.side_b)
        } else {
            None
        }
    }
}

/// Fields for a round about to be persisted.
#[derive(Debug, Clone)]
pub struct NewRound {
    pub kind: RoundKind,
    pub side_a: Side,
    pub side_b: Side,
    pub description: Option<String>,
    pub related_user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerOutcome {
    Pending,
    Win,
    Loss,
    Refund,
}

impl WagerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerOutcome::Pending => "pending",
            WagerOutcome::Win => "win",
            WagerOutcome::Loss => "loss",
            WagerOutcome::Refund => "refund",
        }
    }

    pub fn from_str(s: &str) -> Option<WagerOutcome> {
        match s {
            "pending" => Some(WagerOutcome::Pending),
            "win" => Some(WagerOutcome::Win),
            "loss" => Some(WagerOutcome::Loss),
            "refund" => Some(WagerOutcome::Refund),
            _ => None,
        }
    }
}

/// One user's stake on one round. Never deleted; outcome mutated exactly
/// once, at settlement or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: i64,
    pub round_id: i64,
    pub user_id: String,
    /// Canonical label of the chosen side.
    pub side: String,
    pub amount: i64,
    pub outcome: WagerOutcome,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWager {
    pub round_id: i64,
    pub user_id: String,
    pub side: String,
    pub amount: i64,
}

/// Business-rule failures. These are returned to callers as values inside
/// an [`OperationResult`], never raised across the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundError {
    #[error("Round not found")]
    NotFound,
    #[error("The two sides must be different")]
    InvalidSides,
    #[error("'{0}' is not a valid side for this round")]
    InvalidSide(String),
    #[error("Bet amount must be a positive whole number")]
    InvalidAmount,
    #[error("You already have a bet on this round")]
    DuplicateWager,
    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: i64, need: i64 },
    #[error("Betting is closed for this round")]
    BettingClosed,
    #[error("Round is already finalized")]
    AlreadyFinal,
    #[error("Round was canceled")]
    AlreadyCanceled,
}

/// Uniform result shape for every public engine operation. The
/// presentation layer renders `message` directly and never needs to
/// inspect errors for expected failures.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(err: RoundError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
        }
    }

    pub fn fail_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_sides_match_case_insensitively() {
        let side = Side::Name("Red".to_string());
        assert!(side.matches("red"));
        assert!(side.matches(" RED "));
        assert!(!side.matches("blue"));
    }

    #[test]
    fn test_participant_sides_match_exactly() {
        let side = Side::Participant("12345".to_string());
        assert!(side.matches("12345"));
        assert!(!side.matches("12346"));
    }

    #[test]
    fn test_side_conflicts() {
        let red = Side::Name("Red".to_string());
        let red_upper = Side::Name("RED".to_string());
        let blue = Side::Name("Blue".to_string());
        assert!(red.conflicts_with(&red_upper));
        assert!(!red.conflicts_with(&blue));

        // A participant id never conflicts with a team name, even if the
        // strings happen to collide.
        let id = Side::Participant("Red".to_string());
        assert!(!red.conflicts_with(&id));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RoundStatus::Pending,
            RoundStatus::Started,
            RoundStatus::Done,
            RoundStatus::Canceled,
        ] {
            assert_eq!(RoundStatus::from_str(status.as_str()), Some(status));
        }
        assert!(RoundStatus::from_str("bogus").is_none());
        assert!(RoundStatus::Done.is_terminal());
        assert!(RoundStatus::Canceled.is_terminal());
        assert!(!RoundStatus::Pending.is_terminal());
    }

    #[test]
    fn test_operation_result_messages() {
        let res = OperationResult::fail(RoundError::DuplicateWager);
        assert!(!res.success);
        assert!(res.message.contains("already have a bet"));

        let res = OperationResult::fail(RoundError::InsufficientBalance { have: 10, need: 50 });
        assert!(res.message.contains("have 10"));
        assert!(res.message.contains("need 50"));
    }
}
