//! Round lifecycle engine.
//!
//! One state machine drives both matches and events; the only per-kind
//! variance is how sides are built and validated at creation time. All
//! public operations return an [`OperationResult`] so the presentation
//! layer always has a message to show, and business-rule failures never
//! surface as errors.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex as ParkingMutex;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::ledger::{Ledger, LedgerReason};
use crate::rounds::scheduler::TimerScheduler;
use crate::rounds::store::RoundStore;
use crate::rounds::types::{
    NewRound, NewWager, OperationResult, Round, RoundError, RoundKind, RoundStatus, Side, Wager,
    WagerOutcome,
};

/// Fixed betting window: wagers are admitted for this long after creation.
pub const BETTING_WINDOW: Duration = Duration::from_secs(300);

/// How the two sides of a new match are specified.
#[derive(Debug, Clone)]
pub enum MatchSides {
    /// Free-text team names.
    Teams { a: String, b: String },
    /// Two distinct user identities betting on themselves.
    Participants { a: String, b: String },
}

impl MatchSides {
    fn into_sides(self) -> Result<(Side, Side), RoundError> {
        let (a, b) = match self {
            MatchSides::Teams { a, b } => {
                let a = a.trim().to_string();
                let b = b.trim().to_string();
                if a.is_empty() || b.is_empty() {
                    return Err(RoundError::InvalidSides);
                }
                (Side::Name(a), Side::Name(b))
            }
            MatchSides::Participants { a, b } => {
                let a = a.trim().to_string();
                let b = b.trim().to_string();
                if a.is_empty() || b.is_empty() {
                    return Err(RoundError::InvalidSides);
                }
                (Side::Participant(a), Side::Participant(b))
            }
        };
        if a.conflicts_with(&b) {
            return Err(RoundError::InvalidSides);
        }
        Ok((a, b))
    }
}

#[derive(Clone)]
pub struct RoundEngine {
    store: RoundStore,
    ledger: Arc<dyn Ledger>,
    scheduler: TimerScheduler,
    window: Duration,
    /// Per-round admission locks so two place_wager calls for the same
    /// round cannot interleave between duplicate-check and write.
    admission: Arc<ParkingMutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl RoundEngine {
    pub fn new(
        store: RoundStore,
        ledger: Arc<dyn Ledger>,
        scheduler: TimerScheduler,
        window: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            scheduler,
            window,
            admission: Arc::new(ParkingMutex::new(HashMap::new())),
        }
    }

    pub fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }

    fn round_lock(&self, round_id: i64) -> Arc<Mutex<()>> {
        self.admission
            .lock()
            .entry(round_id)
            .or_default()
            .clone()
    }

    fn drop_round_lock(&self, round_id: i64) {
        self.admission.lock().remove(&round_id);
    }

    fn arm_auto_close(&self, round_id: i64, delay: Duration) {
        let engine = self.clone();
        self.scheduler.arm(round_id, delay, async move {
            info!(round_id, "betting window elapsed, auto-closing round");
            if let Err(e) = engine.close_round(round_id).await {
                warn!(round_id, error = %e, "auto-close failed");
            }
        });
    }

    fn remaining_window(&self, round: &Round) -> Duration {
        if round.status != RoundStatus::Pending {
            return Duration::ZERO;
        }
        let elapsed = Utc::now()
            .signed_duration_since(round.created_at)
            .num_seconds()
            .max(0) as u64;
        Duration::from_secs(self.window.as_secs().saturating_sub(elapsed))
    }

    /// Create a match between two teams or two participants.
    pub async fn create_match(
        &self,
        sides: MatchSides,
        description: Option<String>,
    ) -> Result<OperationResult> {
        let (side_a, side_b) = match sides.into_sides() {
            Ok(sides) => sides,
            Err(e) => return Ok(OperationResult::fail(e)),
        };
        self.create_round(NewRound {
            kind: RoundKind::Match,
            side_a,
            side_b,
            description,
            related_user: None,
        })
        .await
    }

    /// Create a yes/no event, optionally tied to a user.
    pub async fn create_event(
        &self,
        description: Option<String>,
        related_user: Option<String>,
    ) -> Result<OperationResult> {
        self.create_round(NewRound {
            kind: RoundKind::Event,
            side_a: Side::Name("Yes".to_string()),
            side_b: Side::Name("No".to_string()),
            description,
            related_user,
        })
        .await
    }

    async fn create_round(&self, new: NewRound) -> Result<OperationResult> {
        let kind = new.kind;
        let round = self.store.create_round(new).await?;
        self.arm_auto_close(round.id, self.window);

        info!(
            round_id = round.id,
            kind = kind.as_str(),
            side_a = round.side_a.label(),
            side_b = round.side_b.label(),
            window_secs = self.window.as_secs(),
            "round created"
        );

        Ok(OperationResult::ok_with(
            format!(
                "{} vs {} — betting open for {}",
                round.side_a.label(),
                round.side_b.label(),
                format_window(self.window.as_secs()),
            ),
            json!({ "round": round }),
        ))
    }

    /// Seconds left in the betting window; 0 once closed or not found.
    pub async fn open_window(&self, round_id: i64) -> Result<u64> {
        match self.store.get_round(round_id).await? {
            Some(round) => Ok(self.remaining_window(&round).as_secs()),
            None => Ok(0),
        }
    }

    /// Admit one user's wager on an open round.
    ///
    /// Preconditions are checked in a fixed order and the first failure
    /// wins with no side effects. The wager is only persisted once the
    /// ledger debit succeeded, so no wager can exist without a matching
    /// debit.
    pub async fn place_wager(
        &self,
        round_id: i64,
        user_id: &str,
        side: &str,
        amount: i64,
    ) -> Result<OperationResult> {
        let lock = self.round_lock(round_id);
        let _guard = lock.lock().await;

        let Some(round) = self.store.get_round(round_id).await? else {
            return Ok(OperationResult::fail(RoundError::NotFound));
        };
        if round.status != RoundStatus::Pending {
            return Ok(OperationResult::fail(RoundError::BettingClosed));
        }

        let remaining = self.remaining_window(&round);
        if remaining.is_zero() {
            // The timer never fired (missed tick, restart before
            // rehydration). Close on the spot before rejecting.
            info!(round_id, "betting window elapsed, lazy-closing round");
            self.close_inner(&round).await?;
            return Ok(OperationResult::fail(RoundError::BettingClosed));
        }

        let Some(chosen) = round.side_for(side) else {
            return Ok(OperationResult::fail(RoundError::InvalidSide(
                side.trim().to_string(),
            )));
        };
        let chosen = chosen.label().to_string();

        if amount <= 0 {
            return Ok(OperationResult::fail(RoundError::InvalidAmount));
        }
        if self.store.has_wager(user_id, round_id).await? {
            return Ok(OperationResult::fail(RoundError::DuplicateWager));
        }

        let balance = self.ledger.balance(user_id).await?;
        if balance < amount {
            return Ok(OperationResult::fail(RoundError::InsufficientBalance {
                have: balance,
                need: amount,
            }));
        }

        let wager = self
            .store
            .create_wager(NewWager {
                round_id,
                user_id: user_id.to_string(),
                side: chosen.clone(),
                amount,
            })
            .await?;

        let new_balance = match self
            .ledger
            .adjust(user_id, -amount, LedgerReason::Bet, Some(wager.id))
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                // Roll back the admission so no wager exists without a
                // matching debit.
                if let Err(del_err) = self.store.delete_wager(wager.id).await {
                    error!(
                        wager_id = wager.id,
                        debit_error = %e,
                        delete_error = %del_err,
                        "debit failed and wager rollback failed, wager row has no matching debit"
                    );
                    return Err(e.context(format!(
                        "ledger debit failed and wager {} could not be rolled back",
                        wager.id
                    )));
                }
                return Err(e);
            }
        };

        info!(
            round_id,
            wager_id = wager.id,
            user_id,
            side = %chosen,
            amount,
            "wager placed"
        );

        Ok(OperationResult::ok_with(
            format!(
                "Bet of {} placed on {} — {} left to bet",
                amount,
                chosen,
                format_window(remaining.as_secs()),
            ),
            json!({
                "wager": wager,
                "balance": new_balance,
                "window_seconds": remaining.as_secs(),
            }),
        ))
    }

    /// Close betting on a round. Idempotent: closing a round that is no
    /// longer pending is a no-op success, so the timer, the lazy
    /// self-heal and an explicit "start now" cannot race each other into
    /// trouble.
    pub async fn close_round(&self, round_id: i64) -> Result<OperationResult> {
        let lock = self.round_lock(round_id);
        let _guard = lock.lock().await;

        let Some(round) = self.store.get_round(round_id).await? else {
            return Ok(OperationResult::fail(RoundError::NotFound));
        };
        if round.status != RoundStatus::Pending {
            return Ok(OperationResult::ok("Betting is already closed"));
        }
        self.close_inner(&round).await
    }

    /// Shared closing path; callers must already hold the round lock (or
    /// be on the place_wager self-heal path, which does).
    async fn close_inner(&self, round: &Round) -> Result<OperationResult> {
        self.scheduler.disarm(round.id);
        let updated = self.store.update_status(round.id, RoundStatus::Started).await?;

        let wagers = self.store.list_by_round(round.id).await?;
        let stats = side_stats(round, &wagers);

        info!(
            round_id = round.id,
            wagers = wagers.len(),
            "betting closed, awaiting result"
        );

        Ok(OperationResult::ok_with(
            format!("Betting closed — {} bets in", wagers.len()),
            json!({
                "round_id": round.id,
                "started_at": updated.and_then(|r| r.started_at),
                "sides": stats,
                "total_wagers": wagers.len(),
                "total_staked": wagers.iter().map(|w| w.amount).sum::<i64>(),
            }),
        ))
    }

    /// Cancel a round and refund every stake at face value.
    ///
    /// Not idempotent: a done or already-canceled round reports
    /// `AlreadyFinal`. Refunds are best-effort per wager; one stuck
    /// ledger call must not block the remaining refunds, so failures are
    /// counted and surfaced rather than aborting the loop.
    pub async fn cancel_round(&self, round_id: i64) -> Result<OperationResult> {
        let lock = self.round_lock(round_id);
        let _guard = lock.lock().await;

        let Some(round) = self.store.get_round(round_id).await? else {
            return Ok(OperationResult::fail(RoundError::NotFound));
        };
        if round.status.is_terminal() {
            return Ok(OperationResult::fail(RoundError::AlreadyFinal));
        }

        self.scheduler.disarm(round_id);
        self.store
            .update_status(round_id, RoundStatus::Canceled)
            .await?;

        let wagers = self.store.list_by_round(round_id).await?;
        let mut refunded = 0usize;
        let mut failures = 0usize;
        for wager in &wagers {
            match self
                .ledger
                .adjust(
                    &wager.user_id,
                    wager.amount,
                    LedgerReason::Refund,
                    Some(wager.id),
                )
                .await
            {
                Ok(_) => {
                    if let Err(e) = self
                        .store
                        .update_outcome(wager.id, WagerOutcome::Refund)
                        .await
                    {
                        warn!(wager_id = wager.id, error = %e, "refund credited but outcome not recorded");
                        failures += 1;
                    } else {
                        refunded += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        wager_id = wager.id,
                        user_id = %wager.user_id,
                        error = %e,
                        "refund failed, continuing with remaining wagers"
                    );
                    failures += 1;
                }
            }
        }

        drop(_guard);
        self.drop_round_lock(round_id);

        info!(round_id, refunded, failures, "round canceled");

        let data = json!({ "refunded": refunded, "failures": failures });
        if failures > 0 {
            Ok(OperationResult::fail_with(
                format!(
                    "Round canceled, but {} of {} refunds failed",
                    failures,
                    wagers.len()
                ),
                data,
            ))
        } else {
            Ok(OperationResult::ok_with(
                format!("Round canceled, {} bets refunded", refunded),
                data,
            ))
        }
    }

    /// Set the outcome and settle every wager exactly once. Winners are
    /// credited twice their stake; losers are marked and left alone.
    pub async fn settle_round(&self, round_id: i64, winning_side: &str) -> Result<OperationResult> {
        let lock = self.round_lock(round_id);
        let _guard = lock.lock().await;

        let Some(round) = self.store.get_round(round_id).await? else {
            return Ok(OperationResult::fail(RoundError::NotFound));
        };
        let Some(winner) = round.side_for(winning_side) else {
            return Ok(OperationResult::fail(RoundError::InvalidSide(
                winning_side.trim().to_string(),
            )));
        };
        let winner = winner.label().to_string();

        match round.status {
            RoundStatus::Canceled => {
                return Ok(OperationResult::fail(RoundError::AlreadyCanceled))
            }
            RoundStatus::Done => return Ok(OperationResult::fail(RoundError::AlreadyFinal)),
            RoundStatus::Pending => {
                // Result arrived before the window elapsed; close betting
                // first so the status only ever moves forward.
                self.close_inner(&round).await?;
            }
            RoundStatus::Started => {}
        }

        // Mark the round done before paying out: re-invocation is rejected
        // up front, so payouts can never be applied twice.
        self.store.set_winner(round_id, &winner).await?;
        self.store.update_status(round_id, RoundStatus::Done).await?;

        let wagers = self.store.list_by_round(round_id).await?;
        let mut winners = 0usize;
        let mut losers = 0usize;
        let mut total_paid = 0i64;
        let mut failures = 0usize;

        for wager in &wagers {
            if wager.side == winner {
                let payout = wager.amount * 2;
                match self
                    .ledger
                    .adjust(&wager.user_id, payout, LedgerReason::Payout, Some(wager.id))
                    .await
                {
                    Ok(_) => {
                        if let Err(e) = self.store.update_outcome(wager.id, WagerOutcome::Win).await
                        {
                            warn!(wager_id = wager.id, error = %e, "payout credited but outcome not recorded");
                            failures += 1;
                        } else {
                            winners += 1;
                            total_paid += payout;
                        }
                    }
                    Err(e) => {
                        warn!(
                            wager_id = wager.id,
                            user_id = %wager.user_id,
                            error = %e,
                            "payout failed, continuing with remaining wagers"
                        );
                        failures += 1;
                    }
                }
            } else {
                match self.store.update_outcome(wager.id, WagerOutcome::Loss).await {
                    Ok(_) => losers += 1,
                    Err(e) => {
                        warn!(wager_id = wager.id, error = %e, "failed to record loss");
                        failures += 1;
                    }
                }
            }
        }

        drop(_guard);
        self.drop_round_lock(round_id);

        info!(
            round_id,
            winner = %winner,
            winners,
            losers,
            total_paid,
            failures,
            "round settled"
        );

        let data = json!({
            "winner": winner,
            "winners": winners,
            "losers": losers,
            "total_paid": total_paid,
            "failures": failures,
        });
        if failures > 0 {
            Ok(OperationResult::fail_with(
                format!("Round settled, but {} payouts failed", failures),
                data,
            ))
        } else {
            Ok(OperationResult::ok_with(
                format!("{} wins! Paid out {} to {} bettors", winner, total_paid, winners),
                data,
            ))
        }
    }

    pub async fn get_round(&self, round_id: i64) -> Result<Option<Round>> {
        self.store.get_round(round_id).await
    }

    pub async fn active_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        self.store
            .list_by_status(&[RoundStatus::Pending, RoundStatus::Started], limit)
            .await
    }

    pub async fn recent_rounds(&self, limit: usize) -> Result<Vec<Round>> {
        self.store.list_recent(limit).await
    }

    pub async fn wagers(&self, round_id: i64) -> Result<Vec<Wager>> {
        self.store.list_by_round(round_id).await
    }

    /// Rebuild in-memory timers from the store after a restart: re-arm
    /// the remainder of each pending round's window, or close immediately
    /// if it elapsed while the process was down.
    pub async fn rehydrate(&self) -> Result<(usize, usize)> {
        let pending = self.store.list_by_status(&[RoundStatus::Pending], 1000).await?;
        let mut rearmed = 0usize;
        let mut closed = 0usize;

        for round in pending {
            let remaining = self.remaining_window(&round);
            if remaining.is_zero() {
                info!(round_id = round.id, "window elapsed while down, closing");
                if let Err(e) = self.close_round(round.id).await {
                    warn!(round_id = round.id, error = %e, "rehydration close failed");
                } else {
                    closed += 1;
                }
            } else {
                self.arm_auto_close(round.id, remaining);
                rearmed += 1;
            }
        }

        info!(rearmed, closed, "timer rehydration complete");
        Ok((rearmed, closed))
    }
}

fn side_stats(round: &Round, wagers: &[Wager]) -> serde_json::Value {
    let mut stats = Vec::with_capacity(2);
    for side in [&round.side_a, &round.side_b] {
        let label = side.label();
        let on_side: Vec<&Wager> = wagers.iter().filter(|w| w.side == label).collect();
        stats.push(json!({
            "side": label,
            "wagers": on_side.len(),
            "total_staked": on_side.iter().map(|w| w.amount).sum::<i64>(),
        }));
    }
    serde_json::Value::Array(stats)
}

fn format_window(secs: u64) -> String {
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;
    use tempfile::NamedTempFile;

    struct TestHarness {
        engine: RoundEngine,
        ledger: Arc<SqliteLedger>,
        store: RoundStore,
        _files: (NamedTempFile, NamedTempFile),
    }

    fn harness_with_window(window: Duration) -> TestHarness {
        let rounds_db = NamedTempFile::new().unwrap();
        let ledger_db = NamedTempFile::new().unwrap();
        let store = RoundStore::new(rounds_db.path().to_str().unwrap()).unwrap();
        let ledger = Arc::new(SqliteLedger::new(ledger_db.path().to_str().unwrap(), 1000).unwrap());
        let engine = RoundEngine::new(
            store.clone(),
            ledger.clone(),
            TimerScheduler::new(),
            window,
        );
        TestHarness {
            engine,
            ledger,
            store,
            _files: (rounds_db, ledger_db),
        }
    }

    fn harness() -> TestHarness {
        harness_with_window(BETTING_WINDOW)
    }

    fn round_id(res: &OperationResult) -> i64 {
        res.data.as_ref().unwrap()["round"]["id"].as_i64().unwrap()
    }

    async fn new_match(engine: &RoundEngine, a: &str, b: &str) -> i64 {
        let res = engine
            .create_match(
                MatchSides::Teams {
                    a: a.to_string(),
                    b: b.to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(res.success, "{}", res.message);
        round_id(&res)
    }

    /// Ledger double wrapping the real SQLite ledger; once `fail_for` is
    /// set, every adjustment for that user errors. Lets the batch loops
    /// run against a backend that misbehaves for one user only.
    struct FailingUserLedger {
        inner: Arc<SqliteLedger>,
        fail_user: ParkingMutex<Option<String>>,
    }

    impl FailingUserLedger {
        fn fail_for(&self, user: &str) {
            *self.fail_user.lock() = Some(user.to_string());
        }
    }

    #[async_trait::async_trait]
    impl Ledger for FailingUserLedger {
        async fn balance(&self, user_id: &str) -> Result<i64> {
            self.inner.balance(user_id).await
        }

        async fn adjust(
            &self,
            user_id: &str,
            delta: i64,
            reason: LedgerReason,
            ref_id: Option<i64>,
        ) -> Result<i64> {
            if self.fail_user.lock().as_deref() == Some(user_id) {
                anyhow::bail!("ledger unavailable for {user_id}");
            }
            self.inner.adjust(user_id, delta, reason, ref_id).await
        }
    }

    struct FlakyHarness {
        engine: RoundEngine,
        ledger: Arc<FailingUserLedger>,
        balances: Arc<SqliteLedger>,
        _files: (NamedTempFile, NamedTempFile),
    }

    fn flaky_harness() -> FlakyHarness {
        let rounds_db = NamedTempFile::new().unwrap();
        let ledger_db = NamedTempFile::new().unwrap();
        let store = RoundStore::new(rounds_db.path().to_str().unwrap()).unwrap();
        let balances =
            Arc::new(SqliteLedger::new(ledger_db.path().to_str().unwrap(), 1000).unwrap());
        let ledger = Arc::new(FailingUserLedger {
            inner: balances.clone(),
            fail_user: ParkingMutex::new(None),
        });
        let engine = RoundEngine::new(
            store,
            ledger.clone(),
            TimerScheduler::new(),
            BETTING_WINDOW,
        );
        FlakyHarness {
            engine,
            ledger,
            balances,
            _files: (rounds_db, ledger_db),
        }
    }

    #[tokio::test]
    async fn test_failed_debit_leaves_no_wager() {
        let h = flaky_harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        h.ledger.fail_for("u1");
        assert!(h.engine.place_wager(id, "u1", "Red", 100).await.is_err());

        // The admission was rolled back: no wager row, no debit.
        assert!(h.engine.wagers(id).await.unwrap().is_empty());
        assert_eq!(h.balances.balance("u1").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_cancel_surfaces_partial_refund_failures() {
        let h = flaky_harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        assert!(h.engine.place_wager(id, "u1", "Red", 100).await.unwrap().success);
        assert!(h.engine.place_wager(id, "u2", "Blue", 40).await.unwrap().success);

        h.ledger.fail_for("u2");
        let res = h.engine.cancel_round(id).await.unwrap();
        assert!(!res.success);
        let data = res.data.unwrap();
        assert_eq!(data["failures"], 1);
        assert_eq!(data["refunded"], 1);

        // The other bettor was still made whole.
        assert_eq!(h.balances.balance("u1").await.unwrap(), 1000);
        assert_eq!(h.balances.balance("u2").await.unwrap(), 960);

        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Canceled);
        let wagers = h.engine.wagers(id).await.unwrap();
        assert_eq!(wagers[0].outcome, WagerOutcome::Refund);
        assert_eq!(wagers[1].outcome, WagerOutcome::Pending);
    }

    #[tokio::test]
    async fn test_settle_surfaces_partial_payout_failures() {
        let h = flaky_harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        assert!(h.engine.place_wager(id, "u1", "Red", 100).await.unwrap().success);
        assert!(h.engine.place_wager(id, "u2", "Red", 50).await.unwrap().success);
        assert!(h.engine.place_wager(id, "u3", "Blue", 30).await.unwrap().success);

        h.ledger.fail_for("u2");
        let res = h.engine.settle_round(id, "Red").await.unwrap();
        assert!(!res.success);
        let data = res.data.unwrap();
        assert_eq!(data["failures"], 1);
        assert_eq!(data["winners"], 1);
        assert_eq!(data["losers"], 1);
        assert_eq!(data["total_paid"], 200);

        // One stuck payout does not block the other winner.
        assert_eq!(h.balances.balance("u1").await.unwrap(), 1100);
        assert_eq!(h.balances.balance("u2").await.unwrap(), 950);
        assert_eq!(h.balances.balance("u3").await.unwrap(), 970);

        // The round is final regardless; the failed payout stays pending
        // for operator follow-up and is never silently retried.
        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Done);
        let wagers = h.engine.wagers(id).await.unwrap();
        assert_eq!(wagers[1].outcome, WagerOutcome::Pending);
    }

    #[tokio::test]
    async fn test_create_match_rejects_equal_sides() {
        let h = harness();

        let res = h
            .engine
            .create_match(
                MatchSides::Teams {
                    a: "Red".to_string(),
                    b: "RED".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::InvalidSides.to_string());

        let res = h
            .engine
            .create_match(
                MatchSides::Participants {
                    a: "111".to_string(),
                    b: "111".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(!res.success);
    }

    #[tokio::test]
    async fn test_create_match_arms_timer() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        assert_eq!(h.engine.scheduler().armed_count(), 1);
        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Pending);
        assert!(h.engine.open_window(id).await.unwrap() > 290);
    }

    #[tokio::test]
    async fn test_open_window_zero_for_unknown_round() {
        let h = harness();
        assert_eq!(h.engine.open_window(404).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_place_wager_happy_path_debits_ledger() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        let res = h.engine.place_wager(id, "u1", "red", 100).await.unwrap();
        assert!(res.success, "{}", res.message);
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 900);

        let wagers = h.engine.wagers(id).await.unwrap();
        assert_eq!(wagers.len(), 1);
        // Canonical label, not the raw lowercase input.
        assert_eq!(wagers[0].side, "Red");
        assert_eq!(wagers[0].outcome, WagerOutcome::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_wager_rejected_without_ledger_effect() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        assert!(h.engine.place_wager(id, "u1", "Red", 100).await.unwrap().success);
        let res = h.engine.place_wager(id, "u1", "Blue", 50).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::DuplicateWager.to_string());

        assert_eq!(h.ledger.balance("u1").await.unwrap(), 900);
        assert_eq!(h.engine.wagers(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        for amount in [0, -5] {
            let res = h.engine.place_wager(id, "u1", "Red", amount).await.unwrap();
            assert!(!res.success);
            assert_eq!(res.message, RoundError::InvalidAmount.to_string());
        }
        assert!(h.engine.wagers(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        let res = h.engine.place_wager(id, "u1", "Red", 5000).await.unwrap();
        assert!(!res.success);
        assert!(res.message.contains("Insufficient balance"));
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_event_rejects_unknown_side() {
        let h = harness();
        let res = h.engine.create_event(Some("rank up?".to_string()), None).await.unwrap();
        let id = round_id(&res);

        let res = h.engine.place_wager(id, "u1", "Maybe", 10).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::InvalidSide("Maybe".to_string()).to_string());

        // Yes/No match case-insensitively.
        assert!(h.engine.place_wager(id, "u1", "yes", 10).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_wager_not_found() {
        let h = harness();
        let res = h.engine.place_wager(999, "u1", "Red", 10).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::NotFound.to_string());
    }

    #[tokio::test]
    async fn test_elapsed_window_lazy_closes_round() {
        // A zero-length window simulates a round whose window elapsed
        // without the timer firing.
        let h = harness_with_window(Duration::ZERO);
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.scheduler().disarm(id);

        let res = h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::BettingClosed.to_string());

        // The rejection itself flipped the round to started.
        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Started);
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reports_stats() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();
        h.engine.place_wager(id, "u2", "Red", 50).await.unwrap();
        h.engine.place_wager(id, "u3", "Blue", 25).await.unwrap();

        let res = h.engine.close_round(id).await.unwrap();
        assert!(res.success);
        let data = res.data.unwrap();
        assert_eq!(data["total_wagers"], 3);
        assert_eq!(data["total_staked"], 175);
        assert_eq!(data["sides"][0]["side"], "Red");
        assert_eq!(data["sides"][0]["wagers"], 2);
        assert_eq!(data["sides"][0]["total_staked"], 150);
        assert_eq!(data["sides"][1]["total_staked"], 25);
        assert_eq!(h.engine.scheduler().armed_count(), 0);

        // Second close: no-op success, status unchanged.
        let res = h.engine.close_round(id).await.unwrap();
        assert!(res.success);
        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Started);
        assert!(round.started_at.is_some());

        // Betting after close is rejected.
        let res = h.engine.place_wager(id, "u4", "Red", 10).await.unwrap();
        assert_eq!(res.message, RoundError::BettingClosed.to_string());
    }

    #[tokio::test]
    async fn test_cancel_refunds_exact_stakes() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();
        h.engine.place_wager(id, "u2", "Blue", 40).await.unwrap();
        h.engine.close_round(id).await.unwrap();

        // Cancel is legal from started too.
        let res = h.engine.cancel_round(id).await.unwrap();
        assert!(res.success, "{}", res.message);
        assert_eq!(res.data.unwrap()["refunded"], 2);

        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1000);
        assert_eq!(h.ledger.balance("u2").await.unwrap(), 1000);
        for wager in h.engine.wagers(id).await.unwrap() {
            assert_eq!(wager.outcome, WagerOutcome::Refund);
        }
        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Canceled);

        // Cancel is not idempotent.
        let res = h.engine.cancel_round(id).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::AlreadyFinal.to_string());
    }

    #[tokio::test]
    async fn test_cancel_done_round_fails() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();
        h.engine.settle_round(id, "Red").await.unwrap();

        let res = h.engine.cancel_round(id).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::AlreadyFinal.to_string());
        // The payout stands.
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1100);
    }

    #[tokio::test]
    async fn test_settle_round_trip_nets_plus_100_minus_50() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();
        h.engine.place_wager(id, "u2", "Blue", 50).await.unwrap();

        let res = h.engine.settle_round(id, "Red").await.unwrap();
        assert!(res.success, "{}", res.message);
        let data = res.data.unwrap();
        assert_eq!(data["winners"], 1);
        assert_eq!(data["losers"], 1);
        assert_eq!(data["total_paid"], 200);

        // Winner: -100 stake +200 payout = net +100. Loser: net -50.
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1100);
        assert_eq!(h.ledger.balance("u2").await.unwrap(), 950);

        let round = h.engine.get_round(id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Done);
        assert_eq!(round.winner.as_deref(), Some("Red"));

        let wagers = h.engine.wagers(id).await.unwrap();
        assert_eq!(wagers[0].outcome, WagerOutcome::Win);
        assert_eq!(wagers[1].outcome, WagerOutcome::Loss);
    }

    #[tokio::test]
    async fn test_settle_twice_pays_exactly_once() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.place_wager(id, "u1", "Red", 100).await.unwrap();

        assert!(h.engine.settle_round(id, "Red").await.unwrap().success);
        let res = h.engine.settle_round(id, "Red").await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::AlreadyFinal.to_string());

        // Paid exactly once.
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 1100);
    }

    #[tokio::test]
    async fn test_settle_canceled_round_fails() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        h.engine.cancel_round(id).await.unwrap();

        let res = h.engine.settle_round(id, "Red").await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::AlreadyCanceled.to_string());
    }

    #[tokio::test]
    async fn test_settle_rejects_unknown_winner() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;
        let res = h.engine.settle_round(id, "Green").await.unwrap();
        assert!(!res.success);
        assert_eq!(res.message, RoundError::InvalidSide("Green".to_string()).to_string());
    }

    #[tokio::test]
    async fn test_concurrent_wagers_admit_only_one_per_user() {
        let h = harness();
        let id = new_match(&h.engine, "Red", "Blue").await;

        let (a, b) = tokio::join!(
            h.engine.place_wager(id, "u1", "Red", 100),
            h.engine.place_wager(id, "u1", "Blue", 100),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(a.success != b.success, "exactly one admission expected");

        assert_eq!(h.engine.wagers(id).await.unwrap().len(), 1);
        assert_eq!(h.ledger.balance("u1").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_rehydrate_rearms_and_closes() {
        let h = harness();
        let live = new_match(&h.engine, "Red", "Blue").await;
        let stale = new_match(&h.engine, "Ana", "Bea").await;

        // Simulate a restart: timers gone, one round's window long elapsed.
        h.engine.scheduler().disarm(live);
        h.engine.scheduler().disarm(stale);
        h.store
            .backdate_created_at(stale, Utc::now() - chrono::Duration::seconds(301))
            .await
            .unwrap();

        let (rearmed, closed) = h.engine.rehydrate().await.unwrap();
        assert_eq!(rearmed, 1);
        assert_eq!(closed, 1);

        assert_eq!(
            h.engine.get_round(stale).await.unwrap().unwrap().status,
            RoundStatus::Started
        );
        assert_eq!(
            h.engine.get_round(live).await.unwrap().unwrap().status,
            RoundStatus::Pending
        );
        assert_eq!(h.engine.scheduler().armed_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_events_can_coexist() {
        let h = harness();
        let e1 = round_id(&h.engine.create_event(None, None).await.unwrap());
        let e2 = round_id(&h.engine.create_event(None, None).await.unwrap());

        assert!(h.engine.place_wager(e1, "u1", "Yes", 10).await.unwrap().success);
        assert!(h.engine.place_wager(e2, "u1", "No", 10).await.unwrap().success);

        let active = h.engine.active_rounds(50).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_format_window() {
        assert_eq!(format_window(300), "5m 0s");
        assert_eq!(format_window(95), "1m 35s");
        assert_eq!(format_window(42), "42s");
    }
}
