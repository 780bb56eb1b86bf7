//! Virtual-currency ledger.
//!
//! Holds per-user balances plus an append-only transaction trail. The
//! lifecycle engine is a client of the [`Ledger`] trait only; the SQLite
//! implementation here is the production backend, and tests may substitute
//! their own.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Why a balance changed. Every adjustment records one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Bet,
    Payout,
    Refund,
    Init,
    Donate,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::Bet => "bet",
            LedgerReason::Payout => "payout",
            LedgerReason::Refund => "refund",
            LedgerReason::Init => "init",
            LedgerReason::Donate => "donate",
        }
    }
}

/// One row of the audit trail. The engine writes these through
/// [`Ledger::adjust`] and never reads them back for decision-making.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub user_id: String,
    pub delta: i64,
    pub reason: String,
    pub ref_id: Option<i64>,
    pub balance_after: i64,
    pub created_at: String,
}

/// Balance-holding collaborator. Each call is atomic; the engine
/// pre-checks balances so `adjust` is never asked to go negative during
/// normal operation, but the implementation still refuses to.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64>;

    /// Apply `delta` to the user's balance and append an audit record.
    /// Returns the new balance.
    async fn adjust(
        &self,
        user_id: &str,
        delta: i64,
        reason: LedgerReason,
        ref_id: Option<i64>,
    ) -> Result<i64>;
}

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    starting_balance: i64,
}

impl SqliteLedger {
    pub fn new(db_path: &str, starting_balance: i64) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                delta INTEGER NOT NULL,
                reason TEXT NOT NULL,
                ref_id INTEGER,
                balance_after INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, created_at DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            starting_balance,
        })
    }

    /// Read the balance, seeding new users with the starting balance
    /// (recorded as an `init` transaction).
    fn seeded_balance(&self, conn: &Connection, user_id: &str) -> Result<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT balance FROM balances WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some(balance) = existing {
            return Ok(balance);
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO balances (user_id, balance, updated_at) VALUES (?1, ?2, ?3)",
            params![user_id, self.starting_balance, &now],
        )?;
        Self::record_tx(
            conn,
            user_id,
            self.starting_balance,
            LedgerReason::Init,
            None,
            self.starting_balance,
        )?;
        Ok(self.starting_balance)
    }

    fn record_tx(
        conn: &Connection,
        user_id: &str,
        delta: i64,
        reason: LedgerReason,
        ref_id: Option<i64>,
        balance_after: i64,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO transactions (id, user_id, delta, reason, ref_id, balance_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                delta,
                reason.as_str(),
                ref_id,
                balance_after,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("insert ledger transaction")?;
        Ok(())
    }

    /// Move currency between two users. Used by the donate surface, not
    /// by the lifecycle engine.
    pub async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<(i64, i64)> {
        if amount <= 0 {
            bail!("transfer amount must be positive");
        }
        let conn = self.conn.lock().await;
        let from_balance = self.seeded_balance(&conn, from)?;
        if from_balance < amount {
            bail!("insufficient balance: have {}, need {}", from_balance, amount);
        }
        let to_balance = self.seeded_balance(&conn, to)?;

        let now = Utc::now().to_rfc3339();
        let new_from = from_balance - amount;
        let new_to = to_balance + amount;
        conn.execute(
            "UPDATE balances SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![new_from, &now, from],
        )?;
        conn.execute(
            "UPDATE balances SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![new_to, &now, to],
        )?;
        Self::record_tx(&conn, from, -amount, LedgerReason::Donate, None, new_from)?;
        Self::record_tx(&conn, to, amount, LedgerReason::Donate, None, new_to)?;
        Ok((new_from, new_to))
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, delta, reason, ref_id, balance_after, created_at
             FROM transactions WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], |row| {
            Ok(LedgerTransaction {
                id: row.get(0)?,
                user_id: row.get(1)?,
                delta: row.get(2)?,
                reason: row.get(3)?,
                ref_id: row.get(4)?,
                balance_after: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn balance(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        self.seeded_balance(&conn, user_id)
    }

    async fn adjust(
        &self,
        user_id: &str,
        delta: i64,
        reason: LedgerReason,
        ref_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let balance = self.seeded_balance(&conn, user_id)?;
        let new_balance = balance + delta;
        if new_balance < 0 {
            bail!(
                "ledger adjustment would go negative: {} {} {}",
                user_id,
                balance,
                delta
            );
        }

        conn.execute(
            "UPDATE balances SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![new_balance, Utc::now().to_rfc3339(), user_id],
        )?;
        Self::record_tx(&conn, user_id, delta, reason, ref_id, new_balance)?;
        Ok(new_balance)
    }
}
