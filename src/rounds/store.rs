//! SQLite persistence for rounds and wagers.
//!
//! A round owns its wagers; both live in the same database file so a
//! single connection (behind an async mutex) serializes all writes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::rounds::types::{NewRound, NewWager, Round, RoundKind, RoundStatus, Side, Wager, WagerOutcome};

#[derive(Clone)]
pub struct RoundStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<Round> {
    let kind_raw: String = row.get(1)?;
    let sides_kind: String = row.get(2)?;
    let status_raw: String = row.get(7)?;
    let started_at: Option<String> = row.get(10)?;

    Ok(Round {
        id: row.get(0)?,
        kind: RoundKind::from_str(&kind_raw).unwrap_or(RoundKind::Match),
        side_a: Side::from_parts(&sides_kind, row.get(3)?),
        side_b: Side::from_parts(&sides_kind, row.get(4)?),
        description: row.get(5)?,
        related_user: row.get(6)?,
        status: RoundStatus::from_str(&status_raw).unwrap_or(RoundStatus::Canceled),
        winner: row.get(8)?,
        created_at: parse_ts(9, row.get(9)?)?,
        started_at: match started_at {
            Some(raw) => Some(parse_ts(10, raw)?),
            None => None,
        },
        updated_at: parse_ts(11, row.get(11)?)?,
    })
}

fn wager_from_row(row: &Row<'_>) -> rusqlite::Result<Wager> {
    let outcome_raw: String = row.get(5)?;
    Ok(Wager {
        id: row.get(0)?,
        round_id: row.get(1)?,
        user_id: row.get(2)?,
        side: row.get(3)?,
        amount: row.get(4)?,
        outcome: WagerOutcome::from_str(&outcome_raw).unwrap_or(WagerOutcome::Pending),
        created_at: parse_ts(6, row.get(6)?)?,
    })
}

const ROUND_COLS: &str =
    "id, kind, sides_kind, side_a, side_b, description, related_user, status, winner, created_at, started_at, updated_at";
const WAGER_COLS: &str = "id, round_id, user_id, side, amount, outcome, created_at";

impl RoundStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open rounds db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                sides_kind TEXT NOT NULL,
                side_a TEXT NOT NULL,
                side_b TEXT NOT NULL,
                description TEXT,
                related_user TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                winner TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rounds_status ON rounds(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rounds_created ON rounds(created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wagers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                side TEXT NOT NULL,
                amount INTEGER NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                FOREIGN KEY (round_id) REFERENCES rounds(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wagers_round ON wagers(round_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wagers_user_round ON wagers(user_id, round_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create_round(&self, new: NewRound) -> Result<Round> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO rounds (kind, sides_kind, side_a, side_b, description, related_user, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            params![
                new.kind.as_str(),
                new.side_a.kind_str(),
                new.side_a.label(),
                new.side_b.label(),
                new.description.as_deref(),
                new.related_user.as_deref(),
                &now,
            ],
        )
        .context("insert round")?;

        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {ROUND_COLS} FROM rounds WHERE id = ?1"))?;
        let round = stmt.query_row(params![id], round_from_row)?;
        Ok(round)
    }

    pub async fn get_round(&self, id: i64) -> Result<Option<Round>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {ROUND_COLS} FROM rounds WHERE id = ?1"))?;
        match stmt.query_row(params![id], round_from_row) {
            Ok(round) => Ok(Some(round)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a round's status. Transitioning to `started` also stamps
    /// `started_at`; every transition bumps `updated_at`.
    pub async fn update_status(&self, id: i64, status: RoundStatus) -> Result<Option<Round>> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().await;
            let changed = if status == RoundStatus::Started {
                conn.execute(
                    "UPDATE rounds SET status = ?1, started_at = ?2, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), &now, id],
                )?
            } else {
                conn.execute(
                    "UPDATE rounds SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), &now, id],
                )?
            };
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_round(id).await
    }

    pub async fn set_winner(&self, id: i64, winner: &str) -> Result<Option<Round>> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().await;
            let changed = conn.execute(
                "UPDATE rounds SET winner = ?1, updated_at = ?2 WHERE id = ?3",
                params![winner, &now, id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_round(id).await
    }

    pub async fn list_by_status(
        &self,
        statuses: &[RoundStatus],
        limit: usize,
    ) -> Result<Vec<Round>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {ROUND_COLS} FROM rounds WHERE status IN ({placeholders}) ORDER BY id DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(|s| s.as_str())),
            round_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Round>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ROUND_COLS} FROM rounds ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], round_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn create_wager(&self, new: NewWager) -> Result<Wager> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO wagers (round_id, user_id, side, amount, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![new.round_id, &new.user_id, &new.side, new.amount, &now],
        )
        .context("insert wager")?;

        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {WAGER_COLS} FROM wagers WHERE id = ?1"))?;
        let wager = stmt.query_row(params![id], wager_from_row)?;
        Ok(wager)
    }

    /// Remove a wager that never got its matching ledger debit. Only the
    /// place_wager rollback path uses this; settled wagers are never
    /// deleted.
    pub async fn delete_wager(&self, wager_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM wagers WHERE id = ?1", params![wager_id])
            .context("delete wager")?;
        Ok(())
    }

    pub async fn list_by_round(&self, round_id: i64) -> Result<Vec<Wager>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {WAGER_COLS} FROM wagers WHERE round_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![round_id], wager_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn has_wager(&self, user_id: &str, round_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM wagers WHERE user_id = ?1 AND round_id = ?2",
            params![user_id, round_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn update_outcome(
        &self,
        wager_id: i64,
        outcome: WagerOutcome,
    ) -> Result<Option<Wager>> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE wagers SET outcome = ?1 WHERE id = ?2",
            params![outcome.as_str(), wager_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {WAGER_COLS} FROM wagers WHERE id = ?1"))?;
        let wager = stmt.query_row(params![wager_id], wager_from_row)?;
        Ok(Some(wager))
    }

    /// Backdate a round's creation time. Test-only hook for simulating a
    /// betting window that elapsed while the process was down.
    #[cfg(test)]
    pub async fn backdate_created_at(&self, id: i64, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE rounds SET created_at = ?1 WHERE id = ?2",
            params![created_at.to_rfc3339(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_store() -> (RoundStore, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = RoundStore::new(temp.path().to_str().unwrap()).unwrap();
        (store, temp)
    }

    fn teams(a: &str, b: &str) -> NewRound {
        NewRound {
            kind: RoundKind::Match,
            side_a: Side::Name(a.to_string()),
            side_b: Side::Name(b.to_string()),
            description: None,
            related_user: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_round() {
        let (store, _temp) = test_store();

        let round = store.create_round(teams("Red", "Blue")).await.unwrap();
        assert_eq!(round.status, RoundStatus::Pending);
        assert_eq!(round.side_a.label(), "Red");
        assert!(round.started_at.is_none());
        assert!(round.winner.is_none());

        let fetched = store.get_round(round.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, round.id);
        assert_eq!(fetched.side_b, Side::Name("Blue".to_string()));

        assert!(store.get_round(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_stamps_started_at() {
        let (store, _temp) = test_store();
        let round = store.create_round(teams("Red", "Blue")).await.unwrap();

        let started = store
            .update_status(round.id, RoundStatus::Started)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.status, RoundStatus::Started);
        assert!(started.started_at.is_some());

        let done = store
            .update_status(round.id, RoundStatus::Done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, RoundStatus::Done);

        assert!(store
            .update_status(9999, RoundStatus::Done)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_participant_sides_survive_round_trip() {
        let (store, _temp) = test_store();
        let round = store
            .create_round(NewRound {
                kind: RoundKind::Match,
                side_a: Side::Participant("111".to_string()),
                side_b: Side::Participant("222".to_string()),
                description: None,
                related_user: None,
            })
            .await
            .unwrap();

        let fetched = store.get_round(round.id).await.unwrap().unwrap();
        assert_eq!(fetched.side_a, Side::Participant("111".to_string()));
        assert!(fetched.side_for("111").is_some());
        assert!(fetched.side_for("333").is_none());
    }

    #[tokio::test]
    async fn test_wager_crud() {
        let (store, _temp) = test_store();
        let round = store.create_round(teams("Red", "Blue")).await.unwrap();

        let wager = store
            .create_wager(NewWager {
                round_id: round.id,
                user_id: "u1".to_string(),
                side: "Red".to_string(),
                amount: 100,
            })
            .await
            .unwrap();
        assert_eq!(wager.outcome, WagerOutcome::Pending);

        assert!(store.has_wager("u1", round.id).await.unwrap());
        assert!(!store.has_wager("u2", round.id).await.unwrap());

        let updated = store
            .update_outcome(wager.id, WagerOutcome::Win)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.outcome, WagerOutcome::Win);

        let wagers = store.list_by_round(round.id).await.unwrap();
        assert_eq!(wagers.len(), 1);
        assert_eq!(wagers[0].amount, 100);
    }

    #[tokio::test]
    async fn test_list_by_status_filters_and_orders() {
        let (store, _temp) = test_store();
        let r1 = store.create_round(teams("A", "B")).await.unwrap();
        let r2 = store.create_round(teams("C", "D")).await.unwrap();
        store
            .update_status(r1.id, RoundStatus::Canceled)
            .await
            .unwrap();

        let open = store
            .list_by_status(&[RoundStatus::Pending, RoundStatus::Started], 50)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, r2.id);

        let recent = store.list_recent(50).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first.
        assert_eq!(recent[0].id, r2.id);
    }
}
