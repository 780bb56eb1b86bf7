//! Runtime configuration.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::rounds::BETTING_WINDOW;

/// Everything the binary reads from the environment, resolved once at
/// startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub rounds_db_path: String,
    pub ledger_db_path: String,
    pub port: u16,
    pub betting_window: Duration,
    pub starting_balance: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rounds_db_path =
            resolve_data_path(env::var("ROUNDS_DB_PATH").ok(), "wagerbot_rounds.db");
        let ledger_db_path =
            resolve_data_path(env::var("LEDGER_DB_PATH").ok(), "wagerbot_ledger.db");

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("Invalid PORT")?;

        let betting_window = env::var("BETTING_WINDOW_SECS")
            .ok()
            .map(|v| v.parse::<u64>().context("Invalid BETTING_WINDOW_SECS"))
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(BETTING_WINDOW);

        let starting_balance = env::var("STARTING_BALANCE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<i64>()
            .context("Invalid STARTING_BALANCE")?;

        Ok(Self {
            rounds_db_path,
            ledger_db_path,
            port,
            betting_window,
            starting_balance,
        })
    }
}

/// Resolve a database path from the environment, anchoring relative paths
/// to the crate directory so running from elsewhere doesn't silently
/// create a fresh empty database.
fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}
