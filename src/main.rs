//! WagerBot backend: timed wagering rounds with a virtual-currency ledger.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wagerbot_backend::api::{self, AppState};
use wagerbot_backend::ledger::SqliteLedger;
use wagerbot_backend::models::Config;
use wagerbot_backend::rounds::{RoundEngine, RoundStore, TimerScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🎲 WagerBot backend starting");

    let config = Config::from_env()?;

    let store = RoundStore::new(&config.rounds_db_path)
        .context("Failed to open rounds database")?;
    info!("📊 Rounds database at: {}", config.rounds_db_path);

    let ledger = Arc::new(
        SqliteLedger::new(&config.ledger_db_path, config.starting_balance)
            .context("Failed to open ledger database")?,
    );
    info!("💰 Ledger database at: {}", config.ledger_db_path);

    let engine = RoundEngine::new(
        store,
        ledger.clone(),
        TimerScheduler::new(),
        config.betting_window,
    );

    // Rebuild auto-close timers for rounds that were pending when the
    // process last stopped.
    let (rearmed, closed) = engine.rehydrate().await?;
    info!("⏱️ Rehydrated timers: {} re-armed, {} closed late", rearmed, closed);

    let app = api::router(AppState {
        engine,
        ledger,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wagerbot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory so
    // running with --manifest-path from elsewhere still finds .env.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
