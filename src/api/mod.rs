//! HTTP surface over the round engine.
//!
//! Handlers are thin: parse the request, call one engine operation,
//! serialize the [`OperationResult`]. Business-rule failures come back as
//! 200s with `success: false` and a renderable message; only
//! infrastructure errors turn into 500s.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::ledger::SqliteLedger;
use crate::rounds::{MatchSides, OperationResult, RoundEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: RoundEngine,
    pub ledger: Arc<SqliteLedger>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/matches", post(create_match))
        .route("/api/events", post(create_event))
        .route("/api/rounds", get(list_rounds))
        .route("/api/rounds/:id", get(get_round))
        .route("/api/rounds/:id/window", get(get_window))
        .route("/api/rounds/:id/wagers", get(list_wagers).post(place_wager))
        .route("/api/rounds/:id/close", post(close_round))
        .route("/api/rounds/:id/cancel", post(cancel_round))
        .route("/api/rounds/:id/settle", post(settle_round))
        .route("/api/balance/:user_id", get(get_balance))
        .route("/api/balance/donate", post(donate))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

type ApiResult = Result<Json<OperationResult>, (StatusCode, String)>;

fn internal(err: anyhow::Error) -> (StatusCode, String) {
    error!("request failed: {:#}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateMatchRequest {
    side_a: String,
    side_b: String,
    /// "teams" (default) or "participants".
    #[serde(default)]
    mode: Option<String>,
    description: Option<String>,
}

async fn create_match(
    State(state): State<AppState>,
    Json(req): Json<CreateMatchRequest>,
) -> ApiResult {
    let sides = match req.mode.as_deref() {
        Some("participants") => MatchSides::Participants {
            a: req.side_a,
            b: req.side_b,
        },
        _ => MatchSides::Teams {
            a: req.side_a,
            b: req.side_b,
        },
    };
    let res = state
        .engine
        .create_match(sides, req.description)
        .await
        .map_err(internal)?;
    Ok(Json(res))
}

#[derive(Debug, Deserialize)]
struct CreateEventRequest {
    description: Option<String>,
    related_user: Option<String>,
}

async fn create_event(
    State(state): State<AppState>,
    Json(req): Json<CreateEventRequest>,
) -> ApiResult {
    let res = state
        .engine
        .create_event(req.description, req.related_user)
        .await
        .map_err(internal)?;
    Ok(Json(res))
}

#[derive(Debug, Deserialize)]
struct RoundsQuery {
    /// "active" (default) or "recent".
    view: Option<String>,
    limit: Option<usize>,
}

async fn list_rounds(
    State(state): State<AppState>,
    Query(query): Query<RoundsQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50);
    let rounds = match query.view.as_deref() {
        Some("recent") => state.engine.recent_rounds(limit).await,
        _ => state.engine.active_rounds(limit).await,
    }
    .map_err(internal)?;
    let count = rounds.len();
    Ok(Json(json!({ "rounds": rounds, "count": count })))
}

async fn get_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, String)> {
    match state.engine.get_round(id).await.map_err(internal)? {
        Some(round) => Ok(Json(json!({ "round": round }))),
        None => Err((StatusCode::NOT_FOUND, "Round not found".to_string())),
    }
}

async fn get_window(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let seconds = state.engine.open_window(id).await.map_err(internal)?;
    Ok(Json(json!({ "round_id": id, "window_seconds": seconds })))
}

async fn list_wagers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let wagers = state.engine.wagers(id).await.map_err(internal)?;
    Ok(Json(json!({ "round_id": id, "wagers": wagers })))
}

#[derive(Debug, Deserialize)]
struct PlaceWagerRequest {
    user_id: String,
    side: String,
    amount: i64,
}

async fn place_wager(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<PlaceWagerRequest>,
) -> ApiResult {
    let res = state
        .engine
        .place_wager(id, &req.user_id, &req.side, req.amount)
        .await
        .map_err(internal)?;
    Ok(Json(res))
}

async fn close_round(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let res = state.engine.close_round(id).await.map_err(internal)?;
    Ok(Json(res))
}

async fn cancel_round(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let res = state.engine.cancel_round(id).await.map_err(internal)?;
    Ok(Json(res))
}

#[derive(Debug, Deserialize)]
struct SettleRequest {
    winner: String,
}

async fn settle_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SettleRequest>,
) -> ApiResult {
    let res = state
        .engine
        .settle_round(id, &req.winner)
        .await
        .map_err(internal)?;
    Ok(Json(res))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    use crate::ledger::Ledger;
    let balance = state.ledger.balance(&user_id).await.map_err(internal)?;
    let transactions = state
        .ledger
        .list_transactions(&user_id, 20)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "user_id": user_id,
        "balance": balance,
        "transactions": transactions,
    })))
}

#[derive(Debug, Deserialize)]
struct DonateRequest {
    from: String,
    to: String,
    amount: i64,
}

async fn donate(State(state): State<AppState>, Json(req): Json<DonateRequest>) -> ApiResult {
    match state.ledger.transfer(&req.from, &req.to, req.amount).await {
        Ok((from_balance, to_balance)) => Ok(Json(OperationResult::ok_with(
            format!("Donated {} from {} to {}", req.amount, req.from, req.to),
            json!({ "from_balance": from_balance, "to_balance": to_balance }),
        ))),
        // Transfer failures are user-facing (bad amount, not enough funds).
        Err(e) => Ok(Json(OperationResult::fail_with(
            e.to_string(),
            json!({ "from": req.from, "to": req.to }),
        ))),
    }
}
