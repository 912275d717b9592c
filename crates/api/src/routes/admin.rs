//! Dead-letter queue inspection and replay.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use courier_common::error::AppError;
use courier_queue::ReplaySummary;

use crate::state::{AppState, DeadLetterRoute};

const DEFAULT_REPLAY_LIMIT: usize = 100;
const MAX_REPLAY_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ReplayParams {
    pub limit: Option<usize>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/dead-letters/{queue}", get(dead_letter_depth))
        .route("/admin/dead-letters/{queue}/replay", post(replay))
}

fn route<'a>(state: &'a AppState, queue: &str) -> Result<&'a DeadLetterRoute, AppError> {
    state.dead_letter_routes.get(queue).ok_or_else(|| {
        AppError::NotFound(format!("No dead-letter queue named '{}'", queue))
    })
}

/// GET /admin/dead-letters/:queue — Depth of a dead-letter queue.
async fn dead_letter_depth(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let route = route(&state, &queue)?;
    let dead_letters = route.dead_letters();
    let depth = dead_letters.depth().await?;

    Ok(Json(json!({
        "queue": queue,
        "deadLetterQueue": dead_letters.name(),
        "visible": depth.visible,
        "inFlight": depth.in_flight,
    })))
}

/// POST /admin/dead-letters/:queue/replay?limit= — Move dead letters back
/// to their source.
async fn replay(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<Json<ReplaySummary>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_REPLAY_LIMIT)
        .clamp(1, MAX_REPLAY_LIMIT);
    let route = route(&state, &queue)?;

    tracing::info!(
        queue = %queue,
        dead_letter_queue = %route.dead_letters().name(),
        target = %route.target().name(),
        limit,
        "Replaying dead letters"
    );

    let summary = route.replay(limit).await?;
    Ok(Json(summary))
}
