//! Delivery status queries.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_common::types::{DeliveryQuery, DeliveryRecord};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(list_deliveries))
        .route("/status/{message_id}", get(get_delivery))
}

/// GET /status?recipient=&status=&record_id=&message_id=&limit= — Filtered
/// delivery records, newest first.
async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, AppError> {
    let records = state.deliveries.query(&query).await?;
    Ok(Json(records))
}

/// GET /status/:message_id — One delivery record.
async fn get_delivery(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<DeliveryRecord>, AppError> {
    state
        .deliveries
        .find_by_message_id(&message_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Delivery {} not found", message_id)))
}
