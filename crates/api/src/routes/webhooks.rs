//! Inbound delivery-outcome webhook.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::DeliveryOutcomeEvent;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/email-events", post(email_event))
}

/// POST /webhooks/email-events — Publish an outcome event to the feedback topic.
async fn email_event(
    State(state): State<AppState>,
    Json(event): Json<DeliveryOutcomeEvent>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let body = serde_json::to_string(&event)?;
    let delivered = state.feedback_topic.publish(&body).await?;

    tracing::debug!(
        message_id = %event.message_id,
        outcome = ?event.outcome_type,
        subscribers = delivered,
        "Outcome event published"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "subscribers": delivered })),
    ))
}
