use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/wss-publish", post(publish))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    pub success: bool,
    pub message: String,
}

/// Broadcast an arbitrary JSON payload to every connected client.
#[utoipa::path(
    post,
    path = "/wss-publish",
    tag = "Publish",
    request_body(content = Object, description = "Notification payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Payload broadcast", body = PublishResponse),
        (status = 400, description = "Body is not valid JSON", body = ApiErrorBody),
    ),
)]
pub async fn publish(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("INVALID_JSON", format!("Invalid JSON body: {e}")))?;

    let clients = state.hub.client_count();
    state.hub.broadcast_notification(payload);
    tracing::info!(clients, "notification published over http");

    Ok(Json(PublishResponse {
        success: true,
        message: format!("Notification broadcast to {clients} clients"),
    }))
}
