use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use taskhook_core::AppError;
use taskhook_github::webhook::verify_signature;
use taskhook_jobs::messages::{RelayFilter, RelayMessage};

use crate::AppState;

pub const RELAY_SIGNATURE_HEADER: &str = "x-relay-signature-256";

/// Accepts task-platform messages forwarded by the event relay.
pub async fn relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let secret = &state.config.app.relay_secret;
    if secret.is_empty() {
        tracing::warn!("Received relayed message but no relay secret is configured");
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    }
    let signature = headers
        .get(RELAY_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Status(StatusCode::UNAUTHORIZED))?;
    if let Err(m) = verify_signature(secret, signature, &body) {
        tracing::warn!("Rejected relayed message: {m}");
        return Err(AppError::Status(StatusCode::UNAUTHORIZED));
    }

    let message: RelayMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Malformed relayed message: {e}");
            return Err(AppError::Status(StatusCode::BAD_REQUEST));
        }
    };
    let filter = RelayFilter {
        check_task_route: &state.config.app.check_task_route,
        scheduler_id: &state.config.taskcluster.scheduler_id,
    };
    let inbound = match message.classify(&filter) {
        Ok(Some(inbound)) => inbound,
        Ok(None) => {
            tracing::debug!("Ignoring {} message", message.kind());
            return Ok((StatusCode::OK, "Ignored").into_response());
        }
        Err(e) => {
            tracing::warn!("Malformed {} message: {e:#}", message.kind());
            return Err(AppError::Status(StatusCode::BAD_REQUEST));
        }
    };
    tracing::info!("Received {} for task group {}", message.kind(), inbound.task_group_id());
    state.jobs.push_inbound(inbound).await.context("Failed to enqueue message")?;
    Ok((StatusCode::OK, "Queued").into_response())
}
