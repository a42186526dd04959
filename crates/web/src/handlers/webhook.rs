use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use taskhook_core::AppError;
use taskhook_github::webhook::{GitHubEvent, event_context};

use crate::AppState;

/// Webhook handler that enqueues events for processing instead of handling synchronously.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { kind, delivery, body }: GitHubEvent,
) -> Result<Response, AppError> {
    let event = match event_context(&kind, &delivery, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::debug!("Ignoring {kind} delivery {delivery}");
            return Ok((StatusCode::OK, "Ignored").into_response());
        }
        Err(e) => {
            tracing::warn!("Malformed {kind} delivery {delivery}: {e:#}");
            return Err(AppError::Status(StatusCode::BAD_REQUEST));
        }
    };
    tracing::info!(
        "Received {} event from {}/{}",
        event.event_type(),
        event.organization,
        event.repository
    );
    state.jobs.push_job(event).await.context("Failed to enqueue job")?;
    Ok((StatusCode::OK, "Queued").into_response())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::json;

    use crate::handlers::testing::{send, sign, state};

    fn delivery(kind: &str, body: &[u8], signature: &str) -> Request<Body> {
        Request::post("/api/github/webhook")
            .header("X-GitHub-Event", kind)
            .header("X-GitHub-Delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958")
            .header("X-Hub-Signature-256", signature)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    fn push_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "before": "0000000000000000000000000000000000000000",
            "after": "03e9577bc1ec60f2ff0929d5f1554de36b8f48cf",
            "repository": {
                "name": "app",
                "clone_url": "https://github.com/mozilla/app.git",
                "owner": {"login": "mozilla"},
            },
            "sender": {"login": "octocat"},
            "installation": {"id": 5828},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn queues_push() {
        let state = state().await;
        let body = push_body();
        let (status, body) = send(&state, delivery("push", &body, &sign("hook-secret", &body))).await;
        assert_eq!((status, body.as_str()), (200, "Queued"));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let state = state().await;
        let body = push_body();
        let (status, _) = send(&state, delivery("push", &body, &sign("wrong", &body))).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn ignores_other_events() {
        let state = state().await;
        let body = br#"{"zen":"Design for failure."}"#;
        let (status, body) = send(&state, delivery("ping", body, &sign("hook-secret", body))).await;
        assert_eq!(status, 200);
        assert_eq!(body, "Ignored");
    }
}
