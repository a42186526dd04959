use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod common;
mod relay;
mod webhook;

pub use relay::RELAY_SIGNATURE_HEADER;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(common::health))
        .route("/api/github/webhook", post(webhook::webhook))
        .route("/api/taskcluster/events", post(relay::relay))
}
