use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "alive": true, "uptime": state.started.elapsed().as_secs() }))
}
