//! Health check endpoint, used by the master to probe agents.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AgentState;

pub fn router() -> Router<AgentState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({ "status": "ok", "agent": state.info.id.to_string() }))
}
