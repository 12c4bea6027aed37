//! API routes.

pub mod health;
pub mod recipes;

use crate::AgentState;
use axum::Router;

/// Build the agent router.
pub fn router(state: AgentState) -> Router {
    Router::new()
        .nest("/recipes", recipes::router())
        .merge(health::router())
        .with_state(state)
}
