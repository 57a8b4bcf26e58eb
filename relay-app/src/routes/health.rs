use crate::state::{HealthSnapshot, RelayState};
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub const HEALTH_PATH: &str = "/api/v1/relay/health";

pub fn router() -> axum::Router {
    axum::Router::new().route(HEALTH_PATH, get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<RelayState>>) -> Json<HealthSnapshot> {
    Json(state.health())
}
