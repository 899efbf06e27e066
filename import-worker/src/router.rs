use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use import_common::flow_control::{FlowControl, FlowControlState};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub flow_control: Arc<FlowControl>,
    pub shutdown: CancellationToken,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(index))
        .route("/flow", get(flow))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "import worker"
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ready")
    }
}

async fn flow(State(state): State<AppState>) -> Json<FlowControlState> {
    Json(state.flow_control.state())
}
