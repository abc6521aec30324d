pub mod health;
pub mod status;

use crate::orchestration::{ReconcilerInput, ReconcilerStatus};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<ReconcilerStatus>,
    pub inbox: mpsc::Sender<ReconcilerInput>,
}

impl AppState {
    pub fn new(
        status: watch::Receiver<ReconcilerStatus>,
        inbox: mpsc::Sender<ReconcilerInput>,
    ) -> Self {
        Self { status, inbox }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/status", get(status::get_status))
        .route("/v1/recover", post(status::request_recovery))
        .layer(cors)
        .with_state(state)
}
