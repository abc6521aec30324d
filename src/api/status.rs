use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::error::AppError;
use crate::orchestration::{ReconcilerInput, ReconcilerStatus};

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub status: &'static str,
}

pub async fn get_status(State(state): State<AppState>) -> Json<ReconcilerStatus> {
    Json(state.status.borrow().clone())
}

/// Ask the reconciler for a recovery pass. Coalesced with any pass in flight.
pub async fn request_recovery(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<RecoverResponse>), AppError> {
    state.inbox.try_send(ReconcilerInput::RecoveryRequested)?;
    Ok((StatusCode::ACCEPTED, Json(RecoverResponse { status: "queued" })))
}
