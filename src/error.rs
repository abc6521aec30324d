use crate::orchestration::ReconcilerInput;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("reconciler is not accepting requests")]
    ReconcilerGone,
    #[error("reconciler inbox is full, retry later")]
    Busy,
}

impl From<TrySendError<ReconcilerInput>> for AppError {
    fn from(err: TrySendError<ReconcilerInput>) -> Self {
        match err {
            TrySendError::Full(_) => AppError::Busy,
            TrySendError::Closed(_) => AppError::ReconcilerGone,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::ReconcilerGone => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Busy => StatusCode::TOO_MANY_REQUESTS,
        };

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
