use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::AppState;
use crate::domain::ConnectionState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Ready once the live subscription is up.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let connection = state.status.borrow().connection;
    if connection == ConnectionState::Subscribed {
        (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ready", "connection": connection})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "not_ready", "connection": connection})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_returns_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
