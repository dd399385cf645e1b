pub mod api;
pub mod files;
pub mod web;

use crate::error::HistoryError;
use crate::model::HistoryRecord;
use crate::state::AppState;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "File not found")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::NameTooLong(_)
            | HistoryError::InvalidStatus(_)
            | HistoryError::InvalidId(_) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            HistoryError::Sqlite(_) | HistoryError::Io(_) => {
                error!("History store error: {}", e);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

/// Pushes the current history to `/events` subscribers.
pub(crate) fn publish_history(state: &AppState, history: &[HistoryRecord]) {
    if let Ok(data) = serde_json::to_value(history) {
        let _ = state.tx.send(
            serde_json::json!({
                "type": "history",
                "data": data
            })
            .to_string(),
        );
    }
}
