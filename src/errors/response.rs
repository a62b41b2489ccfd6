use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
    Json,
};
use serde_json::json;
use crate::errors::{AppError, StoreError, TaskError};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Upload(_) => StatusCode::BAD_REQUEST,
            AppError::File(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Task(err) => task_status_code(err),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn task_status_code(err: &TaskError) -> StatusCode {
    match err {
        TaskError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::Forbidden(_) => StatusCode::FORBIDDEN,
        TaskError::NotReady(_) => StatusCode::CONFLICT,
        TaskError::Store(StoreError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::Store(_)
        | TaskError::StaleTransition(_)
        | TaskError::InvalidTransition { .. }
        | TaskError::Duplicate(_)
        | TaskError::LeaseOutOfRange(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
