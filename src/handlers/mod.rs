mod task;
mod dashboard;

pub use task::{process_upload, get_task_status, download_results};
pub use dashboard::{list_tasks, delete_task};

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{delete, get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use crate::middleware;
use crate::state::AppState;

pub fn router(state: AppState, max_file_size: usize) -> Router {
    Router::new()
        .route("/process", post(process_upload))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", delete(delete_task))
        .route("/status/:task_id", get(get_task_status))
        .route("/download/:task_id", get(download_results))
        .layer(from_fn(middleware::require_user))
        // File upload limits from config
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_file_size))
        .with_state(state)
}
