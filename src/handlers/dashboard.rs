use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use crate::errors::AppResult;
use crate::middleware::CurrentUser;
use crate::models::TaskId;
use crate::state::AppState;

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(CurrentUser(owner)): Extension<CurrentUser>,
) -> AppResult<Response> {
    let listing = state.tasks.listing(&owner).await?;
    tracing::debug!(
        "Listing {} tasks for user {} ({}/{} seconds used)",
        listing.tasks.len(),
        owner,
        listing.usage.quota_used,
        listing.usage.quota_total
    );
    Ok(Json(listing).into_response())
}

pub async fn delete_task(
    State(state): State<AppState>,
    Extension(CurrentUser(owner)): Extension<CurrentUser>,
    Path(task_id): Path<String>,
) -> AppResult<Response> {
    tracing::info!("Attempting to delete task {} for user {}", task_id, owner);
    state.tasks.delete_task(&TaskId::from(task_id), &owner).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
