use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use crate::errors::{AppError, AppResult};

/// Header carrying the user id, set by the authenticating proxy in front of
/// the service.
pub const USER_HEADER: &str = "x-user";

#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

pub async fn require_user(mut req: Request, next: Next) -> AppResult<Response> {
    let user = req
        .headers()
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            tracing::debug!("Rejecting request to {} without {}", req.uri().path(), USER_HEADER);
            AppError::Auth(format!("missing {} header", USER_HEADER))
        })?;

    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}
