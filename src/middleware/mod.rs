mod auth;

pub use auth::{require_user, CurrentUser, USER_HEADER};
