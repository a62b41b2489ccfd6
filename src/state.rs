use std::sync::Arc;

use crate::services::{FileStore, TaskService};

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskService>,
    pub files: Arc<FileStore>,
}
