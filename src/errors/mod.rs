use thiserror::Error;

pub mod response;
pub mod store;
pub mod task;
pub mod worker;

pub use store::StoreError;
pub use task::TaskError;
pub use worker::{WorkerError, WorkerResult};

/// Errors surfaced by the request layer.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

pub type AppResult<T> = Result<T, AppError>;
