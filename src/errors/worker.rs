use thiserror::Error;
use crate::analysis::AnalysisError;

/// Why a claimed job did not produce a result. The message becomes the
/// task's `error_detail`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("analysis timed out after {0} seconds")]
    Timeout(u64),

    #[error("analysis panicked: {0}")]
    TaskPanic(String),

    #[error("processing time quota exhausted")]
    QuotaExhausted,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
