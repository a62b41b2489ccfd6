mod command;

pub use command::CommandAnalyzer;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use crate::models::{ResultMap, TaskParams};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// The engine refused the input (malformed FASTA, bad parameters).
    #[error("{0}")]
    Rejected(String),

    #[error("analysis ran out of resources: {0}")]
    ResourceExhausted(String),

    #[error("analysis engine could not be run: {0}")]
    Engine(String),

    #[error("analysis produced unreadable output: {0}")]
    Output(String),
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, file_path: &Path, params: &TaskParams) -> Result<ResultMap, AnalysisError>;
}
