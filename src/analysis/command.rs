use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use crate::config::AnalyzerConfig;
use crate::models::{ResultMap, TaskParams};
use super::{AnalysisError, Analyzer};

/// Runs the k-mer engine as a child process. The engine receives the input
/// path and parameters as flags and prints a JSON object of motif scores on
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn command(&self, file_path: &Path, params: &TaskParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--input")
            .arg(file_path)
            .arg("--trials")
            .arg(params.trial_count.to_string())
            .arg("--top-k")
            .arg(params.top_k.to_string());
        if params.reverse_complement_mode {
            cmd.arg("--revcom");
        }
        if params.min_hamming_distance_mode {
            cmd.arg("--min-ham-dist");
        }
        // A timed-out analysis drops this future; the engine must die with it.
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(&self, file_path: &Path, params: &TaskParams) -> Result<ResultMap, AnalysisError> {
        tracing::debug!("Running {} on {}", self.program, file_path.display());

        let output = self
            .command(file_path, params)
            .output()
            .await
            .map_err(|e| {
                tracing::error!("Failed to execute {}: {}", self.program, e);
                AnalysisError::Engine(e.to_string())
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(code) if stderr.is_empty() => {
                    AnalysisError::Rejected(format!("engine exited with code {}", code))
                }
                Some(_) => AnalysisError::Rejected(stderr),
                None => AnalysisError::ResourceExhausted("engine terminated by signal".into()),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| AnalysisError::Output(e.to_string()))
    }
}
