use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::event::error_summary;

/// Startup failures. Nothing is processed until these are fixed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("interpreter not found: {path}")]
    InterpreterNotFound { path: String },
    #[error("parser script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },
    #[error("build working directory not found: {}", path.display())]
    BuildDirNotFound { path: PathBuf },
    #[error("missing required setting `{key}`")]
    MissingSetting { key: &'static str },
    #[error("invalid value for `{key}`: {message}")]
    InvalidValue { key: &'static str, message: String },
    #[error("failed to read config file {}: {message}", path.display())]
    Unreadable { path: PathBuf, message: String },
    #[error("invalid config file {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("failed to launch build command `{command}`: {message}")]
    Launch { command: String, message: String },
    #[error("build failed (exit_code={exit_code:?}): {output}")]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    #[error("build timed out after {after:?}")]
    TimedOut { after: Duration },
    #[error("build cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("failed to launch parser `{program}`: {message}")]
    Launch { program: String, message: String },
    #[error("parser failed (exit_code={exit_code:?}): {}", summarize(output))]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    #[error("parser timed out after {after:?}")]
    TimedOut { after: Duration, output: String },
    #[error("parser run cancelled")]
    Cancelled,
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("failed to capture parser output: {message}")]
    Capture { message: String },
}

impl ParseError {
    /// Output captured before the failure, if the parser got that far.
    pub fn output(&self) -> Option<&str> {
        match self {
            ParseError::Failed { output, .. } | ParseError::TimedOut { output, .. } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }
}

fn summarize(output: &str) -> String {
    error_summary(output).unwrap_or_else(|| "no output".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to copy {} to {}: {message}", source_path.display(), destination.display())]
pub struct CopyError {
    pub source_path: PathBuf,
    pub destination: PathBuf,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("invalid command: {message}")]
    InvalidCommand { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{failed} of {total} files failed")]
    BatchFailed { failed: usize, total: usize },
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::BatchFailed { .. } => 2,
            _ => 1,
        }
    }
}
