use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::error::BuildError;
use crate::core::process::{run_captured, ProcessExit, ProcessSpec, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BuildPolicy {
    Never,
    /// Build before the first parse, again only on `rebuild`.
    #[default]
    Once,
    EveryParse,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub policy: BuildPolicy,
    pub fail_on_error: bool,
    pub timeout: Option<Duration>,
}

impl BuildConfig {
    pub fn make_in(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: "make".to_string(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            policy: BuildPolicy::Once,
            fail_on_error: true,
            timeout: None,
        }
    }

    fn spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.command)
            .args(&self.args)
            .working_dir(&self.working_dir)
            .timeout(self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub output: String,
    pub elapsed: Duration,
}

/// Runs the external tool's build command and remembers the last result for `Once`.
#[derive(Debug)]
pub struct BuildStep {
    config: BuildConfig,
    last: Mutex<Option<Result<BuildReport, BuildError>>>,
}

impl BuildStep {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            last: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Runs the build if the policy calls for it before a parse. `None` means nothing ran and
    /// nothing was cached.
    pub fn ensure(&self, cancel: Option<&CancelToken>) -> Option<Result<BuildReport, BuildError>> {
        match self.config.policy {
            BuildPolicy::Never => None,
            BuildPolicy::EveryParse => Some(self.run(cancel)),
            BuildPolicy::Once => {
                let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(previous) = last.as_ref() {
                    return Some(previous.clone());
                }
                let result = self.run(cancel);
                if settled(&result) {
                    *last = Some(result.clone());
                }
                Some(result)
            }
        }
    }

    /// Forces a fresh build regardless of policy and replaces the cached result.
    pub fn rebuild(&self, cancel: Option<&CancelToken>) -> Result<BuildReport, BuildError> {
        let result = self.run(cancel);
        if settled(&result) {
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            *last = Some(result.clone());
        }
        result
    }

    fn run(&self, cancel: Option<&CancelToken>) -> Result<BuildReport, BuildError> {
        let spec = self.config.spec();
        let command = spec.display_command();
        debug!(%command, dir = %self.config.working_dir.display(), "running build");

        let captured = run_captured(&spec, cancel).map_err(|err| match err {
            RunError::Spawn(e) | RunError::Wait(e) => BuildError::Launch {
                command: command.clone(),
                message: e.to_string(),
            },
        })?;

        match captured.exit {
            ProcessExit::Exited { code: Some(0) } => {
                info!(%command, elapsed = ?captured.elapsed, "build finished");
                Ok(BuildReport {
                    output: captured.output,
                    elapsed: captured.elapsed,
                })
            }
            ProcessExit::Exited { code } => {
                warn!(%command, exit_code = ?code, "build failed");
                Err(BuildError::Failed {
                    exit_code: code,
                    output: captured.output,
                })
            }
            ProcessExit::TimedOut { after } => Err(BuildError::TimedOut { after }),
            ProcessExit::Cancelled => Err(BuildError::Cancelled),
        }
    }
}

/// Interrupted builds say nothing about the build itself and are retried on the next parse.
fn settled(result: &Result<BuildReport, BuildError>) -> bool {
    !matches!(
        result,
        Err(BuildError::Cancelled) | Err(BuildError::TimedOut { .. })
    )
}
