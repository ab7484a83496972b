use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::build::{BuildConfig, BuildPolicy, BuildReport, BuildStep};
use crate::core::cancel::CancelToken;
use crate::core::error::{BuildError, ConfigError, ParseError};
use crate::core::process::{run_captured, ProcessExit, ProcessSpec, RunError};

/// Anything that can turn one cue sheet path into parser output.
pub trait SheetParser: Send + Sync {
    fn parse(&self, path: &str, cancel: Option<&CancelToken>) -> ParseResult;
}

pub type ParseResult = Result<ParseOutput, ParseError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutput {
    pub output: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    /// Build failure that was tolerated because `fail_on_error` is off.
    pub build_warning: Option<BuildError>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub interpreter: String,
    pub script: PathBuf,
    pub capture_stderr: bool,
    pub ignore_exit_code: bool,
    pub timeout: Option<Duration>,
    pub build: Option<BuildConfig>,
}

impl OrchestratorConfig {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            capture_stderr: true,
            ignore_exit_code: false,
            timeout: None,
            build: None,
        }
    }
}

/// Drives the external parser. Paths are resolved and checked once, in `new`.
#[derive(Debug)]
pub struct ParseOrchestrator {
    interpreter: PathBuf,
    script: PathBuf,
    capture_stderr: bool,
    ignore_exit_code: bool,
    timeout: Option<Duration>,
    build: Option<BuildStep>,
}

impl ParseOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        let interpreter = resolve_interpreter(&config.interpreter)?;

        let script = absolutize(&config.script);
        if !script.is_file() {
            return Err(ConfigError::ScriptNotFound { path: script });
        }

        let build = match config.build {
            Some(build) if build.policy != BuildPolicy::Never => {
                if !build.working_dir.is_dir() {
                    return Err(ConfigError::BuildDirNotFound {
                        path: build.working_dir,
                    });
                }
                Some(BuildStep::new(build))
            }
            _ => None,
        };

        debug!(
            interpreter = %interpreter.display(),
            script = %script.display(),
            build = build.is_some(),
            "parser resolved"
        );

        Ok(Self {
            interpreter,
            script,
            capture_stderr: config.capture_stderr,
            ignore_exit_code: config.ignore_exit_code,
            timeout: config.timeout,
            build,
        })
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn has_build_step(&self) -> bool {
        self.build.is_some()
    }

    /// Runs the build command now. `Ok(None)` when no build step is configured.
    pub fn rebuild(&self) -> Result<Option<BuildReport>, BuildError> {
        match &self.build {
            Some(step) => step.rebuild(None).map(Some),
            None => Ok(None),
        }
    }

    fn ensure_built(&self, cancel: Option<&CancelToken>) -> Result<Option<BuildError>, ParseError> {
        let Some(step) = &self.build else {
            return Ok(None);
        };

        match step.ensure(cancel) {
            None | Some(Ok(_)) => Ok(None),
            Some(Err(BuildError::Cancelled)) => Err(ParseError::Cancelled),
            Some(Err(err)) if step.config().fail_on_error => Err(err.into()),
            Some(Err(err)) => {
                warn!("build failed, parsing anyway: {err}");
                Ok(Some(err))
            }
        }
    }

    pub fn parse_with_cancel(&self, path: &str, cancel: Option<&CancelToken>) -> ParseResult {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(ParseError::Cancelled);
        }

        let build_warning = self.ensure_built(cancel)?;

        let spec = ProcessSpec::new(&self.interpreter)
            .arg(&self.script)
            .arg(path)
            .capture_stderr(self.capture_stderr)
            .timeout(self.timeout);

        let captured = run_captured(&spec, cancel).map_err(|err| match err {
            RunError::Spawn(e) => ParseError::Launch {
                program: self.interpreter.to_string_lossy().to_string(),
                message: e.to_string(),
            },
            RunError::Wait(e) => ParseError::Capture {
                message: e.to_string(),
            },
        })?;

        match captured.exit {
            ProcessExit::Exited { code } if code == Some(0) || self.ignore_exit_code => {
                Ok(ParseOutput {
                    output: captured.output,
                    exit_code: code,
                    elapsed: captured.elapsed,
                    build_warning,
                })
            }
            ProcessExit::Exited { code } => Err(ParseError::Failed {
                exit_code: code,
                output: captured.output,
            }),
            ProcessExit::TimedOut { after } => Err(ParseError::TimedOut {
                after,
                output: captured.output,
            }),
            ProcessExit::Cancelled => Err(ParseError::Cancelled),
        }
    }
}

impl SheetParser for ParseOrchestrator {
    fn parse(&self, path: &str, cancel: Option<&CancelToken>) -> ParseResult {
        self.parse_with_cancel(path, cancel)
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Paths with a directory part must exist as given; bare names are looked up on `PATH`.
fn resolve_interpreter(name: &str) -> Result<PathBuf, ConfigError> {
    let not_found = || ConfigError::InterpreterNotFound {
        path: name.to_string(),
    };
    let candidate = Path::new(name);

    if name.is_empty() {
        return Err(not_found());
    }

    if candidate.components().count() > 1 {
        let path = absolutize(candidate);
        return if path.is_file() { Ok(path) } else { Err(not_found()) };
    }

    env::var_os("PATH")
        .and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(candidate))
                .find(|path| path.is_file())
        })
        .ok_or_else(not_found)
}
