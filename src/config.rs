//! Settings file plus command line overrides, resolved into an [`OrchestratorConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::build::{BuildConfig, BuildPolicy};
use crate::core::error::ConfigError;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::scratch::ScratchDir;

pub const DEFAULT_INTERPRETER: &str = "python3";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub interpreter: Option<String>,
    pub script: Option<PathBuf>,
    pub capture_stderr: Option<bool>,
    pub ignore_exit_code: Option<bool>,
    pub timeout_secs: Option<f64>,
    pub scratch_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub build: Option<BuildSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BuildSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub policy: Option<BuildPolicy>,
    pub fail_on_error: Option<bool>,
    pub timeout_secs: Option<f64>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_yaml(&raw).map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|err| err.to_string())
    }

    /// Fields set in `other` win. Build settings merge key by key.
    pub fn merge(mut self, other: Settings) -> Self {
        self.interpreter = other.interpreter.or(self.interpreter);
        self.script = other.script.or(self.script);
        self.capture_stderr = other.capture_stderr.or(self.capture_stderr);
        self.ignore_exit_code = other.ignore_exit_code.or(self.ignore_exit_code);
        self.timeout_secs = other.timeout_secs.or(self.timeout_secs);
        self.scratch_dir = other.scratch_dir.or(self.scratch_dir);
        self.jobs = other.jobs.or(self.jobs);
        self.build = match (self.build, other.build) {
            (Some(base), Some(over)) => Some(BuildSettings {
                command: over.command.or(base.command),
                args: if over.args.is_empty() { base.args } else { over.args },
                working_dir: over.working_dir.or(base.working_dir),
                policy: over.policy.or(base.policy),
                fail_on_error: over.fail_on_error.or(base.fail_on_error),
                timeout_secs: over.timeout_secs.or(base.timeout_secs),
            }),
            (base, over) => over.or(base),
        };
        self
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, ConfigError> {
        let script = self
            .script
            .clone()
            .ok_or(ConfigError::MissingSetting { key: "script" })?;
        let interpreter = self
            .interpreter
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());

        let mut config = OrchestratorConfig::new(interpreter, script);
        config.capture_stderr = self.capture_stderr.unwrap_or(true);
        config.ignore_exit_code = self.ignore_exit_code.unwrap_or(false);
        config.timeout = seconds("timeout_secs", self.timeout_secs)?;
        config.build = self.build.as_ref().map(BuildSettings::build_config).transpose()?;
        Ok(config)
    }

    pub fn scratch(&self) -> ScratchDir {
        self.scratch_dir
            .clone()
            .map(ScratchDir::new)
            .unwrap_or_default()
    }

    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or(1).max(1)
    }
}

impl BuildSettings {
    fn build_config(&self) -> Result<BuildConfig, ConfigError> {
        let working_dir = self
            .working_dir
            .clone()
            .ok_or(ConfigError::MissingSetting {
                key: "build.working_dir",
            })?;
        let mut config = BuildConfig::make_in(working_dir);
        if let Some(command) = &self.command {
            config.command = command.clone();
        }
        config.args = self.args.clone();
        config.policy = self.policy.unwrap_or_default();
        config.fail_on_error = self.fail_on_error.unwrap_or(true);
        config.timeout = seconds("build.timeout_secs", self.timeout_secs)?;
        Ok(config)
    }
}

/// Zero or negative means no limit.
fn seconds(key: &'static str, value: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(secs) if secs <= 0.0 => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|err| ConfigError::InvalidValue {
                key,
                message: format!("{secs}: {err}"),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_yaml() {
        let settings = Settings::from_yaml(
            r#"
interpreter: /usr/local/bin/python3.11
script: Parser/parser.py
timeout_secs: 30
jobs: 2
build:
  working_dir: Parser
  policy: every-parse
  fail_on_error: false
"#,
        )
        .unwrap();

        let config = settings.orchestrator_config().unwrap();
        assert_eq!(config.interpreter, "/usr/local/bin/python3.11");
        assert_eq!(config.script, PathBuf::from("Parser/parser.py"));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert!(config.capture_stderr);
        let build = config.build.unwrap();
        assert_eq!(build.command, "make");
        assert_eq!(build.policy, BuildPolicy::EveryParse);
        assert!(!build.fail_on_error);
        assert_eq!(settings.jobs(), 2);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Settings::from_yaml("scirpt: parser.py\n").is_err());
    }

    #[test]
    fn script_is_required() {
        let err = Settings::default().orchestrator_config().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSetting { key: "script" }));
    }

    #[test]
    fn overrides_win_and_build_merges() {
        let base = Settings::from_yaml(
            "interpreter: python3\nscript: a.py\nbuild:\n  working_dir: Parser\n  command: gmake\n",
        )
        .unwrap();
        let over = Settings {
            script: Some(PathBuf::from("b.py")),
            build: Some(BuildSettings {
                policy: Some(BuildPolicy::Never),
                ..BuildSettings::default()
            }),
            ..Settings::default()
        };

        let merged = base.merge(over);
        assert_eq!(merged.interpreter.as_deref(), Some("python3"));
        assert_eq!(merged.script, Some(PathBuf::from("b.py")));
        let build = merged.build.unwrap();
        assert_eq!(build.command.as_deref(), Some("gmake"));
        assert_eq!(build.working_dir, Some(PathBuf::from("Parser")));
        assert_eq!(build.policy, Some(BuildPolicy::Never));
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(Settings::from_yaml("\n").unwrap(), Settings::default());
    }

    #[test]
    fn non_positive_timeout_disables_it() {
        assert_eq!(seconds("timeout_secs", Some(0.0)).unwrap(), None);
        assert_eq!(seconds("timeout_secs", Some(-3.0)).unwrap(), None);
        assert_eq!(
            seconds("timeout_secs", Some(1.5)).unwrap(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let settings = Settings {
            script: Some(PathBuf::from("parser.py")),
            timeout_secs: Some(1e30),
            ..Settings::default()
        };
        let err = settings.orchestrator_config().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "timeout_secs", .. }));

        let settings = Settings::from_yaml(
            "script: parser.py\nbuild:\n  working_dir: Parser\n  timeout_secs: .nan\n",
        )
        .unwrap();
        let err = settings.orchestrator_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "build.timeout_secs",
                ..
            }
        ));
    }
}
