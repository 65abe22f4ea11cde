use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("validation failed for {path}: {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

pub trait DatasetValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Program and leading arguments; the dataset path is appended.
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
}

impl CommandValidator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ValidatorConfig) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl DatasetValidator for CommandValidator {
    fn validate(&self, path: &Path) -> Result<(), ValidationError> {
        let failure = |reason: String| ValidationError {
            path: path.display().to_string(),
            reason,
        };

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| failure(format!("could not run {}: {err}", self.program)))?;

        if output.status.success() {
            debug!("{} accepted {}", self.program, path.display());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().next().unwrap_or("").trim().to_string();
        Err(failure(format!(
            "{} exited with {}{}",
            self.program,
            output.status,
            if detail.is_empty() {
                String::new()
            } else {
                format!(": {detail}")
            }
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::{CommandValidator, DatasetValidator, ValidatorConfig};

    #[test]
    fn exit_status_decides_outcome() {
        let pass = CommandValidator::new("true", Vec::new());
        let fail = CommandValidator::new("false", Vec::new());
        assert!(pass.validate(Path::new("/tmp/a.nc")).is_ok());
        assert!(fail.validate(Path::new("/tmp/a.nc")).is_err());
    }

    #[test]
    fn missing_program_fails_validation() {
        let validator = CommandValidator::new("definitely-not-a-real-checker-binary", Vec::new());
        let err = validator
            .validate(Path::new("/tmp/a.nc"))
            .expect_err("spawn fails");
        assert!(err.reason.contains("could not run"));
    }

    #[test]
    fn empty_command_config_yields_no_validator() {
        assert!(CommandValidator::from_config(&ValidatorConfig { command: Vec::new() }).is_none());
    }
}
