//! Shell commands as orchestrator tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use taskforge_orchestrator::{Task, TaskError};

/// One `[[task]]` entry of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    /// Program to execute, looked up on `PATH`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The command could not be started.
#[derive(Debug, thiserror::Error, Serialize)]
#[error("failed to start '{command}': {reason}")]
pub struct SpawnError {
    pub command: String,
    pub reason: String,
}

/// The command ran and exited with a non-zero status.
#[derive(Debug, thiserror::Error, Serialize)]
#[error("'{command}' exited with {}", exit_text(.code))]
pub struct ExitStatusError {
    pub command: String,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

fn exit_text(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}

/// Either way a command can fail. Serialized with a `kind` tag so that
/// `retry_on` can tell the two apart.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "kind")]
pub enum CommandError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    ExitStatus(#[from] ExitStatusError),
}

impl CommandSpec {
    /// Run the command to completion, capturing its output.
    ///
    /// A non-zero exit status is an error, so it can be matched by
    /// `retry_on` like any other failure.
    pub fn execute(&self) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&self.command);
        command.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().map_err(|e| SpawnError {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(ExitStatusError {
                command: self.command.clone(),
                code: output.status.code(),
                stdout,
                stderr,
            }
            .into())
        }
    }

    pub fn into_task(self) -> (String, Task) {
        let id = self.id.clone();
        (id, Task::new(move || self.execute()))
    }
}

/// Whether `error` is named in `retry_on`, either by its type name or, for a
/// failed command, by its kind (`Spawn` or `ExitStatus`).
pub fn retry_matches(retry_on: &[String], error: &TaskError) -> bool {
    let kind = match error {
        TaskError::Application { payload, .. } => payload.get("kind").and_then(|k| k.as_str()),
        _ => None,
    };
    retry_on
        .iter()
        .any(|name| name == error.error_type() || Some(name.as_str()) == kind)
}
