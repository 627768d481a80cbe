/// Job spawning: split the command string, append the job argument, and
/// start the child with inherited stdio.
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use tokio::process::{Child, Command};

/// Environment variable through which a job learns where to write progress.
pub const PROGRESS_FILE_VAR: &str = "SLACK_JOB_MONITOR_PROGRESS_FILE";

/// A parsed command: program followed by its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    program: String,
    args: Vec<String>,
}

/// Errors that can occur while preparing or starting a job.
#[derive(Debug)]
pub enum SpawnError {
    /// The command string could not be split into words.
    Parse { command: String, reason: String },
    /// The command string contained no program.
    Empty,
    /// Failed to spawn the child process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Parse { command, reason } => {
                write!(f, "failed to parse command `{}`: {}", command, reason)
            }
            SpawnError::Empty => write!(f, "command is empty"),
            SpawnError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source, .. } => Some(source),
            SpawnError::Parse { .. } | SpawnError::Empty => None,
        }
    }
}

impl SpawnError {
    /// Shell-style exit code for a job that never started.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpawnError::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => 127,
                std::io::ErrorKind::PermissionDenied => 126,
                _ => 1,
            },
            SpawnError::Parse { .. } | SpawnError::Empty => 2,
        }
    }
}

impl JobCommand {
    /// Split `command` with shell quoting rules.
    pub fn parse(command: &str) -> Result<Self, SpawnError> {
        let mut words = shell_words::split(command).map_err(|e| SpawnError::Parse {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        if words.is_empty() {
            return Err(SpawnError::Empty);
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argv for one job, with `arg` appended when present.
    pub fn argv(&self, arg: Option<&str>) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        if let Some(arg) = arg {
            argv.push(arg.to_string());
        }
        argv
    }

    /// Human-readable command line, re-quoted for display.
    pub fn display(&self, arguments: &[String]) -> String {
        let mut words = self.argv(None);
        words.extend(arguments.iter().cloned());
        shell_words::join(words)
    }

    /// Spawn one job. The child shares our stdio and process group, so a
    /// terminal Ctrl-C reaches it directly.
    pub fn spawn(&self, arg: Option<&str>, progress_file: Option<&Path>) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(arg) = arg {
            command.arg(arg);
        }
        if let Some(path) = progress_file {
            command.env(PROGRESS_FILE_VAR, path);
        }

        tracing::info!(
            program = %self.program,
            args = ?self.args,
            job_arg = ?arg,
            "spawning job"
        );

        let child = command.spawn().map_err(|e| SpawnError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        tracing::info!(pid = child.id().unwrap_or(0), "job started");
        Ok(child)
    }
}

/// Exit code for a finished child: its own code, or `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}
