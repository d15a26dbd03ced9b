//! External program execution with captured output.
//!
//! Every collaborator that shells out (sfdisk, mke2fs, simg2img) goes
//! through [`Cmd`], so failures always carry the program name, exit code
//! and stderr.

use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::debug;

/// Failure to run an external program.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to execute '{program}'. Is it installed? ({source})")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{prefix} (exit code {code}){}", stderr_suffix(.stderr))]
    Failed {
        prefix: String,
        code: i32,
        stderr: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr)
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// Exit code, or -1 if terminated by signal.
    fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            error_prefix: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Feed `input` to the program's stdin.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult, ToolError> {
        debug!(program = %self.program, args = ?self.args, "exec");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let spawn_err = |source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (self.stdin.as_deref(), child.stdin.take()) {
            // Dropping the pipe closes stdin so the program sees EOF.
            pipe.write_all(input).map_err(spawn_err)?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.stdout_trimmed().is_empty() {
            debug!(program = %self.program, "stdout:\n{}", result.stdout_trimmed());
        }
        if !result.stderr_trimmed().is_empty() {
            debug!(program = %self.program, "stderr:\n{}", result.stderr_trimmed());
        }

        if !result.status.success() {
            return Err(ToolError::Failed {
                prefix: self
                    .error_prefix
                    .unwrap_or_else(|| format!("'{}' failed", self.program)),
                code: result.code(),
                stderr: result.stderr_trimmed().to_string(),
            });
        }

        Ok(result)
    }
}
