//! External process execution used by the SSH transport.
//!
//! Every call to `ssh` or `scp` goes through [`CommandRunner`] so the session
//! layer can be driven by scripted doubles in tests. The real
//! [`ProcessCommandRunner`] shells out to the host operating system.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use thiserror::Error;

mod sink;
mod util;

pub use sink::OutputSink;
pub use util::expand_tilde;

/// Result of running an external command with captured output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        status_text(self.code)
    }
}

/// Renders an optional exit code, using `signal` when the process was killed.
#[must_use]
pub fn status_text(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("signal"), |value| value.to_string())
}

/// Errors raised when an external program cannot be driven.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the output sink cannot be attached to the child process.
    #[error("failed to attach output sink {path}: {message}")]
    Sink {
        /// Sink path.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError>;

    /// Runs `program` with stdout and stderr both appended to `sink`, in the
    /// order the child writes them, and returns the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started or
    /// [`ExecError::Sink`] if the sink cannot be handed to the child.
    fn run_streaming(
        &self,
        program: &str,
        args: &[OsString],
        sink: &mut OutputSink,
    ) -> Result<Option<i32>, ExecError>;

    /// Runs `program` with all standard streams detached and returns the exit
    /// code. Used for commands that leave a background process behind, which
    /// would otherwise hold captured pipes open forever.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run_detached(&self, program: &str, args: &[OsString]) -> Result<Option<i32>, ExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    fn spawn_error(program: &str, err: &std::io::Error) -> ExecError {
        ExecError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        }
    }

    fn sink_error(sink: &OutputSink, err: &std::io::Error) -> ExecError {
        ExecError::Sink {
            path: sink.path().to_string(),
            message: err.to_string(),
        }
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Self::spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_streaming(
        &self,
        program: &str,
        args: &[OsString],
        sink: &mut OutputSink,
    ) -> Result<Option<i32>, ExecError> {
        sink.flush_pending()
            .map_err(|err| Self::sink_error(sink, &err))?;
        let stdout = sink
            .duplicate_handle()
            .map_err(|err| Self::sink_error(sink, &err))?;
        let stderr = sink
            .duplicate_handle()
            .map_err(|err| Self::sink_error(sink, &err))?;

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .map_err(|err| Self::spawn_error(program, &err))?;
        Ok(status.code())
    }

    fn run_detached(&self, program: &str, args: &[OsString]) -> Result<Option<i32>, ExecError> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| Self::spawn_error(program, &err))?;
        Ok(status.code())
    }
}
