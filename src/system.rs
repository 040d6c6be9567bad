use std::fmt;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TaskError};

/// A single external program call: program, arguments and extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    // Environment variables set for this process only, never logged
    #[must_use]
    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executes external programs on behalf of the orchestration procedures
pub trait Runner {
    /// Run with inherited stdio, failing on a non-zero exit status
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Spawn`] or [`TaskError::ToolFailed`].
    fn run(&mut self, invocation: &Invocation) -> Result<()>;

    /// Run and capture stdout, failing on a non-zero exit status
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Spawn`] or [`TaskError::ToolFailed`] carrying stderr.
    fn output(&mut self, invocation: &Invocation) -> Result<String>;

    /// Block for a fixed delay
    fn sleep(&mut self, duration: Duration);
}

// Runner backed by real subprocesses
#[derive(Debug, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<()> {
        debug!("running: {invocation}");
        let status = invocation
            .command()
            .status()
            .map_err(|source| TaskError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(TaskError::ToolFailed {
                program: invocation.program.clone(),
                status: status.to_string(),
                stderr: String::new(),
            })
        }
    }

    fn output(&mut self, invocation: &Invocation) -> Result<String> {
        debug!("capturing: {invocation}");
        let Output {
            status,
            stdout,
            stderr,
        } = invocation
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TaskError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            debug!("{} stderr: {stderr}", invocation.program);
            Err(TaskError::ToolFailed {
                program: invocation.program.clone(),
                status: status.to_string(),
                stderr,
            })
        }
    }

    fn sleep(&mut self, duration: Duration) {
        debug!("sleeping for {}s", duration.as_secs());
        thread::sleep(duration);
    }
}
