use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the orchestration procedures.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{name} environment variable must be set")]
    MissingVar { name: String },

    #[error("{name} has invalid format: {reason}")]
    InvalidVar { name: String, reason: String },

    #[error("invalid flag value '{0}': must be either 'true' or 'false'")]
    InvalidFlag(String),

    #[error("no deploy target found for '{0}'")]
    UnknownTarget(String),

    #[error("deploy target (sshHostname or sshUser) is empty for '{0}'")]
    EmptyTarget(String),

    #[error("deploy target '{0}' is not in user@host format")]
    MalformedTarget(String),

    #[error("SSH key not found at {}", .0.display())]
    MissingKeyFile(PathBuf),

    #[error("failed to parse output of {context}")]
    MalformedOutput {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed ({status}){}", stderr_suffix(.stderr))]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{phase} failed for '{target}'")]
    Phase {
        phase: &'static str,
        target: String,
        #[source]
        source: Box<TaskError>,
    },
}

impl TaskError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an error with the phase and target it occurred in
    #[must_use]
    pub fn in_phase(self, phase: &'static str, target: impl Into<String>) -> Self {
        Self::Phase {
            phase,
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Whether a failed tool reported that the named kind of object
    /// (`server`, `network`, ...) does not exist
    #[must_use]
    pub fn is_not_found(&self, object: &str) -> bool {
        match self {
            Self::ToolFailed { stderr, .. } => {
                stderr.to_lowercase().contains(&format!("{object} not found"))
            }
            _ => false,
        }
    }
}

// Captured stderr appended to a tool failure, when there is any
fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;

/// Extension for attaching phase context to results, in the spirit of `anyhow::Context`
pub trait PhaseExt<T> {
    /// # Errors
    ///
    /// Returns the original error wrapped in [`TaskError::Phase`].
    fn phase(self, phase: &'static str, target: &str) -> Result<T>;
}

impl<T> PhaseExt<T> for Result<T> {
    fn phase(self, phase: &'static str, target: &str) -> Result<T> {
        self.map_err(|e| e.in_phase(phase, target))
    }
}
