use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod env;
pub mod error;
pub mod system;
pub mod target;
pub mod tasks;

pub use env::{EnvSource, ProcessEnv};
pub use error::{PhaseExt, TaskError};
pub use system::{Invocation, Runner, SystemRunner};
pub use target::{StaticTargets, TargetSource};
pub use tasks::Tasks;

// Resolved connection string for a node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub user: String,
    pub host: String,
}

impl DeployTarget {
    /// Build a target from its parts, rejecting empty fields
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::EmptyTarget`] naming `config` if either part is empty.
    pub fn new(config: &str, user: &str, host: &str) -> Result<Self, TaskError> {
        if user.is_empty() || host.is_empty() {
            return Err(TaskError::EmptyTarget(config.to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
        })
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

impl FromStr for DeployTarget {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok(Self {
                user: user.to_string(),
                host: host.to_string(),
            }),
            _ => Err(TaskError::MalformedTarget(s.to_string())),
        }
    }
}

/// Parse a boolean command argument
///
/// # Errors
///
/// Returns [`TaskError::InvalidFlag`] for anything but `true` or `false` (any case).
pub fn parse_flag(value: &str) -> Result<bool, TaskError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(TaskError::InvalidFlag(value.to_string()))
    }
}

// Fixed paths, names and delays shared by the procedures
#[derive(Debug, Clone)]
pub struct Settings {
    pub flake: String,
    pub secrets_file: String,
    pub remote_checkout: String,
    pub control_node: String,
    pub default_ssh_key: String,
    pub install_wait: Duration,
    pub boot_wait: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flake: ".".to_string(),
            secrets_file: "sops.secrets.yaml".to_string(),
            remote_checkout: "/root/k3s-nixos".to_string(),
            control_node: "thinkcenter-1".to_string(),
            default_ssh_key: "~/.ssh/id_rsa".to_string(),
            install_wait: Duration::from_secs(30),
            boot_wait: Duration::from_secs(60),
        }
    }
}

impl Settings {
    // Flake output reference such as `.#cpx21-control-1`
    #[must_use]
    pub fn flake_ref(&self, attr: &str) -> String {
        format!("{}#{attr}", self.flake)
    }
}
