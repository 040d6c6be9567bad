use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, TaskError};

// Static target table used instead of flake evaluation when set
pub const TARGETS_VAR: &str = "CLUSTER_TASKS_TARGETS";

// Variables worth reporting on when the local environment file is loaded
pub const CRITICAL_VARS: &[&str] = &[
    "AGE_PRIVATE_KEY",
    "K3S_TOKEN",
    "TAILSCALE_AUTH_KEY",
    "HCLOUD_TOKEN",
    "GITHUB_TOKEN",
];

/// Source of configuration values, normally the process environment
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from the environment of the running process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Fetch a variable that must be present and non-empty
///
/// # Errors
///
/// Returns [`TaskError::MissingVar`] if the variable is unset or empty.
pub fn require<E: EnvSource + ?Sized>(env: &E, key: &str) -> Result<String> {
    match env.var(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(TaskError::MissingVar {
            name: key.to_string(),
        }),
    }
}

// Fetch a variable, falling back to the default when unset or empty
pub fn optional_or<E: EnvSource + ?Sized>(env: &E, key: &str, default: &str) -> String {
    match env.var(key) {
        Some(value) if !value.is_empty() => value,
        _ => {
            info!("{key} not set, defaulting to {default}");
            default.to_string()
        }
    }
}

/// Expand a leading `~/` using `HOME`
///
/// # Errors
///
/// Returns [`TaskError::MissingVar`] if the path needs expanding and `HOME` is unset.
pub fn expand_home<E: EnvSource + ?Sized>(path: &str, env: &E) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(home_dir(env)?.join(rest)),
        None => Ok(PathBuf::from(path)),
    }
}

/// # Errors
///
/// Returns [`TaskError::MissingVar`] if `HOME` is unset or empty.
pub fn home_dir<E: EnvSource + ?Sized>(env: &E) -> Result<PathBuf> {
    require(env, "HOME").map(PathBuf::from)
}

/// Static target table to use: the explicit path if given, otherwise
/// `CLUSTER_TASKS_TARGETS`. Read after the local environment file is loaded
/// so a value set only there still applies.
#[must_use]
pub fn targets_file<E: EnvSource + ?Sized>(
    explicit: Option<&Path>,
    env: &E,
) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        env.var(TARGETS_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
}

// Which critical variables are missing from the given set of keys
#[must_use]
pub fn missing_critical_vars(keys: &HashSet<String>) -> Vec<&'static str> {
    CRITICAL_VARS
        .iter()
        .copied()
        .filter(|name| !keys.contains(*name))
        .collect()
}

/// Load the optional local environment file into the process environment.
///
/// Variables already set in the process take precedence. A missing or
/// unreadable file is reported and otherwise ignored. Returns whether the
/// file was loaded.
pub fn load_env_file(path: &Path) -> bool {
    if let Err(e) = dotenvy::from_path(path) {
        info!(
            "{} not loaded ({e}), using existing environment variables",
            path.display()
        );
        return false;
    }
    info!("{} loaded successfully", path.display());

    let keys: HashSet<String> = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter.filter_map(|entry| entry.ok().map(|(key, _)| key)).collect(),
        Err(e) => {
            warn!("failed to read {}: {e}", path.display());
            return true;
        }
    };

    for name in CRITICAL_VARS {
        if !keys.contains(*name) {
            continue;
        }
        if require(&ProcessEnv, name).is_ok() {
            info!("critical variable {name} found in {}", path.display());
        } else {
            warn!(
                "critical variable {name} found in {} but not set in environment",
                path.display()
            );
        }
    }
    for name in missing_critical_vars(&keys) {
        warn!("critical variable {name} not found in {}", path.display());
    }

    true
}
