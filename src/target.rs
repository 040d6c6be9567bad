use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TaskError};
use crate::system::{Invocation, Runner};
use crate::{DeployTarget, Settings};

// Shape of `deploy.nodes.<name>` as emitted by `nix eval --json`
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct DeployNode {
    #[serde(default)]
    ssh_hostname: String,
    #[serde(default)]
    ssh_user: String,
}

/// Static lookup table from configuration name to deploy target
#[derive(Debug, Clone, Default)]
pub struct StaticTargets {
    targets: HashMap<String, DeployTarget>,
}

impl StaticTargets {
    #[must_use]
    pub fn new(targets: HashMap<String, DeployTarget>) -> Self {
        Self { targets }
    }

    /// Load the table from a JSON object of `"name": "user@host"` entries
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a JSON object of
    /// strings, or any entry is not in `user@host` form.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let content = fs::read_to_string(&path)
            .map_err(|e| TaskError::io(format!("failed to read targets from {path_str}"), e))?;

        Self::parse(&content, &path_str)
    }

    /// # Errors
    ///
    /// Returns [`TaskError::MalformedOutput`] for invalid JSON and
    /// [`TaskError::MalformedTarget`] for entries not in `user@host` form.
    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(content).map_err(|source| TaskError::MalformedOutput {
                context: origin.to_string(),
                source,
            })?;

        let targets = raw
            .into_iter()
            .map(|(name, target)| Ok((name, target.parse::<DeployTarget>()?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self { targets })
    }

    /// # Errors
    ///
    /// Returns [`TaskError::UnknownTarget`] if the name has no entry.
    pub fn get(&self, config: &str) -> Result<DeployTarget> {
        self.targets
            .get(config)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTarget(config.to_string()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Where deploy targets come from for one invocation
#[derive(Debug, Clone, Default)]
pub enum TargetSource {
    /// Evaluate `deploy.nodes.<name>` from the flake
    #[default]
    Flake,
    /// Look the name up in a fixed table
    Static(StaticTargets),
}

impl TargetSource {
    /// Resolve a configuration name to its `user@host` target
    ///
    /// # Errors
    ///
    /// Fails if the evaluator fails or prints malformed JSON, if either field
    /// is empty, or if the name is absent from a static table.
    pub fn resolve<R: Runner + ?Sized>(
        &self,
        config: &str,
        settings: &Settings,
        runner: &mut R,
    ) -> Result<DeployTarget> {
        match self {
            Self::Static(table) => table.get(config),
            Self::Flake => eval_flake_target(config, settings, runner),
        }
    }
}

fn eval_flake_target<R: Runner + ?Sized>(
    config: &str,
    settings: &Settings,
    runner: &mut R,
) -> Result<DeployTarget> {
    // --impure because the node definitions read their addresses from the environment
    let attr = settings.flake_ref(&format!("deploy.nodes.{config}"));
    info!("evaluating flake attribute '{attr}' to get deploy target...");

    let eval = Invocation::new("nix")
        .args(["eval", "--json", "--impure", "--show-trace"])
        .arg(attr);
    let json = runner.output(&eval)?;

    parse_deploy_node(config, &json)
}

/// Turn `nix eval --json` output for a deploy node into a target
///
/// # Errors
///
/// Returns [`TaskError::MalformedOutput`] for invalid JSON and
/// [`TaskError::EmptyTarget`] if `sshUser` or `sshHostname` is missing or empty.
pub fn parse_deploy_node(config: &str, json: &str) -> Result<DeployTarget> {
    let node: DeployNode =
        serde_json::from_str(json).map_err(|source| TaskError::MalformedOutput {
            context: format!("nix eval for '{config}'"),
            source,
        })?;

    DeployTarget::new(config, &node.ssh_user, &node.ssh_hostname)
}
