use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use cluster_tasks::env::targets_file;
use cluster_tasks::{ProcessEnv, Settings, StaticTargets, SystemRunner, TargetSource, Tasks};

// CLI arguments parsing structure
#[derive(Parser)]
#[command(author, version, about, long_about = None, disable_help_subcommand = true)]
pub struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output results in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Flake reference used for every evaluation and install
    #[arg(long, default_value = ".", global = true)]
    pub flake: String,

    /// Resolve deploy targets from a JSON table instead of evaluating the flake
    /// [env: CLUSTER_TASKS_TARGETS, also read from the environment file]
    #[arg(long, global = true)]
    pub targets: Option<PathBuf>,

    /// Local environment file loaded at startup
    #[arg(long, default_value = ".env", global = true)]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the flake (default)
    #[command(alias = "check-flake")]
    Check,
    /// Update all flake inputs
    #[command(alias = "update-flake")]
    Update,
    /// Show flake outputs
    #[command(alias = "show-flake")]
    Show,
    /// Print the user@host deploy target of a configuration
    Resolve {
        /// Flake configuration name
        config: String,
    },
    /// Update an existing installation with deploy-rs
    Deploy {
        /// Flake configuration name
        config: String,
    },
    /// Pull and switch the configuration on the node itself
    Rebuild {
        /// Flake configuration name
        config: String,
    },
    /// Reinstall a node with nixos-anywhere
    RecreateNode {
        /// Flake configuration name
        config: String,
    },
    /// Delete and recreate a Hetzner Cloud server
    RecreateServer {
        /// Server name
        server: String,
        /// Enable a public IPv4 address (true/false)
        ipv4: Option<String>,
    },
    /// Recreate a server, then reinstall NixOS on it
    #[command(alias = "delete-and-redeploy-server")]
    RedeployServer {
        /// Server name
        server: String,
        /// Flake configuration name
        config: String,
        /// Enable a public IPv4 address (true/false)
        ipv4: Option<String>,
    },
    /// Copy the K3s credentials of a node to ~/.kube/<config>.yaml
    FetchKubeconfig {
        /// Flake configuration name
        config: String,
    },
    /// Print the decrypted secrets file
    DecryptSecrets,
    /// Reinstall the self-hosted control node
    DeployControlNode,
}

impl Cli {
    // Log level selected by the verbosity flags
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            _ => "trace",
        }
    }
}

// Structure for JSON target output
#[derive(Serialize)]
struct ResolvedTarget<'a> {
    config: &'a str,
    user: String,
    host: String,
    target: String,
}

fn build_tasks(cli: &Cli) -> Result<Tasks<SystemRunner, ProcessEnv>> {
    // The environment file is loaded by now, so the variable may come from it
    let targets = match targets_file(cli.targets.as_deref(), &ProcessEnv) {
        Some(path) => {
            let table = StaticTargets::from_file(&path)
                .with_context(|| format!("failed to load targets from {}", path.display()))?;
            TargetSource::Static(table)
        }
        None => TargetSource::Flake,
    };

    let settings = Settings {
        flake: cli.flake.clone(),
        ..Settings::default()
    };

    Ok(Tasks::new(SystemRunner, ProcessEnv, targets, settings))
}

// Execute the selected command
pub fn execute_command(cli: &Cli) -> Result<()> {
    let mut tasks = build_tasks(cli)?;

    match cli.command.as_ref().unwrap_or(&Commands::Check) {
        Commands::Check => tasks.check_flake().context("flake check failed"),
        Commands::Update => tasks.update_flake().context("flake update failed"),
        Commands::Show => tasks.show_flake().context("flake show failed"),
        Commands::Resolve { config } => cmd_resolve(&mut tasks, config, cli.json),
        Commands::Deploy { config } => tasks
            .deploy(config)
            .with_context(|| format!("failed to deploy '{config}'")),
        Commands::Rebuild { config } => tasks
            .rebuild(config)
            .with_context(|| format!("failed to rebuild '{config}'")),
        Commands::RecreateNode { config } => tasks
            .recreate_node(config)
            .with_context(|| format!("failed to recreate node '{config}'")),
        Commands::RecreateServer { server, ipv4 } => tasks
            .recreate_server(server, ipv4.as_deref())
            .with_context(|| format!("failed to recreate server '{server}'")),
        Commands::RedeployServer {
            server,
            config,
            ipv4,
        } => tasks
            .redeploy_server(server, config, ipv4.as_deref())
            .with_context(|| format!("failed to redeploy server '{server}' as '{config}'")),
        Commands::FetchKubeconfig { config } => {
            let path = tasks
                .fetch_kubeconfig(config)
                .with_context(|| format!("failed to fetch kubeconfig for '{config}'"))?;
            println!("export KUBECONFIG={}", path.display());
            Ok(())
        }
        Commands::DecryptSecrets => tasks
            .decrypt_secrets()
            .context("failed to decrypt secrets"),
        Commands::DeployControlNode => tasks
            .deploy_control_node()
            .context("failed to deploy control node"),
    }
}

fn cmd_resolve(
    tasks: &mut Tasks<SystemRunner, ProcessEnv>,
    config: &str,
    json_output: bool,
) -> Result<()> {
    let target = tasks
        .resolve_target(config)
        .with_context(|| format!("failed to resolve deploy target for '{config}'"))?;

    if json_output {
        let resolved = ResolvedTarget {
            config,
            target: target.to_string(),
            user: target.user,
            host: target.host,
        };
        let json = serde_json::to_string_pretty(&resolved)
            .context("failed to serialize deploy target to JSON")?;
        println!("{json}");
    } else {
        println!("{target}");
    }

    Ok(())
}
