use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::env::{self, EnvSource};
use crate::error::{PhaseExt, Result, TaskError};
use crate::system::{Invocation, Runner};
use crate::target::TargetSource;
use crate::{parse_flag, DeployTarget, Settings};

// Constants
const AGE_KEY_PREFIX: &str = "AGE-SECRET-KEY-";
const AGE_KEY_DIR: &str = "etc/sops/age";
const AGE_KEY_FILE: &str = "key.txt";
const REMOTE_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
const FACTER_REPORT: &str = "/tmp/facter.json";

const DEFAULT_LOCATION: &str = "ash";
const DEFAULT_IMAGE: &str = "debian-12";
const DEFAULT_SERVER_TYPE: &str = "cpx21";

/// Properties of a cloud server, gathered from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub token: String,
    pub ssh_key_name: String,
    pub network: String,
    pub placement_group: String,
    pub location: String,
    pub image: String,
    pub server_type: String,
    pub enable_ipv4: bool,
}

impl ServerSpec {
    /// Build the spec for `name`, validating required variables first.
    ///
    /// `ipv4` is the explicit command argument; when absent or empty the
    /// `HETZNER_DEFAULT_ENABLE_IPV4` variable decides.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::MissingVar`] for an unset required variable and
    /// [`TaskError::InvalidFlag`] for an `ipv4` argument other than true/false.
    pub fn from_env<E: EnvSource + ?Sized>(
        name: &str,
        ipv4: Option<&str>,
        vars: &E,
    ) -> Result<Self> {
        let token = env::require(vars, "HCLOUD_TOKEN")?;
        let ssh_key_name = env::require(vars, "HETZNER_SSH_KEY_NAME")?;
        let network = env::require(vars, "PRIVATE_NETWORK_NAME")?;
        let placement_group = env::require(vars, "PLACEMENT_GROUP_NAME")?;

        let location = env::optional_or(vars, "HETZNER_LOCATION", DEFAULT_LOCATION);
        let image = env::optional_or(vars, "HETZNER_IMAGE_NAME", DEFAULT_IMAGE);
        let server_type = env::optional_or(vars, "CONTROL_PLANE_VM_TYPE", DEFAULT_SERVER_TYPE);

        let enable_ipv4 = match ipv4 {
            Some(value) if !value.is_empty() => parse_flag(value)?,
            _ => vars
                .var("HETZNER_DEFAULT_ENABLE_IPV4")
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
        };

        Ok(Self {
            name: name.to_string(),
            token,
            ssh_key_name,
            network,
            placement_group,
            location,
            image,
            server_type,
            enable_ipv4,
        })
    }

    #[must_use]
    pub fn datacenter(&self) -> String {
        format!("{}-dc1", self.location)
    }

    #[must_use]
    pub fn delete_invocation(&self) -> Invocation {
        Invocation::new("hcloud")
            .args(["server", "delete", self.name.as_str()])
            .env("HCLOUD_TOKEN", &self.token)
    }

    #[must_use]
    pub fn create_invocation(&self) -> Invocation {
        let create = Invocation::new("hcloud")
            .args(["server", "create"])
            .args(["--name", self.name.as_str()])
            .args(["--type", self.server_type.as_str()])
            .args(["--image", self.image.as_str()])
            .args(["--datacenter", self.datacenter().as_str()])
            .args(["--ssh-key", self.ssh_key_name.as_str()])
            .args(["--network", self.network.as_str()])
            .args(["--placement-group", self.placement_group.as_str()])
            .env("HCLOUD_TOKEN", &self.token);

        if self.enable_ipv4 {
            create
        } else {
            create.arg("--without-ipv4")
        }
    }
}

/// Read the age private key, checking its format
///
/// # Errors
///
/// Returns [`TaskError::MissingVar`] if unset and [`TaskError::InvalidVar`]
/// if it does not start with `AGE-SECRET-KEY-`.
pub fn age_private_key<E: EnvSource + ?Sized>(vars: &E) -> Result<String> {
    let key = env::require(vars, "AGE_PRIVATE_KEY")?;
    if !key.starts_with(AGE_KEY_PREFIX) {
        return Err(TaskError::InvalidVar {
            name: "AGE_PRIVATE_KEY".to_string(),
            reason: format!("should start with {AGE_KEY_PREFIX}"),
        });
    }
    Ok(key)
}

/// Write the age key into a fresh temporary tree laid out as it should appear
/// on the target (`etc/sops/age/key.txt`). The tree is removed when the
/// returned guard is dropped.
///
/// # Errors
///
/// Returns [`TaskError::Io`] if the directory or key file cannot be created.
pub fn stage_age_key(key: &str) -> Result<TempDir> {
    let staging = tempfile::Builder::new()
        .prefix("nixos-anywhere-age-key")
        .tempdir()
        .map_err(|e| TaskError::io("failed to create temporary directory for age key", e))?;

    let key_dir = staging.path().join(AGE_KEY_DIR);
    create_dir_with_mode(&key_dir, 0o700)
        .map_err(|e| TaskError::io("failed to create age key directory", e))?;

    let key_path = key_dir.join(AGE_KEY_FILE);
    write_with_mode(&key_path, key.as_bytes(), 0o600)
        .map_err(|e| TaskError::io("failed to write age key", e))?;

    info!(
        "age key written to temporary path {} for deployment",
        key_path.display()
    );
    Ok(staging)
}

fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;

    // Fix permissions on files that already existed with a wider mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

// Tasks runs the orchestration procedures against a runner and environment
pub struct Tasks<R: Runner, E: EnvSource> {
    runner: R,
    env: E,
    targets: TargetSource,
    settings: Settings,
}

impl<R: Runner, E: EnvSource> Tasks<R, E> {
    pub fn new(runner: R, env: E, targets: TargetSource, settings: Settings) -> Self {
        Self {
            runner,
            env,
            targets,
            settings,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Validate the flake with `nix flake check`
    ///
    /// # Errors
    ///
    /// Returns an error if the check reports any problem.
    pub fn check_flake(&mut self) -> Result<()> {
        info!("checking nix flake...");
        let check = Invocation::new("nix").args(["flake", "check", "--show-trace"]);
        self.runner.run(&check.arg(self.settings.flake.as_str()))
    }

    /// # Errors
    ///
    /// Returns an error if `nix flake update` fails.
    pub fn update_flake(&mut self) -> Result<()> {
        info!("updating flake inputs...");
        let update = Invocation::new("nix").args(["flake", "update", "--flake"]);
        self.runner.run(&update.arg(self.settings.flake.as_str()))
    }

    /// # Errors
    ///
    /// Returns an error if `nix flake show` fails.
    pub fn show_flake(&mut self) -> Result<()> {
        info!("showing flake outputs...");
        let show = Invocation::new("nix").args(["flake", "show"]);
        self.runner.run(&show.arg(self.settings.flake.as_str()))
    }

    /// # Errors
    ///
    /// See [`TargetSource::resolve`].
    pub fn resolve_target(&mut self, config: &str) -> Result<DeployTarget> {
        self.targets
            .resolve(config, &self.settings, &mut self.runner)
            .phase("resolve deploy target", config)
    }

    /// Update an existing installation with deploy-rs after validating the flake
    ///
    /// # Errors
    ///
    /// Returns an error if the flake check or the deployment fails.
    pub fn deploy(&mut self, config: &str) -> Result<()> {
        self.check_flake().phase("flake check", config)?;

        info!("deploying nixos configuration '{config}' via deploy-rs...");
        let deploy = Invocation::new("deploy").arg(self.settings.flake_ref(config));
        self.runner.run(&deploy).phase("deploy", config)
    }

    /// Pull the checkout on the node and switch to the new configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be resolved or the remote rebuild fails.
    pub fn rebuild(&mut self, config: &str) -> Result<()> {
        let target = self.resolve_target(config)?;

        info!("rebuilding nixos configuration '{config}' on {target}...");
        info!(
            "this assumes the flake checkout at {} on the target can be pulled",
            self.settings.remote_checkout
        );
        let remote = format!(
            "cd {} && git pull && nixos-rebuild switch --flake .#{config}",
            self.settings.remote_checkout
        );
        let rebuild = Invocation::new("ssh").arg(target.to_string()).arg(remote);
        self.runner.run(&rebuild).phase("remote rebuild", config)
    }

    // SSH identity from DEPLOY_SSH_KEY or the default, which must exist locally
    fn ssh_key_path(&self) -> Result<PathBuf> {
        let configured =
            env::optional_or(&self.env, "DEPLOY_SSH_KEY", &self.settings.default_ssh_key);
        let path = env::expand_home(&configured, &self.env)?;
        if !path.exists() {
            return Err(TaskError::MissingKeyFile(path));
        }
        info!("using ssh key: {}", path.display());
        Ok(path)
    }

    /// Reinstall a node with nixos-anywhere, carrying the age key along, then
    /// try to fetch its cluster credentials.
    ///
    /// Failing to fetch the credentials is only a warning since K3s may still
    /// be starting or the node may not run a control plane.
    ///
    /// # Errors
    ///
    /// Returns an error if the key material is missing or malformed, the
    /// target cannot be resolved, the install fails, or the fetched
    /// credentials cannot be written locally.
    pub fn recreate_node(&mut self, config: &str) -> Result<()> {
        let age_key = age_private_key(&self.env).phase("recreate node", config)?;
        let ssh_key = self.ssh_key_path().phase("recreate node", config)?;
        let target = self.resolve_target(config)?;

        let staging = stage_age_key(&age_key).phase("stage age key", config)?;

        info!("running nixos-anywhere to deploy nixos to {target}...");
        let install = Invocation::new("nixos-anywhere")
            .arg("--debug")
            .args(["-f", self.settings.flake_ref(config).as_str()])
            .args(["--generate-hardware-config", "nixos-facter", FACTER_REPORT])
            .arg("--extra-files")
            .arg(staging.path().to_string_lossy())
            .arg("--substitute-on-destination")
            .arg("--copy-host-keys")
            .arg("-i")
            .arg(ssh_key.to_string_lossy())
            .arg(target.to_string());
        info!("running {install}");
        self.runner
            .run(&install)
            .phase("nixos-anywhere install", config)?;
        drop(staging);

        info!("waiting for {} to reboot and become available...", target.host);
        self.runner.sleep(self.settings.install_wait);

        info!("attempting to copy k3s configuration file from the server...");
        match self.fetch_remote_kubeconfig(&target, &ssh_key) {
            Ok(content) => {
                let path = self.write_kubeconfig(config, &content)?;
                info!("to use it, run: export KUBECONFIG={}", path.display());
            }
            // K3s may still be starting, or this is not a control plane node
            Err(e) => warn!("failed to copy k3s.yaml from {target}: {e}"),
        }

        info!("node '{config}' recreated and configured, tailscale and k3s should be setting up");
        Ok(())
    }

    /// Fetch the K3s credentials of an already running node
    ///
    /// # Errors
    ///
    /// Unlike the fetch after an install, any failure here is returned.
    pub fn fetch_kubeconfig(&mut self, config: &str) -> Result<PathBuf> {
        let ssh_key = self.ssh_key_path().phase("fetch kubeconfig", config)?;
        let target = self.resolve_target(config)?;
        let content = self
            .fetch_remote_kubeconfig(&target, &ssh_key)
            .phase("fetch kubeconfig", config)?;
        self.write_kubeconfig(config, &content)
    }

    fn fetch_remote_kubeconfig(
        &mut self,
        target: &DeployTarget,
        ssh_key: &Path,
    ) -> Result<String> {
        // The host keys may have just been replaced by the install
        let fetch = Invocation::new("ssh")
            .arg("-i")
            .arg(ssh_key.to_string_lossy())
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .arg(target.to_string())
            .arg(format!("sudo cat {REMOTE_KUBECONFIG}"));
        self.runner.output(&fetch)
    }

    /// Local path the credentials for `config` are written to
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::MissingVar`] if `HOME` is unset.
    pub fn kubeconfig_path(&self, config: &str) -> Result<PathBuf> {
        Ok(env::home_dir(&self.env)?
            .join(".kube")
            .join(format!("{config}.yaml")))
    }

    fn write_kubeconfig(&self, config: &str, content: &str) -> Result<PathBuf> {
        let path = self.kubeconfig_path(config)?;
        if let Some(dir) = path.parent() {
            create_dir_with_mode(dir, 0o755)
                .map_err(|e| TaskError::io("failed to create kubeconfig directory", e))?;
        }
        write_with_mode(&path, content.as_bytes(), 0o600).map_err(|e| {
            TaskError::io(format!("failed to write kubeconfig to {}", path.display()), e)
        })?;

        info!("k3s config copied to {}", path.display());
        Ok(path)
    }

    /// Delete the named cloud server if it exists and create it again with
    /// the same properties.
    ///
    /// A deleted server is not restored if the creation fails.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing, `ipv4` is not a
    /// boolean, the flake check fails, the delete fails for any reason other
    /// than the server not existing, or the creation fails.
    pub fn recreate_server(&mut self, server: &str, ipv4: Option<&str>) -> Result<()> {
        let spec =
            ServerSpec::from_env(server, ipv4, &self.env).phase("read server settings", server)?;
        self.check_flake().phase("flake check", server)?;

        info!(
            "recreating server {server} with ipv4 enabled: {}...",
            spec.enable_ipv4
        );

        info!("deleting existing server...");
        match self.runner.output(&spec.delete_invocation()) {
            Ok(_) => info!("server {server} deleted"),
            Err(e) if e.is_not_found("server") => info!("server {server} did not exist"),
            Err(e) => return Err(e.in_phase("delete server", server)),
        }

        info!("creating new server...");
        self.runner
            .run(&spec.create_invocation())
            .phase("create server", server)?;

        info!("server {server} recreated successfully");
        Ok(())
    }

    /// Recreate the cloud server, wait for it to boot, then install NixOS on it
    ///
    /// # Errors
    ///
    /// Returns the first failure, wrapped with the phase it happened in. The
    /// install is never attempted if recreating the server fails.
    pub fn redeploy_server(
        &mut self,
        server: &str,
        config: &str,
        ipv4: Option<&str>,
    ) -> Result<()> {
        info!("starting complete redeployment of server {server} with flake config {config}");

        self.recreate_server(server, ipv4).phase("recreate server", server)?;

        info!("waiting for server to be fully up and reachable over ssh...");
        self.runner.sleep(self.settings.boot_wait);

        self.recreate_node(config).phase("deploy nixos", config)?;

        info!("server {server} deleted, recreated, and redeployed with configuration {config}");
        Ok(())
    }

    /// Print the decrypted secrets file to the console
    ///
    /// # Errors
    ///
    /// Returns an error if `AGE_PRIVATE_KEY` is unset or sops fails.
    pub fn decrypt_secrets(&mut self) -> Result<()> {
        let file = self.settings.secrets_file.clone();
        info!("decrypting {file}...");

        let key = env::require(&self.env, "AGE_PRIVATE_KEY").phase("decrypt secrets", &file)?;
        let decrypt = Invocation::new("sops")
            .args(["--decrypt", file.as_str()])
            .env("SOPS_AGE_KEY", key);
        self.runner.run(&decrypt).phase("decrypt secrets", &file)?;

        info!("decryption complete");
        warn!("the decrypted secrets were printed to your console, be mindful of your environment");
        Ok(())
    }

    /// Reinstall the self-hosted control node
    ///
    /// # Errors
    ///
    /// See [`Tasks::recreate_node`].
    pub fn deploy_control_node(&mut self) -> Result<()> {
        let config = self.settings.control_node.clone();
        info!("deploying self-hosted control node ({config})...");
        self.recreate_node(&config)
    }
}
