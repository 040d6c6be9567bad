#[cfg(test)]
mod tests {
    use anyhow::Result;
    use cluster_tasks::env::{self, missing_critical_vars, targets_file, CRITICAL_VARS};
    use cluster_tasks::target::parse_deploy_node;
    use cluster_tasks::tasks::{age_private_key, stage_age_key, ServerSpec};
    use cluster_tasks::{
        parse_flag, DeployTarget, Invocation, Runner, StaticTargets, SystemRunner, TaskError,
    };
    use std::collections::{HashMap, HashSet};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::NamedTempFile;

    const REQUIRED_SERVER_VARS: [&str; 4] = [
        "HCLOUD_TOKEN",
        "HETZNER_SSH_KEY_NAME",
        "PRIVATE_NETWORK_NAME",
        "PLACEMENT_GROUP_NAME",
    ];

    // Helper to build an environment from pairs
    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn server_vars() -> HashMap<String, String> {
        vars(&[
            ("HCLOUD_TOKEN", "token"),
            ("HETZNER_SSH_KEY_NAME", "deploy"),
            ("PRIVATE_NETWORK_NAME", "k3s-net"),
            ("PLACEMENT_GROUP_NAME", "spread"),
        ])
    }

    // Test error context and formatting
    #[test]
    fn test_error_handling() {
        let missing = TaskError::MissingVar {
            name: "HCLOUD_TOKEN".to_string(),
        };
        let wrapped = missing.in_phase("recreate server", "web-1");
        assert_eq!(wrapped.to_string(), "recreate server failed for 'web-1'");

        let source = std::error::Error::source(&wrapped).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("HCLOUD_TOKEN environment variable must be set")
        );

        let with_context = anyhow::Error::new(wrapped).context("failed to recreate server");
        assert!(format!("{with_context:#}").contains("HCLOUD_TOKEN"));
    }

    // Test that a captured tool failure carries its stderr into the rendered chain
    #[cfg(unix)]
    #[test]
    fn test_tool_failure_reports_stderr() {
        let failing = Invocation::new("sh")
            .arg("-c")
            .arg("echo 'error: attribute deploy.nodes.x missing' >&2; exit 1");
        let err = SystemRunner.output(&failing).unwrap_err();
        assert!(matches!(&err, TaskError::ToolFailed { stderr, .. } if stderr.contains("deploy.nodes.x")));

        let rendered = format!(
            "{:#}",
            anyhow::Error::new(err.in_phase("resolve deploy target", "x"))
                .context("command execution failed")
        );
        assert!(rendered.contains("error: attribute deploy.nodes.x missing"));

        let silent = TaskError::ToolFailed {
            program: "deploy".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "  \n".to_string(),
        };
        assert_eq!(silent.to_string(), "deploy failed (exit status: 1)");
    }

    #[test]
    fn test_not_found_only_for_the_named_object() {
        let failure = |stderr: &str| TaskError::ToolFailed {
            program: "hcloud".to_string(),
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        };

        assert!(failure("hcloud: Server not found: web-1").is_not_found("server"));
        assert!(!failure("hcloud: config file not found").is_not_found("server"));
        assert!(!failure("hcloud: context not found: prod").is_not_found("server"));
        assert!(!failure("hcloud: network not found: k3s-net").is_not_found("server"));
        assert!(!TaskError::UnknownTarget("server not found".to_string()).is_not_found("server"));
    }

    #[test]
    fn test_targets_file_from_environment() {
        let env = vars(&[("CLUSTER_TASKS_TARGETS", "/etc/cluster/targets.json")]);

        assert_eq!(
            targets_file(None, &env),
            Some(PathBuf::from("/etc/cluster/targets.json"))
        );
        assert_eq!(
            targets_file(Some(Path::new("local.json")), &env),
            Some(PathBuf::from("local.json"))
        );
        assert_eq!(targets_file(None, &vars(&[("CLUSTER_TASKS_TARGETS", "")])), None);
        assert_eq!(targets_file(None, &HashMap::new()), None);
    }

    #[test]
    fn test_targets_file_set_only_in_env_file() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, "CLUSTER_TASKS_TARGETS=/srv/from-env-file.json")?;
        // Existing process variables win over the file, so only assert when unset
        if std::env::var_os("CLUSTER_TASKS_TARGETS").is_none() {
            assert!(env::load_env_file(temp_file.path()));
            assert_eq!(
                targets_file(None, &cluster_tasks::ProcessEnv),
                Some(PathBuf::from("/srv/from-env-file.json"))
            );
        }
        Ok(())
    }

    #[test]
    fn test_deploy_target_parsing() {
        let target: DeployTarget = "root@10.0.0.2".parse().unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.host, "10.0.0.2");
        assert_eq!(target.to_string(), "root@10.0.0.2");

        for bad in ["10.0.0.2", "@10.0.0.2", "root@", "", "@"] {
            assert!(
                matches!(bad.parse::<DeployTarget>(), Err(TaskError::MalformedTarget(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_flag() {
        for value in ["true", "TRUE", "True", "tRuE"] {
            assert!(parse_flag(value).unwrap());
        }
        for value in ["false", "FALSE", "False"] {
            assert!(!parse_flag(value).unwrap());
        }
        for value in ["", "yes", "no", "1", "0", " true", "true ", "t"] {
            assert!(
                matches!(parse_flag(value), Err(TaskError::InvalidFlag(_))),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_require_rejects_absent_and_empty() {
        let env = vars(&[("EMPTY", ""), ("SPACE", " "), ("SET", "value")]);

        assert!(matches!(
            env::require(&env, "ABSENT"),
            Err(TaskError::MissingVar { name }) if name == "ABSENT"
        ));
        assert!(matches!(
            env::require(&env, "EMPTY"),
            Err(TaskError::MissingVar { .. })
        ));
        assert_eq!(env::require(&env, "SPACE").unwrap(), " ");
        assert_eq!(env::require(&env, "SET").unwrap(), "value");
    }

    #[test]
    fn test_optional_defaults() {
        let env = vars(&[("EMPTY", ""), ("SET", "fsn1")]);

        assert_eq!(env::optional_or(&env, "ABSENT", "ash"), "ash");
        assert_eq!(env::optional_or(&env, "EMPTY", "ash"), "ash");
        assert_eq!(env::optional_or(&env, "SET", "ash"), "fsn1");
    }

    #[test]
    fn test_expand_home() {
        let env = vars(&[("HOME", "/home/ops")]);

        assert_eq!(
            env::expand_home("~/.ssh/id_rsa", &env).unwrap(),
            PathBuf::from("/home/ops/.ssh/id_rsa")
        );
        assert_eq!(
            env::expand_home("/etc/key", &env).unwrap(),
            PathBuf::from("/etc/key")
        );
        assert!(env::expand_home("~/.ssh/id_rsa", &HashMap::new()).is_err());
    }

    #[test]
    fn test_missing_critical_vars() {
        let keys: HashSet<String> = ["AGE_PRIVATE_KEY", "HCLOUD_TOKEN", "UNRELATED"]
            .iter()
            .map(ToString::to_string)
            .collect();

        let missing = missing_critical_vars(&keys);
        assert_eq!(missing, vec!["K3S_TOKEN", "TAILSCALE_AUTH_KEY", "GITHUB_TOKEN"]);
        assert_eq!(missing_critical_vars(&HashSet::new()).len(), CRITICAL_VARS.len());
    }

    #[test]
    fn test_load_env_file() -> Result<()> {
        assert!(!env::load_env_file(&PathBuf::from("/nonexistent/cluster-tasks.env")));

        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, "CLUSTER_TASKS_LOAD_TEST=loaded")?;
        assert!(env::load_env_file(temp_file.path()));
        assert_eq!(
            std::env::var("CLUSTER_TASKS_LOAD_TEST").as_deref(),
            Ok("loaded")
        );

        Ok(())
    }

    #[test]
    fn test_parse_deploy_node() {
        let json = r#"{"sshUser":"root","sshHostname":"10.0.0.2","hostname":"x"}"#;
        let target = parse_deploy_node("cpx21-control-1", json).unwrap();
        assert_eq!(target.to_string(), "root@10.0.0.2");

        assert!(matches!(
            parse_deploy_node("cpx21-control-1", r#"{"sshUser":"","sshHostname":"10.0.0.2"}"#),
            Err(TaskError::EmptyTarget(name)) if name == "cpx21-control-1"
        ));
        assert!(matches!(
            parse_deploy_node("cpx21-control-1", r#"{"sshUser":"root"}"#),
            Err(TaskError::EmptyTarget(_))
        ));
        assert!(matches!(
            parse_deploy_node("cpx21-control-1", "error: attribute missing"),
            Err(TaskError::MalformedOutput { .. })
        ));
    }

    // Test loading the static target table from a file
    #[test]
    fn test_static_targets_from_file() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        let json_content = r#"
        {
            "cpx21-control-1": "root@10.0.0.2",
            "thinkcenter-1": "admin@thinkcenter.lan"
        }
        "#;
        write!(temp_file, "{json_content}")?;

        let targets = StaticTargets::from_file(temp_file.path())?;

        assert_eq!(targets.names(), vec!["cpx21-control-1", "thinkcenter-1"]);
        for name in targets.names() {
            let target = targets.get(name)?;
            assert!(!target.user.is_empty() && !target.host.is_empty());
        }
        assert_eq!(
            targets.get("thinkcenter-1")?.to_string(),
            "admin@thinkcenter.lan"
        );
        assert!(matches!(
            targets.get("cpx31-worker-9"),
            Err(TaskError::UnknownTarget(name)) if name == "cpx31-worker-9"
        ));

        Ok(())
    }

    #[test]
    fn test_static_targets_rejects_bad_entries() {
        assert!(matches!(
            StaticTargets::parse(r#"{"node": "10.0.0.2"}"#, "inline"),
            Err(TaskError::MalformedTarget(_))
        ));
        assert!(matches!(
            StaticTargets::parse("[]", "inline"),
            Err(TaskError::MalformedOutput { .. })
        ));
        assert!(StaticTargets::from_file("/nonexistent/targets.json").is_err());
    }

    #[test]
    fn test_server_spec_requires_each_variable() {
        for name in REQUIRED_SERVER_VARS {
            let mut env = server_vars();
            env.remove(name);
            assert!(
                matches!(
                    ServerSpec::from_env("web-1", None, &env),
                    Err(TaskError::MissingVar { name: missing }) if missing == name
                ),
                "{name} should be required"
            );

            env.insert(name.to_string(), String::new());
            assert!(ServerSpec::from_env("web-1", None, &env).is_err());

            env.insert(name.to_string(), "anything".to_string());
            assert!(ServerSpec::from_env("web-1", None, &env).is_ok());
        }
    }

    #[test]
    fn test_server_spec_defaults() -> Result<()> {
        let spec = ServerSpec::from_env("web-1", None, &server_vars())?;
        assert_eq!(spec.location, "ash");
        assert_eq!(spec.datacenter(), "ash-dc1");
        assert_eq!(spec.image, "debian-12");
        assert_eq!(spec.server_type, "cpx21");
        assert!(!spec.enable_ipv4);

        let mut env = server_vars();
        env.insert("HETZNER_LOCATION".to_string(), String::new());
        env.insert("HETZNER_IMAGE_NAME".to_string(), "ubuntu-24.04".to_string());
        env.insert("CONTROL_PLANE_VM_TYPE".to_string(), "cpx31".to_string());
        let spec = ServerSpec::from_env("web-1", None, &env)?;
        assert_eq!(spec.location, "ash");
        assert_eq!(spec.image, "ubuntu-24.04");
        assert_eq!(spec.server_type, "cpx31");

        Ok(())
    }

    #[test]
    fn test_server_spec_ipv4() -> Result<()> {
        let mut env = server_vars();
        assert!(ServerSpec::from_env("web-1", Some("True"), &env)?.enable_ipv4);
        assert!(!ServerSpec::from_env("web-1", Some("false"), &env)?.enable_ipv4);
        assert!(matches!(
            ServerSpec::from_env("web-1", Some("maybe"), &env),
            Err(TaskError::InvalidFlag(_))
        ));

        env.insert("HETZNER_DEFAULT_ENABLE_IPV4".to_string(), "TRUE".to_string());
        assert!(ServerSpec::from_env("web-1", None, &env)?.enable_ipv4);
        assert!(ServerSpec::from_env("web-1", Some(""), &env)?.enable_ipv4);
        assert!(!ServerSpec::from_env("web-1", Some("false"), &env)?.enable_ipv4);

        let create = ServerSpec::from_env("web-1", None, &env)?.create_invocation();
        assert!(!create.args.contains(&"--without-ipv4".to_string()));

        Ok(())
    }

    #[test]
    fn test_server_invocations() -> Result<()> {
        let spec = ServerSpec::from_env("web-1", Some("false"), &server_vars())?;

        let delete = spec.delete_invocation();
        assert_eq!(delete.to_string(), "hcloud server delete web-1");

        let create = spec.create_invocation();
        assert_eq!(
            create.to_string(),
            "hcloud server create --name web-1 --type cpx21 --image debian-12 \
             --datacenter ash-dc1 --ssh-key deploy --network k3s-net \
             --placement-group spread --without-ipv4"
        );
        // The token travels in the environment, never on the command line
        assert!(!create.args.iter().any(|arg| arg.contains("token")));
        assert!(create
            .envs
            .contains(&("HCLOUD_TOKEN".to_string(), "token".to_string())));

        Ok(())
    }

    #[test]
    fn test_invocation_display_quotes_arguments() {
        let ssh = Invocation::new("ssh")
            .arg("root@10.0.0.2")
            .arg("sudo cat /etc/rancher/k3s/k3s.yaml")
            .arg("")
            .env("SECRET", "hidden");
        assert_eq!(
            ssh.to_string(),
            "ssh root@10.0.0.2 'sudo cat /etc/rancher/k3s/k3s.yaml' ''"
        );
    }

    #[test]
    fn test_age_private_key_format() {
        assert!(matches!(
            age_private_key(&HashMap::new()),
            Err(TaskError::MissingVar { .. })
        ));
        assert!(matches!(
            age_private_key(&vars(&[("AGE_PRIVATE_KEY", "not-a-key")])),
            Err(TaskError::InvalidVar { .. })
        ));
        assert!(age_private_key(&vars(&[("AGE_PRIVATE_KEY", "AGE-SECRET-KEY-1ABC")])).is_ok());
    }

    // Test that staged key material is laid out, locked down and removed on drop
    #[test]
    fn test_stage_age_key() -> Result<()> {
        let staging = stage_age_key("AGE-SECRET-KEY-1ABC")?;
        let root = staging.path().to_path_buf();
        let key_path = root.join("etc/sops/age/key.txt");

        assert_eq!(std::fs::read_to_string(&key_path)?, "AGE-SECRET-KEY-1ABC");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(&key_path)?.permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o600);
            let dir_mode = std::fs::metadata(root.join("etc/sops/age"))?
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(dir_mode, 0o700);
        }

        drop(staging);
        assert!(!root.exists());

        Ok(())
    }
}
