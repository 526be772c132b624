//! Integration tests for CLI commands
//!
//! These run the built binary and stay clear of anything that needs a
//! reachable cluster.

use std::io::Write;
use std::process::Command;

/// Helper to run stevedore with an empty kubeconfig
fn stevedore(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_stevedore"))
        .args(args)
        .env("KUBECONFIG", "/nonexistent/kubeconfig")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute stevedore")
}

mod help {
    use super::*;

    #[test]
    fn test_top_level_help() {
        let output = stevedore(&["--help"]);

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("connect"));
    }

    #[test]
    fn test_connect_help_lists_flags() {
        let output = stevedore(&["connect", "--help"]);

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        for flag in ["--name", "--namespace", "--type", "--local-port", "--remote-port", "--cli-only"] {
            assert!(stdout.contains(flag), "missing {} in help", flag);
        }
        assert!(stdout.contains("list"));
    }
}

mod connect_command {
    use super::*;

    #[test]
    fn test_unknown_resource_type_is_usage_error() {
        let output = stevedore(&["connect", "--name", "web", "--type", "deployment", "--remote-port", "80"]);

        assert_eq!(output.status.code(), Some(64));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("deployment"));
    }

    #[test]
    fn test_invalid_port_is_rejected_by_parser() {
        let output = stevedore(&["connect", "--local-port", "70000"]);
        assert!(!output.status.success());
    }

    #[test]
    fn test_invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "maxAttempts: 0").unwrap();

        let output = stevedore(&[
            "connect",
            "registry",
            "--config",
            file.path().to_str().unwrap(),
        ]);

        assert_eq!(output.status.code(), Some(2));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("maxAttempts"));
    }

    #[test]
    fn test_unreachable_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("tunnel.yaml");
        std::fs::write(&config, "namespace: zarf\n").unwrap();

        let output = Command::new(env!("CARGO_BIN_EXE_stevedore"))
            .args(["connect", "registry", "--cli-only", "--config"])
            .arg(&config)
            .env("KUBECONFIG", dir.path().join("missing"))
            .env("HOME", dir.path())
            .env_remove("KUBERNETES_SERVICE_HOST")
            .output()
            .expect("Failed to execute stevedore");

        assert_eq!(output.status.code(), Some(3));
    }
}

mod list_command {
    use super::*;

    #[test]
    fn test_list_json_flag_accepted() {
        let output = stevedore(&["connect", "list", "--help"]);

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("--json"));
    }
}
