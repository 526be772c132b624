//! CLI error types with exit code handling
//!
//! Library errors are folded into a small set of diagnostics, each mapped to
//! an exit code.

use miette::Diagnostic;
use stevedore_core::CoreError;
use stevedore_kube::TunnelError;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Invalid arguments
    #[error("{message}")]
    #[diagnostic(code(stevedore::cli::usage))]
    Usage {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Configuration file could not be used
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(stevedore::cli::config),
        help("check the file passed with --config or ~/.config/stevedore/tunnel.yaml")
    )]
    Config { message: String },

    /// Cluster unreachable
    #[error("Cluster error: {message}")]
    #[diagnostic(code(stevedore::cli::cluster))]
    Cluster {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Tunnel could not be established
    #[error("Tunnel error: {message}")]
    #[diagnostic(code(stevedore::cli::tunnel))]
    Tunnel {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(stevedore::cli::io))]
    Io { message: String },

    /// Wrapped error for passthrough (stores the formatted message)
    #[error("{message}")]
    #[diagnostic(code(stevedore::cli::error))]
    Other { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage { .. } => exit_codes::USAGE_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Cluster { .. } => exit_codes::CLUSTER_ERROR,
            CliError::Tunnel { .. } => exit_codes::TUNNEL_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Other { .. } => exit_codes::ERROR,
        }
    }

    /// Create a usage error with help text
    pub fn usage_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a cluster connection error
    pub fn cluster(err: impl std::fmt::Display) -> Self {
        Self::Cluster {
            message: err.to_string(),
            help: Some("check that your kubeconfig points at a reachable cluster".to_string()),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidConfig { .. } | CoreError::YamlParse(_) => CliError::Config {
                message: err.to_string(),
            },
            CoreError::Io(e) => CliError::Io {
                message: e.to_string(),
            },
            CoreError::UnsupportedResourceKind { .. } => {
                CliError::usage_with_help(err.to_string(), "use --type pod or --type svc")
            }
            other => CliError::Usage {
                message: other.to_string(),
                help: None,
            },
        }
    }
}

impl From<TunnelError> for CliError {
    fn from(err: TunnelError) -> Self {
        match &err {
            TunnelError::InvalidSpec(_) => CliError::usage_with_help(
                err.to_string(),
                "name a target, or pass --name and --remote-port",
            ),
            TunnelError::UnsupportedResourceKind(_) => {
                CliError::usage_with_help(err.to_string(), "use --type pod or --type svc")
            }
            TunnelError::Api(_) => CliError::cluster(&err),
            TunnelError::AlreadyConnected { .. } => CliError::Tunnel {
                message: err.to_string(),
                help: Some("close the running tunnel before connecting again".to_string()),
            },
            _ => CliError::Tunnel {
                message: err.to_string(),
                help: Some(
                    "check that the target exists and has a running pod; \
                     `stevedore connect list` shows advertised targets"
                        .to_string(),
                ),
            },
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Other {
            message: err.to_string(),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
