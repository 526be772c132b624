//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("unsupported resource kind: {kind} (expected pod or svc)")]
    UnsupportedResourceKind { kind: String },

    #[error("missing resource name")]
    MissingResourceName,

    #[error("missing remote port")]
    MissingRemotePort,

    #[error("not a cluster service URL: {url}")]
    NotAServiceUrl { url: String },

    #[error("invalid service URL '{url}': {message}")]
    InvalidServiceUrl { url: String, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to parse configuration: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
