//! Stevedore Core - Core types for the air-gap deployment tool
//!
//! This crate provides the plain types shared by the cluster and CLI crates:
//! - `TunnelSpec`: What a tunnel should connect to (namespace, kind, name, ports)
//! - `ConnectEntry`: Well-known and label-discovered connect targets
//! - `TunnelConfig`: User configuration for tunnel behavior

pub mod config;
pub mod connect;
pub mod error;
pub mod target;

pub use config::TunnelConfig;
pub use connect::{
    CONNECT_DESCRIPTION_ANNOTATION, CONNECT_LABEL, CONNECT_URL_ANNOTATION, ConnectEntry,
    ConnectString, ConnectStrings, WellKnownAlias,
};
pub use error::{CoreError, Result};
pub use target::{
    LOCALHOST, ResourceKind, SYSTEM_NAMESPACE, TunnelSpec, endpoint_url, is_service_url,
};
