//! Connect targets: well-known aliases and label-discovered entries
//!
//! A service opts into `stevedore connect <name>` by carrying the
//! [`CONNECT_LABEL`] label with `<name>` as its value. The optional
//! [`CONNECT_URL_ANNOTATION`] is appended to the tunnel endpoint and
//! [`CONNECT_DESCRIPTION_ANNOTATION`] is shown in the connect table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::target::{ResourceKind, TunnelSpec};

/// Label marking a service as a connect target; its value is the alias name
pub const CONNECT_LABEL: &str = "zarf.dev/connect-name";

/// Annotation holding a human-readable description of the target
pub const CONNECT_DESCRIPTION_ANNOTATION: &str = "zarf.dev/connect-description";

/// Annotation holding the URL suffix appended to the endpoint
pub const CONNECT_URL_ANNOTATION: &str = "zarf.dev/connect-url";

/// Grafana explore view pre-filtered to the system namespace logs
const LOGGING_URL_SUFFIX: &str = r#"/monitor/explore?orgId=1&left=%5B"now-12h","now","Loki",%7B"refId":"Zarf%20Logs","expr":"%7Bnamespace%3D%5C"zarf%5C"%7D"%7D%5D"#;

/// Built-in connect targets that never require a cluster lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownAlias {
    Registry,
    Logging,
    Git,
    Injector,
}

impl WellKnownAlias {
    /// All aliases, in display order
    pub const ALL: [WellKnownAlias; 4] = [Self::Registry, Self::Logging, Self::Git, Self::Injector];

    /// Match a target name case-insensitively
    pub fn parse(target: &str) -> Option<Self> {
        match target.to_ascii_uppercase().as_str() {
            "REGISTRY" => Some(Self::Registry),
            "LOGGING" => Some(Self::Logging),
            "GIT" => Some(Self::Git),
            "INJECTOR" => Some(Self::Injector),
            _ => None,
        }
    }

    /// Canonical alias name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registry => "REGISTRY",
            Self::Logging => "LOGGING",
            Self::Git => "GIT",
            Self::Injector => "INJECTOR",
        }
    }

    /// The fixed connect entry for this alias
    pub fn entry(&self) -> ConnectEntry {
        let (resource_name, remote_port, url_suffix) = match self {
            Self::Registry => ("zarf-docker-registry", 5000, "/v2/_catalog"),
            Self::Logging => ("zarf-loki-stack-grafana", 3000, LOGGING_URL_SUFFIX),
            Self::Git => ("zarf-gitea-http", 3000, ""),
            Self::Injector => ("zarf-injector", 5000, ""),
        };

        ConnectEntry {
            name: self.name().to_string(),
            resource_name: resource_name.to_string(),
            namespace: None,
            remote_port,
            url_suffix: url_suffix.to_string(),
            description: None,
        }
    }
}

/// A resolved connect target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectEntry {
    /// Alias the entry was looked up by
    pub name: String,

    /// Service to forward to
    pub resource_name: String,

    /// Namespace of the service, when discovered in the cluster
    #[serde(default)]
    pub namespace: Option<String>,

    /// Port on the selected pod
    pub remote_port: u16,

    /// Appended to the tunnel endpoint
    #[serde(default)]
    pub url_suffix: String,

    /// Cluster-supplied description
    #[serde(default)]
    pub description: Option<String>,
}

impl ConnectEntry {
    /// Derive a tunnel spec from `base`, pointing it at this entry
    ///
    /// The local port of `base` is kept; the namespace is replaced only when
    /// the entry was discovered in a specific namespace.
    pub fn apply_to(&self, base: &TunnelSpec) -> TunnelSpec {
        TunnelSpec {
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| base.namespace.clone()),
            kind: ResourceKind::Service,
            resource_name: self.resource_name.clone(),
            local_port: base.local_port,
            remote_port: self.remote_port,
            url_suffix: self.url_suffix.clone(),
        }
    }
}

/// Connect table row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectString {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

/// Connect table keyed by alias name
pub type ConnectStrings = BTreeMap<String, ConnectString>;
