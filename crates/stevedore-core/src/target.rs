//! Tunnel targets: what a tunnel connects to and how its endpoint is addressed

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{CoreError, Result};

/// Loopback address every tunnel binds to
pub const LOCALHOST: &str = "127.0.0.1";

/// Namespace holding the system services (registry, git server, logging stack)
pub const SYSTEM_NAMESPACE: &str = "zarf";

/// Matches `{name}.{namespace}.svc.cluster.local`
static SERVICE_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[^\.]+)\.(?P<namespace>[^\.]+)\.svc\.cluster\.local$")
        .expect("valid regex")
});

/// Kind of cluster resource a tunnel points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Forward directly to a named pod
    Pod,
    /// Forward to a ready pod selected by the service's selector
    #[serde(rename = "svc", alias = "service")]
    Service,
}

impl ResourceKind {
    /// Short name used in CLI flags and log output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "svc",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(Self::Pod),
            "svc" | "service" | "services" => Ok(Self::Service),
            _ => Err(CoreError::UnsupportedResourceKind {
                kind: s.to_string(),
            }),
        }
    }
}

/// Immutable description of a tunnel to open
///
/// A local port of `0` asks for an automatically assigned port. The resource
/// name and remote port may be left empty until an alias or connect label
/// fills them in, but must be set before the tunnel is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub namespace: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub url_suffix: String,
}

impl TunnelSpec {
    /// Create a spec for a resource
    pub fn new(
        namespace: impl Into<String>,
        kind: ResourceKind,
        resource_name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            resource_name: resource_name.into(),
            local_port,
            remote_port,
            url_suffix: String::new(),
        }
    }

    /// Service spec in the system namespace, waiting for an alias to name the target
    pub fn system() -> Self {
        Self::new(SYSTEM_NAMESPACE, ResourceKind::Service, "", 0, 0)
    }

    /// Parse a spec from an in-cluster service URL
    ///
    /// Expected format: `http://{SERVICE}.{NAMESPACE}.svc.cluster.local:{PORT}`.
    /// The local port is auto-assigned.
    pub fn from_service_url(service_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(service_url).map_err(|e| CoreError::InvalidServiceUrl {
            url: service_url.to_string(),
            message: e.to_string(),
        })?;

        let host = parsed.host_str().unwrap_or_default();
        let captures =
            SERVICE_HOST_PATTERN
                .captures(host)
                .ok_or_else(|| CoreError::NotAServiceUrl {
                    url: service_url.to_string(),
                })?;

        // The port must be spelled out. Url drops a port equal to the scheme
        // default, so look for it in the input before calling it missing.
        let written_default = parsed
            .port_or_known_default()
            .filter(|p| service_url.contains(&format!("{}:{}", host, p)));
        let remote_port = match parsed.port().or(written_default) {
            Some(0) => {
                return Err(CoreError::InvalidServiceUrl {
                    url: service_url.to_string(),
                    message: "invalid port 0".to_string(),
                });
            }
            Some(port) => port,
            None => {
                return Err(CoreError::InvalidServiceUrl {
                    url: service_url.to_string(),
                    message: "missing port".to_string(),
                });
            }
        };

        Ok(Self::new(
            &captures["namespace"],
            ResourceKind::Service,
            &captures["name"],
            0,
            remote_port,
        ))
    }

    /// Set the URL suffix appended to the endpoint
    pub fn with_url_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.url_suffix = suffix.into();
        self
    }

    /// Check the spec is complete enough to establish a tunnel
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.is_empty() {
            return Err(CoreError::MissingResourceName);
        }
        if self.remote_port < 1 {
            return Err(CoreError::MissingRemotePort);
        }
        Ok(())
    }

    /// Whether the local port should be picked automatically
    pub fn wants_auto_port(&self) -> bool {
        self.local_port == 0
    }

    /// Human-readable target, e.g. `svc/zarf-docker-registry`
    pub fn resource_ref(&self) -> String {
        format!("{}/{}", self.kind, self.resource_name)
    }
}

/// Check whether a URL points at an in-cluster service
pub fn is_service_url(service_url: &str) -> bool {
    url::Url::parse(service_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| SERVICE_HOST_PATTERN.is_match(h)))
        .unwrap_or(false)
}

/// Build the endpoint URL a tunnel is reachable at
pub fn endpoint_url(local_port: u16, url_suffix: &str) -> String {
    format!("http://{}:{}{}", LOCALHOST, local_port, url_suffix)
}
