//! Connect-label discovery
//!
//! Services opt into `stevedore connect` by carrying the connect label. This
//! module resolves a single alias to a [`ConnectEntry`] and builds the
//! read-only connect table of every advertised target.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::sync::Arc;

use crate::cluster::ClusterClient;
use crate::error::{Result, TunnelError};
use stevedore_core::{
    CONNECT_DESCRIPTION_ANNOTATION, CONNECT_LABEL, CONNECT_URL_ANNOTATION, ConnectEntry,
    ConnectString, ConnectStrings,
};

/// Looks up connect targets advertised by services in the cluster
#[derive(Clone)]
pub struct ConnectLabelLookup {
    cluster: Arc<dyn ClusterClient>,
}

impl ConnectLabelLookup {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Find the service advertising `name`
    ///
    /// Several services may carry the same alias; the first one in listing
    /// order is used and no further ordering is applied.
    pub async fn find(&self, name: &str) -> Result<ConnectEntry> {
        let selector = format!("{}={}", CONNECT_LABEL, name);
        let matches = self.cluster.list_services(None, &selector).await?;

        if matches.len() > 1 {
            tracing::debug!(name, count = matches.len(), "multiple services share connect name, using the first");
        }

        let service = matches.into_iter().next().ok_or_else(|| TunnelError::NotFound {
            name: name.to_string(),
        })?;

        let entry = entry_from_service(name, &service)?;
        tracing::debug!(
            name,
            namespace = entry.namespace.as_deref().unwrap_or_default(),
            service = %entry.resource_name,
            port = entry.remote_port,
            "connect label match"
        );
        Ok(entry)
    }

    /// Every connect target advertised in the cluster
    pub async fn connect_strings(&self) -> Result<ConnectStrings> {
        let services = self.cluster.list_services(None, CONNECT_LABEL).await?;

        let mut connections = ConnectStrings::new();
        for service in &services {
            let Some(name) = label(service, CONNECT_LABEL) else {
                continue;
            };
            connections.insert(
                name.to_string(),
                ConnectString {
                    description: annotation(service, CONNECT_DESCRIPTION_ANNOTATION)
                        .unwrap_or_default()
                        .to_string(),
                    url: annotation(service, CONNECT_URL_ANNOTATION)
                        .unwrap_or_default()
                        .to_string(),
                },
            );
        }

        Ok(connections)
    }
}

fn label<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

fn annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Build a connect entry from a matched service
///
/// Only the first declared port is used. Its numeric target port is what the
/// pod listens on; a named or missing target port falls back to the service
/// port.
fn entry_from_service(name: &str, service: &Service) -> Result<ConnectEntry> {
    let service_name = service.metadata.name.clone().unwrap_or_default();

    let first_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first())
        .ok_or_else(|| TunnelError::Resolution {
            namespace: service.metadata.namespace.clone().unwrap_or_default(),
            resource: format!("svc/{}", service_name),
            message: "service declares no ports".to_string(),
        })?;

    let port = match &first_port.target_port {
        Some(IntOrString::Int(p)) => *p,
        _ => first_port.port,
    };
    let remote_port = u16::try_from(port).ok().filter(|p| *p > 0).ok_or_else(|| {
        TunnelError::Resolution {
            namespace: service.metadata.namespace.clone().unwrap_or_default(),
            resource: format!("svc/{}", service_name),
            message: format!("invalid port {}", port),
        }
    })?;

    Ok(ConnectEntry {
        name: name.to_string(),
        resource_name: service_name,
        namespace: service.metadata.namespace.clone(),
        remote_port,
        url_suffix: annotation(service, CONNECT_URL_ANNOTATION)
            .unwrap_or_default()
            .to_string(),
        description: annotation(service, CONNECT_DESCRIPTION_ANNOTATION).map(str::to_string),
    })
}
