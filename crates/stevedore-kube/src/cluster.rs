//! Cluster access used by the tunnel manager
//!
//! The tunnel only needs a handful of read-only queries plus the ability to
//! open a byte stream to a pod port through the API server's `portforward`
//! subresource. [`ClusterClient`] captures that surface so tunnels can be
//! driven against a real cluster ([`KubeCluster`]) or an in-memory one
//! ([`crate::mock::MockCluster`]).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::error::{Result, TunnelError};

/// Interval between pod readiness polls
pub const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Full-duplex byte stream to a container port
pub trait PortStreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PortStreamIo for T {}

/// Boxed stream returned by [`ClusterClient::open_port_stream`]
pub type PortStream = Box<dyn PortStreamIo>;

/// Read-only cluster queries and port streaming
///
/// Implementations must be Send + Sync: one client is shared by every
/// tunnel in the process and queried concurrently without extra locking.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a service by name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// List services matching a label selector; `None` searches all namespaces
    async fn list_services(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Service>>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Open a stream to `port` on `pod`
    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortStream>;

    /// Wait until at least one pod matching `selector` has all containers ready
    ///
    /// Returns the names of the ready pods in listing order, or an empty list
    /// if none became ready before `timeout`.
    async fn wait_for_ready_pods(
        &self,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            let ready: Vec<String> = self
                .list_pods(namespace, selector)
                .await?
                .iter()
                .filter(|p| is_pod_ready(p))
                .filter_map(|p| p.metadata.name.clone())
                .collect();

            if !ready.is_empty() {
                return Ok(ready);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            tracing::debug!(namespace, selector, "waiting for ready pods");
            tokio::time::sleep(POD_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// A pod is ready when it is running and every container reports ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    if status.phase.as_deref() != Some("Running") {
        return false;
    }

    match status.container_statuses.as_ref() {
        Some(containers) if !containers.is_empty() => containers.iter().all(|c| c.ready),
        _ => false,
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Connect using the default kubeconfig and check the API server answers
    pub async fn connect() -> Result<Self> {
        let client = kube::Client::try_default().await?;
        let version = client.apiserver_version().await?;
        tracing::debug!(version = %version.git_version, "connected to cluster");
        Ok(Self { client })
    }

    /// Create with an existing Kubernetes client
    pub fn with_client(client: kube::Client) -> Self {
        Self { client }
    }

    /// Get the underlying Kubernetes client
    pub fn kube_client(&self) -> &kube::Client {
        &self.client
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_services(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let resource = format!("pod/{}", pod);

        let mut forwarder = api
            .portforward(pod, &[port])
            .await
            .map_err(|e| TunnelError::establish(&resource, e))?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| TunnelError::establish(&resource, format!("port {} not forwarded", port)))?;

        // The forwarder finishes once the stream is dropped by both sides
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::debug!(resource = %resource, error = %e, "port forward ended with error");
            }
        });

        Ok(Box::new(stream))
    }
}
