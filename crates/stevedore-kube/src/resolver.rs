//! Resolve a tunnel target to the pod that will carry its traffic

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterClient;
use crate::error::{Result, TunnelError};
use stevedore_core::ResourceKind;

/// Finds an attachable pod for a pod or service target
#[derive(Clone)]
pub struct ResourceResolver {
    cluster: Arc<dyn ClusterClient>,
    pod_ready_timeout: Duration,
}

impl ResourceResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>, pod_ready_timeout: Duration) -> Self {
        Self {
            cluster,
            pod_ready_timeout,
        }
    }

    /// Return the pod to forward to
    ///
    /// Pods resolve to themselves without touching the cluster. Services
    /// resolve to the first ready pod matching their selector.
    pub async fn resolve_pod(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<String> {
        match kind {
            ResourceKind::Pod => Ok(name.to_string()),
            ResourceKind::Service => self.pod_for_service(namespace, name).await,
        }
    }

    async fn pod_for_service(&self, namespace: &str, name: &str) -> Result<String> {
        let resolution_error = |message: String| TunnelError::Resolution {
            namespace: namespace.to_string(),
            resource: format!("svc/{}", name),
            message,
        };

        let service = self
            .cluster
            .get_service(namespace, name)
            .await
            .map_err(|e| resolution_error(format!("unable to find the service: {}", e)))?;

        let selector = service
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .filter(|s| !s.is_empty())
            .map(selector_string)
            .ok_or_else(|| resolution_error("service has no pod selector".to_string()))?;

        tracing::debug!(namespace, service = name, selector = %selector, "waiting for a ready pod");

        let pods = self
            .cluster
            .wait_for_ready_pods(namespace, &selector, self.pod_ready_timeout)
            .await
            .map_err(|e| resolution_error(e.to_string()))?;

        // Keep the first pod in listing order; later calls may see another one
        let pod = pods.into_iter().find(|p| !p.is_empty()).ok_or_else(|| {
            resolution_error(format!(
                "no ready pod matched '{}' within {:?}",
                selector, self.pod_ready_timeout
            ))
        })?;

        tracing::debug!(namespace, service = name, pod = %pod, "selected pod");
        Ok(pod)
    }
}

/// Format a selector map as a label selector query
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    fn resolver(cluster: &MockCluster, timeout: Duration) -> ResourceResolver {
        ResourceResolver::new(Arc::new(cluster.clone()), timeout)
    }

    #[test]
    fn test_selector_string_sorted() {
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "infra".to_string());
        labels.insert("app".to_string(), "registry".to_string());
        assert_eq!(selector_string(&labels), "app=registry,tier=infra");
    }

    #[tokio::test]
    async fn test_pod_resolves_without_cluster_query() {
        let cluster = MockCluster::new();
        let pod = resolver(&cluster, Duration::from_secs(1))
            .resolve_pod("zarf", ResourceKind::Pod, "injector-abc")
            .await
            .unwrap();

        assert_eq!(pod, "injector-abc");
        let ops = cluster.operation_counts();
        assert_eq!(ops.service_gets + ops.pod_lists, 0);
    }

    #[tokio::test]
    async fn test_service_resolves_first_ready_pod() {
        let labels = [("app", "registry")];
        let cluster = MockCluster::new()
            .with_service(MockCluster::service("zarf", "zarf-docker-registry", &labels, &[5000]))
            .with_pod(MockCluster::pending_pod("zarf", "registry-starting", &labels))
            .with_pod(MockCluster::ready_pod("zarf", "registry-a", &labels))
            .with_pod(MockCluster::ready_pod("zarf", "registry-b", &labels));

        let pod = resolver(&cluster, Duration::from_secs(1))
            .resolve_pod("zarf", ResourceKind::Service, "zarf-docker-registry")
            .await
            .unwrap();
        assert_eq!(pod, "registry-a");
    }

    #[tokio::test]
    async fn test_missing_service() {
        let cluster = MockCluster::new();
        let err = resolver(&cluster, Duration::from_secs(1))
            .resolve_pod("zarf", ResourceKind::Service, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_service_without_selector() {
        let cluster =
            MockCluster::new().with_service(MockCluster::service("zarf", "headless", &[], &[80]));
        let err = resolver(&cluster, Duration::from_secs(1))
            .resolve_pod("zarf", ResourceKind::Service, "headless")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no pod selector"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ready_pod_times_out() {
        let labels = [("app", "git")];
        let cluster = MockCluster::new()
            .with_service(MockCluster::service("zarf", "zarf-gitea-http", &labels, &[3000]))
            .with_pod(MockCluster::pending_pod("zarf", "gitea-0", &labels));

        let err = resolver(&cluster, Duration::from_secs(5))
            .resolve_pod("zarf", ResourceKind::Service, "zarf-gitea-http")
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Resolution { .. }));
        // Polled until the deadline rather than giving up after one look
        assert!(cluster.operation_counts().pod_lists > 1);
    }
}
