//! In-memory cluster for testing
//!
//! Holds services and pods in memory and answers port streams with an echo
//! server, so tunnels can be exercised end to end without a Kubernetes
//! cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerStatus, Pod, PodStatus, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

use crate::cluster::{ClusterClient, PortStream};
use crate::error::{Result, TunnelError};
use stevedore_core::{CONNECT_LABEL, CONNECT_URL_ANNOTATION};

/// In-memory [`ClusterClient`]
#[derive(Clone, Default)]
pub struct MockCluster {
    services: Arc<RwLock<Vec<Service>>>,
    pods: Arc<RwLock<Vec<Pod>>>,
    /// Number of upcoming stream opens that should fail
    failing_streams: Arc<AtomicU32>,
    /// When set, stream opens never complete
    hold_streams: Arc<AtomicBool>,
    stream_requested: Arc<Notify>,
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of cluster calls for testing assertions
#[derive(Debug, Default, Clone)]
pub struct OperationCounts {
    pub service_gets: usize,
    pub service_lists: usize,
    pub pod_lists: usize,
    pub stream_opens: usize,
}

impl MockCluster {
    /// Create a new empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service
    pub fn with_service(self, service: Service) -> Self {
        self.services.write().unwrap().push(service);
        self
    }

    /// Add a pod
    pub fn with_pod(self, pod: Pod) -> Self {
        self.pods.write().unwrap().push(pod);
        self
    }

    /// Make the next `count` stream opens fail
    pub fn fail_streams(&self, count: u32) {
        self.failing_streams.store(count, Ordering::SeqCst);
    }

    /// Make stream opens hang until the caller gives up
    pub fn hold_streams(&self) {
        self.hold_streams.store(true, Ordering::SeqCst);
    }

    /// Wait until a stream open has been requested
    pub async fn stream_requested(&self) {
        self.stream_requested.notified().await;
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    /// Build a service selecting pods by `selector`
    pub fn service(
        namespace: &str,
        name: &str,
        selector: &[(&str, &str)],
        target_ports: &[i32],
    ) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: (!selector.is_empty()).then(|| to_map(selector)),
                ports: Some(
                    target_ports
                        .iter()
                        .map(|p| ServicePort {
                            port: 80,
                            target_port: Some(IntOrString::Int(*p)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build a service advertising itself under connect alias `alias`
    pub fn connect_service(
        namespace: &str,
        name: &str,
        alias: &str,
        target_port: i32,
        url_suffix: Option<&str>,
    ) -> Service {
        let mut service = Self::service(namespace, name, &[("app", name)], &[target_port]);
        service.metadata.labels = Some(to_map(&[(CONNECT_LABEL, alias)]));
        if let Some(suffix) = url_suffix {
            service.metadata.annotations = Some(to_map(&[(CONNECT_URL_ANNOTATION, suffix)]));
        }
        service
    }

    /// Build a running pod whose containers are all ready
    pub fn ready_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
        Self::pod(namespace, name, labels, "Running", true)
    }

    /// Build a pod that has not become ready
    pub fn pending_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
        Self::pod(namespace, name, labels, "Pending", false)
    }

    fn pod(namespace: &str, name: &str, labels: &[(&str, &str)], phase: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(to_map(labels)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".to_string(),
                    ready,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Match labels against a `k=v,k2` selector (equality and existence terms)
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.and_then(|l| l.get(key)).is_some_and(|v| v == value),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.operations.write().unwrap().service_gets += 1;

        self.services
            .read()
            .unwrap()
            .iter()
            .find(|s| {
                s.metadata.namespace.as_deref() == Some(namespace)
                    && s.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| {
                TunnelError::Api(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("services \"{}\" not found", name),
                    reason: "NotFound".to_string(),
                    code: 404,
                }))
            })
    }

    async fn list_services(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<Service>> {
        self.operations.write().unwrap().service_lists += 1;

        Ok(self
            .services
            .read()
            .unwrap()
            .iter()
            .filter(|s| namespace.is_none() || s.metadata.namespace.as_deref() == namespace)
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.operations.write().unwrap().pod_lists += 1;

        Ok(self
            .pods
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn open_port_stream(&self, namespace: &str, pod: &str, port: u16) -> Result<PortStream> {
        self.operations.write().unwrap().stream_opens += 1;
        self.stream_requested.notify_one();

        if self.hold_streams.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let failing = self
            .failing_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TunnelError::establish(
                format!("pod/{}", pod),
                format!("error upgrading connection to {}/{}:{}", namespace, pod, port),
            ));
        }

        let exists = self.pods.read().unwrap().iter().any(|p| {
            p.metadata.namespace.as_deref() == Some(namespace)
                && p.metadata.name.as_deref() == Some(pod)
        });
        if !exists {
            return Err(TunnelError::establish(
                format!("pod/{}", pod),
                format!("pods \"{}\" not found", pod),
            ));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });

        Ok(Box::new(client))
    }
}
