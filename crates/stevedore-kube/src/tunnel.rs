//! Tunnel facade
//!
//! [`Tunnel`] ties the pieces together: it maps a user-facing target to a
//! spec, retries establishment with linear backoff, and owns the session
//! that callers close.
//!
//! # Example
//!
//! ```ignore
//! use stevedore_kube::Tunnel;
//!
//! let tunnel = Tunnel::system().await?;
//! let url = tunnel.connect("registry").await?;
//! println!("registry available at {}", url);
//! tunnel.close();
//! tunnel.join().await;
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::cluster::{ClusterClient, KubeCluster};
use crate::error::{ErrorSeverity, Result, TunnelError};
use crate::establish::{Attempt, StreamEstablisher};
use crate::lookup::ConnectLabelLookup;
use crate::port::{LocalPortAllocator, PortAllocator};
use crate::session::{TunnelSession, TunnelState};
use stevedore_core::{LOCALHOST, ResourceKind, TunnelConfig, TunnelSpec, WellKnownAlias};

/// A tunnel to a pod or service port, exposed on localhost
pub struct Tunnel {
    spec: TunnelSpec,
    cluster: Arc<dyn ClusterClient>,
    allocator: Arc<dyn PortAllocator>,
    config: TunnelConfig,
    auto_open: bool,
    opener: Arc<dyn UrlOpener>,
    session: TunnelSession,
}

impl Tunnel {
    /// Tunnel to `kind/name` in `namespace`, using the current kubeconfig
    ///
    /// A `local_port` of 0 picks a free port when connecting.
    pub async fn new(
        namespace: impl Into<String>,
        kind: ResourceKind,
        resource_name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self> {
        let spec = TunnelSpec::new(namespace, kind, resource_name, local_port, remote_port);
        Self::with_kube(spec).await
    }

    /// Tunnel into the system namespace; the target is named when connecting
    pub async fn system() -> Result<Self> {
        Self::with_kube(TunnelSpec::system()).await
    }

    /// Tunnel to the service behind an in-cluster service URL
    pub async fn from_service_url(service_url: &str) -> Result<Self> {
        let spec = TunnelSpec::from_service_url(service_url)?;
        Self::with_kube(spec).await
    }

    async fn with_kube(spec: TunnelSpec) -> Result<Self> {
        let cluster = KubeCluster::connect().await?;
        Ok(Self::with_cluster(Arc::new(cluster), spec))
    }

    /// Tunnel backed by an existing cluster client
    pub fn with_cluster(cluster: Arc<dyn ClusterClient>, spec: TunnelSpec) -> Self {
        Self {
            spec,
            cluster,
            allocator: Arc::new(LocalPortAllocator::process_wide()),
            config: TunnelConfig::default(),
            auto_open: false,
            opener: Arc::new(SystemBrowser),
            session: TunnelSession::new(),
        }
    }

    /// Use a different source of local ports
    pub fn with_allocator(mut self, allocator: Arc<dyn PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Apply timeouts, retry settings, and auto-open from configuration
    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.auto_open = self.auto_open || config.auto_open;
        self.config = config;
        self
    }

    /// Open the endpoint in a browser when connecting in blocking mode
    pub fn enable_auto_open(mut self) -> Self {
        self.auto_open = true;
        self
    }

    /// Use a different way of opening the endpoint URL
    pub fn with_opener(mut self, opener: Arc<dyn UrlOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// The spec this tunnel was created with
    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Runtime state of the tunnel
    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    /// Map a connect target onto the tunnel's spec
    ///
    /// Well-known aliases are matched first and never query the cluster.
    /// Other non-empty targets are looked up by connect label; a failed
    /// lookup is logged and the spec is returned unchanged.
    pub async fn resolve_target(&self, target: &str) -> TunnelSpec {
        if let Some(alias) = WellKnownAlias::parse(target) {
            tracing::debug!(alias = alias.name(), "using well-known connect target");
            return alias.entry().apply_to(&self.spec);
        }

        if target.is_empty() {
            return self.spec.clone();
        }

        match ConnectLabelLookup::new(Arc::clone(&self.cluster)).find(target).await {
            Ok(entry) => entry.apply_to(&self.spec),
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Advisory => {
                        tracing::warn!(name = target, error = %e, "connect target lookup failed")
                    }
                    ErrorSeverity::Fatal => {
                        tracing::error!(name = target, error = %e, "connect target lookup failed")
                    }
                }
                self.spec.clone()
            }
        }
    }

    /// Establish the tunnel and return its endpoint URL
    ///
    /// Forwarding continues in the background until [`Tunnel::close`].
    pub async fn connect(&self, target: &str) -> Result<String> {
        match self.session.state() {
            TunnelState::Closed => return Err(TunnelError::Closed),
            TunnelState::Active => {
                return Err(TunnelError::AlreadyConnected {
                    endpoint: self.session.endpoint().unwrap_or_default(),
                });
            }
            _ => {}
        }

        let spec = self.resolve_target(target).await;
        if let Err(e) = spec.validate() {
            let err = TunnelError::from(e);
            self.session.mark_failed(err.to_string());
            return Err(err);
        }

        let establisher = StreamEstablisher::new(
            Arc::clone(&self.cluster),
            Arc::clone(&self.allocator),
            self.config.pod_ready_timeout,
        );
        let mut shutdown = self.session.subscribe();
        let mut attempt = Attempt::first(Arc::new(spec), self.config.max_attempts);

        loop {
            let err = match establisher.establish(&self.session, &attempt).await {
                Ok(url) => return Ok(url),
                Err(e) => e,
            };

            if !err.is_retryable() {
                self.session.mark_failed(err.to_string());
                return Err(err);
            }

            if attempt.is_last() {
                self.session.mark_failed(err.to_string());
                return Err(TunnelError::RetryExhausted {
                    attempts: attempt.number,
                    source: Box::new(err),
                });
            }

            let delay = attempt.backoff(self.config.retry_delay);
            tracing::info!(
                attempt = attempt.number,
                error = %err,
                "unable to establish tunnel, retrying in {}s",
                delay.as_secs()
            );

            tokio::select! {
                biased;
                _ = shutdown.closed() => return Err(TunnelError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt = attempt.next();
        }
    }

    /// Connect, then keep forwarding until `signal` resolves
    pub async fn connect_until<F>(&self, target: &str, signal: F) -> Result<String>
    where
        F: Future<Output = ()>,
    {
        let url = self.connect(target).await?;
        self.serve_until(signal).await;
        Ok(url)
    }

    /// Keep an established tunnel forwarding until `signal` resolves
    ///
    /// Prints the endpoint URL to stdout and, when auto-open is enabled,
    /// opens it in a browser. The session is closed and its forwarding task
    /// joined before returning.
    pub async fn serve_until<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        if let Some(url) = self.session.url() {
            if self.auto_open {
                if let Err(e) = self.open_url(&url).await {
                    tracing::debug!(url = %url, error = %e, "unable to open the browser");
                }
            }
            println!("{}", url);
        }

        signal.await;
        self.close();
        self.join().await;
    }

    /// Connect and keep forwarding until Ctrl-C or SIGTERM
    pub async fn connect_blocking(&self, target: &str) -> Result<String> {
        self.connect_until(target, shutdown_signal()).await
    }

    /// `127.0.0.1:<port>` once a port is assigned
    pub fn endpoint(&self) -> Option<String> {
        self.session.endpoint()
    }

    /// `http://127.0.0.1:<port>`, without the target's URL suffix
    pub fn http_endpoint(&self) -> Option<String> {
        self.session
            .local_port()
            .map(|p| format!("http://{}:{}", LOCALHOST, p))
    }

    /// Stop the tunnel; returns `false` if it was already closed
    pub fn close(&self) -> bool {
        self.session.close()
    }

    /// Wait for the listener and remote streams to be released
    pub async fn join(&self) {
        self.session.join().await
    }
}

impl Tunnel {
    async fn open_url(&self, url: &str) -> std::io::Result<()> {
        let opener = Arc::clone(&self.opener);
        let url = url.to_string();
        tokio::task::spawn_blocking(move || opener.open(&url))
            .await
            .map_err(std::io::Error::other)?
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("spec", &self.spec)
            .field("config", &self.config)
            .field("auto_open", &self.auto_open)
            .field("state", &self.session.state())
            .finish()
    }
}

/// Opens a tunnel endpoint for the user
pub trait UrlOpener: Send + Sync {
    /// Open `url`; may block
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs in the default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        webbrowser::open(url)
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::debug!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Opener that always fails, counting how often it was asked
    #[derive(Default)]
    struct BrokenBrowser {
        calls: AtomicUsize,
    }

    impl UrlOpener for BrokenBrowser {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no browser"))
        }
    }

    fn system_cluster() -> MockCluster {
        let registry = [("app", "registry")];
        MockCluster::new()
            .with_service(MockCluster::service(
                "zarf",
                "zarf-docker-registry",
                &registry,
                &[5000],
            ))
            .with_pod(MockCluster::ready_pod("zarf", "registry-0", &registry))
    }

    fn pod_tunnel(cluster: &MockCluster) -> Tunnel {
        let spec = TunnelSpec::new("zarf", ResourceKind::Pod, "registry-0", 0, 5000);
        Tunnel::with_cluster(Arc::new(cluster.clone()), spec)
            .with_allocator(Arc::new(LocalPortAllocator::new()))
    }

    #[tokio::test]
    async fn test_alias_skips_connect_label_lookup() {
        let cluster = system_cluster();
        let tunnel = Tunnel::with_cluster(Arc::new(cluster.clone()), TunnelSpec::system());

        let url = tunnel.connect("ReGiStRy").await.unwrap();

        assert!(url.ends_with("/v2/_catalog"));
        assert_eq!(cluster.operation_counts().service_lists, 0);
        let active = tunnel.session().spec().unwrap();
        assert_eq!(active.resource_name, "zarf-docker-registry");
        assert_eq!(active.remote_port, 5000);

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test]
    async fn test_connect_label_target() {
        let cluster = system_cluster()
            .with_service(MockCluster::connect_service(
                "apps",
                "podinfo",
                "podinfo",
                9898,
                Some("/healthz"),
            ))
            .with_pod(MockCluster::ready_pod("apps", "podinfo-0", &[("app", "podinfo")]));
        let tunnel = Tunnel::with_cluster(Arc::new(cluster.clone()), TunnelSpec::system());

        let url = tunnel.connect("podinfo").await.unwrap();

        assert!(url.ends_with("/healthz"));
        let active = tunnel.session().spec().unwrap();
        assert_eq!(active.namespace, "apps");
        assert_eq!(active.remote_port, 9898);

        // Traffic reaches the pod
        let port = tunnel.session().local_port().unwrap();
        let mut conn = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test]
    async fn test_lookup_miss_keeps_explicit_target() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);

        let url = tunnel.connect("not-advertised").await.unwrap();

        assert_eq!(cluster.operation_counts().service_lists, 1);
        assert_eq!(tunnel.session().spec().unwrap().resource_name, "registry-0");
        assert_eq!(Some(url), tunnel.http_endpoint());

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test]
    async fn test_empty_target_without_name_is_invalid() {
        let cluster = system_cluster();
        let tunnel = Tunnel::with_cluster(Arc::new(cluster.clone()), TunnelSpec::system());

        let err = tunnel.connect("").await.unwrap_err();

        assert!(matches!(err, TunnelError::InvalidSpec(_)));
        assert_eq!(cluster.operation_counts().stream_opens, 0);
        assert_eq!(tunnel.session().state().status_name(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_three_times_then_fails() {
        let cluster = system_cluster();
        cluster.fail_streams(3);
        let tunnel = pod_tunnel(&cluster);

        let started = Instant::now();
        let err = tunnel.connect("").await.unwrap_err();

        assert!(matches!(err, TunnelError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(cluster.operation_counts().stream_opens, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(matches!(tunnel.session().state(), TunnelState::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_one_failure() {
        let cluster = system_cluster();
        cluster.fail_streams(1);
        let tunnel = pod_tunnel(&cluster);

        let started = Instant::now();
        tunnel.connect("").await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(cluster.operation_counts().stream_opens, 2);
        assert_eq!(tunnel.session().state(), TunnelState::Active);

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_attempts_and_delay() {
        let cluster = system_cluster();
        cluster.fail_streams(5);
        let config = TunnelConfig {
            max_attempts: 2,
            retry_delay: Duration::from_secs(1),
            ..TunnelConfig::default()
        };
        let tunnel = pod_tunnel(&cluster).with_config(config);

        let started = Instant::now();
        let err = tunnel.connect("").await.unwrap_err();

        assert!(matches!(err, TunnelError::RetryExhausted { attempts: 2, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff_stops_retrying() {
        let cluster = system_cluster();
        cluster.fail_streams(3);
        let tunnel = Arc::new(pod_tunnel(&cluster));

        let task = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.connect("").await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(tunnel.close());

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Closed)));
        assert_eq!(cluster.operation_counts().stream_opens, 1);
    }

    #[tokio::test]
    async fn test_closed_tunnel_does_not_connect() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);
        tunnel.close();

        let err = tunnel.connect("").await.unwrap_err();
        assert!(matches!(err, TunnelError::Closed));
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);
        tunnel.connect("").await.unwrap();

        let err = tunnel.connect("").await.unwrap_err();
        assert!(matches!(
            &err,
            TunnelError::AlreadyConnected { endpoint } if Some(endpoint.clone()) == tunnel.endpoint()
        ));
        assert!(!err.is_retryable());
        // The first tunnel keeps forwarding
        assert_eq!(tunnel.session().state(), TunnelState::Active);

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test]
    async fn test_close_twice() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);
        tunnel.connect("").await.unwrap();
        let port = tunnel.session().local_port().unwrap();

        assert!(tunnel.close());
        assert!(!tunnel.close());
        tunnel.join().await;

        assert!(std::net::TcpListener::bind((LOCALHOST, port)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_until_closes_after_signal() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);

        let url = tunnel
            .connect_until("", std::future::ready(()))
            .await
            .unwrap();

        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(tunnel.session().is_closed());
        assert_eq!(tunnel.session().state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_endpoints() {
        let cluster = system_cluster();
        let tunnel = pod_tunnel(&cluster);
        assert!(tunnel.endpoint().is_none());

        tunnel.connect("").await.unwrap();
        let port = tunnel.session().local_port().unwrap();
        assert_eq!(tunnel.endpoint(), Some(format!("127.0.0.1:{}", port)));
        assert_eq!(tunnel.http_endpoint(), Some(format!("http://127.0.0.1:{}", port)));

        tunnel.close();
        tunnel.join().await;
    }

    #[tokio::test]
    async fn test_browser_failure_is_not_fatal() {
        let cluster = system_cluster();
        let browser = Arc::new(BrokenBrowser::default());
        let tunnel = pod_tunnel(&cluster)
            .with_opener(browser.clone())
            .enable_auto_open();

        let url = tunnel
            .connect_until("", std::future::ready(()))
            .await
            .unwrap();

        assert!(url.starts_with("http://127.0.0.1:"));
        assert_eq!(browser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.session().state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_browser_not_opened_without_auto_open() {
        let cluster = system_cluster();
        let browser = Arc::new(BrokenBrowser::default());
        let tunnel = pod_tunnel(&cluster).with_opener(browser.clone());

        tunnel
            .connect_until("", std::future::ready(()))
            .await
            .unwrap();

        assert_eq!(browser.calls.load(Ordering::SeqCst), 0);
    }
}
