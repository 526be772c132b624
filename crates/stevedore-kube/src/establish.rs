//! Opening a tunnel: resolve, allocate, bind, and bridge
//!
//! [`StreamEstablisher::establish`] performs a single attempt. It spawns the
//! forwarding task and races its readiness signal against the task failing;
//! whichever happens first decides the attempt. Retrying is left to the
//! caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::cluster::ClusterClient;
use crate::error::{Result, TunnelError};
use crate::port::{PortAllocator, PortReservation};
use crate::resolver::ResourceResolver;
use crate::session::{ShutdownListener, TunnelSession, TunnelState};
use stevedore_core::{LOCALHOST, TunnelSpec, endpoint_url};

/// Pause after a failed accept, e.g. when the process is out of descriptors
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One establishment attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    /// Attempts allowed in total
    pub max: u32,
    pub spec: Arc<TunnelSpec>,
}

impl Attempt {
    pub fn first(spec: Arc<TunnelSpec>, max: u32) -> Self {
        Self {
            number: 1,
            max,
            spec,
        }
    }

    /// The attempt after this one
    pub fn next(&self) -> Self {
        Self {
            number: self.number + 1,
            max: self.max,
            spec: Arc::clone(&self.spec),
        }
    }

    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }

    /// Linear backoff before the next attempt
    pub fn backoff(&self, unit: Duration) -> Duration {
        unit * self.number
    }
}

/// Opens the stream to a pod port and keeps it forwarding in the background
#[derive(Clone)]
pub struct StreamEstablisher {
    cluster: Arc<dyn ClusterClient>,
    allocator: Arc<dyn PortAllocator>,
    resolver: ResourceResolver,
}

impl StreamEstablisher {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        allocator: Arc<dyn PortAllocator>,
        pod_ready_timeout: Duration,
    ) -> Self {
        let resolver = ResourceResolver::new(Arc::clone(&cluster), pod_ready_timeout);
        Self {
            cluster,
            allocator,
            resolver,
        }
    }

    /// Run one attempt, returning the endpoint URL once traffic can flow
    pub async fn establish(&self, session: &TunnelSession, attempt: &Attempt) -> Result<String> {
        let spec = attempt.spec.as_ref();
        spec.validate()?;

        let resource = spec.resource_ref();
        let mut shutdown = session.subscribe();
        if shutdown.is_closed() {
            return Err(TunnelError::Closed);
        }

        tracing::debug!(
            attempt = attempt.number,
            namespace = %spec.namespace,
            resource = %resource,
            "establishing tunnel"
        );

        session.transition(TunnelState::Resolving);
        let pod = tokio::select! {
            biased;
            _ = shutdown.closed() => return Err(TunnelError::Closed),
            pod = self.resolver.resolve_pod(&spec.namespace, spec.kind, &spec.resource_name) => pod?,
        };

        session.transition(TunnelState::Establishing);
        let reservation = if spec.wants_auto_port() {
            tokio::select! {
                biased;
                _ = shutdown.closed() => return Err(TunnelError::Closed),
                reservation = self.allocator.reserve() => reservation?,
            }
        } else {
            PortReservation::explicit(spec.local_port)
        };
        session.assign_port(reservation.port());

        tracing::debug!(
            local_port = reservation.port(),
            remote_port = spec.remote_port,
            resource = %resource,
            namespace = %spec.namespace,
            "opening tunnel"
        );

        let forwarder = Forwarder {
            cluster: Arc::clone(&self.cluster),
            namespace: spec.namespace.clone(),
            pod,
            remote_port: spec.remote_port,
            resource: resource.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut handle = tokio::spawn(forwarder.run(reservation, ready_tx, shutdown));

        tokio::select! {
            biased;
            ready = ready_rx => match ready {
                Ok(port) => {
                    let url = endpoint_url(port, &spec.url_suffix);
                    tracing::debug!(url = %url, "tunnel ready");
                    session.activate(spec.clone(), url.clone(), handle);
                    Ok(url)
                }
                // The task dropped the sender without becoming ready
                Err(_) => Err(task_failure(&resource, handle.await)),
            },
            finished = &mut handle => Err(task_failure(&resource, finished)),
        }
    }
}

/// Error to report for a forwarding task that ended before readiness
fn task_failure(
    resource: &str,
    finished: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> TunnelError {
    match finished {
        Ok(Err(e)) => e,
        Ok(Ok(())) => TunnelError::Closed,
        Err(e) => TunnelError::establish(resource, e),
    }
}

/// Background task bridging local connections to the pod
struct Forwarder {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    pod: String,
    remote_port: u16,
    resource: String,
}

impl Forwarder {
    async fn run(
        self,
        reservation: PortReservation,
        ready: oneshot::Sender<u16>,
        mut shutdown: ShutdownListener,
    ) -> Result<()> {
        let listener = TcpListener::bind((LOCALHOST, reservation.port()))
            .await
            .map_err(|e| {
                TunnelError::establish(
                    &self.resource,
                    format!("unable to listen on port {}: {}", reservation.port(), e),
                )
            })?;
        // Bound, so the port can no longer be handed out twice
        let port = reservation.release();

        // Open one stream up front so an unreachable pod fails the attempt
        let probe = tokio::select! {
            biased;
            _ = shutdown.closed() => return Err(TunnelError::Closed),
            stream = self.cluster.open_port_stream(&self.namespace, &self.pod, self.remote_port) => stream?,
        };
        drop(probe);

        if ready.send(port).is_err() {
            return Ok(());
        }

        let forwarder = Arc::new(self);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.closed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        connections.spawn(Arc::clone(&forwarder).forward(socket, peer));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept tunnel connection");
                        tokio::select! {
                            _ = shutdown.closed() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        }
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        tracing::debug!(port, resource = %forwarder.resource, "tunnel listener closed");
        Ok(())
    }

    async fn forward(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, resource = %self.resource, "forwarding connection");

        let mut upstream = match self
            .cluster
            .open_port_stream(&self.namespace, &self.pod, self.remote_port)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "unable to open stream to pod");
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut socket, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::debug!(%peer, sent, received, "connection finished");
            }
            Err(e) => tracing::debug!(%peer, error = %e, "connection ended with error"),
        }
    }
}
