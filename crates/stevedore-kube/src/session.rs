//! Runtime state of one tunnel
//!
//! A session moves through `Idle -> Resolving -> Establishing -> Active ->
//! Closed`. A failed attempt returns it to `Resolving` on retry, and
//! exhausting the retries leaves it `Failed`. Closing is terminal: the
//! termination signal is broadcast once and observed by the forwarding task
//! and by any establishment still in flight.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use stevedore_core::{LOCALHOST, TunnelSpec};

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// Created, nothing attempted yet
    Idle,
    /// Looking up the pod to forward to
    Resolving,
    /// Opening the local listener and remote stream
    Establishing,
    /// Forwarding traffic
    Active,
    /// Closed by the caller
    Closed,
    /// Every attempt failed
    Failed { reason: String },
}

impl TunnelState {
    /// Human-readable status name
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Establishing => "establishing",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Failed { .. } => "failed",
        }
    }

    /// The session is not working towards an active tunnel
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.status_name()),
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    state: TunnelState,
    local_port: Option<u16>,
    spec: Option<TunnelSpec>,
    url: Option<String>,
    forwarder: Option<JoinHandle<Result<()>>>,
}

/// One tunnel's lifecycle: state, assigned port, and termination signal
#[derive(Debug)]
pub struct TunnelSession {
    shutdown: watch::Sender<bool>,
    inner: Mutex<SessionInner>,
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSession {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            inner: Mutex::new(SessionInner {
                state: TunnelState::Idle,
                local_port: None,
                spec: None,
                url: None,
                forwarder: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.inner().state.clone()
    }

    /// Local port, once allocation has completed
    pub fn local_port(&self) -> Option<u16> {
        self.inner().local_port
    }

    /// Spec of the active tunnel
    pub fn spec(&self) -> Option<TunnelSpec> {
        self.inner().spec.clone()
    }

    /// Endpoint URL of the active tunnel, including its suffix
    pub fn url(&self) -> Option<String> {
        self.inner().url.clone()
    }

    /// `127.0.0.1:<port>` once a port is assigned
    pub fn endpoint(&self) -> Option<String> {
        self.local_port().map(|p| format!("{}:{}", LOCALHOST, p))
    }

    /// Whether close has been requested
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Request termination
    ///
    /// Returns `true` for the call that actually closed the session; later
    /// calls are no-ops.
    pub fn close(&self) -> bool {
        let first = self.shutdown.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if first {
            tracing::debug!("closing tunnel");
            self.inner().state = TunnelState::Closed;
        }
        first
    }

    /// Wait for the forwarding task to release its listener and streams
    pub async fn join(&self) {
        let forwarder = self.inner().forwarder.take();
        if let Some(handle) = forwarder {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "forwarder stopped with error"),
                Err(e) => tracing::debug!(error = %e, "forwarder task failed"),
            }
        }
    }

    pub(crate) fn subscribe(&self) -> ShutdownListener {
        ShutdownListener(self.shutdown.subscribe())
    }

    /// Move to `state` unless the session was closed
    pub(crate) fn transition(&self, state: TunnelState) {
        let mut inner = self.inner();
        if inner.state != TunnelState::Closed {
            tracing::debug!(from = %inner.state, to = %state, "tunnel state");
            inner.state = state;
        }
    }

    pub(crate) fn assign_port(&self, port: u16) {
        self.inner().local_port = Some(port);
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        self.transition(TunnelState::Failed {
            reason: reason.into(),
        });
    }

    pub(crate) fn activate(&self, spec: TunnelSpec, url: String, forwarder: JoinHandle<Result<()>>) {
        let mut inner = self.inner();
        inner.spec = Some(spec);
        inner.url = Some(url);
        inner.forwarder = Some(forwarder);
        if inner.state != TunnelState::Closed {
            inner.state = TunnelState::Active;
        }
    }
}

/// Receiving side of a session's termination signal
#[derive(Debug, Clone)]
pub(crate) struct ShutdownListener(watch::Receiver<bool>);

impl ShutdownListener {
    /// Resolve once the session is closed or dropped
    pub(crate) async fn closed(&mut self) {
        let _ = self.0.wait_for(|closed| *closed).await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_session_is_idle() {
        let session = TunnelSession::new();
        assert_eq!(session.state(), TunnelState::Idle);
        assert!(session.local_port().is_none());
        assert!(session.endpoint().is_none());
        assert!(!session.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = TunnelSession::new();
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(session.state(), TunnelState::Closed);
    }

    #[test]
    fn test_closed_session_ignores_transitions() {
        let session = TunnelSession::new();
        session.close();
        session.transition(TunnelState::Establishing);
        assert_eq!(session.state(), TunnelState::Closed);
    }

    #[test]
    fn test_endpoint_after_port_assignment() {
        let session = TunnelSession::new();
        session.assign_port(54321);
        assert_eq!(session.endpoint().as_deref(), Some("127.0.0.1:54321"));
    }

    #[tokio::test]
    async fn test_listener_sees_close_before_and_after_subscribe() {
        let session = TunnelSession::new();
        let mut early = session.subscribe();
        session.close();
        let mut late = session.subscribe();

        assert!(late.is_closed());
        tokio::time::timeout(Duration::from_secs(1), early.closed())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_session_releases_listeners() {
        let session = TunnelSession::new();
        let mut listener = session.subscribe();
        drop(session);
        tokio::time::timeout(Duration::from_secs(1), listener.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_without_forwarder() {
        TunnelSession::new().join().await;
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TunnelState::Active.to_string(), "active");
        assert_eq!(
            TunnelState::Failed {
                reason: "boom".to_string()
            }
            .to_string(),
            "failed: boom"
        );
    }
}
