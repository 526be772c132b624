//! Local port allocation
//!
//! Picking a free port and binding it are two separate steps: the OS happily
//! hands the same "free" port to a second probe until someone binds it. A
//! [`PortReservation`] for an auto-assigned port therefore holds the
//! allocator's lock until the forwarding task has bound its listener and
//! calls [`PortReservation::release`]. Explicit ports never take the lock.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Result, TunnelError};
use stevedore_core::LOCALHOST;

/// A local port picked for a tunnel, exclusive until released or dropped
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PortReservation {
    /// Reservation for a port the caller chose; no locking involved
    pub fn explicit(port: u16) -> Self {
        Self { port, guard: None }
    }

    /// The reserved port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this reservation still blocks other allocations
    pub fn is_exclusive(&self) -> bool {
        self.guard.is_some()
    }

    /// Let other allocations proceed; call once the port is bound
    pub fn release(mut self) -> u16 {
        self.guard.take();
        self.port
    }
}

/// Source of local ports for auto-assigned tunnels
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Pick a free port and hold it until the reservation is released
    async fn reserve(&self) -> Result<PortReservation>;
}

/// Allocator asking the OS for a free ephemeral port
///
/// Clones share the same lock, so every tunnel composed from one allocator
/// is serialized through the probe-and-bind window.
#[derive(Debug, Clone, Default)]
pub struct LocalPortAllocator {
    lock: Arc<Mutex<()>>,
}

static PROCESS_ALLOCATOR: LazyLock<LocalPortAllocator> = LazyLock::new(LocalPortAllocator::new);

impl LocalPortAllocator {
    /// Allocator with its own lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator shared by every tunnel that is not given one explicitly
    pub fn process_wide() -> Self {
        PROCESS_ALLOCATOR.clone()
    }
}

#[async_trait]
impl PortAllocator for LocalPortAllocator {
    async fn reserve(&self) -> Result<PortReservation> {
        let guard = self.lock.clone().lock_owned().await;

        let port = {
            let listener = TcpListener::bind((LOCALHOST, 0)).map_err(TunnelError::Allocation)?;
            listener.local_addr().map_err(TunnelError::Allocation)?.port()
        };
        tracing::debug!(port, "selected local port");

        Ok(PortReservation {
            port,
            guard: Some(guard),
        })
    }
}

/// Allocator handing out a fixed sequence of ports
///
/// Used to make tunnel tests deterministic. Fails with
/// [`TunnelError::Allocation`] once the sequence is exhausted.
#[derive(Debug, Clone)]
pub struct StaticPortAllocator {
    ports: Arc<StdMutex<VecDeque<u16>>>,
    lock: Arc<Mutex<()>>,
}

impl StaticPortAllocator {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: Arc::new(StdMutex::new(ports.into_iter().collect())),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ports not handed out yet
    pub fn remaining(&self) -> usize {
        self.ports.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PortAllocator for StaticPortAllocator {
    async fn reserve(&self) -> Result<PortReservation> {
        let guard = self.lock.clone().lock_owned().await;

        let next = self.ports.lock().ok().and_then(|mut p| p.pop_front());
        let port = next.ok_or_else(|| {
            TunnelError::Allocation(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no ports left in the static allocator",
            ))
        })?;

        Ok(PortReservation {
            port,
            guard: Some(guard),
        })
    }
}
