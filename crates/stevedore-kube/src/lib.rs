//! Stevedore Kube - Kubernetes tunnels for Stevedore
//!
//! This crate provides:
//! - **Tunnels**: Expose a pod or service port on `127.0.0.1`, with retries and clean shutdown
//! - **Resolution**: Pick a ready pod behind a service selector
//! - **Connect Labels**: Discover targets advertised by `zarf.dev/connect-name` services
//! - **Port Allocation**: Race-free auto-assigned local ports
//! - **Cluster Access**: A small client trait over the Kubernetes API, with an in-memory mock

pub mod cluster;
pub mod error;
pub mod establish;
pub mod lookup;
pub mod mock;
pub mod port;
pub mod resolver;
pub mod session;
pub mod tunnel;

pub use cluster::{ClusterClient, KubeCluster, PortStream, is_pod_ready};
pub use error::{ErrorSeverity, Result, TunnelError};
pub use establish::{Attempt, StreamEstablisher};
pub use lookup::ConnectLabelLookup;
pub use mock::{MockCluster, OperationCounts};
pub use port::{LocalPortAllocator, PortAllocator, PortReservation, StaticPortAllocator};
pub use resolver::ResourceResolver;
pub use session::{TunnelSession, TunnelState};
pub use tunnel::{SystemBrowser, Tunnel, UrlOpener, shutdown_signal};
