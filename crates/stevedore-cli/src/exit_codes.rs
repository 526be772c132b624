//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

/// Success - operation completed without errors, including a tunnel closed by Ctrl-C
pub const SUCCESS: i32 = 0;

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Configuration error - unreadable or invalid tunnel.yaml
pub const CONFIG_ERROR: i32 = 2;

/// Cluster error - kubeconfig missing or API server unreachable
pub const CLUSTER_ERROR: i32 = 3;

/// Tunnel error - target could not be resolved or the tunnel never came up
pub const TUNNEL_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;
