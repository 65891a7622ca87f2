//! Common types for Sandcastle: cluster spec, errors, credential documents and utilities

#![deny(missing_docs)]

pub mod credentials;
pub mod error;
pub mod poll;
pub mod spec;
pub mod telemetry;
pub mod yaml;

pub use error::Error;
pub use spec::{ClusterSpec, NodeDescriptor, NodeRole};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kubernetes API server port, exposed by control planes and the proxy
pub const API_PORT: u16 = 6443;

/// Node-management API port, exposed by every node and the proxy
pub const MANAGEMENT_PORT: u16 = 50000;

/// Default wait budget for API reachability and node registration (seconds)
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 300;

/// Default interval between readiness polls (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "talos-default";

/// Default node OS version
pub const DEFAULT_OS_VERSION: &str = "v1.8.3";

/// Default cluster VIP
pub const DEFAULT_VIP: &str = "10.87.13.37";

/// Build an `https://host:port` URL, bracketing IPv6 literals
pub fn https_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}
