//! Cluster parameters and node identities
//!
//! A [`ClusterSpec`] is validated once at construction and immutable
//! afterwards; everything downstream (topology, trust material, machine
//! configs, proxy routes) derives from it. [`NodeDescriptor`]s name the
//! nodes the cluster spec implies.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::{Error, Result};

/// Desired shape of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    name: String,
    os_version: String,
    controlplanes: u32,
    workers: u32,
    vip: String,
}

impl ClusterSpec {
    /// Validate and build a cluster spec.
    ///
    /// Counts are taken as signed integers so that negative input coming
    /// from a config file or flag is reported as a validation error rather
    /// than wrapped or truncated.
    pub fn new(
        name: impl Into<String>,
        os_version: impl Into<String>,
        controlplanes: i64,
        workers: i64,
        vip: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let os_version = os_version.into();
        let vip = vip.into();

        validate_name(&name)?;

        if os_version.trim().is_empty() {
            return Err(Error::validation_for_field(
                "osVersion",
                "OS version cannot be empty",
            ));
        }

        if controlplanes < 1 {
            return Err(Error::validation_for_field(
                "controlplanes",
                format!("invalid number of controlplanes {}: must be at least 1", controlplanes),
            ));
        }
        if workers < 0 {
            return Err(Error::validation_for_field(
                "workers",
                format!("invalid number of workers {}: must not be negative", workers),
            ));
        }

        let controlplanes = u32::try_from(controlplanes).map_err(|_| {
            Error::validation_for_field("controlplanes", "control plane count is too large")
        })?;
        let workers = u32::try_from(workers)
            .map_err(|_| Error::validation_for_field("workers", "worker count is too large"))?;

        if vip.parse::<IpAddr>().is_err() {
            return Err(Error::validation_for_field(
                "vip",
                format!("VIP '{}' is not an IP address", vip),
            ));
        }

        Ok(Self {
            name,
            os_version,
            controlplanes,
            workers,
            vip,
        })
    }

    /// Cluster name, used as the hostname prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node OS image version (e.g. "v1.8.3")
    pub fn os_version(&self) -> &str {
        &self.os_version
    }

    /// Number of control plane nodes (at least 1)
    pub fn controlplanes(&self) -> u32 {
        self.controlplanes
    }

    /// Number of worker nodes
    pub fn workers(&self) -> u32 {
        self.workers
    }

    /// Cluster virtual IP
    pub fn vip(&self) -> &str {
        &self.vip
    }

    /// The in-cluster API endpoint every node config points at
    pub fn api_endpoint(&self) -> String {
        crate::https_url(&self.vip, crate::API_PORT)
    }
}

/// Cluster names become hostname prefixes, so they must be DNS-label safe.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation_for_field("name", "cluster name cannot be empty"));
    }
    // Leave room for "-controlplane-NNN" within a 63-character label.
    if name.len() > 45 {
        return Err(Error::validation_for_field(
            "name",
            format!("cluster name '{}' is longer than 45 characters", name),
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(Error::validation_for_field(
            "name",
            format!(
                "cluster name '{}' must be lowercase alphanumeric with inner dashes",
                name
            ),
        ));
    }
    Ok(())
}

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NodeRole {
    /// Runs the API server and consensus members
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl NodeRole {
    /// Machine type string used in hostnames and machine configs
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "controlplane",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single node the cluster should contain
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    hostname: String,
    role: NodeRole,
    index: u32,
    os_version: String,
}

impl NodeDescriptor {
    /// Describe the `index`-th (1-based) node of `role` in `spec`
    pub fn new(spec: &ClusterSpec, role: NodeRole, index: u32) -> Self {
        Self {
            hostname: format!("{}-{}-{}", spec.name(), role.as_str(), index),
            role,
            index,
            os_version: spec.os_version().to_string(),
        }
    }

    /// Hostname, also the node's service-binding name
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Node role
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// 1-based index within the role
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Node OS image version
    pub fn os_version(&self) -> &str {
        &self.os_version
    }

    /// Whether this is the node that receives the one-time bootstrap command
    pub fn is_bootstrap_node(&self) -> bool {
        self.role == NodeRole::ControlPlane && self.index == 1
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cp: i64, workers: i64) -> Result<ClusterSpec> {
        ClusterSpec::new("t1", "v1.8.3", cp, workers, "10.87.13.37")
    }

    #[test]
    fn accepts_valid_counts() {
        let spec = spec(3, 0).unwrap();
        assert_eq!(spec.controlplanes(), 3);
        assert_eq!(spec.workers(), 0);
        assert_eq!(spec.api_endpoint(), "https://10.87.13.37:6443");
    }

    #[test]
    fn zero_control_planes_is_a_validation_error() {
        match spec(0, 1).unwrap_err() {
            Error::Validation { field, message } => {
                assert_eq!(field.as_deref(), Some("controlplanes"));
                assert!(message.contains("at least 1"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn negative_workers_is_a_validation_error() {
        match spec(1, -1).unwrap_err() {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("workers")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_names_and_vips() {
        for name in ["", "My Cluster", "-t1", "t1-", "T1"] {
            assert!(
                ClusterSpec::new(name, "v1.8.3", 1, 1, "10.87.13.37").is_err(),
                "name {:?} should be rejected",
                name
            );
        }
        assert!(ClusterSpec::new("t1", "v1.8.3", 1, 1, "not-an-ip").is_err());
        assert!(ClusterSpec::new("t1", "", 1, 1, "10.87.13.37").is_err());
    }

    #[test]
    fn descriptor_hostnames_are_role_prefixed() {
        let spec = spec(1, 1).unwrap();
        let cp = NodeDescriptor::new(&spec, NodeRole::ControlPlane, 1);
        let worker = NodeDescriptor::new(&spec, NodeRole::Worker, 1);

        assert_eq!(cp.hostname(), "t1-controlplane-1");
        assert_eq!(worker.hostname(), "t1-worker-1");
        assert!(cp.is_bootstrap_node());
        assert!(!worker.is_bootstrap_node());
        assert!(!NodeDescriptor::new(&spec, NodeRole::ControlPlane, 2).is_bootstrap_node());
    }
}
