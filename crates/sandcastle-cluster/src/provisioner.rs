//! Node runtime provisioning
//!
//! Each node is one privileged, stateful runtime unit. Its state lives in
//! volumes named after the hostname, so re-provisioning a node with the same
//! name reattaches the same data. Only the regenerable artifact set is
//! purged on every start.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use sandcastle_common::{Error, NodeDescriptor, NodeRole, Result, API_PORT, MANAGEMENT_PORT};

use crate::engine::{
    ExecutionEngine, ServiceBinding, ServiceHandle, SetupStep, UnitFile, UnitSpec, VolumeMount,
};
use crate::topology::Topology;

/// Files regenerated on every node start; removed before init runs
pub const REGENERABLE_ARTIFACTS: [&str; 3] = [
    "/system/secrets/kubernetes/kube-apiserver/apiserver.crt",
    "/system/secrets/kubernetes/kube-apiserver/apiserver.key",
    "/var/lib/talos/admin-token",
];

/// Mount points backed by per-node persistent volumes
pub const NODE_CACHE_MOUNTS: [&str; 8] = [
    "/run",
    "/system",
    "/system/state",
    "/var",
    "/etc/cni",
    "/etc/kubernetes",
    "/usr/libexec/kubernetes",
    "/opt",
];

/// Image references for every kind of unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeImages {
    /// Node OS image repository; tagged with the cluster's OS version
    pub node_repository: String,
    /// Image carrying talosctl, kubectl and nc
    pub toolbox_image: String,
    /// Envoy image for the proxy
    pub proxy_image: String,
}

impl Default for NodeImages {
    fn default() -> Self {
        Self {
            node_repository: "ghcr.io/siderolabs/talos".to_string(),
            toolbox_image: "alpine/k8s:1.31.2".to_string(),
            proxy_image: "envoyproxy/envoy:v1.32.1".to_string(),
        }
    }
}

impl NodeImages {
    /// Node image for an OS version
    pub fn node_image(&self, os_version: &str) -> String {
        format!("{}:{}", self.node_repository, os_version)
    }
}

/// Which ports a node unit exposes to other units
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exposure {
    /// Node-management API only
    Management,
    /// Node-management API and the Kubernetes API
    Api,
}

impl Exposure {
    /// Control planes serve the Kubernetes API; workers don't
    pub fn for_role(role: NodeRole) -> Self {
        match role {
            NodeRole::ControlPlane => Exposure::Api,
            NodeRole::Worker => Exposure::Management,
        }
    }

    /// Ports to expose
    pub fn ports(&self) -> Vec<u16> {
        match self {
            Exposure::Management => vec![MANAGEMENT_PORT],
            Exposure::Api => vec![MANAGEMENT_PORT, API_PORT],
        }
    }
}

/// Volume name for a node's mount point: `<hostname>-<path with '/' as '-'>`
pub fn volume_name(hostname: &str, mount: &str) -> String {
    format!(
        "{}-{}",
        hostname,
        mount.trim_start_matches('/').replace('/', "-")
    )
}

/// Hostname to running service, for every provisioned node.
///
/// Owns the handles; other components borrow them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRegistry {
    services: BTreeMap<String, ServiceHandle>,
}

impl NodeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's service; replaces any previous handle for the hostname
    pub fn insert(&mut self, hostname: impl Into<String>, service: ServiceHandle) {
        self.services.insert(hostname.into(), service);
    }

    /// The service for a hostname
    pub fn get(&self, hostname: &str) -> Option<&ServiceHandle> {
        self.services.get(hostname)
    }

    /// Registered hostnames, sorted
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Bindings that make every registered node reachable by hostname
    pub fn bindings(&self) -> Vec<ServiceBinding> {
        self.services
            .iter()
            .map(|(alias, service)| ServiceBinding {
                alias: alias.clone(),
                service: service.clone(),
            })
            .collect()
    }

    /// Bindings for the given hostnames; each must be registered
    pub fn bindings_for<'a>(
        &self,
        hostnames: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<ServiceBinding>> {
        hostnames
            .into_iter()
            .map(|host| {
                self.get(host)
                    .map(|service| ServiceBinding {
                        alias: host.to_string(),
                        service: service.clone(),
                    })
                    .ok_or_else(|| Error::provisioning(host, "no runtime unit registered"))
            })
            .collect()
    }
}

/// Creates node units on an execution engine
pub struct NodeProvisioner {
    engine: Arc<dyn ExecutionEngine>,
    images: NodeImages,
}

impl NodeProvisioner {
    /// Create a provisioner
    pub fn new(engine: Arc<dyn ExecutionEngine>, images: NodeImages) -> Self {
        Self { engine, images }
    }

    /// The unit spec for a node. Pure.
    pub fn unit_spec(&self, node: &NodeDescriptor, exposure: Exposure) -> UnitSpec {
        let hostname = node.hostname();

        UnitSpec {
            name: hostname.to_string(),
            image: self.images.node_image(node.os_version()),
            files: vec![UnitFile {
                path: "/etc/hostname".to_string(),
                contents: hostname.to_string(),
            }],
            volumes: NODE_CACHE_MOUNTS
                .iter()
                .map(|mount| VolumeMount {
                    name: volume_name(hostname, mount),
                    path: mount.to_string(),
                })
                .collect(),
            tmpfs: vec!["/tmp".to_string()],
            env: BTreeMap::from([("PLATFORM".to_string(), "container".to_string())]),
            setup: vec![SetupStep::RemoveFiles(
                REGENERABLE_ARTIFACTS.iter().map(|p| p.to_string()).collect(),
            )],
            command: vec!["/sbin/init".to_string()],
            privileged: true,
            exposed_ports: exposure.ports(),
            bindings: vec![],
        }
    }

    /// Build and start one node unit
    pub async fn provision_node(
        &self,
        node: &NodeDescriptor,
        exposure: Exposure,
    ) -> Result<ServiceHandle> {
        let spec = self.unit_spec(node, exposure);
        let unit_name = spec.name.clone();

        debug!(node = %node, image = %spec.image, "building node unit");
        let unit = self
            .engine
            .build(&spec)
            .await
            .map_err(|e| Error::provisioning(&unit_name, e.to_string()))?;

        let service = self
            .engine
            .start_service(&unit)
            .await
            .map_err(|e| Error::provisioning(&unit_name, e.to_string()))?;

        info!(node = %node, service = %service, "node unit started");
        Ok(service)
    }

    /// Provision every node in the topology concurrently.
    ///
    /// All units are attempted; the first failure in topology order is
    /// returned. Units that did start are left running.
    pub async fn provision(&self, topology: &Topology) -> Result<NodeRegistry> {
        let nodes: Vec<&NodeDescriptor> = topology.all().collect();
        let limit = nodes.len().max(1);

        let mut results: Vec<(usize, Result<ServiceHandle>)> = stream::iter(
            nodes.iter().enumerate(),
        )
        .map(|(i, node)| async move {
            (
                i,
                self.provision_node(node, Exposure::for_role(node.role()))
                    .await,
            )
        })
        .buffer_unordered(limit)
        .collect()
        .await;
        results.sort_by_key(|(i, _)| *i);

        let mut registry = NodeRegistry::new();
        for (i, result) in results {
            match result {
                Ok(service) => registry.insert(nodes[i].hostname(), service),
                Err(e) => {
                    warn!(node = %nodes[i], error = %e, "node provisioning failed");
                    return Err(e);
                }
            }
        }

        info!(nodes = registry.len(), "all node units running");
        Ok(registry)
    }
}
