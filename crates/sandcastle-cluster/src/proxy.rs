//! L4 proxy in front of the cluster
//!
//! Routes are derived from the topology: the Kubernetes API listener
//! balances across control planes, the node-management listener across
//! every node. The table is rebuilt from scratch whenever the node list
//! changes and rendered once into an Envoy static bootstrap.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use sandcastle_common::yaml::to_yaml;
use sandcastle_common::{Error, NodeDescriptor, Result, API_PORT, MANAGEMENT_PORT};

use crate::engine::{ExecutionEngine, ServiceHandle, UnitFile, UnitSpec};
use crate::provisioner::{NodeImages, NodeRegistry};
use crate::topology::Topology;

/// Route balancing the Kubernetes API
pub const KUBE_API_ROUTE: &str = "kube-api";

/// Route balancing the node-management API
pub const MANAGEMENT_ROUTE: &str = "talos-api";

/// Where the proxy reads its config
pub const ENVOY_CONFIG_PATH: &str = "/etc/envoy/envoy.yaml";

const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
const TCP_PROXY_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";

/// One listener and the backends it balances across
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRoute {
    /// Route name, also the upstream cluster name
    pub name: String,
    /// Port the proxy listens on
    pub listener_port: u16,
    /// Port dialed on each backend
    pub backend_port: u16,
    /// Backend hostnames
    pub backends: BTreeSet<String>,
}

/// The full routing table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRoutes {
    routes: Vec<ProxyRoute>,
}

impl ProxyRoutes {
    /// Build the table for a topology
    pub fn from_topology(topology: &Topology) -> Self {
        Self {
            routes: vec![
                ProxyRoute {
                    name: KUBE_API_ROUTE.to_string(),
                    listener_port: API_PORT,
                    backend_port: API_PORT,
                    backends: hostnames(topology.controlplanes().iter()),
                },
                ProxyRoute {
                    name: MANAGEMENT_ROUTE.to_string(),
                    listener_port: MANAGEMENT_PORT,
                    backend_port: MANAGEMENT_PORT,
                    backends: hostnames(topology.all()),
                },
            ],
        }
    }

    /// Routes in listener order
    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    /// A route by name
    pub fn get(&self, name: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|r| r.name == name)
    }

    /// Listener ports
    pub fn listener_ports(&self) -> Vec<u16> {
        self.routes.iter().map(|r| r.listener_port).collect()
    }

    /// Every backend hostname across routes
    pub fn backend_hosts(&self) -> BTreeSet<&str> {
        self.routes
            .iter()
            .flat_map(|r| r.backends.iter().map(String::as_str))
            .collect()
    }

    /// Render as an Envoy static bootstrap document
    pub fn render_envoy(&self) -> Result<String> {
        let bootstrap = EnvoyBootstrap {
            static_resources: StaticResources {
                listeners: self.routes.iter().map(listener).collect(),
                clusters: self.routes.iter().map(upstream).collect(),
            },
        };
        Ok(to_yaml(&bootstrap)?)
    }
}

/// Unit name of a cluster's proxy
pub fn proxy_unit_name(cluster_name: &str) -> String {
    format!("{}-proxy", cluster_name)
}

/// Starts the proxy unit
pub struct ProxyBuilder {
    engine: Arc<dyn ExecutionEngine>,
    images: NodeImages,
}

impl ProxyBuilder {
    /// Create a builder
    pub fn new(engine: Arc<dyn ExecutionEngine>, images: NodeImages) -> Self {
        Self { engine, images }
    }

    /// The proxy unit: bound to every backend, exposing every listener
    pub fn unit_spec(
        &self,
        cluster_name: &str,
        registry: &NodeRegistry,
        routes: &ProxyRoutes,
    ) -> Result<UnitSpec> {
        Ok(UnitSpec {
            name: proxy_unit_name(cluster_name),
            image: self.images.proxy_image.clone(),
            files: vec![UnitFile {
                path: ENVOY_CONFIG_PATH.to_string(),
                contents: routes.render_envoy()?,
            }],
            command: vec![
                "envoy".to_string(),
                "-c".to_string(),
                ENVOY_CONFIG_PATH.to_string(),
            ],
            exposed_ports: routes.listener_ports(),
            bindings: registry.bindings_for(routes.backend_hosts())?,
            ..Default::default()
        })
    }

    /// Build and start the proxy
    pub async fn start(
        &self,
        cluster_name: &str,
        registry: &NodeRegistry,
        routes: &ProxyRoutes,
    ) -> Result<ServiceHandle> {
        let spec = self.unit_spec(cluster_name, registry, routes)?;
        let name = spec.name.clone();

        let unit = self
            .engine
            .build(&spec)
            .await
            .map_err(|e| Error::provisioning(&name, e.to_string()))?;
        let service = self
            .engine
            .start_service(&unit)
            .await
            .map_err(|e| Error::provisioning(&name, e.to_string()))?;

        info!(service = %service, ports = ?spec.exposed_ports, "proxy started");
        Ok(service)
    }
}

#[derive(Serialize)]
struct EnvoyBootstrap {
    static_resources: StaticResources,
}

#[derive(Serialize)]
struct StaticResources {
    listeners: Vec<Listener>,
    clusters: Vec<Upstream>,
}

#[derive(Serialize)]
struct Listener {
    name: String,
    address: Address,
    filter_chains: Vec<FilterChain>,
}

#[derive(Serialize)]
struct Address {
    socket_address: SocketAddress,
}

#[derive(Serialize)]
struct SocketAddress {
    address: String,
    port_value: u16,
}

#[derive(Serialize)]
struct FilterChain {
    filters: Vec<Filter>,
}

#[derive(Serialize)]
struct Filter {
    name: &'static str,
    typed_config: TcpProxy,
}

#[derive(Serialize)]
struct TcpProxy {
    #[serde(rename = "@type")]
    type_url: &'static str,
    cluster: String,
    stat_prefix: String,
}

#[derive(Serialize)]
struct Upstream {
    name: String,
    #[serde(rename = "type")]
    discovery_type: &'static str,
    lb_policy: &'static str,
    connect_timeout: &'static str,
    load_assignment: LoadAssignment,
}

#[derive(Serialize)]
struct LoadAssignment {
    cluster_name: String,
    endpoints: Vec<LocalityEndpoints>,
}

#[derive(Serialize)]
struct LocalityEndpoints {
    lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Serialize)]
struct LbEndpoint {
    endpoint: Endpoint,
}

#[derive(Serialize)]
struct Endpoint {
    address: Address,
}

fn hostnames<'a>(nodes: impl Iterator<Item = &'a NodeDescriptor>) -> BTreeSet<String> {
    nodes.map(|n| n.hostname().to_string()).collect()
}

fn listener(route: &ProxyRoute) -> Listener {
    Listener {
        name: route.name.clone(),
        address: Address {
            socket_address: SocketAddress {
                address: "0.0.0.0".to_string(),
                port_value: route.listener_port,
            },
        },
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: TCP_PROXY_FILTER,
                typed_config: TcpProxy {
                    type_url: TCP_PROXY_TYPE,
                    cluster: route.name.clone(),
                    stat_prefix: route.name.replace('-', "_"),
                },
            }],
        }],
    }
}

fn upstream(route: &ProxyRoute) -> Upstream {
    Upstream {
        name: route.name.clone(),
        discovery_type: "STRICT_DNS",
        lb_policy: "ROUND_ROBIN",
        connect_timeout: "5s",
        load_assignment: LoadAssignment {
            cluster_name: route.name.clone(),
            endpoints: vec![LocalityEndpoints {
                lb_endpoints: route
                    .backends
                    .iter()
                    .map(|host| LbEndpoint {
                        endpoint: Endpoint {
                            address: Address {
                                socket_address: SocketAddress {
                                    address: host.clone(),
                                    port_value: route.backend_port,
                                },
                            },
                        },
                    })
                    .collect(),
            }],
        },
    }
}
