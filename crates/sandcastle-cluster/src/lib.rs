//! Cluster lifecycle for Sandcastle
//!
//! Takes a validated [`ClusterSpec`] to a running, reachable cluster:
//!
//! - [`topology`]: node list derived from the cluster spec
//! - [`engine`]: the execution engine trait nodes run on
//! - [`provisioner`]: node units and the hostname registry
//! - [`node_client`]: talosctl/kubectl operations against nodes
//! - [`sequencer`]: the bootstrap state machine
//! - [`proxy`]: the L4 proxy in front of the cluster
//! - [`credentials`]: kubeconfig server rewriting
//! - [`orchestrator`]: all of the above, in order

#![deny(missing_docs)]

pub mod credentials;
pub mod engine;
pub mod node_client;
pub mod orchestrator;
pub mod provisioner;
pub mod proxy;
pub mod sequencer;
pub mod topology;

pub use credentials::rewrite_server;
pub use engine::{
    ExecOutput, ExecutionEngine, ServiceBinding, ServiceHandle, SetupStep, UnitFile, UnitHandle,
    UnitSpec, VolumeMount,
};
pub use node_client::{NodeClient, TalosctlClient};
pub use orchestrator::{ClusterArtifacts, ClusterRequest, CreateError, Orchestrator};
pub use provisioner::{Exposure, NodeImages, NodeProvisioner, NodeRegistry};
pub use proxy::{proxy_unit_name, ProxyBuilder, ProxyRoute, ProxyRoutes};
pub use sequencer::{
    BootstrapFailure, BootstrapOutcome, BootstrapSequencer, BootstrapState, BootstrapStep,
    SequencerConfig,
};
pub use topology::{build_topology, Topology};

pub use sandcastle_common::{ClusterSpec, Error, NodeDescriptor, NodeRole, Result};
