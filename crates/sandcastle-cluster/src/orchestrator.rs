//! End-to-end cluster creation
//!
//! Wires the pieces together in dependency order: topology, trust material
//! and configs, node units, toolbox, bootstrap sequence, proxy, and finally
//! the credential rewrite. Config generation happens before any unit exists,
//! so a bad patch costs nothing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use sandcastle_common::credentials::Talosconfig;
use sandcastle_common::{ClusterSpec, Error};
use sandcastle_infra::{MachineConfigGenerator, PatchSet, TrustBundle};

use crate::credentials::rewrite_server;
use crate::engine::{ExecutionEngine, ServiceHandle};
use crate::node_client::TalosctlClient;
use crate::provisioner::{NodeImages, NodeProvisioner, NodeRegistry};
use crate::proxy::{ProxyBuilder, ProxyRoutes};
use crate::sequencer::{BootstrapFailure, BootstrapSequencer, SequencerConfig};
use crate::topology::build_topology;

/// Everything needed to create one cluster
#[derive(Clone, Debug)]
pub struct ClusterRequest {
    /// Validated cluster shape
    pub spec: ClusterSpec,
    /// Caller config patches
    pub patches: PatchSet,
    /// Timeouts and concurrency
    pub sequencer: SequencerConfig,
    /// Unit images
    pub images: NodeImages,
    /// Externally reachable API URL written into the kubeconfig, if any
    pub external_server: Option<String>,
}

impl ClusterRequest {
    /// A request with default patches, timing and images
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            patches: PatchSet::default(),
            sequencer: SequencerConfig::default(),
            images: NodeImages::default(),
            external_server: None,
        }
    }
}

/// What a successful creation leaves behind
#[derive(Debug)]
pub struct ClusterArtifacts {
    /// Admin kubeconfig, rewritten to the external server when one was given
    pub kubeconfig: String,
    /// Node-management client config pointing at the VIP
    pub talosconfig: Talosconfig,
    /// Running node services
    pub registry: NodeRegistry,
    /// The running proxy
    pub proxy: ServiceHandle,
}

/// Failure of [`Orchestrator::create`]
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// Failed before or after the bootstrap sequence
    #[error(transparent)]
    Setup(#[from] Error),
    /// The bootstrap sequence failed
    #[error(transparent)]
    Bootstrap(#[from] BootstrapFailure),
}

/// Creates clusters on one execution engine
pub struct Orchestrator {
    engine: Arc<dyn ExecutionEngine>,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Provision, bootstrap and expose a cluster.
    ///
    /// Failures leave every started unit running.
    pub async fn create(
        &self,
        request: &ClusterRequest,
        cancel: CancellationToken,
    ) -> Result<ClusterArtifacts, CreateError> {
        let spec = &request.spec;
        let topology = build_topology(spec);
        info!(
            cluster = %spec.name(),
            controlplanes = spec.controlplanes(),
            workers = spec.workers(),
            "creating cluster"
        );

        let bundle = Arc::new(TrustBundle::generate(spec)?);
        let talosconfig = bundle.talosconfig(spec);
        let generator = Arc::new(MachineConfigGenerator::with_vip_interface(
            spec,
            bundle,
            &request.patches,
            self.engine.vip_interface(),
        )?);

        ensure_not_cancelled(&cancel, "provision")?;
        let registry = NodeProvisioner::new(self.engine.clone(), request.images.clone())
            .provision(&topology)
            .await?;

        let client = TalosctlClient::start(
            self.engine.clone(),
            spec,
            &request.images,
            &talosconfig,
            &registry,
        )
        .await?;

        let outcome = BootstrapSequencer::new(
            topology.clone(),
            generator,
            Arc::new(client),
            request.sequencer.clone(),
        )
        .run(cancel.clone())
        .await?;

        ensure_not_cancelled(&cancel, "proxy")?;
        let routes = ProxyRoutes::from_topology(&topology);
        let proxy = ProxyBuilder::new(self.engine.clone(), request.images.clone())
            .start(spec.name(), &registry, &routes)
            .await?;

        let kubeconfig = match &request.external_server {
            Some(target) => rewrite_server(&outcome.kubeconfig, target)?,
            None => outcome.kubeconfig,
        };

        info!(cluster = %spec.name(), nodes = registry.len(), "cluster ready");
        Ok(ClusterArtifacts {
            kubeconfig,
            talosconfig,
            registry,
            proxy,
        })
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, step: &str) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled(step));
    }
    Ok(())
}
