//! `sandcastle create`: provision, bootstrap and expose a cluster on Docker

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandcastle_cluster::{proxy_unit_name, ClusterRequest, NodeImages, Orchestrator};
use sandcastle_common::{https_url, ClusterSpec, API_PORT, MANAGEMENT_PORT};
use sandcastle_common::yaml::to_yaml;

use super::{write_artifact, ClusterArgs, ResolvedCluster};
use crate::docker::DockerEngine;
use crate::{Error, Result};

/// Create arguments
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Seconds to wait for the Kubernetes API to accept connections [default: 300]
    #[arg(long, env = "SANDCASTLE_API_TIMEOUT_SECS")]
    pub api_timeout_secs: Option<u64>,

    /// Seconds to wait for each node to register [default: 300]
    #[arg(long, env = "SANDCASTLE_REGISTRATION_TIMEOUT_SECS")]
    pub registration_timeout_secs: Option<u64>,

    /// Seconds the bootstrap command may take [default: 120]
    #[arg(long)]
    pub bootstrap_timeout_secs: Option<u64>,

    /// Nodes configured at once; 1 applies configs one by one [default: 1]
    #[arg(long)]
    pub apply_concurrency: Option<usize>,

    /// Host loopback port the proxy publishes the Kubernetes API on
    #[arg(long, default_value_t = API_PORT)]
    pub api_port: u16,

    /// Host loopback port the proxy publishes the node-management API on
    #[arg(long, default_value_t = MANAGEMENT_PORT)]
    pub management_port: u16,

    /// Server written into the kubeconfig [default: https://127.0.0.1:<api-port>]
    #[arg(long, env = "SANDCASTLE_EXTERNAL_SERVER")]
    pub external_server: Option<String>,

    /// Directory kubeconfig and talosconfig are written to
    #[arg(short = 'o', long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Docker network for the cluster [default: <name>-net]
    #[arg(long, env = "SANDCASTLE_DOCKER_NETWORK")]
    pub network: Option<String>,

    /// Docker-compatible CLI driving the containers
    #[arg(long, env = "SANDCASTLE_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Talos image repository, tagged with the Talos version
    #[arg(long, env = "SANDCASTLE_NODE_IMAGE")]
    pub node_image: Option<String>,

    /// Image providing talosctl's runtime, kubectl and nc
    #[arg(long, env = "SANDCASTLE_TOOLBOX_IMAGE")]
    pub toolbox_image: Option<String>,

    /// Envoy image for the proxy
    #[arg(long, env = "SANDCASTLE_PROXY_IMAGE")]
    pub proxy_image: Option<String>,
}

impl CreateArgs {
    /// Turn flags and the cluster file into an orchestrator request
    pub fn request(&self, resolved: ResolvedCluster) -> Result<ClusterRequest> {
        let ResolvedCluster {
            spec,
            patches,
            file,
        } = resolved;

        let mut request = ClusterRequest::new(spec);
        request.patches = patches;

        let sequencer = &mut request.sequencer;
        if let Some(secs) = self.api_timeout_secs.or(file.api_timeout_secs) {
            sequencer.api_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self
            .registration_timeout_secs
            .or(file.registration_timeout_secs)
        {
            sequencer.registration_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.bootstrap_timeout_secs.or(file.bootstrap_timeout_secs) {
            sequencer.bootstrap_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = self.apply_concurrency.or(file.apply_concurrency) {
            if limit == 0 {
                return Err(Error::validation("apply concurrency must be at least 1"));
            }
            sequencer.apply_concurrency = limit;
        }

        request.images = self.images();
        request.external_server = Some(
            self.external_server
                .clone()
                .or(file.external_server)
                .unwrap_or_else(|| https_url("127.0.0.1", self.api_port)),
        );
        Ok(request)
    }

    fn images(&self) -> NodeImages {
        let defaults = NodeImages::default();
        NodeImages {
            node_repository: self
                .node_image
                .clone()
                .unwrap_or(defaults.node_repository),
            toolbox_image: self.toolbox_image.clone().unwrap_or(defaults.toolbox_image),
            proxy_image: self.proxy_image.clone().unwrap_or(defaults.proxy_image),
        }
    }

    fn engine(&self, spec: &ClusterSpec) -> Result<DockerEngine> {
        let vip: Ipv4Addr = spec.vip().parse().map_err(|_| {
            Error::validation(format!("docker clusters need an IPv4 VIP, got {}", spec.vip()))
        })?;
        let network = self
            .network
            .clone()
            .unwrap_or_else(|| format!("{}-net", spec.name()));
        let proxy = proxy_unit_name(spec.name());
        Ok(DockerEngine::new(network, vip)
            .with_docker_bin(&self.docker_bin)
            .publish(&proxy, self.api_port, API_PORT)
            .publish(&proxy, self.management_port, MANAGEMENT_PORT))
    }
}

/// Run the create command
pub async fn run(args: CreateArgs) -> Result<()> {
    let request = args.request(args.cluster.resolve()?)?;
    let engine = args.engine(&request.spec)?;
    info!(
        cluster = %request.spec.name(),
        network = %engine.network(),
        "creating cluster on docker"
    );

    let cancel = CancellationToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping after the current step");
                cancel.cancel();
            }
        })
    };

    let result = Orchestrator::new(Arc::new(engine))
        .create(&request, cancel)
        .await;
    signal.abort();
    let artifacts = result?;

    let kubeconfig = write_artifact(&args.out_dir, "kubeconfig", &artifacts.kubeconfig)?;
    let talosconfig = write_artifact(
        &args.out_dir,
        "talosconfig",
        &to_yaml(&artifacts.talosconfig)?,
    )?;

    println!("Cluster {} is ready", request.spec.name());
    println!("  kubeconfig:  {}", kubeconfig.display());
    println!("  talosconfig: {}", talosconfig.display());
    if let Some(server) = &request.external_server {
        println!("  api server:  {}", server);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        create: CreateArgs,
    }

    fn parse(args: &[&str]) -> CreateArgs {
        let argv = std::iter::once("create").chain(args.iter().copied());
        TestCli::parse_from(argv).create
    }

    #[test]
    fn defaults_produce_a_local_request() {
        let args = parse(&[]);
        let request = args.request(args.cluster.resolve().unwrap()).unwrap();

        assert_eq!(request.spec.name(), "talos-default");
        assert_eq!(request.sequencer.api_timeout, Duration::from_secs(300));
        assert_eq!(request.sequencer.apply_concurrency, 1);
        assert_eq!(
            request.external_server.as_deref(),
            Some("https://127.0.0.1:6443")
        );
        assert_eq!(request.images, NodeImages::default());
    }

    #[test]
    fn flags_tune_timing_and_exposure() {
        let args = parse(&[
            "--name",
            "ci",
            "--workers",
            "0",
            "--api-timeout-secs",
            "30",
            "--apply-concurrency",
            "4",
            "--api-port",
            "16443",
            "--config-patch",
            "machine: {}",
            "--config-patch",
            "@extra.yaml",
        ]);
        let request = args.request(args.cluster.resolve().unwrap()).unwrap();

        assert_eq!(request.spec.workers(), 0);
        assert_eq!(request.sequencer.api_timeout, Duration::from_secs(30));
        assert_eq!(request.sequencer.apply_concurrency, 4);
        assert_eq!(request.patches.all.len(), 2);
        assert_eq!(
            request.external_server.as_deref(),
            Some("https://127.0.0.1:16443")
        );

        let engine = args.engine(&request.spec).unwrap();
        assert_eq!(engine.network(), "ci-net");
    }

    #[test]
    fn cluster_file_supplies_timing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(
            &path,
            "registrationTimeoutSecs: 900\nexternalServer: https://ci.example:6443\n",
        )
        .unwrap();

        let args = parse(&["-f", path.to_str().unwrap()]);
        let request = args.request(args.cluster.resolve().unwrap()).unwrap();
        assert_eq!(
            request.sequencer.registration_timeout,
            Duration::from_secs(900)
        );
        assert_eq!(
            request.external_server.as_deref(),
            Some("https://ci.example:6443")
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let args = parse(&["--apply-concurrency", "0"]);
        let err = args.request(args.cluster.resolve().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn negative_counts_parse_then_fail_validation() {
        let args = parse(&["--controlplanes", "-1"]);
        assert!(args.cluster.resolve().is_err());
    }

    #[test]
    fn docker_needs_an_ipv4_vip() {
        let args = parse(&["--vip", "fd00::5"]);
        let request = args.request(args.cluster.resolve().unwrap()).unwrap();
        let err = args.engine(&request.spec).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
