//! Node-management and Kubernetes API operations
//!
//! The sequencer drives nodes through [`NodeClient`]. [`TalosctlClient`] is
//! the real implementation: a toolbox unit bound to every node, running
//! talosctl, kubectl and nc on the sequencer's behalf.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use sandcastle_common::credentials::Talosconfig;
use sandcastle_common::yaml::to_yaml;
use sandcastle_common::{ClusterSpec, Error, NodeDescriptor, Result};
use sandcastle_infra::MachineConfig;

use crate::engine::{ExecOutput, ExecutionEngine, ServiceHandle, UnitFile, UnitSpec};
use crate::provisioner::{NodeImages, NodeRegistry};

/// Working directory inside the toolbox
pub const TOOLBOX_WORKDIR: &str = "/work";

const TALOSCONFIG_PATH: &str = "/work/talosconfig";
const KUBECONFIG_PATH: &str = "/work/kubeconfig";
const TALOSCTL_BIN: &str = "/usr/local/bin/talosctl";

/// Seconds `nc` waits for a connection before reporting unreachable
const PROBE_CONNECT_TIMEOUT_SECS: u32 = 2;

/// Operations the bootstrap sequence performs against nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Apply a machine config over the unauthenticated maintenance API
    async fn apply_config(&self, node: &NodeDescriptor, config: &MachineConfig) -> Result<()>;

    /// Issue the one-time consensus bootstrap command
    async fn bootstrap(&self, node: &NodeDescriptor) -> Result<()>;

    /// Whether a TCP connection to `host:port` succeeds
    async fn probe_tcp(&self, host: &str, port: u16) -> Result<bool>;

    /// Retrieve admin Kubernetes credentials from a control plane
    async fn fetch_kubeconfig(&self, node: &NodeDescriptor) -> Result<String>;

    /// Whether the Kubernetes API has a Node object named `hostname`
    async fn node_registered(&self, hostname: &str) -> Result<bool>;
}

/// [`NodeClient`] backed by talosctl, kubectl and nc in a toolbox unit
pub struct TalosctlClient {
    engine: Arc<dyn ExecutionEngine>,
    toolbox: ServiceHandle,
}

impl TalosctlClient {
    /// The toolbox unit: binds every registered node and carries the
    /// cluster's talosconfig.
    pub fn toolbox_spec(
        spec: &ClusterSpec,
        images: &NodeImages,
        talosconfig: &Talosconfig,
        registry: &NodeRegistry,
    ) -> Result<UnitSpec> {
        Ok(UnitSpec {
            name: format!("{}-toolbox", spec.name()),
            image: images.toolbox_image.clone(),
            files: vec![UnitFile {
                path: TALOSCONFIG_PATH.to_string(),
                contents: to_yaml(talosconfig)?,
            }],
            env: BTreeMap::from([
                ("TALOSCONFIG".to_string(), TALOSCONFIG_PATH.to_string()),
                ("KUBECONFIG".to_string(), KUBECONFIG_PATH.to_string()),
            ]),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            bindings: registry.bindings(),
            ..Default::default()
        })
    }

    /// Shell script that installs the talosctl release matching the cluster
    pub fn install_script(spec: &ClusterSpec) -> String {
        format!(
            "arch=$(uname -m | sed -e 's/x86_64/amd64/' -e 's/aarch64/arm64/') && \
             curl -fsSL -o {bin} https://github.com/siderolabs/talos/releases/download/{version}/talosctl-linux-$arch && \
             chmod +x {bin}",
            bin = TALOSCTL_BIN,
            version = spec.os_version(),
        )
    }

    /// Build and start the toolbox, install talosctl, then wrap it
    pub async fn start(
        engine: Arc<dyn ExecutionEngine>,
        spec: &ClusterSpec,
        images: &NodeImages,
        talosconfig: &Talosconfig,
        registry: &NodeRegistry,
    ) -> Result<Self> {
        let unit_spec = Self::toolbox_spec(spec, images, talosconfig, registry)?;
        let name = unit_spec.name.clone();

        let unit = engine
            .build(&unit_spec)
            .await
            .map_err(|e| Error::provisioning(&name, e.to_string()))?;
        let toolbox = engine
            .start_service(&unit)
            .await
            .map_err(|e| Error::provisioning(&name, e.to_string()))?;

        let client = Self::new(engine, toolbox);
        let out = client
            .run(&["sh", "-c", &Self::install_script(spec)])
            .await
            .map_err(|e| Error::provisioning(&name, e.to_string()))?;
        if !out.success() {
            return Err(Error::provisioning(
                &name,
                format!("talosctl install failed: {}", out.diagnostic()),
            ));
        }

        info!(service = %client.toolbox, "toolbox ready");
        Ok(client)
    }

    /// Wrap an already running toolbox
    pub fn new(engine: Arc<dyn ExecutionEngine>, toolbox: ServiceHandle) -> Self {
        Self { engine, toolbox }
    }

    async fn run(&self, argv: &[&str]) -> Result<ExecOutput> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        debug!(command = %argv.join(" "), "toolbox exec");
        self.engine.exec(&self.toolbox, &argv).await
    }
}

#[async_trait]
impl NodeClient for TalosctlClient {
    async fn apply_config(&self, node: &NodeDescriptor, config: &MachineConfig) -> Result<()> {
        let host = node.hostname();
        let path = format!("{}/{}.yaml", TOOLBOX_WORKDIR, host);
        let yaml = config.to_yaml()?;

        self.engine
            .write_file(&self.toolbox, &path, yaml.as_bytes())
            .await
            .map_err(|e| Error::config_application(host, e.to_string()))?;

        let out = self
            .run(&["talosctl", "apply-config", "--insecure", "-n", host, "-f", &path])
            .await
            .map_err(|e| Error::config_application(host, e.to_string()))?;
        if !out.success() {
            return Err(Error::config_application(host, out.diagnostic()));
        }
        Ok(())
    }

    async fn bootstrap(&self, node: &NodeDescriptor) -> Result<()> {
        let host = node.hostname();
        let out = self
            .run(&["talosctl", "-e", host, "-n", host, "bootstrap"])
            .await
            .map_err(|e| Error::bootstrap_command(host, e.to_string()))?;
        if !out.success() {
            return Err(Error::bootstrap_command(host, out.diagnostic()));
        }
        Ok(())
    }

    async fn probe_tcp(&self, host: &str, port: u16) -> Result<bool> {
        let wait = PROBE_CONNECT_TIMEOUT_SECS.to_string();
        let port = port.to_string();
        let out = self.run(&["nc", "-z", "-w", &wait, host, &port]).await?;
        Ok(out.success())
    }

    async fn fetch_kubeconfig(&self, node: &NodeDescriptor) -> Result<String> {
        let host = node.hostname();
        let out = self
            .run(&[
                "talosctl",
                "-e",
                host,
                "-n",
                host,
                "kubeconfig",
                "--force",
                KUBECONFIG_PATH,
            ])
            .await?;
        if !out.success() {
            return Err(Error::engine(
                "fetch_kubeconfig",
                format!("{}: {}", host, out.diagnostic()),
            ));
        }

        let bytes = self.engine.read_file(&self.toolbox, KUBECONFIG_PATH).await?;
        String::from_utf8(bytes)
            .map_err(|e| Error::engine("fetch_kubeconfig", format!("kubeconfig is not UTF-8: {}", e)))
    }

    async fn node_registered(&self, hostname: &str) -> Result<bool> {
        let out = self
            .run(&["kubectl", "get", "node", hostname, "-o", "name"])
            .await?;
        if !out.success() {
            debug!(node = %hostname, reason = %out.diagnostic(), "node not registered yet");
        }
        Ok(out.success())
    }
}
