//! Per-role machine configuration
//!
//! Documents are built structurally from the [`ClusterSpec`] and
//! [`TrustBundle`], then overlaid with caller patches in the exact order
//! given. Precedence, lowest first:
//!
//! 1. generated base document
//! 2. cluster-derived patches (control-plane VIP interface)
//! 3. patches for all roles, in list order
//! 4. role-specific patches, in list order
//! 5. per-node hostname patch
//!
//! A patch is YAML or JSON text, inline or loaded from `@path`. A sequence
//! is an RFC 6902 JSON patch; a mapping is an RFC 7396 merge patch.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use sandcastle_common::yaml::{parse_yaml, to_yaml};
use sandcastle_common::{ClusterSpec, Error, NodeDescriptor, NodeRole, Result};

use crate::secrets::{b64, TrustBundle};

/// Interface the VIP is announced on when the runtime doesn't say otherwise.
///
/// Two-NIC runtimes put the cluster network on the second interface.
pub const DEFAULT_VIP_INTERFACE: &str = "eth1";

/// Machine config document version
pub const CONFIG_VERSION: &str = "v1alpha1";

/// A caller-supplied config patch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigPatch {
    /// Patch text given directly
    Inline(String),
    /// Patch text read from a file
    File(PathBuf),
}

impl ConfigPatch {
    /// Interpret a CLI-style patch argument: `@path` reads a file, anything
    /// else is inline text.
    pub fn from_arg(arg: &str) -> Self {
        match arg.strip_prefix('@') {
            Some(path) => Self::File(PathBuf::from(path)),
            None => Self::Inline(arg.to_string()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Inline(_) => "inline".to_string(),
            Self::File(path) => format!("@{}", path.display()),
        }
    }

    fn load(&self) -> std::result::Result<String, String> {
        match self {
            Self::Inline(text) => Ok(text.clone()),
            Self::File(path) => std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {}", path.display(), e)),
        }
    }
}

/// Ordered patch lists, scoped by role
#[derive(Clone, Debug, Default)]
pub struct PatchSet {
    /// Applied to every role
    pub all: Vec<ConfigPatch>,
    /// Applied to control planes after `all`
    pub controlplane: Vec<ConfigPatch>,
    /// Applied to workers after `all`
    pub worker: Vec<ConfigPatch>,
}

impl PatchSet {
    fn for_role(&self, role: NodeRole) -> impl Iterator<Item = &ConfigPatch> {
        let scoped = match role {
            NodeRole::ControlPlane => &self.controlplane,
            NodeRole::Worker => &self.worker,
        };
        self.all.iter().chain(scoped.iter())
    }
}

#[derive(Clone, Debug)]
enum CompiledPatch {
    Json(json_patch::Patch),
    Merge(Value),
}

impl CompiledPatch {
    fn compile(text: &str) -> std::result::Result<Self, String> {
        let value = parse_yaml(text).map_err(|e| format!("malformed patch: {}", e))?;
        match value {
            Value::Array(_) => serde_json::from_value(value)
                .map(Self::Json)
                .map_err(|e| format!("invalid JSON patch: {}", e)),
            Value::Object(_) => Ok(Self::Merge(value)),
            Value::Null => Err("patch is empty".to_string()),
            other => Err(format!(
                "patch must be a list of operations or a mapping, got {}",
                other
            )),
        }
    }

    fn apply(&self, doc: &mut Value) -> std::result::Result<(), String> {
        match self {
            Self::Json(patch) => json_patch::patch(doc, patch).map_err(|e| e.to_string()),
            Self::Merge(overlay) => {
                json_patch::merge(doc, overlay);
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug)]
struct LabelledPatch {
    label: String,
    patch: CompiledPatch,
}

/// A rendered machine config document
#[derive(Clone, Debug, PartialEq)]
pub struct MachineConfig {
    role: NodeRole,
    document: Value,
}

impl MachineConfig {
    /// Role the document configures
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// The structured document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Look up a value by JSON pointer (e.g. "/machine/network/hostname")
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.document.pointer(pointer)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(to_yaml(&self.document)?)
    }
}

/// Renders machine configs for one cluster instance
#[derive(Clone, Debug)]
pub struct MachineConfigGenerator {
    spec: ClusterSpec,
    bundle: Arc<TrustBundle>,
    controlplane: Vec<LabelledPatch>,
    worker: Vec<LabelledPatch>,
}

impl MachineConfigGenerator {
    /// Generator announcing the VIP on [`DEFAULT_VIP_INTERFACE`]
    pub fn new(spec: &ClusterSpec, bundle: Arc<TrustBundle>, patches: &PatchSet) -> Result<Self> {
        Self::with_vip_interface(spec, bundle, patches, DEFAULT_VIP_INTERFACE)
    }

    /// Load and compile every patch, then render both roles once so that
    /// malformed or inapplicable patches fail here, before any node exists.
    ///
    /// `vip_interface` is the node interface attached to the cluster network.
    pub fn with_vip_interface(
        spec: &ClusterSpec,
        bundle: Arc<TrustBundle>,
        patches: &PatchSet,
        vip_interface: &str,
    ) -> Result<Self> {
        let generator = Self {
            spec: spec.clone(),
            bundle,
            controlplane: compile_for_role(spec, patches, NodeRole::ControlPlane, vip_interface)?,
            worker: compile_for_role(spec, patches, NodeRole::Worker, vip_interface)?,
        };

        generator.render(NodeRole::ControlPlane)?;
        generator.render(NodeRole::Worker)?;

        Ok(generator)
    }

    /// The trust bundle the configs embed
    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    /// Render the role's config with all patches applied
    pub fn render(&self, role: NodeRole) -> Result<MachineConfig> {
        let mut document = base_document(&self.spec, &self.bundle, role);
        let patches = match role {
            NodeRole::ControlPlane => &self.controlplane,
            NodeRole::Worker => &self.worker,
        };

        for labelled in patches {
            labelled
                .patch
                .apply(&mut document)
                .map_err(|e| Error::config_generation(&labelled.label, e))?;
        }

        Ok(MachineConfig { role, document })
    }

    /// Render the config for one node, tagged with its hostname
    pub fn render_for_node(&self, node: &NodeDescriptor) -> Result<MachineConfig> {
        let mut config = self.render(node.role())?;
        let hostname_patch = CompiledPatch::Json(
            serde_json::from_value(json!([{
                "op": "add",
                "path": "/machine/network/hostname",
                "value": node.hostname(),
            }]))
            .map_err(|e| Error::config_generation(node.hostname(), e.to_string()))?,
        );
        hostname_patch
            .apply(&mut config.document)
            .map_err(|e| Error::config_generation(format!("{} hostname patch", node), e))?;

        debug!(node = %node, role = %node.role(), "rendered machine config");
        Ok(config)
    }
}

fn compile_for_role(
    spec: &ClusterSpec,
    patches: &PatchSet,
    role: NodeRole,
    vip_interface: &str,
) -> Result<Vec<LabelledPatch>> {
    let mut compiled = Vec::new();

    if role == NodeRole::ControlPlane {
        compiled.push(LabelledPatch {
            label: "controlplane vip interface".to_string(),
            patch: vip_interface_patch(spec, vip_interface)?,
        });
    }

    for (i, patch) in patches.for_role(role).enumerate() {
        let label = format!("{} patch {} ({})", role, i + 1, patch.describe());
        let text = patch
            .load()
            .map_err(|e| Error::config_generation(&label, e))?;
        let patch = CompiledPatch::compile(&text).map_err(|e| Error::config_generation(&label, e))?;
        compiled.push(LabelledPatch { label, patch });
    }

    Ok(compiled)
}

fn vip_interface_patch(spec: &ClusterSpec, interface: &str) -> Result<CompiledPatch> {
    let ops = json!([{
        "op": "add",
        "path": "/machine/network/interfaces",
        "value": [{
            "interface": interface,
            "dhcp": true,
            "vip": { "ip": spec.vip() },
        }],
    }]);
    serde_json::from_value(ops)
        .map(CompiledPatch::Json)
        .map_err(|e| Error::config_generation("controlplane vip interface", e.to_string()))
}

fn base_document(spec: &ClusterSpec, bundle: &TrustBundle, role: NodeRole) -> Value {
    let controlplane = role == NodeRole::ControlPlane;

    // Workers get certificates only; CA keys stay on control planes.
    let ca_pair = |cert: &str, key: &str| {
        if controlplane {
            json!({ "crt": b64(cert), "key": b64(key) })
        } else {
            json!({ "crt": b64(cert), "key": "" })
        }
    };

    let mut cluster = json!({
        "id": bundle.cluster_id(),
        "secret": bundle.cluster_secret(),
        "controlPlane": { "endpoint": spec.api_endpoint() },
        "clusterName": spec.name(),
        "network": {
            "dnsDomain": "cluster.local",
            "podSubnets": ["10.244.0.0/16"],
            "serviceSubnets": ["10.96.0.0/12"],
        },
        "token": bundle.bootstrap_token(),
        "ca": ca_pair(
            bundle.kubernetes_ca().ca_cert_pem(),
            bundle.kubernetes_ca().ca_key_pem(),
        ),
        "discovery": { "enabled": true },
    });

    if controlplane {
        if let Some(obj) = cluster.as_object_mut() {
            obj.insert(
                "secretboxEncryptionSecret".to_string(),
                json!(bundle.secretbox_secret()),
            );
            obj.insert(
                "aggregatorCA".to_string(),
                ca_pair(
                    bundle.aggregator_ca().ca_cert_pem(),
                    bundle.aggregator_ca().ca_key_pem(),
                ),
            );
            obj.insert(
                "serviceAccount".to_string(),
                json!({ "key": b64(bundle.service_account_key_pem()) }),
            );
            obj.insert(
                "apiServer".to_string(),
                json!({ "certSANs": [spec.vip(), "localhost"] }),
            );
            obj.insert(
                "etcd".to_string(),
                json!({
                    "ca": ca_pair(bundle.etcd_ca().ca_cert_pem(), bundle.etcd_ca().ca_key_pem()),
                }),
            );
        }
    }

    json!({
        "version": CONFIG_VERSION,
        "debug": false,
        "persist": true,
        "machine": {
            "type": role.as_str(),
            "token": bundle.machine_token(),
            "ca": ca_pair(bundle.os_ca().ca_cert_pem(), bundle.os_ca().ca_key_pem()),
            "certSANs": ["localhost", spec.vip()],
            "kubelet": { "defaultRuntimeSeccompProfileEnabled": true },
            "network": {},
            "install": {
                "disk": "/dev/sda",
                "image": format!("ghcr.io/siderolabs/installer:{}", spec.os_version()),
                "wipe": false,
            },
            "features": {
                "rbac": true,
                "stableHostname": true,
                "apidCheckExtKeyUsage": true,
            },
        },
        "cluster": cluster,
    })
}
