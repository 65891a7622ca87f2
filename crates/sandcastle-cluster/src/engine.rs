//! Execution engine abstraction
//!
//! The engine is the container/process runtime nodes, the toolbox and the
//! proxy run on. Everything above it talks to this trait only, so tests
//! substitute a mock or an in-memory fake.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use sandcastle_common::Result;
use sandcastle_infra::DEFAULT_VIP_INTERFACE;

/// A file placed into a unit before it starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitFile {
    /// Absolute path inside the unit
    pub path: String,
    /// File contents
    pub contents: String,
}

/// A persistent named volume mounted into a unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    /// Volume name; the same name reattaches the same data
    pub name: String,
    /// Mount path inside the unit
    pub path: String,
}

/// Work done against a unit's volumes, in order, before its main command.
///
/// Node images carry no shell, so engines run these in a helper that shares
/// the unit's volumes rather than in the unit itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupStep {
    /// Delete exactly these paths if present
    RemoveFiles(Vec<String>),
    /// Run a shell snippet
    Shell(String),
}

impl SetupStep {
    /// The shell command that performs this step
    pub fn to_shell(&self) -> String {
        match self {
            SetupStep::RemoveFiles(paths) => format!("rm -f {}", paths.join(" ")),
            SetupStep::Shell(script) => script.clone(),
        }
    }
}

/// Makes another running service reachable from a unit under a hostname
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceBinding {
    /// Hostname the service answers to inside the unit
    pub alias: String,
    /// The bound service
    pub service: ServiceHandle,
}

/// Everything the engine needs to build one runtime unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitSpec {
    /// Unit name, unique per cluster
    pub name: String,
    /// Base image reference
    pub image: String,
    /// Files written before start
    pub files: Vec<UnitFile>,
    /// Named volumes
    pub volumes: Vec<VolumeMount>,
    /// Paths mounted as tmpfs
    pub tmpfs: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Steps run before `command`
    pub setup: Vec<SetupStep>,
    /// Main command; empty means the image default
    pub command: Vec<String>,
    /// Run with full privileges
    pub privileged: bool,
    /// Ports other units may connect to
    pub exposed_ports: Vec<u16>,
    /// Services reachable from this unit by hostname
    pub bindings: Vec<ServiceBinding>,
}

/// A built, not yet started unit
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    /// Unit name from its spec
    pub name: String,
    /// Engine-assigned identifier
    pub id: String,
}

/// A unit running as a long-lived background service
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Unit name from its spec
    pub name: String,
    /// Engine-assigned identifier
    pub id: String,
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Result of running a command inside a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if present, otherwise stdout, trimmed; for error messages
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Container/process runtime
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Build a unit from its spec, pulling the image and running setup steps
    async fn build(&self, spec: &UnitSpec) -> Result<UnitHandle>;

    /// Start a built unit as a background service
    async fn start_service(&self, unit: &UnitHandle) -> Result<ServiceHandle>;

    /// Run a command inside a running service
    async fn exec(&self, service: &ServiceHandle, argv: &[String]) -> Result<ExecOutput>;

    /// Write a file inside a running service
    async fn write_file(&self, service: &ServiceHandle, path: &str, contents: &[u8])
        -> Result<()>;

    /// Read a file produced inside a running service
    async fn read_file(&self, service: &ServiceHandle, path: &str) -> Result<Vec<u8>>;

    /// Node interface attached to the cluster network, where control planes
    /// announce the VIP
    fn vip_interface(&self) -> &str {
        DEFAULT_VIP_INTERFACE
    }
}
