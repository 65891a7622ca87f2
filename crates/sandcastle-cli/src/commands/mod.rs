//! CLI commands

use std::fmt::Display;
use std::path::{Path, PathBuf};

use clap::Args;
use tracing::debug;

use sandcastle_common::{
    ClusterSpec, DEFAULT_CLUSTER_NAME, DEFAULT_OS_VERSION, DEFAULT_VIP,
};
use sandcastle_infra::{ConfigPatch, PatchSet};

use crate::config::ClusterFile;
use crate::{Error, Result};

pub mod create;
pub mod gen;
pub mod rewrite;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Cluster shape and config patches, shared by `create` and `gen`.
///
/// Each value comes from its flag, then the cluster file, then the default.
/// Patches from the cluster file apply before patches given as flags.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Cluster file (YAML) providing defaults for every flag below
    #[arg(short = 'f', long = "cluster-file", env = "SANDCASTLE_CLUSTER_FILE")]
    pub cluster_file: Option<PathBuf>,

    /// Cluster name, the prefix of every node hostname [default: talos-default]
    #[arg(long, env = "SANDCASTLE_CLUSTER_NAME")]
    pub name: Option<String>,

    /// Talos version, used as the node image tag [default: v1.8.3]
    #[arg(long, env = "SANDCASTLE_TALOS_VERSION")]
    pub talos_version: Option<String>,

    /// Number of control plane nodes [default: 1]
    #[arg(long, allow_negative_numbers = true)]
    pub controlplanes: Option<i64>,

    /// Number of worker nodes [default: 1]
    #[arg(long, allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Shared virtual IP of the control plane [default: 10.87.13.37]
    #[arg(long)]
    pub vip: Option<String>,

    /// Patch for every node: inline YAML/JSON, or @file
    #[arg(long = "config-patch")]
    pub config_patch: Vec<String>,

    /// Patch for control plane nodes: inline YAML/JSON, or @file
    #[arg(long = "config-patch-control-plane")]
    pub config_patch_control_plane: Vec<String>,

    /// Patch for worker nodes: inline YAML/JSON, or @file
    #[arg(long = "config-patch-worker")]
    pub config_patch_worker: Vec<String>,
}

/// Cluster arguments merged with the cluster file
#[derive(Debug, Clone)]
pub struct ResolvedCluster {
    pub spec: ClusterSpec,
    pub patches: PatchSet,
    /// The cluster file, or an empty one; commands read their own settings from it
    pub file: ClusterFile,
}

impl ClusterArgs {
    /// Merge flags over the cluster file and validate the result
    pub fn resolve(&self) -> Result<ResolvedCluster> {
        let file = match &self.cluster_file {
            Some(path) => {
                debug!(path = %path.display(), "loading cluster file");
                ClusterFile::load(path)?
            }
            None => ClusterFile::default(),
        };

        let spec = ClusterSpec::new(
            pick(&self.name, &file.name, DEFAULT_CLUSTER_NAME),
            pick(&self.talos_version, &file.version, DEFAULT_OS_VERSION),
            self.controlplanes.or(file.controlplanes).unwrap_or(1),
            self.workers.or(file.workers).unwrap_or(1),
            pick(&self.vip, &file.vip, DEFAULT_VIP),
        )?;

        let patches = PatchSet {
            all: chain(file.patches_all()?, &self.config_patch),
            controlplane: chain(file.patches_controlplane()?, &self.config_patch_control_plane),
            worker: chain(file.patches_worker()?, &self.config_patch_worker),
        };

        Ok(ResolvedCluster {
            spec,
            patches,
            file,
        })
    }
}

fn pick(flag: &Option<String>, file: &Option<String>, default: &str) -> String {
    flag.clone()
        .or_else(|| file.clone())
        .unwrap_or_else(|| default.to_string())
}

fn chain(mut from_file: Vec<ConfigPatch>, flags: &[String]) -> Vec<ConfigPatch> {
    from_file.extend(flags.iter().map(|arg| ConfigPatch::from_arg(arg)));
    from_file
}

/// Write a credential or config file, readable by the owner only
pub fn write_artifact(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path)
}
