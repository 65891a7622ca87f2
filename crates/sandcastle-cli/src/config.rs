//! Cluster file
//!
//! A YAML file describing a cluster, so CI jobs don't have to spell out
//! every flag. Command-line flags override anything set here.
//!
//! ```yaml
//! name: ci
//! version: v1.8.3
//! controlplanes: 1
//! workers: 2
//! vip: 10.87.13.37
//! configPatches:
//!   - machine:
//!       network:
//!         nameservers: [1.1.1.1]
//! configPatchesWorker:
//!   - "@worker-extra.yaml"
//! apiTimeoutSecs: 600
//! ```
//!
//! Patch entries are either YAML structures, used as the patch itself, or
//! strings. A string starting with `@` names a patch file, resolved
//! relative to the cluster file's directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use sandcastle_infra::ConfigPatch;

use crate::{Error, Result};

/// Parsed cluster file
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterFile {
    pub name: Option<String>,
    pub version: Option<String>,
    pub controlplanes: Option<i64>,
    pub workers: Option<i64>,
    pub vip: Option<String>,
    #[serde(default)]
    pub config_patches: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub config_patches_control_plane: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub config_patches_worker: Vec<serde_yaml::Value>,
    pub api_timeout_secs: Option<u64>,
    pub registration_timeout_secs: Option<u64>,
    pub bootstrap_timeout_secs: Option<u64>,
    pub apply_concurrency: Option<usize>,
    pub external_server: Option<String>,

    /// Directory relative patch paths resolve against
    #[serde(skip)]
    base_dir: PathBuf,
}

impl ClusterFile {
    /// Read and parse a cluster file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::cluster_file(path, format!("failed to read: {}", e)))?;
        let mut file = Self::parse(&text).map_err(|e| Error::cluster_file(path, e))?;
        file.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(file)
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    }

    /// Patches applied to every role
    pub fn patches_all(&self) -> Result<Vec<ConfigPatch>> {
        self.resolve(&self.config_patches, "configPatches")
    }

    /// Patches applied to control planes
    pub fn patches_controlplane(&self) -> Result<Vec<ConfigPatch>> {
        self.resolve(&self.config_patches_control_plane, "configPatchesControlPlane")
    }

    /// Patches applied to workers
    pub fn patches_worker(&self) -> Result<Vec<ConfigPatch>> {
        self.resolve(&self.config_patches_worker, "configPatchesWorker")
    }

    fn resolve(&self, entries: &[serde_yaml::Value], field: &str) -> Result<Vec<ConfigPatch>> {
        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                serde_yaml::Value::String(arg) => Ok(match ConfigPatch::from_arg(arg) {
                    ConfigPatch::File(path) if path.is_relative() => {
                        ConfigPatch::File(self.base_dir.join(path))
                    }
                    patch => patch,
                }),
                serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_) => {
                    Ok(ConfigPatch::Inline(serde_yaml::to_string(entry)?))
                }
                _ => Err(Error::validation(format!(
                    "{}[{}] must be a mapping, a sequence or a string",
                    field, i
                ))),
            })
            .collect()
    }
}
