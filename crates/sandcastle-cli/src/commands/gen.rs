//! `sandcastle gen`: render machine configs and a talosconfig to disk
//!
//! Nothing is started. Useful for inspecting what patches do, or for
//! feeding configs to nodes created some other way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::info;

use sandcastle_common::yaml::to_yaml;
use sandcastle_common::NodeRole;
use sandcastle_infra::{MachineConfigGenerator, TrustBundle, DEFAULT_VIP_INTERFACE};

use super::{write_artifact, ClusterArgs, ResolvedCluster};
use crate::Result;

/// Gen arguments
#[derive(Args, Debug)]
pub struct GenArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Directory the configs are written to
    #[arg(short = 'o', long, default_value = ".")]
    pub out_dir: PathBuf,

    /// Node interface control planes announce the VIP on
    #[arg(long, default_value = DEFAULT_VIP_INTERFACE)]
    pub vip_interface: String,
}

/// Run the gen command
pub async fn run(args: GenArgs) -> Result<()> {
    let resolved = args.cluster.resolve()?;
    for path in generate(&resolved, &args.vip_interface, &args.out_dir)? {
        println!("{}", path.display());
    }
    Ok(())
}

/// Write `controlplane.yaml`, `worker.yaml` and `talosconfig` into `out_dir`
pub fn generate(
    resolved: &ResolvedCluster,
    vip_interface: &str,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let spec = &resolved.spec;
    let bundle = Arc::new(TrustBundle::generate(spec)?);
    let talosconfig = bundle.talosconfig(spec);
    let generator = MachineConfigGenerator::with_vip_interface(
        spec,
        bundle,
        &resolved.patches,
        vip_interface,
    )?;

    let mut written = Vec::new();
    for role in [NodeRole::ControlPlane, NodeRole::Worker] {
        let config = generator.render(role)?;
        let name = format!("{}.yaml", role.as_str());
        written.push(write_artifact(out_dir, &name, &config.to_yaml()?)?);
    }
    written.push(write_artifact(out_dir, "talosconfig", &to_yaml(&talosconfig)?)?);

    info!(cluster = %spec.name(), dir = %out_dir.display(), "configs written");
    Ok(written)
}
