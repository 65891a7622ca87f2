//! Docker-backed execution engine
//!
//! Every unit is a container on one user-defined bridge network per
//! cluster. The network is addressed from the VIP's /24 so control planes
//! can announce the VIP on their only interface, `eth0`. Bindings become
//! container links, so a bound service answers to its alias inside the
//! consumer. Setup steps run in a throwaway helper container that mounts
//! the unit's volumes, since node images have no shell of their own.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::{ExitStatus, Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use sandcastle_cluster::{
    ExecOutput, ExecutionEngine, ServiceHandle, SetupStep, UnitHandle, UnitSpec,
};
use sandcastle_common::{Error, Result};

/// Image setup steps run in
pub const DEFAULT_HELPER_IMAGE: &str = "busybox:1.36";

/// Docker manages this file from `--hostname`
const HOSTNAME_FILE: &str = "/etc/hostname";

/// A container on a single network sees it as its first interface
pub const VIP_INTERFACE: &str = "eth0";

/// Addressing of a cluster network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPlan {
    /// The VIP's /24
    pub subnet: String,
    /// Bridge address, always `.1`
    pub gateway: Ipv4Addr,
    /// The /25 containers draw addresses from; never holds the VIP
    pub ip_range: String,
}

impl NetworkPlan {
    /// Plan the network around `vip`.
    ///
    /// The VIP can't be the network, gateway or broadcast address of its /24.
    pub fn for_vip(vip: Ipv4Addr) -> Result<Self> {
        let [a, b, c, d] = vip.octets();
        if matches!(d, 0 | 1 | 255) {
            return Err(Error::validation_for_field(
                "vip",
                format!(
                    "VIP {} collides with the network, gateway or broadcast address of {}.{}.{}.0/24",
                    vip, a, b, c
                ),
            ));
        }

        let range_start = if d < 128 { 128 } else { 0 };
        Ok(Self {
            subnet: format!("{}.{}.{}.0/24", a, b, c),
            gateway: Ipv4Addr::new(a, b, c, 1),
            ip_range: format!("{}.{}.{}.{}/25", a, b, c, range_start),
        })
    }
}

/// [`ExecutionEngine`] driving the local `docker` CLI
#[derive(Debug)]
pub struct DockerEngine {
    docker_bin: String,
    network: String,
    vip: Ipv4Addr,
    helper_image: String,
    /// unit name -> (host port, unit port)
    published: BTreeMap<String, Vec<(u16, u16)>>,
    network_ready: OnceCell<()>,
}

impl DockerEngine {
    /// Engine placing units on `network`, created on first use with room
    /// for `vip`
    pub fn new(network: impl Into<String>, vip: Ipv4Addr) -> Self {
        Self {
            docker_bin: "docker".to_string(),
            network: network.into(),
            vip,
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
            published: BTreeMap::new(),
            network_ready: OnceCell::new(),
        }
    }

    /// Drive another docker-compatible CLI
    pub fn with_docker_bin(mut self, docker_bin: impl Into<String>) -> Self {
        self.docker_bin = docker_bin.into();
        self
    }

    /// Use another image for setup steps
    pub fn with_helper_image(mut self, image: impl Into<String>) -> Self {
        self.helper_image = image.into();
        self
    }

    /// Publish `unit_port` of the unit named `unit` on the host loopback
    pub fn publish(mut self, unit: impl Into<String>, host_port: u16, unit_port: u16) -> Self {
        self.published
            .entry(unit.into())
            .or_default()
            .push((host_port, unit_port));
        self
    }

    /// Network units are attached to
    pub fn network(&self) -> &str {
        &self.network
    }

    /// `docker network create` arguments for the cluster network
    pub fn network_create_args(&self) -> Result<Vec<String>> {
        let plan = NetworkPlan::for_vip(self.vip)?;
        Ok(vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
            "--subnet".to_string(),
            plan.subnet,
            "--gateway".to_string(),
            plan.gateway.to_string(),
            "--ip-range".to_string(),
            plan.ip_range,
            self.network.clone(),
        ])
    }

    /// `docker create` arguments for a unit
    pub fn create_args(&self, spec: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            self.network.clone(),
            "--network-alias".to_string(),
            spec.name.clone(),
        ];

        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.name, volume.path));
        }
        for path in &spec.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(path.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for port in &spec.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }
        for (host_port, unit_port) in self.published.get(&spec.name).into_iter().flatten() {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1:{}:{}", host_port, unit_port));
        }
        for binding in &spec.bindings {
            args.push("--link".to_string());
            args.push(format!("{}:{}", binding.service.name, binding.alias));
        }

        match spec.command.split_first() {
            Some((entrypoint, rest)) => {
                args.push("--entrypoint".to_string());
                args.push(entrypoint.clone());
                args.push(spec.image.clone());
                args.extend(rest.iter().cloned());
            }
            None => args.push(spec.image.clone()),
        }
        args
    }

    /// `docker run` arguments for the setup helper, if the unit has setup
    pub fn setup_args(&self, spec: &UnitSpec) -> Option<Vec<String>> {
        if spec.setup.is_empty() {
            return None;
        }

        let script = spec
            .setup
            .iter()
            .map(SetupStep::to_shell)
            .collect::<Vec<_>>()
            .join(" && ");

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("{}-setup", spec.name),
        ];
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.name, volume.path));
        }
        args.extend([
            self.helper_image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ]);
        Some(args)
    }

    async fn docker(&self, op: &str, args: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(op, command = %args.join(" "), "docker");

        let mut child = Command::new(&self.docker_bin)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::engine(op, format!("failed to run {}: {}", self.docker_bin, e)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)
                .await
                .map_err(|e| Error::engine(op, format!("failed to write stdin: {}", e)))?;
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| Error::engine(op, e.to_string()))
    }

    /// Run docker and return trimmed stdout, failing on a non-zero exit
    async fn docker_ok(&self, op: &str, args: &[String], stdin: Option<&[u8]>) -> Result<String> {
        let output = self.docker(op, args, stdin).await?;
        if !output.status.success() {
            return Err(Error::engine(
                op,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn ensure_network(&self) -> Result<()> {
        self.network_ready
            .get_or_try_init(|| async {
                let inspect = self
                    .docker(
                        "network",
                        &strings(&[
                            "network",
                            "inspect",
                            "--format",
                            "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
                            &self.network,
                        ]),
                        None,
                    )
                    .await?;

                if inspect.status.success() {
                    let subnets = String::from_utf8_lossy(&inspect.stdout);
                    check_existing_network(&self.network, &subnets, self.vip)?;
                    debug!(network = %self.network, subnets = %subnets.trim(), "reusing docker network");
                } else {
                    let args = self.network_create_args()?;
                    info!(network = %self.network, vip = %self.vip, "creating docker network");
                    self.docker_ok("network", &args, None).await?;
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Copy spec files into a created, not yet started container.
    ///
    /// Files are staged as a tree mirroring their unit paths and copied in
    /// one go, which also creates missing parent directories.
    async fn copy_files(&self, spec: &UnitSpec, id: &str) -> Result<()> {
        let files: Vec<_> = spec
            .files
            .iter()
            .filter(|f| !(f.path == HOSTNAME_FILE && f.contents.trim() == spec.name))
            .collect();
        if files.is_empty() {
            return Ok(());
        }

        let staging = tempfile::tempdir().map_err(|e| {
            Error::engine("copy_files", format!("failed to create staging dir: {}", e))
        })?;
        for file in &files {
            let local = staging.path().join(file.path.trim_start_matches('/'));
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::engine("copy_files", format!("{}: {}", file.path, e)))?;
            }
            std::fs::write(&local, &file.contents)
                .map_err(|e| Error::engine("copy_files", format!("{}: {}", file.path, e)))?;
        }

        let args = vec![
            "cp".to_string(),
            format!("{}/.", staging.path().display()),
            format!("{}:/", id),
        ];
        self.docker_ok("copy_files", &args, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    async fn build(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        self.ensure_network().await?;

        // Replace a container left by an earlier run; its volumes survive
        match self
            .docker("remove", &strings(&["rm", "-f", &spec.name]), None)
            .await
        {
            Ok(output) if !output.status.success() => debug!(
                unit = %spec.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "stale container not removed"
            ),
            Err(e) => debug!(unit = %spec.name, error = %e, "stale container not removed"),
            Ok(_) => {}
        }

        if let Some(args) = self.setup_args(spec) {
            self.docker_ok("setup", &args, None).await?;
        }

        let id = self.docker_ok("create", &self.create_args(spec), None).await?;
        self.copy_files(spec, &id).await?;

        debug!(unit = %spec.name, id = %id, "unit built");
        Ok(UnitHandle {
            name: spec.name.clone(),
            id,
        })
    }

    async fn start_service(&self, unit: &UnitHandle) -> Result<ServiceHandle> {
        self.docker_ok("start", &strings(&["start", &unit.id]), None)
            .await?;
        Ok(ServiceHandle {
            name: unit.name.clone(),
            id: unit.id.clone(),
        })
    }

    async fn exec(&self, service: &ServiceHandle, argv: &[String]) -> Result<ExecOutput> {
        let mut args = strings(&["exec", &service.id]);
        args.extend(argv.iter().cloned());

        let output = self.docker("exec", &args, None).await?;
        Ok(exec_output(output))
    }

    async fn write_file(&self, service: &ServiceHandle, path: &str, contents: &[u8]) -> Result<()> {
        let args = strings(&[
            "exec",
            "-i",
            &service.id,
            "sh",
            "-c",
            r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
            "sh",
            path,
        ]);
        self.docker_ok("write_file", &args, Some(contents)).await?;
        Ok(())
    }

    async fn read_file(&self, service: &ServiceHandle, path: &str) -> Result<Vec<u8>> {
        let args = strings(&["exec", &service.id, "cat", path]);
        let output = self.docker("read_file", &args, None).await?;
        if !output.status.success() {
            return Err(Error::engine(
                "read_file",
                format!(
                    "{}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output.stdout)
    }

    fn vip_interface(&self) -> &str {
        VIP_INTERFACE
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Fail unless one of the network's subnets (space separated CIDRs, as
/// `docker network inspect` prints them) contains the VIP
fn check_existing_network(network: &str, subnets: &str, vip: Ipv4Addr) -> Result<()> {
    if subnets
        .split_whitespace()
        .any(|cidr| subnet_contains(cidr, vip))
    {
        return Ok(());
    }
    Err(Error::engine(
        "network",
        format!(
            "existing network {} ({}) does not contain VIP {}; remove it or choose another network",
            network,
            subnets.trim(),
            vip
        ),
    ))
}

fn subnet_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    let Some((base, len)) = cidr.split_once('/') else {
        return false;
    };
    let (Ok(base), Ok(len)) = (base.parse::<Ipv4Addr>(), len.parse::<u32>()) else {
        return false;
    };
    if len > 32 {
        return false;
    }
    let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
    u32::from(base) & mask == u32::from(ip) & mask
}

/// A process killed by a signal has no exit code; say so in stderr
fn exec_output(output: Output) -> ExecOutput {
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = match output.status.code() {
        Some(code) => code,
        None => {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("terminated by {}", termination(&output.status)));
            -1
        }
    };
    ExecOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
    }
}

#[cfg(unix)]
fn termination(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("signal {}", signal),
        None => status.to_string(),
    }
}

#[cfg(not(unix))]
fn termination(status: &ExitStatus) -> String {
    status.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_cluster::{ServiceBinding, UnitFile, VolumeMount};

    fn node_spec() -> UnitSpec {
        UnitSpec {
            name: "t1-controlplane-1".to_string(),
            image: "ghcr.io/siderolabs/talos:v1.8.3".to_string(),
            files: vec![UnitFile {
                path: HOSTNAME_FILE.to_string(),
                contents: "t1-controlplane-1".to_string(),
            }],
            volumes: vec![VolumeMount {
                name: "t1-controlplane-1-var".to_string(),
                path: "/var".to_string(),
            }],
            tmpfs: vec!["/tmp".to_string()],
            env: BTreeMap::from([("PLATFORM".to_string(), "container".to_string())]),
            setup: vec![SetupStep::RemoveFiles(vec![
                "/system/state/config.yaml".to_string(),
            ])],
            command: vec!["/sbin/init".to_string()],
            privileged: true,
            exposed_ports: vec![50000, 6443],
            bindings: vec![],
        }
    }

    fn engine() -> DockerEngine {
        DockerEngine::new("t1-net", Ipv4Addr::new(10, 87, 13, 37))
    }

    fn window(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn node_create_args() {
        let engine = engine();
        let args = engine.create_args(&node_spec());

        assert_eq!(args[0], "create");
        assert_eq!(window(&args, "--name"), ["t1-controlplane-1"]);
        assert_eq!(window(&args, "--hostname"), ["t1-controlplane-1"]);
        assert_eq!(window(&args, "--network"), ["t1-net"]);
        assert!(args.contains(&"--privileged".to_string()));
        assert_eq!(window(&args, "-v"), ["t1-controlplane-1-var:/var"]);
        assert_eq!(window(&args, "--tmpfs"), ["/tmp"]);
        assert_eq!(window(&args, "-e"), ["PLATFORM=container"]);
        assert_eq!(window(&args, "--expose"), ["50000", "6443"]);
        assert!(window(&args, "-p").is_empty());

        // image follows the entrypoint, with no trailing arguments
        assert_eq!(window(&args, "--entrypoint"), ["/sbin/init"]);
        assert_eq!(args.last().unwrap(), "ghcr.io/siderolabs/talos:v1.8.3");
    }

    #[test]
    fn command_arguments_follow_the_image() {
        let spec = UnitSpec {
            name: "t1-toolbox".to_string(),
            image: "alpine/k8s:1.31.2".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            ..Default::default()
        };
        let args = engine().create_args(&spec);
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, ["--entrypoint", "sleep", "alpine/k8s:1.31.2", "infinity"]);
    }

    #[test]
    fn bindings_become_links() {
        let spec = UnitSpec {
            name: "t1-proxy".to_string(),
            image: "envoyproxy/envoy:v1.32.1".to_string(),
            bindings: vec![ServiceBinding {
                alias: "t1-controlplane-1".to_string(),
                service: ServiceHandle {
                    name: "t1-controlplane-1".to_string(),
                    id: "abc123".to_string(),
                },
            }],
            ..Default::default()
        };
        let args = engine().create_args(&spec);
        assert_eq!(window(&args, "--link"), ["t1-controlplane-1:t1-controlplane-1"]);
        assert!(window(&args, "--entrypoint").is_empty());
        assert_eq!(args.last().unwrap(), "envoyproxy/envoy:v1.32.1");
    }

    #[test]
    fn published_ports_apply_to_the_named_unit_only() {
        let engine = engine()
            .publish("t1-proxy", 16443, 6443)
            .publish("t1-proxy", 50000, 50000);

        let proxy = UnitSpec {
            name: "t1-proxy".to_string(),
            image: "envoyproxy/envoy:v1.32.1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            window(&engine.create_args(&proxy), "-p"),
            ["127.0.0.1:16443:6443", "127.0.0.1:50000:50000"]
        );
        assert!(window(&engine.create_args(&node_spec()), "-p").is_empty());
    }

    #[test]
    fn setup_runs_in_helper_with_unit_volumes() {
        let engine = engine().with_helper_image("busybox:latest");
        let args = engine.setup_args(&node_spec()).unwrap();

        assert_eq!(&args[..2], ["run", "--rm"]);
        assert_eq!(window(&args, "-v"), ["t1-controlplane-1-var:/var"]);
        assert_eq!(
            &args[args.len() - 4..],
            ["busybox:latest", "sh", "-c", "rm -f /system/state/config.yaml"]
        );
        assert!(!args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn no_setup_no_helper() {
        let spec = UnitSpec {
            name: "t1-proxy".to_string(),
            ..Default::default()
        };
        assert!(engine().setup_args(&spec).is_none());
    }

    #[test]
    fn network_is_addressed_around_the_vip() {
        let args = engine().network_create_args().unwrap();

        assert_eq!(&args[..2], ["network", "create"]);
        assert_eq!(window(&args, "--subnet"), ["10.87.13.0/24"]);
        assert_eq!(window(&args, "--gateway"), ["10.87.13.1"]);
        assert_eq!(window(&args, "--ip-range"), ["10.87.13.128/25"]);
        assert_eq!(args.last().unwrap(), "t1-net");
        assert!(subnet_contains("10.87.13.0/24", Ipv4Addr::new(10, 87, 13, 37)));
    }

    #[test]
    fn container_range_avoids_a_high_vip() {
        let plan = NetworkPlan::for_vip(Ipv4Addr::new(172, 30, 5, 200)).unwrap();
        assert_eq!(plan.subnet, "172.30.5.0/24");
        assert_eq!(plan.ip_range, "172.30.5.0/25");
        assert!(!subnet_contains(&plan.ip_range, Ipv4Addr::new(172, 30, 5, 200)));
    }

    #[test]
    fn vip_on_a_reserved_address_is_rejected() {
        for last in [0, 1, 255] {
            let err = NetworkPlan::for_vip(Ipv4Addr::new(10, 5, 0, last)).unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{err:?}");
        }
    }

    #[test]
    fn existing_network_must_contain_the_vip() {
        let vip = Ipv4Addr::new(10, 87, 13, 37);
        assert!(check_existing_network("t1-net", "10.87.0.0/16 ", vip).is_ok());
        assert!(check_existing_network("t1-net", "fd00::/64 10.87.13.0/24 ", vip).is_ok());

        let err = check_existing_network("t1-net", "172.18.0.0/16 ", vip).unwrap_err();
        assert!(err.to_string().contains("does not contain VIP 10.87.13.37"));
        assert!(check_existing_network("t1-net", "", vip).is_err());
    }

    #[test]
    fn nodes_announce_the_vip_on_eth0() {
        assert_eq!(engine().vip_interface(), "eth0");
    }

    #[cfg(unix)]
    #[test]
    fn signal_termination_is_reported() {
        use std::os::unix::process::ExitStatusExt;

        let output = Output {
            status: ExitStatus::from_raw(9),
            stdout: Vec::new(),
            stderr: b"partial".to_vec(),
        };
        let out = exec_output(output);
        assert_eq!(out.exit_code, -1);
        assert!(!out.success());
        assert_eq!(out.diagnostic(), "partial\nterminated by signal 9");

        let output = Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
        };
        let out = exec_output(output);
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_stale_removal_does_not_fail_the_build() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("docker");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             case \"$1\" in\n\
             network) echo '10.87.13.0/24 ' ;;\n\
             rm) echo \"Error: No such container: $3\" >&2; exit 1 ;;\n\
             create) echo c0ffee ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = engine().with_docker_bin(script.display().to_string());
        let spec = UnitSpec {
            name: "t1-proxy".to_string(),
            image: "envoyproxy/envoy:v1.32.1".to_string(),
            ..Default::default()
        };
        let unit = engine.build(&spec).await.unwrap();
        assert_eq!(unit.id, "c0ffee");
        assert_eq!(unit.name, "t1-proxy");
    }
}
