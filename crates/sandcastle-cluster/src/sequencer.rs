//! Bootstrap sequencer
//!
//! Drives provisioned nodes to a ready cluster as an explicit state machine:
//!
//! ```text
//! Unconfigured -> ConfigApplied -> ConsensusBootstrapped -> ApiReady
//!     -> CredentialRetrieved -> Registered
//! ```
//!
//! Each state has exactly one transition. A failed transition aborts the run
//! with a [`BootstrapFailure`] naming the step and the last state reached.
//! Nothing is rolled back and nothing is retried; units stay as they are for
//! inspection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use sandcastle_common::poll::wait_with_timeout;
use sandcastle_common::{
    Error, NodeDescriptor, Result, API_PORT, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_READINESS_TIMEOUT_SECS,
};
use sandcastle_infra::{MachineConfig, MachineConfigGenerator};

use crate::node_client::NodeClient;
use crate::topology::Topology;

/// Default bound on the one-time bootstrap command (seconds)
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 120;

/// Timing and concurrency knobs for a bootstrap run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Bound on waiting for the API port to accept TCP connections
    pub api_timeout: Duration,
    /// Bound on waiting for each node to register
    pub registration_timeout: Duration,
    /// Bound on the bootstrap command itself
    pub bootstrap_timeout: Duration,
    /// Delay between readiness polls
    pub poll_interval: Duration,
    /// Nodes configured at once; 1 applies configs sequentially
    pub apply_concurrency: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            api_timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS),
            registration_timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS),
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            apply_concurrency: 1,
        }
    }
}

/// Where a bootstrap run stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nodes are running but carry no config
    Unconfigured,
    /// Every node accepted its config
    ConfigApplied {
        /// Configured hostnames, control planes first
        nodes: Vec<String>,
    },
    /// The bootstrap node initialized consensus
    ConsensusBootstrapped,
    /// The API port accepts TCP connections
    ApiReady,
    /// Admin credentials were retrieved
    CredentialRetrieved {
        /// Kubeconfig as returned by the bootstrap node
        kubeconfig: String,
    },
    /// Every node is registered with the cluster
    Registered {
        /// Kubeconfig as returned by the bootstrap node
        kubeconfig: String,
    },
}

impl BootstrapState {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            BootstrapState::Unconfigured => "Unconfigured",
            BootstrapState::ConfigApplied { .. } => "ConfigApplied",
            BootstrapState::ConsensusBootstrapped => "ConsensusBootstrapped",
            BootstrapState::ApiReady => "ApiReady",
            BootstrapState::CredentialRetrieved { .. } => "CredentialRetrieved",
            BootstrapState::Registered { .. } => "Registered",
        }
    }

    /// The step that leaves this state, or `None` once registered
    pub fn next_step(&self) -> Option<BootstrapStep> {
        match self {
            BootstrapState::Unconfigured => Some(BootstrapStep::ApplyConfig),
            BootstrapState::ConfigApplied { .. } => Some(BootstrapStep::BootstrapConsensus),
            BootstrapState::ConsensusBootstrapped => Some(BootstrapStep::WaitForApi),
            BootstrapState::ApiReady => Some(BootstrapStep::FetchCredentials),
            BootstrapState::CredentialRetrieved { .. } => {
                Some(BootstrapStep::WaitForRegistration)
            }
            BootstrapState::Registered { .. } => None,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transition between two states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Render and apply every node's config
    ApplyConfig,
    /// Issue the one-time bootstrap command
    BootstrapConsensus,
    /// Wait for the API port
    WaitForApi,
    /// Retrieve the kubeconfig
    FetchCredentials,
    /// Wait for every node to register
    WaitForRegistration,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootstrapStep::ApplyConfig => "apply-config",
            BootstrapStep::BootstrapConsensus => "bootstrap",
            BootstrapStep::WaitForApi => "wait-for-api",
            BootstrapStep::FetchCredentials => "fetch-credentials",
            BootstrapStep::WaitForRegistration => "wait-for-registration",
        })
    }
}

/// Terminal error of a bootstrap run
#[derive(Debug, thiserror::Error)]
#[error("bootstrap failed at step {step} (reached {reached}): {source}")]
pub struct BootstrapFailure {
    /// The step that failed
    pub step: BootstrapStep,
    /// The last state successfully reached
    pub reached: BootstrapState,
    /// What went wrong
    #[source]
    pub source: Error,
}

/// Result of a completed run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// Kubeconfig from the bootstrap node, server unmodified
    pub kubeconfig: String,
    /// Registered hostnames, control planes first
    pub nodes: Vec<String>,
}

/// Runs the bootstrap state machine against one topology
pub struct BootstrapSequencer {
    topology: Topology,
    generator: Arc<MachineConfigGenerator>,
    client: Arc<dyn NodeClient>,
    config: SequencerConfig,
}

impl BootstrapSequencer {
    /// Create a sequencer
    pub fn new(
        topology: Topology,
        generator: Arc<MachineConfigGenerator>,
        client: Arc<dyn NodeClient>,
        config: SequencerConfig,
    ) -> Self {
        Self {
            topology,
            generator,
            client,
            config,
        }
    }

    /// Drive the state machine from `Unconfigured` to `Registered`.
    ///
    /// Cancellation stops before the next step and interrupts waits.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> std::result::Result<BootstrapOutcome, BootstrapFailure> {
        let mut state = BootstrapState::Unconfigured;

        loop {
            let Some(step) = state.next_step() else {
                break;
            };

            if cancel.is_cancelled() {
                warn!(step = %step, reached = %state, "bootstrap cancelled");
                return Err(BootstrapFailure {
                    step,
                    source: Error::cancelled(step.to_string()),
                    reached: state,
                });
            }

            match self.step(&state, &cancel).await {
                Ok(next) => {
                    info!(step = %step, from = %state, to = %next, "bootstrap transition");
                    state = next;
                }
                Err(source) => {
                    warn!(step = %step, reached = %state, error = %source, "bootstrap step failed");
                    return Err(BootstrapFailure {
                        step,
                        reached: state,
                        source,
                    });
                }
            }
        }

        match state {
            BootstrapState::Registered { kubeconfig } => Ok(BootstrapOutcome {
                kubeconfig,
                nodes: self.hostnames(),
            }),
            // next_step() is None only for Registered
            other => Err(BootstrapFailure {
                step: BootstrapStep::WaitForRegistration,
                source: Error::validation(format!("sequence ended in state {}", other)),
                reached: other,
            }),
        }
    }

    /// Perform the single transition out of `state`
    pub async fn step(
        &self,
        state: &BootstrapState,
        cancel: &CancellationToken,
    ) -> Result<BootstrapState> {
        match state {
            BootstrapState::Unconfigured => self.apply_configs(cancel).await,
            BootstrapState::ConfigApplied { .. } => self.bootstrap_consensus().await,
            BootstrapState::ConsensusBootstrapped => self.wait_for_api(cancel).await,
            BootstrapState::ApiReady => self.fetch_credentials().await,
            BootstrapState::CredentialRetrieved { kubeconfig } => {
                self.wait_for_registration(kubeconfig, cancel).await
            }
            BootstrapState::Registered { .. } => Ok(state.clone()),
        }
    }

    fn hostnames(&self) -> Vec<String> {
        self.topology
            .all()
            .map(|n| n.hostname().to_string())
            .collect()
    }

    #[instrument(skip_all, fields(nodes = self.topology.len()))]
    async fn apply_configs(&self, cancel: &CancellationToken) -> Result<BootstrapState> {
        // Render everything first so a generation error touches no node.
        let rendered: Vec<(&NodeDescriptor, MachineConfig)> = self
            .topology
            .all()
            .map(|node| self.generator.render_for_node(node).map(|config| (node, config)))
            .collect::<Result<_>>()?;

        let limit = self
            .config
            .apply_concurrency
            .clamp(1, self.topology.len().max(1));

        let apply = stream::iter(rendered)
            .map(|(node, config)| async move {
                info!(node = %node, role = %node.role(), "applying machine config");
                self.client.apply_config(node, &config).await
            })
            .buffered(limit)
            .try_collect::<Vec<()>>();

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(BootstrapStep::ApplyConfig.to_string())),
            result = apply => result?,
        };

        Ok(BootstrapState::ConfigApplied {
            nodes: self.hostnames(),
        })
    }

    #[instrument(skip_all, fields(node = %self.topology.bootstrap_node()))]
    async fn bootstrap_consensus(&self) -> Result<BootstrapState> {
        let node = self.topology.bootstrap_node();
        info!("bootstrapping consensus");

        match tokio::time::timeout(self.config.bootstrap_timeout, self.client.bootstrap(node)).await
        {
            Ok(Ok(())) => Ok(BootstrapState::ConsensusBootstrapped),
            Ok(Err(e @ Error::BootstrapCommand { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::bootstrap_command(node.hostname(), e.to_string())),
            Err(_) => Err(Error::bootstrap_command(
                node.hostname(),
                format!(
                    "no response after {}s",
                    self.config.bootstrap_timeout.as_secs()
                ),
            )),
        }
    }

    #[instrument(skip_all)]
    async fn wait_for_api(&self, cancel: &CancellationToken) -> Result<BootstrapState> {
        let vip = self.topology.spec().vip();
        let target = format!("{}:{}", vip, API_PORT);
        info!(target = %target, "waiting for API to accept connections");

        wait_with_timeout(
            self.config.api_timeout,
            self.config.poll_interval,
            &target,
            cancel,
            || async move {
                // A failing probe is "not yet"; only the deadline ends the wait.
                match self.client.probe_tcp(vip, API_PORT).await {
                    Ok(true) => Ok(Some(())),
                    Ok(false) => Ok(None),
                    Err(e) => {
                        warn!(error = %e, "API probe failed");
                        Ok(None)
                    }
                }
            },
        )
        .await?;

        Ok(BootstrapState::ApiReady)
    }

    #[instrument(skip_all, fields(node = %self.topology.bootstrap_node()))]
    async fn fetch_credentials(&self) -> Result<BootstrapState> {
        let kubeconfig = self
            .client
            .fetch_kubeconfig(self.topology.bootstrap_node())
            .await?;
        info!("retrieved admin kubeconfig");
        Ok(BootstrapState::CredentialRetrieved { kubeconfig })
    }

    #[instrument(skip_all)]
    async fn wait_for_registration(
        &self,
        kubeconfig: &str,
        cancel: &CancellationToken,
    ) -> Result<BootstrapState> {
        for node in self.topology.all() {
            let hostname = node.hostname();
            let target = format!("node/{}", hostname);

            wait_with_timeout(
                self.config.registration_timeout,
                self.config.poll_interval,
                &target,
                cancel,
                || async move {
                    match self.client.node_registered(hostname).await {
                        Ok(true) => Ok(Some(())),
                        Ok(false) => Ok(None),
                        Err(e) => {
                            warn!(node = %hostname, error = %e, "registration check failed");
                            Ok(None)
                        }
                    }
                },
            )
            .await?;
            info!(node = %hostname, "node registered");
        }

        Ok(BootstrapState::Registered {
            kubeconfig: kubeconfig.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::MockNodeClient;
    use crate::topology::build_topology;
    use mockall::Sequence;
    use sandcastle_common::ClusterSpec;
    use sandcastle_infra::{ConfigPatch, PatchSet, TrustBundle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KUBECONFIG: &str = "apiVersion: v1\nkind: Config\n";

    fn spec(cp: i64, workers: i64) -> ClusterSpec {
        ClusterSpec::new("t1", "v1.8.3", cp, workers, "10.87.13.37").unwrap()
    }

    fn generator(spec: &ClusterSpec) -> Arc<MachineConfigGenerator> {
        let bundle = Arc::new(TrustBundle::generate(spec).unwrap());
        Arc::new(MachineConfigGenerator::new(spec, bundle, &PatchSet::default()).unwrap())
    }

    fn sequencer(spec: &ClusterSpec, client: MockNodeClient, config: SequencerConfig) -> BootstrapSequencer {
        BootstrapSequencer::new(build_topology(spec), generator(spec), Arc::new(client), config)
    }

    fn healthy_client() -> MockNodeClient {
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client.expect_bootstrap().times(1).returning(|_| Ok(()));
        client.expect_probe_tcp().returning(|_, _| Ok(true));
        client
            .expect_fetch_kubeconfig()
            .returning(|_| Ok(KUBECONFIG.to_string()));
        client.expect_node_registered().returning(|_| Ok(true));
        client
    }

    #[tokio::test]
    async fn happy_path_reaches_registered() {
        let spec = spec(1, 1);
        let outcome = sequencer(&spec, healthy_client(), SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.kubeconfig, KUBECONFIG);
        assert_eq!(outcome.nodes, vec!["t1-controlplane-1", "t1-worker-1"]);
    }

    #[tokio::test]
    async fn steps_run_in_strict_order() {
        let spec = spec(1, 1);
        let mut seq = Sequence::new();
        let mut client = MockNodeClient::new();

        client
            .expect_apply_config()
            .withf(|node, _| node.hostname() == "t1-controlplane-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        client
            .expect_apply_config()
            .withf(|node, _| node.hostname() == "t1-worker-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        client
            .expect_bootstrap()
            .withf(|node| node.hostname() == "t1-controlplane-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        client
            .expect_probe_tcp()
            .withf(|host, port| host == "10.87.13.37" && *port == 6443)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        client
            .expect_fetch_kubeconfig()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(KUBECONFIG.to_string()));
        client
            .expect_node_registered()
            .withf(|host| host == "t1-controlplane-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        client
            .expect_node_registered()
            .withf(|host| host == "t1-worker-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));

        sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bootstrap_is_issued_once_on_first_control_plane_only() {
        let spec = spec(3, 2);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().times(5).returning(|_, _| Ok(()));
        client
            .expect_bootstrap()
            .withf(|node| node.is_bootstrap_node())
            .times(1)
            .returning(|_| Ok(()));
        client.expect_probe_tcp().returning(|_, _| Ok(true));
        client
            .expect_fetch_kubeconfig()
            .withf(|node| node.hostname() == "t1-controlplane-1")
            .returning(|_| Ok(KUBECONFIG.to_string()));
        client.expect_node_registered().times(5).returning(|_| Ok(true));

        sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_api_times_out_naming_vip_and_port() {
        let spec = spec(1, 1);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client.expect_bootstrap().returning(|_| Ok(()));
        client.expect_probe_tcp().returning(|_, _| Ok(false));
        client.expect_fetch_kubeconfig().never();

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::WaitForApi);
        assert_eq!(failure.reached, BootstrapState::ConsensusBootstrapped);
        match failure.source {
            Error::ReadinessTimeout {
                target,
                waited_secs,
            } => {
                assert_eq!(target, "10.87.13.37:6443");
                assert_eq!(waited_secs, 300);
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn api_becomes_ready_after_a_few_polls() {
        let spec = spec(1, 0);
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();

        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client.expect_bootstrap().returning(|_| Ok(()));
        client
            .expect_probe_tcp()
            .returning(move |_, _| Ok(counter.fetch_add(1, Ordering::SeqCst) >= 3));
        client
            .expect_fetch_kubeconfig()
            .returning(|_| Ok(KUBECONFIG.to_string()));
        client.expect_node_registered().returning(|_| Ok(true));

        sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_timeout_names_the_node() {
        let spec = spec(1, 1);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client.expect_bootstrap().returning(|_| Ok(()));
        client.expect_probe_tcp().returning(|_, _| Ok(true));
        client
            .expect_fetch_kubeconfig()
            .returning(|_| Ok(KUBECONFIG.to_string()));
        client
            .expect_node_registered()
            .returning(|host| Ok(host != "t1-worker-1"));

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::WaitForRegistration);
        assert!(matches!(
            failure.reached,
            BootstrapState::CredentialRetrieved { .. }
        ));
        match failure.source {
            Error::ReadinessTimeout { target, .. } => assert_eq!(target, "node/t1-worker-1"),
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_failure_stops_before_bootstrap() {
        let spec = spec(1, 2);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|node, _| {
            if node.hostname() == "t1-worker-1" {
                Err(Error::config_application(node.hostname(), "connection refused"))
            } else {
                Ok(())
            }
        });
        client.expect_bootstrap().never();

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::ApplyConfig);
        assert_eq!(failure.reached, BootstrapState::Unconfigured);
        assert!(failure.to_string().contains("t1-worker-1"));
    }

    #[tokio::test]
    async fn bootstrap_failure_is_not_retried() {
        let spec = spec(1, 1);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client
            .expect_bootstrap()
            .times(1)
            .returning(|node| Err(Error::engine("exec", format!("{} unreachable", node))));
        client.expect_probe_tcp().never();

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::BootstrapConsensus);
        match failure.source {
            Error::BootstrapCommand { node, .. } => assert_eq!(node, "t1-controlplane-1"),
            other => panic!("expected BootstrapCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn generation_error_touches_no_node() {
        let spec = spec(1, 1);
        let bundle = Arc::new(TrustBundle::generate(&spec).unwrap());
        // Valid for the role render, but the per-node hostname patch needs
        // /machine/network to be an object.
        let generator = MachineConfigGenerator::new(
            &spec,
            bundle,
            &PatchSet {
                worker: vec![ConfigPatch::Inline(
                    r#"[{"op": "replace", "path": "/machine/network", "value": "none"}]"#.to_string(),
                )],
                ..Default::default()
            },
        )
        .unwrap();

        let mut client = MockNodeClient::new();
        client.expect_apply_config().never();

        let failure = BootstrapSequencer::new(
            build_topology(&spec),
            Arc::new(generator),
            Arc::new(client),
            SequencerConfig::default(),
        )
        .run(CancellationToken::new())
        .await
        .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::ApplyConfig);
        assert_eq!(failure.source.kind(), "ConfigGenerationError");
    }

    #[tokio::test]
    async fn cancelled_run_issues_no_steps() {
        let spec = spec(1, 1);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().never();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::ApplyConfig);
        assert_eq!(failure.source.kind(), "Cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_api_wait() {
        let spec = spec(1, 0);
        let mut client = MockNodeClient::new();
        client.expect_apply_config().returning(|_, _| Ok(()));
        client.expect_bootstrap().returning(|_| Ok(()));
        client.expect_probe_tcp().returning(|_, _| Ok(false));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let failure = sequencer(&spec, client, SequencerConfig::default())
            .run(cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.step, BootstrapStep::WaitForApi);
        assert_eq!(failure.source.kind(), "Cancelled");
    }

    #[tokio::test]
    async fn step_performs_exactly_one_transition() {
        let spec = spec(1, 1);
        let mut client = MockNodeClient::new();
        client
            .expect_fetch_kubeconfig()
            .times(1)
            .returning(|_| Ok(KUBECONFIG.to_string()));

        let seq = sequencer(&spec, client, SequencerConfig::default());
        let next = seq
            .step(&BootstrapState::ApiReady, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            next,
            BootstrapState::CredentialRetrieved {
                kubeconfig: KUBECONFIG.to_string()
            }
        );
    }
}
