//! §4.9: Controller Top-Level. The fourteen-step sequence from TestbedConfig
//! load through reservation release. `run()` is the single async entry
//! point, owning a `tokio::sync::watch` cancellation channel exactly as the
//! teacher's `mvm-coordinator::server::serve` owns its shutdown channel.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ptb_core::config::{Instance, TestbedConfig, INSTANCE_MGMT_SOCKET};
use ptb_core::instance::{InstanceLifecycleState, InterfaceMapping};
use ptb_core::naming::{mac_base, mac_for_nic, INTERCHANGE_DIR_PREFIX};
use ptb_core::protocol::{AppExecutionState, Downstream, DownstreamMessage, Upstream, UpstreamMessage};
use ptb_fabric::dismantle::DismantleStack;
use ptb_fabric::runner::{CommandRunner, SystemRunner};
use ptb_fabric::{bridge, nat, tap};
use ptb_state::reservation::ReservationBook;
use ptb_supervisor::{start_instance, ControlEndpoint, InstanceSpec, RunningInstance};
use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::dependency::DependencyEngine;
use crate::integrations::IntegrationManager;
use crate::result::{log_from_downstream, FullResult, LogLevel};
use crate::state::{StateManager, WaitResult};

/// A named breakpoint stage for `--interact`: the Controller pauses for an
/// operator keystroke before proceeding past that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractStage {
    Setup,
    Init,
    Experiment,
}

pub struct RunOptions {
    pub testbed_package_dir: PathBuf,
    pub state_dir: PathBuf,
    pub hypervisor_binary: String,
    pub disable_kvm: bool,
    pub skip_integration: bool,
    pub dont_store: bool,
    pub experiment_tag: String,
    pub interact: Option<InteractStage>,
    pub experiment_timeout_override: Option<Duration>,
}

pub struct RunOutcome {
    pub success: bool,
    pub result: FullResult,
}

async fn interact_pause(stage: InteractStage, requested: Option<InteractStage>) {
    if requested != Some(stage) {
        return;
    }
    tracing::info!(?stage, "paused for --interact; press ENTER to continue");
    let mut line = String::new();
    let _ = tokio::io::AsyncBufReadExt::read_line(
        &mut tokio::io::BufReader::new(tokio::io::stdin()),
        &mut line,
    )
    .await;
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("'{cidr}' is not a CIDR network"))?;
    let addr: Ipv4Addr = addr.parse().with_context(|| format!("parsing network address '{addr}'"))?;
    let prefix: u8 = prefix.parse().with_context(|| format!("parsing prefix length '{prefix}'"))?;
    Ok((u32::from(addr), prefix))
}

/// The `n`th host address within a CIDR network (0 = network address).
fn nth_host(cidr: &str, n: u32) -> Result<String> {
    let (base, _) = parse_cidr(cidr)?;
    Ok(Ipv4Addr::from(base + n).to_string())
}

fn prefix_len(cidr: &str) -> Result<u8> {
    Ok(parse_cidr(cidr)?.1)
}

/// One Instance with its bridge/TAP assignments and management address,
/// computed before anything is reserved or spawned.
struct InstancePlan<'a> {
    instance: &'a Instance,
    interfaces: Vec<InterfaceMapping>,
    mgmt_address: String,
    mgmt_prefix: u8,
    mgmt_gateway: String,
}

fn runner() -> &'static dyn CommandRunner {
    static RUNNER: SystemRunner = SystemRunner;
    &RUNNER
}

/// Run one full testbed execution end to end.
pub async fn run(config: TestbedConfig, opts: RunOptions) -> Result<RunOutcome> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = cancel_tx.send(true);
    });

    let result = Arc::new(Mutex::new(FullResult::new(&config)));
    let outcome = run_inner(&config, &opts, cancel_rx, Arc::clone(&result)).await;
    signal_task.abort();

    // Every task holding a clone of `result` is joined or aborted by the
    // time `run_inner` returns, so exactly one strong reference remains.
    let mut result = Arc::try_unwrap(result)
        .unwrap_or_else(|_| panic!("a controller task outlived run_inner and is still holding FullResult"))
        .into_inner();

    match outcome {
        Ok(success) => Ok(RunOutcome { success, result }),
        Err(err) => {
            result.controller_failed = true;
            result.append_controller_log(LogLevel::Error, err.to_string());
            Err(err)
        }
    }
}

async fn run_inner(
    config: &TestbedConfig,
    opts: &RunOptions,
    mut cancel_rx: watch::Receiver<bool>,
    result: Arc<Mutex<FullResult>>,
) -> Result<bool> {
    // Step 1: dependency-graph + resource-capacity validation. TestbedConfig
    // already enforced its own structural invariants at parse time.
    let dependency_engine = DependencyEngine::build(config).context("validating Application dependency graph")?;
    let experiment_runtime_estimate = dependency_engine.maximum_runtime();

    let pid = std::process::id();
    let uid = unsafe { libc::getuid() };
    let unique_run_name = ptb_state::run::unique_run_name(pid, uid);

    // Step 2: reserve CPU/memory/bridge/TAP names; write the reservation
    // atomically before anything is brought up.
    let mut reservation = ReservationBook::new(&opts.state_dir, &unique_run_name)?;

    let total_cores: u32 = config.instances.iter().map(|i| i.cores).sum();
    let total_memory: u64 = config.instances.iter().map(|i| i.memory_mb).sum();
    if !reservation.apply_resource_demand(total_cores, total_memory)? {
        bail!("requested {total_cores} cores / {total_memory} MiB exceeds host capacity");
    }

    let extra_network_names: Vec<&str> = config.networks.iter().map(|n| n.name.as_str()).collect();
    let bridge_names = reservation.generate_new_bridge_names(runner(), extra_network_names.len() + 1)?;
    let mgmt_bridge = bridge_names[0].clone();
    let mut network_bridges: HashMap<&str, String> = HashMap::new();
    for (name, bridge_name) in extra_network_names.iter().copied().zip(bridge_names.iter().skip(1)) {
        network_bridges.insert(name, bridge_name.clone());
    }

    let total_taps: usize = config.instances.iter().map(|i| 1 + i.networks.len()).sum();
    let mut tap_names = reservation.generate_new_tap_names(runner(), total_taps)?.into_iter();

    let run_dir = opts.state_dir.join(&unique_run_name);
    let mgmt_prefix = prefix_len(&config.settings.management_network)?;
    let mgmt_gateway = nth_host(&config.settings.management_network, 1)?;

    let mut plans = Vec::with_capacity(config.instances.len());
    for (idx, instance) in config.instances.iter().enumerate() {
        let base = mac_base(&unique_run_name, &instance.name);
        let mgmt_tap = tap_names.next().ok_or_else(|| anyhow::anyhow!("ran out of reserved TAP names"))?;
        let mut interfaces = vec![InterfaceMapping {
            index: 0,
            bridge: mgmt_bridge.clone(),
            tap: mgmt_tap,
            mac: mac_for_nic(&base, 0),
        }];
        for (nic_idx, net_name) in instance.networks.iter().enumerate() {
            let bridge_name = network_bridges
                .get(net_name.as_str())
                .ok_or_else(|| anyhow::anyhow!("Instance '{}' references unreserved network '{}'", instance.name, net_name))?
                .clone();
            let extra_tap = tap_names.next().ok_or_else(|| anyhow::anyhow!("ran out of reserved TAP names"))?;
            interfaces.push(InterfaceMapping {
                index: (nic_idx + 1) as u8,
                bridge: bridge_name,
                tap: extra_tap,
                mac: mac_for_nic(&base, (nic_idx + 1) as u8),
            });
        }

        plans.push(InstancePlan {
            instance,
            interfaces,
            mgmt_address: nth_host(&config.settings.management_network, 2 + idx as u32)?,
            mgmt_prefix,
            mgmt_gateway: mgmt_gateway.clone(),
        });
    }

    // Step 3: bring up the management bridge (with outbound NAT) and every
    // declared network's bridge, then every Instance's TAPs.
    let mut fabric = DismantleStack::new();
    bridge::ensure_bridge(runner(), &mut fabric, &mgmt_bridge)?;
    bridge::assign_address(runner(), &mut fabric, &mgmt_bridge, &format!("{mgmt_gateway}/{mgmt_prefix}"))?;
    nat::ensure_masquerade(runner(), &mut fabric, &config.settings.management_network, &mgmt_bridge)?;
    for bridge_name in network_bridges.values() {
        bridge::ensure_bridge(runner(), &mut fabric, bridge_name)?;
    }
    for plan in &plans {
        for iface in &plan.interfaces {
            tap::ensure_tap(runner(), &mut fabric, &iface.tap, &iface.bridge)?;
        }
    }

    let run_result = run_with_fabric(
        config,
        opts,
        &unique_run_name,
        &run_dir,
        plans,
        dependency_engine,
        experiment_runtime_estimate,
        &mut cancel_rx,
        Arc::clone(&result),
    )
    .await;

    if !fabric.dismantle(runner()) {
        tracing::warn!("one or more fabric teardown actions failed");
    }
    if let Err(err) = reservation.clear() {
        tracing::warn!(error = %err, "failed to clear resource reservation");
    }

    run_result
}

/// Aggregate Application completion (`apps_done`/`apps_failed`) across every
/// Instance, independent of the per-Instance lifecycle state machine.
struct ExperimentCompletion {
    done: Mutex<HashSet<String>>,
    any_failed: AtomicBool,
    notify: Notify,
}

impl ExperimentCompletion {
    fn new() -> Self {
        ExperimentCompletion { done: Mutex::new(HashSet::new()), any_failed: AtomicBool::new(false), notify: Notify::new() }
    }

    async fn mark(&self, instance: &str, failed: bool) {
        self.done.lock().await.insert(instance.to_string());
        if failed {
            self.any_failed.store(true, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
    }

    async fn wait(&self, state_manager: &StateManager, total: usize, timeout: Duration) -> WaitResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if state_manager.is_interrupted() {
                return WaitResult::Interrupted;
            }
            if state_manager.all_states().await.iter().any(|(_, s)| *s == InstanceLifecycleState::Failed) {
                return WaitResult::Failed;
            }
            if self.done.lock().await.len() >= total {
                return WaitResult::Ok;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return WaitResult::Timeout;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

/// Shared context handed to every per-Instance downstream dispatch task.
struct DispatchContext {
    state_manager: Arc<StateManager>,
    dependency_engine: Mutex<DependencyEngine>,
    result: Arc<Mutex<FullResult>>,
    completion: Arc<ExperimentCompletion>,
    upstream_tx: HashMap<String, mpsc::Sender<Upstream>>,
}

#[allow(clippy::too_many_arguments)]
async fn run_with_fabric(
    config: &TestbedConfig,
    opts: &RunOptions,
    unique_run_name: &str,
    run_dir: &Path,
    plans: Vec<InstancePlan<'_>>,
    dependency_engine: DependencyEngine,
    experiment_runtime_estimate: u64,
    cancel_rx: &mut watch::Receiver<bool>,
    result: Arc<Mutex<FullResult>>,
) -> Result<bool> {
    let instance_names: Vec<String> = plans.iter().map(|p| p.instance.name.clone()).collect();
    let state_manager = Arc::new(StateManager::new(instance_names.clone()));
    let completion = Arc::new(ExperimentCompletion::new());

    {
        let state_manager = Arc::clone(&state_manager);
        let mut cancel_rx = cancel_rx.clone();
        tokio::spawn(async move {
            if cancel_rx.changed().await.is_ok() && *cancel_rx.borrow() {
                state_manager.interrupt();
            }
        });
    }

    let integrations = Arc::new(IntegrationManager::build(config, &opts.testbed_package_dir)?);
    let startup_timeout = Duration::from_secs(config.settings.startup_init_timeout);

    // Step 4: spawn hypervisors; each Agent's own `started` report (relayed
    // by the downstream dispatch task below) is what actually advances the
    // state machine — the supervisor's accept() only proves the transport
    // connected.
    let mut running: HashMap<String, RunningInstance> = HashMap::new();
    let mut upstream_tx: HashMap<String, mpsc::Sender<Upstream>> = HashMap::new();
    let mut downstream_rxs: Vec<(String, mpsc::Receiver<Downstream>)> = Vec::new();

    for plan in &plans {
        let interchange_dir = run_dir.join(format!("{INTERCHANGE_DIR_PREFIX}{}", plan.instance.name));
        let control_endpoint = ControlEndpoint::UnixClient { path: interchange_dir.join(INSTANCE_MGMT_SOCKET) };
        let spec = InstanceSpec {
            unique_run_name,
            instance_name: &plan.instance.name,
            hostname: &plan.instance.name,
            cores: plan.instance.cores,
            memory_mb: plan.instance.memory_mb,
            nic_model: &plan.instance.nic_model,
            image: Path::new(&plan.instance.image),
            interfaces: &plan.interfaces,
            mgmt_address: &plan.mgmt_address,
            mgmt_prefix: plan.mgmt_prefix,
            mgmt_gateway: &plan.mgmt_gateway,
            interchange_dir: &interchange_dir,
            testbed_package_dir: &opts.testbed_package_dir,
            control_endpoint,
            hypervisor_binary: &opts.hypervisor_binary,
            disable_kvm: opts.disable_kvm,
        };

        let mut instance = start_instance(runner(), spec, startup_timeout).await?;
        state_manager.set_interchange_dir(&plan.instance.name, interchange_dir.clone()).await?;
        state_manager.set_mgmt_ip(&plan.instance.name, plan.mgmt_address.clone()).await?;

        upstream_tx.insert(plan.instance.name.clone(), instance.upstream_tx.clone());
        let (_, placeholder_rx) = mpsc::channel(1);
        let downstream_rx = std::mem::replace(&mut instance.downstream_rx, placeholder_rx);
        downstream_rxs.push((plan.instance.name.clone(), downstream_rx));
        running.insert(plan.instance.name.clone(), instance);
    }

    let ctx = Arc::new(DispatchContext {
        state_manager: Arc::clone(&state_manager),
        dependency_engine: Mutex::new(dependency_engine),
        result: Arc::clone(&result),
        completion: Arc::clone(&completion),
        upstream_tx,
    });

    let mut dispatch_tasks = Vec::new();
    for (name, downstream_rx) in downstream_rxs {
        dispatch_tasks.push(spawn_dispatch(name, downstream_rx, Arc::clone(&ctx)));
    }

    // Step 5: fire STARTUP Integrations (unless skipped).
    if !opts.skip_integration {
        integrations.run_stage(ptb_core::config::IntegrationStage::Startup).await?;
    }

    // Step 6: rendezvous on STARTED.
    rendezvous(&state_manager, InstanceLifecycleState::Started, startup_timeout, &result).await?;
    interact_pause(InteractStage::Setup, opts.interact).await;

    // Step 7: NETWORK Integrations.
    if !opts.skip_integration {
        integrations.run_stage(ptb_core::config::IntegrationStage::Network).await?;
    }

    // Step 8: initialize every Instance; rendezvous on INITIALIZED.
    for plan in &plans {
        let tx = ctx.upstream_tx.get(&plan.instance.name).expect("upstream sender registered");
        let message = Upstream {
            name: plan.instance.name.clone(),
            message: UpstreamMessage::Initialize {
                script: plan.instance.setup_script.clone(),
                environment: plan.instance.environment.clone(),
                snapshot_requested: false,
            },
        };
        tx.send(message).await.context("sending initialize")?;
    }
    rendezvous(&state_manager, InstanceLifecycleState::Initialized, startup_timeout, &result).await?;

    // Step 9: INIT Integrations.
    if !opts.skip_integration {
        integrations.run_stage(ptb_core::config::IntegrationStage::Init).await?;
    }
    interact_pause(InteractStage::Init, opts.interact).await;

    // Step 10: install_apps; rendezvous on APPS_INSTALLED.
    for plan in &plans {
        let tx = ctx.upstream_tx.get(&plan.instance.name).expect("upstream sender registered");
        let message = Upstream {
            name: plan.instance.name.clone(),
            message: UpstreamMessage::InstallApps { applications: plan.instance.applications.clone() },
        };
        tx.send(message).await.context("sending install_apps")?;
    }
    rendezvous(&state_manager, InstanceLifecycleState::AppsInstalled, startup_timeout, &result).await?;
    for name in &instance_names {
        state_manager.transition(name, InstanceLifecycleState::AppsReady).await?;
    }

    // Step 11: compute t0 a few seconds out, send run_apps.
    let t0 = chrono::Utc::now() + chrono::Duration::seconds(5);
    let tcurrent = chrono::Utc::now();
    for plan in &plans {
        let tx = ctx.upstream_tx.get(&plan.instance.name).expect("upstream sender registered");
        let message = Upstream {
            name: plan.instance.name.clone(),
            message: UpstreamMessage::RunApps { t0: t0.to_rfc3339(), tcurrent: tcurrent.to_rfc3339() },
        };
        tx.send(message).await.context("sending run_apps")?;
    }
    for name in &instance_names {
        state_manager.transition(name, InstanceLifecycleState::InExperiment).await?;
    }
    ctx.dependency_engine.lock().await.compile_dependency_list();
    interact_pause(InteractStage::Experiment, opts.interact).await;

    // Step 12: rendezvous on every Instance reporting aggregate Application
    // completion, bounded by whichever is larger of the explicit config
    // timeout and the dependency-engine estimate plus safety margin — an
    // operator-set timeout can only extend the deadline, never cut the
    // dependency engine's own estimate short. An explicit per-run override
    // still wins outright.
    let experiment_timeout = match opts.experiment_timeout_override {
        Some(explicit) => explicit,
        None => {
            let explicit_config_secs = config.settings.experiment_timeout.unwrap_or(0);
            Duration::from_secs(explicit_config_secs.max(experiment_runtime_estimate + 10))
        }
    };
    let completion_result = completion.wait(&state_manager, instance_names.len(), experiment_timeout).await;
    let testbed_succeeded = matches!(completion_result, WaitResult::Ok) && !completion.any_failed.load(Ordering::SeqCst);

    // Step 13: finish; rendezvous on FINISHED.
    for plan in &plans {
        let tx = ctx.upstream_tx.get(&plan.instance.name).expect("upstream sender registered");
        let message = Upstream {
            name: plan.instance.name.clone(),
            message: UpstreamMessage::Finish {
                preserve_files: plan.instance.preserve_files.clone(),
                do_preserve: !opts.dont_store,
            },
        };
        let _ = tx.send(message).await;
    }
    let shutdown_timeout = if state_manager.is_interrupted() { Duration::from_secs(5) } else { Duration::from_secs(30) };
    let _ = rendezvous(&state_manager, InstanceLifecycleState::Finished, shutdown_timeout, &result).await;

    // Step 14: integration stop; tear down hypervisors (network fabric and
    // reservation release happen in the caller once this returns).
    if !opts.skip_integration {
        if let Err(err) = integrations.shutdown().await {
            let mut result = result.lock().await;
            result.integration_failed = true;
            result.append_controller_log(LogLevel::Error, format!("Integration shutdown failed: {err}"));
        }
    }

    let graceful = if state_manager.is_interrupted() { Duration::from_secs(2) } else { Duration::from_secs(10) };
    for (name, instance) in running {
        if let Err(err) = instance.shutdown(graceful).await {
            let mut result = result.lock().await;
            let _ = result.append_instance_log(&name, LogLevel::Warning, format!("shutdown error: {err}"));
        }
    }
    for task in dispatch_tasks {
        task.abort();
    }

    result.lock().await.testbed_succeeded = testbed_succeeded;
    Ok(testbed_succeeded)
}

async fn rendezvous(
    state_manager: &StateManager,
    expected: InstanceLifecycleState,
    timeout: Duration,
    result: &Arc<Mutex<FullResult>>,
) -> Result<()> {
    match state_manager.wait_for_all(expected, timeout).await {
        WaitResult::Ok => Ok(()),
        WaitResult::Failed => {
            result.lock().await.controller_failed = true;
            bail!("an Instance reported FAILED while waiting for {expected}")
        }
        WaitResult::Timeout => {
            result.lock().await.controller_failed = true;
            bail!("timed out waiting for every Instance to reach {expected}")
        }
        WaitResult::Interrupted => bail!("run interrupted while waiting for {expected}"),
        WaitResult::Shutdown => bail!("shutdown requested while waiting for {expected}"),
    }
}

/// Derive the dependency-satisfying edge kind from a reported Application
/// execution state: starting satisfies `at = start` edges, finishing
/// satisfies `at = finish` edges. Failure satisfies neither — a dependent
/// with an `at = finish` edge on a failed predecessor is never started.
fn dependency_edge_for(state: AppExecutionState) -> Option<ptb_core::config::DependencyAt> {
    match state {
        AppExecutionState::ExecutionStarted => Some(ptb_core::config::DependencyAt::Start),
        AppExecutionState::ExecutionFinished => Some(ptb_core::config::DependencyAt::Finish),
        AppExecutionState::ExecutionFailed | AppExecutionState::NeverStarted => None,
    }
}

/// One Instance's downstream dispatch loop: applies state transitions,
/// folds log/status messages into the shared [`FullResult`], and drives the
/// dependency engine's deferred-start rendezvous.
fn spawn_dispatch(
    instance_name: String,
    mut downstream_rx: mpsc::Receiver<Downstream>,
    ctx: Arc<DispatchContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = downstream_rx.recv().await {
            if let Some((level, message)) = log_from_downstream(&envelope.message) {
                let mut result = ctx.result.lock().await;
                let _ = result.append_instance_log(&instance_name, level, message);
                continue;
            }

            match envelope.message {
                DownstreamMessage::Started => {
                    let _ = ctx.state_manager.transition(&instance_name, InstanceLifecycleState::Started).await;
                }
                DownstreamMessage::Initialized => {
                    let _ = ctx.state_manager.transition(&instance_name, InstanceLifecycleState::Initialized).await;
                }
                DownstreamMessage::AppsInstalled => {
                    let _ = ctx.state_manager.transition(&instance_name, InstanceLifecycleState::AppsInstalled).await;
                }
                DownstreamMessage::AppsDone => {
                    ctx.completion.mark(&instance_name, false).await;
                }
                DownstreamMessage::AppsFailed => {
                    ctx.completion.mark(&instance_name, true).await;
                }
                DownstreamMessage::AppsExtendedStatus { app_name, state } => {
                    ctx.result.lock().await.change_application_status(&instance_name, &app_name, state);
                    if let Some(at) = dependency_edge_for(state) {
                        let ready = ctx.dependency_engine.lock().await.satisfy(&instance_name, &app_name, at);
                        for (ready_instance, ready_app) in ready {
                            if let Some(tx) = ctx.upstream_tx.get(&ready_instance) {
                                let message = Upstream {
                                    name: ready_instance,
                                    message: UpstreamMessage::ApplicationStatus { app_name: ready_app, at },
                                };
                                let _ = tx.send(message).await;
                            }
                        }
                    }
                }
                DownstreamMessage::Finished => {
                    let _ = ctx.state_manager.transition(&instance_name, InstanceLifecycleState::Finished).await;
                }
                DownstreamMessage::Failed { reason } => {
                    tracing::error!(instance = %instance_name, %reason, "Instance reported failure");
                    ctx.result.lock().await.append_controller_log(LogLevel::Error, format!("{instance_name}: {reason}"));
                    let _ = ctx.state_manager.transition(&instance_name, InstanceLifecycleState::Failed).await;
                    ctx.completion.mark(&instance_name, true).await;
                }
                DownstreamMessage::DataPoint { measurement, tags, points } => {
                    let _ = ctx.result.lock().await.record_data_point(&instance_name, measurement, tags, points);
                }
                DownstreamMessage::CopiedFile { .. } => {}
                DownstreamMessage::MsgInfo { .. }
                | DownstreamMessage::MsgSuccess { .. }
                | DownstreamMessage::MsgWarning { .. }
                | DownstreamMessage::MsgError { .. }
                | DownstreamMessage::MsgDebug { .. } => unreachable!("handled by log_from_downstream above"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nth_host_computes_offset_address() {
        assert_eq!(nth_host("10.0.0.0/24", 1).unwrap(), "10.0.0.1");
        assert_eq!(nth_host("10.0.0.0/24", 2).unwrap(), "10.0.0.2");
    }

    #[test]
    fn test_prefix_len_parses_mask() {
        assert_eq!(prefix_len("192.168.1.0/28").unwrap(), 28);
    }

    #[test]
    fn test_parse_cidr_rejects_missing_slash() {
        assert!(parse_cidr("10.0.0.0").is_err());
    }
}
