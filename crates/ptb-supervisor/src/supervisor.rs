//! §4.3: own the lifetime of a single Instance and its control stream.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ptb_core::instance::InterfaceMapping;
use ptb_core::naming::{mac_base, mac_for_nic};
use ptb_core::protocol::{Downstream, Upstream};
use ptb_fabric::runner::CommandRunner;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::ferry;
use crate::hypervisor::{self, HypervisorProcess, LaunchSpec, NicSpec};
use crate::seed::{self, SeedParams};
use crate::transport::ControlEndpoint;

/// Everything the supervisor needs to bring up one Instance, gathered from
/// the TestbedConfig and the reservation/fabric layers upstream of it.
pub struct InstanceSpec<'a> {
    pub unique_run_name: &'a str,
    pub instance_name: &'a str,
    pub hostname: &'a str,
    pub cores: u32,
    pub memory_mb: u64,
    pub nic_model: &'a str,
    pub image: &'a Path,
    pub interfaces: &'a [InterfaceMapping],
    pub mgmt_address: &'a str,
    pub mgmt_prefix: u8,
    pub mgmt_gateway: &'a str,
    pub interchange_dir: &'a Path,
    pub testbed_package_dir: &'a Path,
    pub control_endpoint: ControlEndpoint,
    pub hypervisor_binary: &'a str,
    pub disable_kvm: bool,
}

/// A running Instance: the hypervisor handle plus the ferry's channel pair.
pub struct RunningInstance {
    hypervisor: HypervisorProcess,
    pub downstream_rx: mpsc::Receiver<Downstream>,
    pub upstream_tx: mpsc::Sender<Upstream>,
    ferry_task: tokio::task::JoinHandle<Result<()>>,
}

/// Prepare the interchange directory with mode 0777 so the hypervisor,
/// which may run as another uid, can write to it.
fn prepare_interchange_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("creating interchange dir {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .with_context(|| format!("chmod 0777 {}", path.display()))?;
    }
    Ok(())
}

/// Bring up one Instance: prepare its interchange dir, render and pack its
/// cloud-init seed, spawn the hypervisor, and wait for the Agent to connect
/// over the control endpoint (bounded by `startup_timeout`).
#[instrument(skip_all, fields(instance = spec.instance_name))]
pub async fn start_instance(
    runner: &dyn CommandRunner,
    spec: InstanceSpec<'_>,
    startup_timeout: Duration,
) -> Result<RunningInstance> {
    prepare_interchange_dir(spec.interchange_dir)?;

    let mac_base_bytes = mac_base(spec.unique_run_name, spec.instance_name);
    let mgmt_mac = mac_for_nic(&mac_base_bytes, 0);

    let seed_params = SeedParams {
        instance_id: spec.instance_name,
        hostname: spec.hostname,
        mgmt_mac: &mgmt_mac,
        mgmt_address: spec.mgmt_address,
        mgmt_prefix: spec.mgmt_prefix,
        mgmt_gateway: spec.mgmt_gateway,
    };
    let seed_iso = seed::generate_seed(runner, spec.interchange_dir, &seed_params)?;

    let nics: Vec<NicSpec> = spec
        .interfaces
        .iter()
        .map(|iface| NicSpec { tap: &iface.tap, mac: &iface.mac })
        .collect();

    let control_socket = control_socket_path(&spec.control_endpoint, spec.interchange_dir);

    let launch_spec = LaunchSpec {
        cores: spec.cores,
        memory_mb: spec.memory_mb,
        nic_model: spec.nic_model,
        image: spec.image,
        seed_iso: &seed_iso,
        nics: &nics,
        exchange_dir: spec.interchange_dir,
        testbed_package_dir: spec.testbed_package_dir,
        control_socket: &control_socket,
        disable_kvm: spec.disable_kvm,
    };

    let process = hypervisor::launch(spec.hypervisor_binary, &launch_spec, startup_timeout).await?;

    tracing::info!("waiting for Agent to connect");
    let stream = spec.control_endpoint.accept(startup_timeout).await?;
    tracing::info!("Instance STARTED");

    let (down_tx, down_rx) = mpsc::channel(64);
    let (up_tx, up_rx) = mpsc::channel(64);
    let ferry_task = tokio::spawn(ferry::run(stream, down_tx, up_rx));

    Ok(RunningInstance {
        hypervisor: process,
        downstream_rx: down_rx,
        upstream_tx: up_tx,
        ferry_task,
    })
}

fn control_socket_path(endpoint: &ControlEndpoint, interchange_dir: &Path) -> PathBuf {
    match endpoint {
        ControlEndpoint::UnixClient { path } => path.clone(),
        ControlEndpoint::Vsock { .. } => interchange_dir.join(ptb_core::config::INSTANCE_MGMT_SOCKET),
    }
}

impl RunningInstance {
    /// Drive shutdown (§4.3 step 5): drop the upstream sender so the ferry
    /// exits cleanly, then ask the hypervisor monitor to power down within
    /// `graceful`, escalating to SIGKILL on overrun.
    pub async fn shutdown(self, graceful: Duration) -> Result<()> {
        drop(self.upstream_tx);
        let _ = self.ferry_task.await;
        self.hypervisor.shutdown(graceful).await
    }

    pub fn pid(&self) -> Option<u32> {
        self.hypervisor.pid()
    }
}
