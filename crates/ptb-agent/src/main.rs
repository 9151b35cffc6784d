use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser};
use ptb_agent::dispatch::{self, AgentConfig};
use ptb_agent::transport::AgentTransport;

#[derive(Parser)]
#[command(name = "ptb-agent", version, about = "In-guest testbed Agent")]
struct Cli {
    /// FQDN this Instance is known by to the Controller.
    #[arg(long)]
    instance_name: String,

    #[command(flatten)]
    transport: TransportArgs,

    /// Mount point for the read-write exchange 9p share.
    #[arg(long, default_value = "/mnt/exchange")]
    exchange_mount: PathBuf,

    /// Mount point for the read-only testbed-package 9p share.
    #[arg(long, default_value = "/mnt/tbp")]
    testbed_package_mount: PathBuf,

    /// UNIX socket the local log/data/preserve/status daemon listens on.
    #[arg(long)]
    daemon_socket: Option<PathBuf>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TransportArgs {
    /// Character device backed by the hypervisor's serial chardev.
    #[arg(long)]
    serial_device: Option<PathBuf>,

    /// AF_VSOCK port to connect out to the host (CID 2) on.
    #[arg(long)]
    vsock_port: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    let transport = match (cli.transport.serial_device, cli.transport.vsock_port) {
        (Some(path), _) => AgentTransport::SerialDevice { path },
        (None, Some(port)) => AgentTransport::Vsock { port },
        (None, None) => unreachable!("clap enforces exactly one transport flag"),
    };

    let daemon_socket = cli
        .daemon_socket
        .unwrap_or_else(|| ptb_agent::daemon::default_socket_path(&cli.exchange_mount));

    let config = AgentConfig {
        instance_name: cli.instance_name,
        transport,
        exchange_mount: cli.exchange_mount,
        testbed_package_mount: cli.testbed_package_mount,
        daemon_socket,
    };

    dispatch::run(config).await
}
