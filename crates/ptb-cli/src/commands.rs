//! `clap`-derived CLI surface and one executor function per subcommand,
//! mirroring `original_source/controller/executors/*.py`'s one-file-per-
//! command layout but collapsed into a single module the way the teacher's
//! `auser-mvm::main` keeps its whole `Cli`/`Commands` shape in one file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use colored::Colorize;

use ptb_core::config::{DEFAULT_STATE_DIR, TestbedConfig};
use ptb_core::naming::INTERCHANGE_DIR_PREFIX;
use ptb_fabric::interfaces;
use ptb_fabric::runner::SystemRunner;
use ptb_manager::{InteractStage, RunOptions};
use ptb_state::statefile::{PersistedInstanceState, is_process_running, scan};

use crate::output::{ListedInstance, ListedInterface, OutputFormat, render_instances};

#[derive(Parser)]
#[command(name = "ptb", version, about = "Networked testbed orchestrator")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Escalate privileges for network operations via sudo.
    #[arg(long, global = true)]
    pub sudo: bool,

    /// Experiment tag; auto-generated if omitted.
    #[arg(short = 'e', long = "tag", global = true)]
    pub tag: Option<String>,

    /// Metrics-sink configuration file (falls back to INFLUXDB_* env vars).
    #[arg(long, global = true)]
    pub influxdb: Option<PathBuf>,

    /// Shared state directory.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a testbed run
    #[command(visible_alias = "r")]
    Run(RunArgs),
    /// List running testbeds
    #[command(visible_alias = "ls")]
    List(ListArgs),
    /// Clean orphaned interchange dirs and interfaces
    #[command(visible_alias = "p")]
    Prune(PruneArgs),
    /// Clean results of a prior run
    #[command(visible_alias = "c")]
    Clean(CleanArgs),
    /// Export collected series
    #[command(visible_alias = "e")]
    Export(ExportArgs),
    /// Attach to an Instance's serial console
    #[command(visible_alias = "a")]
    Attach(AttachArgs),
    /// Generate shell completions
    Completions { shell: clap_complete::Shell },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum InteractOpt {
    Setup,
    Init,
    Experiment,
    Disable,
}

impl From<InteractOpt> for Option<InteractStage> {
    fn from(opt: InteractOpt) -> Self {
        match opt {
            InteractOpt::Setup => Some(InteractStage::Setup),
            InteractOpt::Init => Some(InteractStage::Init),
            InteractOpt::Experiment => Some(InteractStage::Experiment),
            InteractOpt::Disable => None,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the testbed package/configuration.
    pub testbed_config: PathBuf,

    /// Prune the state directory before starting.
    #[arg(long)]
    pub clean: bool,

    /// Pause before a given stage for manual inspection.
    #[arg(short = 'i', long, value_enum)]
    pub interact: Option<InteractOpt>,

    /// Disable hardware virtualization acceleration.
    #[arg(long)]
    pub no_kvm: bool,

    /// Skip running Integrations.
    #[arg(short = 's', long)]
    pub skip_integration: bool,

    /// Do not persist Application data points.
    #[arg(short = 'd', long)]
    pub dont_store: bool,

    /// Skip `{{NAME}}` environment placeholder substitution.
    #[arg(long)]
    pub skip_substitution: bool,

    /// Additional host paths to preserve after the run (repeatable).
    #[arg(short = 'p', long = "preserve")]
    pub preserve: Vec<PathBuf>,

    /// QEMU/hypervisor binary to invoke.
    #[arg(long, default_value = "qemu-system-x86_64")]
    pub hypervisor_binary: String,

    /// Directory holding the testbed package contents exported to Instances.
    #[arg(long)]
    pub testbed_package_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Show testbeds from all users.
    #[arg(short = 'a', long)]
    pub all: bool,

    #[arg(short = 'o', long, value_enum, default_value = "table")]
    pub output: OutputFormat,
}

#[derive(Args)]
pub struct PruneArgs {
    /// Also clean testbeds from different users.
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Also sweep dangling host interfaces not referenced by any live run.
    #[arg(short = 'i', long)]
    pub interfaces: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Also remove the persisted result dump, not just interchange state.
    #[arg(long)]
    pub result: bool,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Write the export to this path instead of stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct AttachArgs {
    /// Instance name to attach to.
    pub instance: String,

    /// Use SSH instead of the serial console, if available.
    #[arg(short = 's', long)]
    pub ssh: bool,
}

/// Parses arguments, initializes logging at the requested verbosity, and
/// dispatches to the matching executor. Returns the process exit code:
/// 0 on success, 1 when the run/command completed but reported a failure,
/// 2 for a usage or configuration error that prevented the command from
/// running at all.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Run(args) => run_run(&cli, args).await,
        Commands::List(args) => run_list(&cli, args),
        Commands::Prune(args) => run_prune(&cli, args),
        Commands::Clean(args) => run_clean(&cli, args),
        Commands::Export(args) => run_export(&cli, args),
        Commands::Attach(args) => run_attach(&cli, args),
        Commands::Completions { shell } => run_completions(*shell),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_completions(shell: clap_complete::Shell) -> Result<i32> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(0)
}

// ---- run ------------------------------------------------------------

async fn run_run(cli: &Cli, args: &RunArgs) -> Result<i32> {
    let state_dir = cli.effective_state_dir();
    if args.clean {
        let _ = ptb_state::prune::prune(&state_dir);
    }

    let config = match TestbedConfig::load(&args.testbed_config, args.skip_substitution) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load testbed configuration");
            return Ok(2);
        }
    };

    if let Some(path) = &cli.influxdb {
        if let Err(err) = ptb_core::config::MetricsSinkConfig::from_path(path) {
            tracing::error!(error = %err, "failed to load metrics sink configuration");
            return Ok(2);
        }
    }

    let experiment_tag = cli.tag.clone().unwrap_or_else(ptb_state::run::generate_experiment_tag);
    let testbed_package_dir = args
        .testbed_config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| args.testbed_package_dir.clone().unwrap_or_default());

    let opts = RunOptions {
        testbed_package_dir,
        state_dir: state_dir.clone(),
        hypervisor_binary: args.hypervisor_binary.clone(),
        disable_kvm: args.no_kvm,
        skip_integration: args.skip_integration,
        dont_store: args.dont_store,
        experiment_tag: experiment_tag.clone(),
        interact: args.interact.map(Into::into).unwrap_or(None),
        experiment_timeout_override: None,
    };

    let outcome = match ptb_manager::run(config, opts).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "controller failed to run testbed");
            return Ok(2);
        }
    };

    let dump_dir = state_dir.join(format!("results-{experiment_tag}"));
    std::fs::create_dir_all(&dump_dir)
        .with_context(|| format!("creating result directory {}", dump_dir.display()))?;
    let dump_path = dump_dir.join("result.txt");
    let dump_file = std::fs::File::create(&dump_path)
        .with_context(|| format!("creating result dump {}", dump_path.display()))?;
    outcome.result.dump_state(dump_file).context("writing result dump")?;

    if outcome.success {
        println!("{} Experiment '{experiment_tag}' finished, results in {}", "[SUCCESS]".green(), dump_path.display());
        Ok(0)
    } else {
        println!("{} Experiment '{experiment_tag}' finished with failures, results in {}", "[WARNING]".yellow(), dump_path.display());
        Ok(1)
    }
}

// ---- list -------------------------------------------------------------

/// `<state_dir>/<pid>-<uid>/` run directories, parsed for their owning uid.
fn discover_run_dirs(state_dir: &Path) -> Result<Vec<(PathBuf, u32)>> {
    let mut dirs = Vec::new();
    if !state_dir.is_dir() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(state_dir).with_context(|| format!("reading {}", state_dir.display()))? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some((_, uid)) = name.rsplit_once('-') else {
            continue;
        };
        let Ok(uid) = uid.parse::<u32>() else {
            continue;
        };
        dirs.push((entry.path(), uid));
    }
    Ok(dirs)
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Resolves a uid to a username via `getpwuid`, falling back to the uid
/// itself when no passwd entry exists — mirrors `list_executor.py`'s
/// `pwd.getpwuid`/`KeyError` fallback.
fn username_for_uid(uid: u32) -> String {
    unsafe {
        let passwd = libc::getpwuid(uid);
        if passwd.is_null() {
            return uid.to_string();
        }
        let name = std::ffi::CStr::from_ptr((*passwd).pw_name);
        name.to_string_lossy().into_owned()
    }
}

fn collect_states(state_dir: &Path, all: bool) -> Result<Vec<(PersistedInstanceState, u32)>> {
    let uid = current_uid();
    let mut found = Vec::new();
    for (run_dir, owner_uid) in discover_run_dirs(state_dir)? {
        if !all && owner_uid != uid {
            continue;
        }
        for state in scan(&run_dir)? {
            found.push((state, owner_uid));
        }
    }
    Ok(found)
}

fn run_list(cli: &Cli, args: &ListArgs) -> Result<i32> {
    let state_dir = cli.effective_state_dir();
    let states = collect_states(&state_dir, args.all)?;
    let instances: Vec<ListedInstance> = states
        .into_iter()
        .map(|(state, owner_uid)| ListedInstance {
            name: state.name,
            uuid: state.uuid.to_string(),
            pid: state.pid,
            experiment: state.experiment,
            owner: username_for_uid(owner_uid),
            mgmt_ip: state.mgmt_ip,
            running: is_process_running(state.pid, &state.cmdline),
            interfaces: state
                .interfaces
                .into_iter()
                .map(|iface| ListedInterface { bridge: iface.bridge, tap: iface.tap, mac: iface.mac })
                .collect(),
        })
        .collect();

    println!("{}", render_instances(args.output, &instances));
    Ok(0)
}

// ---- prune --------------------------------------------------------------

fn run_prune(cli: &Cli, args: &PruneArgs) -> Result<i32> {
    let state_dir = cli.effective_state_dir();
    let mut removed_total = 0usize;
    for (run_dir, owner_uid) in discover_run_dirs(&state_dir)? {
        if !args.all && owner_uid != current_uid() {
            continue;
        }
        let removed = ptb_state::prune::prune(&run_dir)?;
        for dir in &removed {
            tracing::info!(dir, "deleted stale interchange dir");
        }
        removed_total += removed.len();
    }
    tracing::info!(count = removed_total, "orphaned testbeds deleted");

    if !args.interfaces {
        return Ok(0);
    }

    let known: HashSet<String> = collect_states(&state_dir, args.all)?
        .into_iter()
        .flat_map(|(state, _)| state.interfaces.into_iter().flat_map(|i| [i.bridge, i.tap]))
        .collect();

    let runner = SystemRunner;
    let mut swept = 0usize;
    for interface in interfaces::list_ptb_interfaces(&runner)? {
        if known.contains(&interface) {
            continue;
        }
        if interfaces::delete_interface(&runner, &interface)? {
            tracing::info!(interface, "deleted dangling interface");
            swept += 1;
        }
    }
    tracing::info!(count = swept, "dangling interfaces deleted");
    Ok(0)
}

// ---- clean --------------------------------------------------------------

fn run_clean(cli: &Cli, args: &CleanArgs) -> Result<i32> {
    let Some(tag) = &cli.tag else {
        bail!("`clean` requires -e/--tag to identify which run to clean");
    };
    let state_dir = cli.effective_state_dir();

    let mut removed_anything = false;
    for (run_dir, owner_uid) in discover_run_dirs(&state_dir)? {
        if owner_uid != current_uid() {
            continue;
        }
        for entry in std::fs::read_dir(&run_dir).with_context(|| format!("reading {}", run_dir.display()))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(INTERCHANGE_DIR_PREFIX) {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path().join(ptb_core::config::MACHINE_STATE_FILE)) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<PersistedInstanceState>(&raw) else {
                continue;
            };
            if &state.experiment != tag {
                continue;
            }
            if is_process_running(state.pid, &state.cmdline) {
                bail!("experiment '{tag}' is still running (Instance '{}')", state.name);
            }
            std::fs::remove_dir_all(entry.path())
                .with_context(|| format!("removing {}", entry.path().display()))?;
            removed_anything = true;
        }
    }

    if args.result {
        let dump_dir = state_dir.join(format!("results-{tag}"));
        if dump_dir.is_dir() {
            std::fs::remove_dir_all(&dump_dir).with_context(|| format!("removing {}", dump_dir.display()))?;
            removed_anything = true;
        }
    }

    if removed_anything {
        println!("Cleaned experiment '{tag}'.");
    } else {
        println!("Nothing to clean for experiment '{tag}'.");
    }
    Ok(0)
}

// ---- export ---------------------------------------------------------------

fn run_export(cli: &Cli, args: &ExportArgs) -> Result<i32> {
    let Some(tag) = &cli.tag else {
        bail!("`export` requires -e/--tag to identify which run to export");
    };

    let state_dir = cli.effective_state_dir();
    let dump_path = state_dir.join(format!("results-{tag}")).join("result.txt");
    let contents = std::fs::read_to_string(&dump_path)
        .with_context(|| format!("reading result dump {} (the experiment may not have finished yet)", dump_path.display()))?;

    match &args.out {
        Some(path) => {
            std::fs::write(path, &contents).with_context(|| format!("writing export to {}", path.display()))?;
        }
        None => print!("{contents}"),
    }
    Ok(0)
}

// ---- attach ---------------------------------------------------------------

fn run_attach(cli: &Cli, args: &AttachArgs) -> Result<i32> {
    let state_dir = cli.effective_state_dir();
    for (run_dir, owner_uid) in discover_run_dirs(&state_dir)? {
        if owner_uid != current_uid() {
            continue;
        }
        let interchange_dir = run_dir.join(format!("{INTERCHANGE_DIR_PREFIX}{}", args.instance));
        let tty_socket = interchange_dir.join(ptb_core::config::INSTANCE_TTY_SOCKET);
        if !tty_socket.exists() {
            continue;
        }
        if args.ssh {
            tracing::warn!("SSH attach was requested but only the serial console is implemented; falling back");
        }
        return replace_process("socat", &["-,raw,echo=0", &format!("UNIX-CONNECT:{}", tty_socket.display())]);
    }
    bail!("no running Instance named '{}' found under {}", args.instance, state_dir.display())
}

/// Replaces the current process with an interactive console client.
/// `exec()` only returns on error.
#[cfg(unix)]
fn replace_process(cmd: &str, args: &[&str]) -> Result<i32> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(cmd).args(args).exec();
    Err(err).with_context(|| format!("failed to exec: {cmd} {}", args.join(" ")))
}
