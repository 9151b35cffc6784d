//! The Agent's control-stream state machine: connects upstream, then drives
//! `initialize` → `install_apps` → `run_apps` → (`copy`/`application_status`
//! as they arrive) → `finish` exactly as the Controller's `controller::run`
//! sequences them.
//!
//! Grounded in `original_source/instance-manager/manager_main.py`'s `main()`
//! dispatch loop and `management_client.py`'s reconnecting client, adapted to
//! a single long-lived control stream instead of a polling socket client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ptb_apps::{AppEvent, AppInterface, Application as LoadedApp};
use ptb_core::config::Application as AppConfig;
use ptb_core::protocol::{
    AppExecutionState, Downstream, DownstreamMessage, FrameDecoder, Upstream, UpstreamMessage,
};
use tokio::io::{split, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::apps::{Outcome, Supervisor};
use crate::events::AgentEvent;
use crate::transport::{AgentTransport, ControlStream};
use crate::{clock, daemon, marker, mounts, preserve::PreserveSet, setup};

/// Where an Instance's 9p shares land and how the control stream and local
/// daemon are reached, resolved once at startup from CLI arguments.
pub struct AgentConfig {
    pub instance_name: String,
    pub transport: AgentTransport,
    pub exchange_mount: PathBuf,
    pub testbed_package_mount: PathBuf,
    pub daemon_socket: PathBuf,
}

type Writer = Arc<Mutex<WriteHalf<ControlStream>>>;

/// Runs until the control stream closes or a `finish` is handled.
pub async fn run(cfg: AgentConfig) -> Result<()> {
    let stream = cfg.transport.connect().await?;
    let (mut reader, writer) = split(stream);
    let writer: Writer = Arc::new(Mutex::new(writer));

    send_downstream(&writer, &cfg.instance_name, DownstreamMessage::Started).await?;

    let preserve = Arc::new(Mutex::new(PreserveSet::new()));
    let supervisor = Arc::new(Mutex::new(Supervisor::new()));

    let (master_tx, mut master_rx) = mpsc::channel::<AgentEvent>(256);
    let (app_event_tx, mut app_event_rx) = mpsc::channel::<AppEvent>(256);

    // Built-in Applications speak `ptb_apps::AppEvent` over their own
    // channel; fold it into the same `AgentEvent` pipeline the local daemon
    // feeds from external processes.
    {
        let master_tx = master_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = app_event_rx.recv().await {
                let _ = master_tx.send(AgentEvent::from(event)).await;
            }
        });
    }

    {
        let socket_path = cfg.daemon_socket.clone();
        let daemon_tx = master_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = daemon::serve(&socket_path, daemon_tx).await {
                tracing::error!(error = %err, "local daemon exited");
            }
        });
    }

    {
        let writer = writer.clone();
        let preserve = preserve.clone();
        let instance_name = cfg.instance_name.clone();
        tokio::spawn(async move {
            while let Some(event) = master_rx.recv().await {
                if let Err(err) = drain_event(&writer, &instance_name, &preserve, event).await {
                    tracing::warn!(error = %err, "failed to forward Agent event downstream");
                }
            }
        });
    }

    let mut configs: Vec<AppConfig> = Vec::new();
    let mut loaded: HashMap<String, (LoadedApp, AppInterface)> = HashMap::new();
    let mut decoder = FrameDecoder::new();

    loop {
        let frame = match ptb_core::protocol::read_frame(&mut reader, &mut decoder).await? {
            Some(frame) => frame,
            None => break,
        };
        let envelope: Upstream = serde_json::from_slice(&frame).context("parsing upstream frame")?;

        match envelope.message {
            UpstreamMessage::Initialize { script, environment, snapshot_requested: _ } => {
                if let Err(err) = handle_initialize(&cfg, script, environment).await {
                    fail(&writer, &cfg.instance_name, err).await?;
                    continue;
                }
                send_downstream(&writer, &cfg.instance_name, DownstreamMessage::Initialized).await?;
            }

            UpstreamMessage::InstallApps { applications } => {
                match install_apps(&applications, &cfg.testbed_package_mount, app_event_tx.clone()) {
                    Ok(installed) => {
                        configs = applications;
                        loaded = installed;
                        send_downstream(&writer, &cfg.instance_name, DownstreamMessage::AppsInstalled).await?;
                    }
                    Err(err) => {
                        fail(&writer, &cfg.instance_name, err).await?;
                    }
                }
            }

            UpstreamMessage::RunApps { t0, tcurrent } => {
                let t0 = match clock::verify_and_parse(&t0, &tcurrent) {
                    Ok(t0) => t0,
                    Err(err) => {
                        fail(&writer, &cfg.instance_name, err).await?;
                        continue;
                    }
                };

                let configs = std::mem::take(&mut configs);
                let loaded = std::mem::take(&mut loaded);
                spawn_run(
                    supervisor.clone(),
                    writer.clone(),
                    master_tx.clone(),
                    cfg.instance_name.clone(),
                    cfg.testbed_package_mount.clone(),
                    configs,
                    loaded,
                    t0,
                );
            }

            UpstreamMessage::ApplicationStatus { app_name, at: _ } => {
                supervisor.lock().await.trigger(&app_name).await;
            }

            UpstreamMessage::Copy { source, target, proc_id, rename } => {
                let outcome = perform_copy(&source, &target, rename.as_deref()).await;
                match outcome {
                    Ok(()) => {
                        send_downstream(&writer, &cfg.instance_name, DownstreamMessage::CopiedFile { proc_id }).await?;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, source, target, "copy failed");
                        fail(&writer, &cfg.instance_name, err).await?;
                    }
                }
            }

            UpstreamMessage::Finish { preserve_files, do_preserve } => {
                {
                    let mut set = preserve.lock().await;
                    set.extend(preserve_files);
                    if do_preserve {
                        if let Err(err) = set.copy_into(&cfg.exchange_mount).await {
                            tracing::warn!(error = %err, "preserving files at finish failed");
                        }
                    }
                }
                supervisor.lock().await.abort_all();
                send_downstream(&writer, &cfg.instance_name, DownstreamMessage::Finished).await?;
                break;
            }

            UpstreamMessage::Null => {}
        }
    }

    Ok(())
}

async fn handle_initialize(
    cfg: &AgentConfig,
    script: Option<String>,
    environment: HashMap<String, String>,
) -> Result<()> {
    mounts::ensure_9p_mount("exchange", &cfg.exchange_mount, false).await?;
    mounts::ensure_9p_mount("tbp", &cfg.testbed_package_mount, true).await?;

    if !marker::is_present(&cfg.exchange_mount).await {
        if let Some(script) = script {
            setup::run_setup_script(&cfg.testbed_package_mount, &script, &environment).await?;
        }
        marker::write(&cfg.exchange_mount).await?;
    }
    Ok(())
}

fn install_apps(
    applications: &[AppConfig],
    testbed_package_dir: &std::path::Path,
    app_event_tx: mpsc::Sender<AppEvent>,
) -> Result<HashMap<String, (LoadedApp, AppInterface)>> {
    let mut installed = HashMap::new();
    for app in applications {
        let loaded = LoadedApp::load(&app.app_type, &app.settings)
            .with_context(|| format!("loading Application '{}'", app.name))?;
        loaded
            .prepare(testbed_package_dir)
            .with_context(|| format!("preparing Application '{}'", app.name))?;
        let interface = AppInterface::new(app.name.clone(), app_event_tx.clone());
        installed.insert(app.name.clone(), (loaded, interface));
    }
    Ok(installed)
}

/// Schedules every installed Application, reports each one's start/finish as
/// `AppsExtendedStatus`, and closes the loop with `AppsDone`/`AppsFailed` once
/// every Application has reached a terminal state. Runs detached from the
/// main dispatch loop so a Controller `application_status` notification
/// arriving mid-experiment is never blocked behind this rendezvous.
#[allow(clippy::too_many_arguments)]
fn spawn_run(
    supervisor: Arc<Mutex<Supervisor>>,
    writer: Writer,
    event_tx: mpsc::Sender<AgentEvent>,
    instance_name: String,
    testbed_package_dir: PathBuf,
    configs: Vec<AppConfig>,
    loaded: HashMap<String, (LoadedApp, AppInterface)>,
    t0: chrono::DateTime<chrono::Utc>,
) {
    tokio::spawn(async move {
        let total = configs.len();
        if total == 0 {
            let _ = send_downstream(&writer, &instance_name, DownstreamMessage::AppsDone).await;
            return;
        }

        let (status_tx, mut status_rx) = mpsc::channel(total.max(1) * 2);
        {
            let mut sup = supervisor.lock().await;
            sup.schedule(&configs, loaded, testbed_package_dir, t0, status_tx, event_tx).await;
        }

        let mut finished = 0usize;
        let mut any_failed = false;
        while let Some((app_name, outcome, started)) = status_rx.recv().await {
            let state = match started {
                Some(true) => AppExecutionState::ExecutionStarted,
                _ => {
                    finished += 1;
                    any_failed |= outcome == Outcome::Failed;
                    match outcome {
                        Outcome::Finished => AppExecutionState::ExecutionFinished,
                        Outcome::Failed => AppExecutionState::ExecutionFailed,
                    }
                }
            };
            let _ = send_downstream(
                &writer,
                &instance_name,
                DownstreamMessage::AppsExtendedStatus { app_name, state },
            )
            .await;
            if finished == total {
                break;
            }
        }

        supervisor.lock().await.join_all().await;
        let final_status = if any_failed { DownstreamMessage::AppsFailed } else { DownstreamMessage::AppsDone };
        let _ = send_downstream(&writer, &instance_name, final_status).await;
    });
}

async fn perform_copy(source: &str, target: &str, rename: Option<&str>) -> Result<()> {
    let source = std::path::Path::new(source);
    let destination = match rename {
        Some(name) => std::path::Path::new(target).join(name),
        None => std::path::Path::new(target).to_path_buf(),
    };
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.context("creating copy destination directory")?;
    }
    crate::preserve::copy_recursive(source, &destination).await
}

async fn drain_event(writer: &Writer, instance_name: &str, preserve: &Arc<Mutex<PreserveSet>>, event: AgentEvent) -> Result<()> {
    match event {
        AgentEvent::Preserve { path, .. } => {
            preserve.lock().await.add(path);
            Ok(())
        }
        AgentEvent::Log { level, message, .. } => {
            let message_variant = match level {
                ptb_apps::LogLevel::Info => DownstreamMessage::MsgInfo { message },
                ptb_apps::LogLevel::Success => DownstreamMessage::MsgSuccess { message },
                ptb_apps::LogLevel::Warning => DownstreamMessage::MsgWarning { message },
                ptb_apps::LogLevel::Error => DownstreamMessage::MsgError { message },
                ptb_apps::LogLevel::Debug => DownstreamMessage::MsgDebug { message },
            };
            send_downstream(writer, instance_name, message_variant).await
        }
        AgentEvent::Data { measurement, tags, points, .. } => {
            send_downstream(writer, instance_name, DownstreamMessage::DataPoint { measurement, tags, points }).await
        }
    }
}

async fn send_downstream(writer: &Writer, name: &str, message: DownstreamMessage) -> Result<()> {
    let envelope = Downstream { name: name.to_string(), message };
    let body = serde_json::to_vec(&envelope)?;
    let mut writer = writer.lock().await;
    ptb_core::protocol::write_frame(&mut *writer, &body).await
}

async fn fail(writer: &Writer, name: &str, err: anyhow::Error) -> Result<()> {
    tracing::error!(error = %err, "Agent reporting failure upstream");
    send_downstream(writer, name, DownstreamMessage::Failed { reason: format!("{err:#}") }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_config(name: &str) -> AppConfig {
        AppConfig {
            name: name.to_string(),
            app_type: "ping".to_string(),
            delay: 0,
            runtime: Some(5),
            dont_store: false,
            settings: serde_json::json!({"target": "127.0.0.1"}),
            dependencies: vec![],
        }
    }

    #[test]
    fn test_install_apps_loads_and_prepares() {
        let (tx, _rx) = mpsc::channel(8);
        let configs = vec![ping_config("ping1")];
        let installed = install_apps(&configs, &std::env::temp_dir(), tx).unwrap();
        assert!(installed.contains_key("ping1"));
    }

    #[test]
    fn test_install_apps_rejects_unknown_type() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = ping_config("bad1");
        config.app_type = "does-not-exist".to_string();
        let err = install_apps(&[config], &std::env::temp_dir(), tx).unwrap_err();
        assert!(err.to_string().contains("loading Application"));
    }

    #[tokio::test]
    async fn test_perform_copy_renames_into_target_dir() {
        let source_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let source_file = source_dir.path().join("result.log");
        tokio::fs::write(&source_file, b"payload").await.unwrap();

        perform_copy(
            source_file.to_str().unwrap(),
            dest_dir.path().to_str().unwrap(),
            Some("renamed.log"),
        )
        .await
        .unwrap();

        let copied = dest_dir.path().join("renamed.log");
        assert_eq!(tokio::fs::read(&copied).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_perform_copy_missing_source_fails() {
        let dest_dir = tempfile::tempdir().unwrap();
        let result = perform_copy("/does/not/exist", dest_dir.path().to_str().unwrap(), None).await;
        assert!(result.is_err());
    }
}
