//! Per-Application supervision: schedules each Application's start (either at
//! `t0 + delay` for a root, or on an `ApplicationStatus` trigger forwarded by
//! the Controller for a dependent), bounds it by `get_runtime_upper_bound`
//! plus a one-second grace period, and force-kills on overrun.
//!
//! Grounded in
//! `original_source/instance-manager/collector_controller.py`'s
//! `CollectorController.run()`: `Barrier.wait()` then `sleep(delay)` then
//! `process.join(upper_bound + 1)`, escalating to `SIGTERM`/`terminate()` on
//! overrun. Applications here are Tokio tasks rather than forked processes,
//! so the escalation collapses to aborting the task's `JoinHandle` — Tokio
//! gives no portable way to sub-signal a task tree the way `psutil` walks a
//! process tree, so abort is the full equivalent here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ptb_apps::AppInterface;
use ptb_core::config::Application as AppConfig;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;

use crate::events::AgentEvent;

/// A daemon Application (no declared runtime) is bounded by this instead, to
/// give `run()` something finite to time out against; the outer experiment
/// timeout on the Controller side is what actually bounds its lifetime.
const DAEMON_RUNTIME_BOUND_SECS: u64 = 7 * 24 * 3600;

/// One Application's terminal outcome, reported upstream as
/// `AppsExtendedStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Failed,
}

/// Shared sink for status transitions so the caller can drive the control
/// protocol without polling the JoinSet itself.
pub struct StatusSink {
    tx: mpsc::Sender<(String, Outcome, Option<bool>)>,
}

impl StatusSink {
    async fn started(&self, app: &str) {
        let _ = self.tx.send((app.to_string(), Outcome::Finished, Some(true))).await;
    }
    async fn finished(&self, app: &str, outcome: Outcome) {
        let _ = self.tx.send((app.to_string(), outcome, None)).await;
    }
}

pub struct Supervisor {
    triggers: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor { triggers: Arc::new(Mutex::new(HashMap::new())), tasks: JoinSet::new() }
    }

    /// Schedules every Application in `configs`. `loaded` must contain an
    /// entry (the validated `ptb_apps::Application` plus the matching
    /// `AppInterface`) for every name in `configs`.
    pub async fn schedule(
        &mut self,
        configs: &[AppConfig],
        loaded: HashMap<String, (ptb_apps::Application, AppInterface)>,
        testbed_package_dir: std::path::PathBuf,
        t0: DateTime<Utc>,
        status_tx: mpsc::Sender<(String, Outcome, Option<bool>)>,
        event_tx: mpsc::Sender<AgentEvent>,
    ) {
        // Every dependent's (sender, receiver) pair is created up front and
        // the sender registered before any task starts running, so a
        // Controller `ApplicationStatus` that arrives the instant `schedule`
        // returns can never race ahead of the app registering itself.
        let mut receivers: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        {
            let mut triggers = self.triggers.lock().await;
            for config in configs {
                if !config.dependencies.is_empty() {
                    let (tx, rx) = oneshot::channel();
                    triggers.insert(config.name.clone(), tx);
                    receivers.insert(config.name.clone(), rx);
                }
            }
        }

        for config in configs.iter().cloned() {
            let Some((app, interface)) = loaded.get(&config.name).cloned() else {
                continue;
            };
            let testbed_package_dir = testbed_package_dir.clone();
            let status_tx = status_tx.clone();
            let event_tx = event_tx.clone();
            let trigger_rx = receivers.remove(&config.name);

            self.tasks.spawn(async move {
                match trigger_rx {
                    None => {
                        let wait = (t0 - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(wait).await;
                    }
                    Some(rx) => {
                        let _ = rx.await;
                    }
                }
                tokio::time::sleep(Duration::from_secs(config.delay)).await;

                let sink = StatusSink { tx: status_tx.clone() };
                sink.started(&config.name).await;

                let runtime = config.runtime.unwrap_or(DAEMON_RUNTIME_BOUND_SECS);
                let bound = app.get_runtime_upper_bound(runtime) + 1;

                let result =
                    tokio::time::timeout(Duration::from_secs(bound), app.start(runtime, &testbed_package_dir, &interface))
                        .await;

                let outcome = match result {
                    Ok(Ok(true)) => Outcome::Finished,
                    Ok(Ok(false)) | Ok(Err(_)) => Outcome::Failed,
                    Err(_) => {
                        let _ = event_tx
                            .send(AgentEvent::Log {
                                app: config.name.clone(),
                                level: ptb_apps::LogLevel::Error,
                                message: format!("Application '{}' still runs after timeout", config.name),
                            })
                            .await;
                        Outcome::Failed
                    }
                };
                sink.finished(&config.name, outcome).await;
            });
        }
    }

    /// Forwards the Controller's notice that every incoming dependency edge
    /// for `app_name` is now satisfied.
    pub async fn trigger(&self, app_name: &str) {
        if let Some(tx) = self.triggers.lock().await.remove(app_name) {
            let _ = tx.send(());
        }
    }

    /// Waits for every scheduled Application to finish (used at the
    /// aggregate `apps_done`/`apps_failed` rendezvous).
    pub async fn join_all(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptb_core::config::Application as AppConfig;

    fn root_config(name: &str, runtime: u64) -> AppConfig {
        AppConfig {
            name: name.to_string(),
            app_type: "ping".to_string(),
            delay: 0,
            runtime: Some(runtime),
            dont_store: false,
            settings: serde_json::json!({"target": "127.0.0.1"}),
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn test_schedule_runs_root_and_reports_finish() {
        let config = root_config("ping1", 0);
        let app = ptb_apps::Application::load("ping", &config.settings).unwrap();
        let (app_event_tx, _app_event_rx) = mpsc::channel(8);
        let interface = AppInterface::new("ping1", app_event_tx);

        let mut loaded = HashMap::new();
        loaded.insert("ping1".to_string(), (app, interface));

        let (status_tx, mut status_rx) = mpsc::channel(8);
        let (event_tx, _event_rx) = mpsc::channel(8);

        let mut supervisor = Supervisor::new();
        supervisor
            .schedule(&[config], loaded, std::env::temp_dir(), Utc::now(), status_tx, event_tx)
            .await;

        let (name, _outcome, started) = status_rx.recv().await.unwrap();
        assert_eq!(name, "ping1");
        assert_eq!(started, Some(true));

        supervisor.join_all().await;
    }
}
