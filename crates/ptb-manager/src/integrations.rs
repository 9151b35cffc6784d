//! §4.8: Integrations. Two invocation modes — `await` (one script,
//! fire-and-join) and `start_stop` (one script at invocation, one at
//! teardown) — grouped by invocation stage and run with the
//! synchronous-blocking / launch-then-poll shape the Python
//! `BaseIntegration` subclasses implement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ptb_core::config::{IntegrationMode, IntegrationStage, TestbedConfig};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Deserialize)]
struct AwaitSettings {
    start_script: String,
    #[serde(default)]
    start_delay: u64,
    wait_for_exit: u64,
}

#[derive(Debug, Deserialize)]
struct StartStopSettings {
    start_script: String,
    stop_script: String,
    /// `-1` marks this Integration blocking regardless of stage, mirroring
    /// the Python `start_delay == -1` convention.
    #[serde(default)]
    start_delay: i64,
    wait_for_exit: u64,
}

enum Kind {
    Await { start_script: PathBuf, start_delay: u64, wait_for_exit: Duration },
    StartStop { start_script: PathBuf, stop_script: PathBuf, start_delay: i64, wait_for_exit: Duration },
}

/// One configured Integration, checked and ready to invoke.
struct RunningIntegration {
    name: String,
    stage: IntegrationStage,
    wait_after_invoke: Duration,
    environment: HashMap<String, String>,
    kind: Kind,
}

fn check_script(base_path: &Path, rel: &str) -> Result<PathBuf> {
    let script = base_path.join(rel);
    if !script.exists() || !script.starts_with(base_path) {
        bail!("Integration script '{}' not found under {}", rel, base_path.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&script)?.permissions().mode();
        if mode & 0o111 == 0 {
            bail!("Integration script '{}' is not executable", script.display());
        }
    }
    Ok(script)
}

impl RunningIntegration {
    fn is_blocking(&self) -> bool {
        match &self.kind {
            Kind::Await { .. } => false,
            Kind::StartStop { start_delay, .. } => *start_delay == -1,
        }
    }

    async fn run_script(&self, script: &Path, timeout_dur: Duration) -> Result<()> {
        let mut command = Command::new("/bin/bash");
        command.arg(script);
        for (k, v) in &self.environment {
            command.env(k, v);
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning Integration script {}", script.display()))?;

        match timeout(timeout_dur, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => bail!(
                "Integration '{}' script {} failed: {}",
                self.name,
                script.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(err)) => bail!("Integration '{}' script {} errored: {err}", self.name, script.display()),
            Err(_) => bail!("Integration '{}' script {} timed out", self.name, script.display()),
        }
    }

    async fn start(&self) -> Result<()> {
        match &self.kind {
            Kind::Await { start_script, start_delay, wait_for_exit } => {
                if *start_delay > 0 {
                    tokio::time::sleep(Duration::from_secs(*start_delay)).await;
                }
                self.run_script(start_script, *wait_for_exit).await
            }
            Kind::StartStop { start_script, start_delay, wait_for_exit, .. } => {
                if *start_delay > 0 {
                    tokio::time::sleep(Duration::from_secs(*start_delay as u64)).await;
                }
                self.run_script(start_script, *wait_for_exit).await
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        match &self.kind {
            Kind::Await { .. } => Ok(()),
            Kind::StartStop { stop_script, wait_for_exit, .. } => self.run_script(stop_script, *wait_for_exit).await,
        }
    }
}

/// Drives every configured Integration through its invocation stages and
/// final teardown.
pub struct IntegrationManager {
    integrations: Vec<Arc<RunningIntegration>>,
}

impl IntegrationManager {
    pub fn build(config: &TestbedConfig, base_path: &Path) -> Result<Self> {
        let mut integrations = Vec::new();
        for integration in &config.integrations {
            let kind = match integration.mode {
                IntegrationMode::Await => {
                    let settings: AwaitSettings = serde_json::from_value(integration.settings.clone())
                        .with_context(|| format!("parsing await settings for Integration '{}'", integration.name))?;
                    Kind::Await {
                        start_script: check_script(base_path, &settings.start_script)?,
                        start_delay: settings.start_delay,
                        wait_for_exit: Duration::from_secs(settings.wait_for_exit),
                    }
                }
                IntegrationMode::StartStop => {
                    let settings: StartStopSettings = serde_json::from_value(integration.settings.clone())
                        .with_context(|| format!("parsing start_stop settings for Integration '{}'", integration.name))?;
                    Kind::StartStop {
                        start_script: check_script(base_path, &settings.start_script)?,
                        stop_script: check_script(base_path, &settings.stop_script)?,
                        start_delay: settings.start_delay,
                        wait_for_exit: Duration::from_secs(settings.wait_for_exit),
                    }
                }
            };

            integrations.push(Arc::new(RunningIntegration {
                name: integration.name.clone(),
                stage: integration.invocation_stage,
                wait_after_invoke: Duration::from_secs(integration.wait_after_invoke),
                environment: integration.environment.clone(),
                kind,
            }));
        }
        Ok(IntegrationManager { integrations })
    }

    /// Run every Integration declared for `stage`: blocking ones join
    /// in-line, non-blocking ones run concurrently; then sleep the stage's
    /// grace period and surface any reported error.
    pub async fn run_stage(&self, stage: IntegrationStage) -> Result<()> {
        let in_stage: Vec<&Arc<RunningIntegration>> =
            self.integrations.iter().filter(|i| i.stage == stage).collect();
        if in_stage.is_empty() {
            return Ok(());
        }

        for integration in in_stage.iter().filter(|i| i.is_blocking()) {
            integration.start().await?;
        }

        let mut handles = Vec::new();
        for integration in in_stage.iter().filter(|i| !i.is_blocking()) {
            let integration = Arc::clone(integration);
            handles.push(tokio::spawn(async move { integration.start().await }));
        }

        let grace = in_stage.iter().map(|i| i.wait_after_invoke).max().unwrap_or_default();
        tokio::time::sleep(grace).await;

        for handle in handles {
            handle.await.context("Integration task panicked")??;
        }
        Ok(())
    }

    /// Run every StartStop Integration's stop script, bounded by its own
    /// timeout; collects (rather than short-circuits on) the first error so
    /// every Integration gets a chance to tear down.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            if let Err(err) = integration.stop().await {
                tracing::warn!(integration = %integration.name, error = %err, "Integration stop failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn config_with_integration(settings_json: &str, mode: &str) -> TestbedConfig {
        let raw = format!(
            r#"{{
                "settings": {{"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"}},
                "networks": [],
                "integrations": [
                    {{"name": "t", "mode": "{mode}", "invocation_stage": "STARTUP",
                      "wait_after_invoke": 0, "settings": {settings_json}}}
                ],
                "instances": []
            }}"#
        );
        TestbedConfig::from_json(&raw, true).unwrap()
    }

    #[tokio::test]
    async fn test_await_integration_runs_and_joins() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "start.sh", "#!/bin/bash\nexit 0\n");
        let cfg = config_with_integration(r#"{"start_script": "start.sh", "start_delay": 0, "wait_for_exit": 5}"#, "await");
        let manager = IntegrationManager::build(&cfg, dir.path()).unwrap();
        manager.run_stage(IntegrationStage::Startup).await.unwrap();
    }

    #[tokio::test]
    async fn test_await_integration_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "start.sh", "#!/bin/bash\nexit 1\n");
        let cfg = config_with_integration(r#"{"start_script": "start.sh", "start_delay": 0, "wait_for_exit": 5}"#, "await");
        let manager = IntegrationManager::build(&cfg, dir.path()).unwrap();
        assert!(manager.run_stage(IntegrationStage::Startup).await.is_err());
    }

    #[tokio::test]
    async fn test_start_stop_shutdown_invokes_stop_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "start.sh", "#!/bin/bash\nexit 0\n");
        let marker = dir.path().join("stopped");
        write_script(
            dir.path(),
            "stop.sh",
            &format!("#!/bin/bash\ntouch {}\n", marker.display()),
        );
        let cfg = config_with_integration(
            r#"{"start_script": "start.sh", "stop_script": "stop.sh", "start_delay": 0, "wait_for_exit": 5}"#,
            "start_stop",
        );
        let manager = IntegrationManager::build(&cfg, dir.path()).unwrap();
        manager.run_stage(IntegrationStage::Startup).await.unwrap();
        manager.shutdown().await.unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn test_missing_script_rejected_at_build() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_with_integration(r#"{"start_script": "nope.sh", "start_delay": 0, "wait_for_exit": 5}"#, "await");
        assert!(IntegrationManager::build(&cfg, dir.path()).is_err());
    }
}
