//! Application Loader: resolves an `app_type` string and its JSON `settings`
//! into one of the built-in Applications, grounded in
//! `original_source/applications/base_application.py`'s discovery contract
//! (`NAME`, `set_and_validate_config`, `get_runtime_upper_bound`, `start`).
//!
//! Unlike the Python original, which dynamically imports modules matching
//! `NAME` from a plugin directory, the built-in set here is a closed tagged
//! union — there is no out-of-tree Application loading in this port.

use std::path::Path;

use serde::Deserialize;

use crate::interface::AppInterface;
use crate::{iperf, ping, procmon, run_program};

#[derive(Debug, Clone)]
pub enum Application {
    Ping(ping::PingConfig),
    Iperf3Client(iperf::Iperf3ClientConfig),
    Iperf3Server(iperf::Iperf3ServerConfig),
    Procmon(procmon::ProcmonConfig),
    RunProgram(run_program::RunProgramConfig),
}

fn parse_settings<T: for<'de> Deserialize<'de>>(settings: &serde_json::Value) -> anyhow::Result<T> {
    serde_json::from_value(settings.clone()).map_err(|err| anyhow::anyhow!("config validation failed: {err}"))
}

impl Application {
    /// Matches an Application's `app_type` (the `applications[].application`
    /// field of the testbed config) to a built-in and validates its settings.
    pub fn load(app_type: &str, settings: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(match app_type {
            "ping" => Application::Ping(parse_settings(settings)?),
            "iperf3-client" => Application::Iperf3Client(parse_settings(settings)?),
            "iperf3-server" => Application::Iperf3Server(parse_settings(settings)?),
            "procmon" => Application::Procmon(parse_settings(settings)?),
            "run-program" => Application::RunProgram(parse_settings(settings)?),
            other => anyhow::bail!("unknown application type '{other}'"),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Application::Ping(_) => "ping",
            Application::Iperf3Client(_) => "iperf3-client",
            Application::Iperf3Server(_) => "iperf3-server",
            Application::Procmon(_) => "procmon",
            Application::RunProgram(_) => "run-program",
        }
    }

    /// Upper bound (in seconds) the Agent should wait before hard-killing
    /// this Application once `runtime` has elapsed.
    pub fn get_runtime_upper_bound(&self, runtime: u64) -> u64 {
        match self {
            Application::Ping(_) => runtime,
            Application::Iperf3Client(_) => iperf::client_runtime_upper_bound(runtime),
            Application::Iperf3Server(_) => runtime * 2,
            Application::Procmon(config) => runtime + 2 * config.interval,
            Application::RunProgram(_) => runtime,
        }
    }

    /// Pre-validates an Application before it's actually started. For
    /// `run-program`, this resolves and chmod's the target executable
    /// exactly as `set_and_validate_config` does, so a missing/non-executable
    /// script fails fast instead of at `start`.
    pub fn prepare(&self, testbed_package_dir: &Path) -> anyhow::Result<()> {
        if let Application::RunProgram(config) = self {
            run_program::resolve(config, testbed_package_dir)?;
        }
        Ok(())
    }

    pub async fn start(&self, runtime: u64, testbed_package_dir: &Path, interface: &AppInterface) -> anyhow::Result<bool> {
        match self {
            Application::Ping(config) => ping::run(config, runtime, interface).await,
            Application::Iperf3Client(config) => iperf::run_client(config, runtime, interface).await,
            Application::Iperf3Server(config) => iperf::run_server(config, interface).await,
            Application::Procmon(config) => procmon::run(config, runtime, interface).await,
            Application::RunProgram(config) => {
                let resolved = run_program::resolve(config, testbed_package_dir)?;
                run_program::run(config, &resolved, runtime, interface).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_unknown_application_fails() {
        let err = Application::load("does-not-exist", &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("unknown application type"));
    }

    #[test]
    fn test_load_ping_with_defaults() {
        let app = Application::load("ping", &serde_json::json!({"target": "10.0.0.1"})).unwrap();
        assert_eq!(app.name(), "ping");
        assert_eq!(app.get_runtime_upper_bound(60), 60);
    }

    #[test]
    fn test_load_ping_missing_target_fails() {
        assert!(Application::load("ping", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_iperf_client_runtime_upper_bound_via_loader() {
        let app = Application::load("iperf3-client", &serde_json::json!({"host": "10.0.0.2"})).unwrap();
        assert_eq!(app.get_runtime_upper_bound(100), 100 + 10 + 5);
    }

    #[test]
    fn test_iperf_server_runtime_upper_bound_via_loader() {
        let app = Application::load("iperf3-server", &serde_json::json!({})).unwrap();
        assert_eq!(app.get_runtime_upper_bound(30), 60);
    }

    #[test]
    fn test_procmon_runtime_upper_bound_via_loader() {
        let app = Application::load("procmon", &serde_json::json!({"interval": 5})).unwrap();
        assert_eq!(app.get_runtime_upper_bound(60), 70);
    }

    #[test]
    fn test_run_program_requires_command_field() {
        assert!(Application::load("run-program", &serde_json::json!({})).is_err());
    }
}
