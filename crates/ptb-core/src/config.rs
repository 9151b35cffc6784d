use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::naming::validate_id;

pub const MACHINE_STATE_FILE: &str = "state.json";
pub const GLOBAL_LOCKFILE: &str = "p2t.filelock";
pub const RESERVATION_FILE: &str = "reservationmap.json";
pub const INSTANCE_MGMT_SOCKET: &str = "mgmt.sock";
pub const INSTANCE_TTY_SOCKET: &str = "tty.sock";
pub const INSTANCE_MOUNT_DIR: &str = "mount/";
pub const TESTBED_CONFIG_FILENAME: &str = "testbed.json";
pub const SUPPORTED_INSTANCE_NUMBER: usize = 50;
pub const SUPPORTED_EXTRA_NETWORKS_PER_INSTANCE: usize = 4;
pub const DEFAULT_STATE_DIR: &str = "/tmp/ptb/";

/// Where `{{NAME}}` placeholders are looked up when resolving a TestbedConfig.
fn placeholder_regex() -> Regex {
    Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap()
}

/// Substitute every `{{NAME}}` placeholder in `input` from the process
/// environment. An unresolved placeholder is an error unless `skip` is set,
/// in which case placeholders are left untouched.
pub fn substitute_env_placeholders(input: &str, skip: bool) -> Result<String> {
    if skip {
        return Ok(input.to_string());
    }
    let re = placeholder_regex();
    let mut err: Option<String> = None;
    let out = re.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                if err.is_none() {
                    err = Some(name.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    if let Some(name) = err {
        bail!("unresolved environment placeholder '{{{{{name}}}}}'");
    }
    Ok(out.into_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub management_network: String,
    pub diskimage_basepath: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_init_timeout: u64,
    #[serde(default)]
    pub experiment_timeout: Option<u64>,
}

fn default_startup_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub host_ports: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMode {
    Await,
    StartStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrationStage {
    Startup,
    Network,
    Init,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub name: String,
    pub mode: IntegrationMode,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub invocation_stage: IntegrationStage,
    #[serde(default)]
    pub wait_after_invoke: u64,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyAt {
    Start,
    Finish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub instance: String,
    pub application: String,
    pub at: DependencyAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(rename = "application")]
    pub app_type: String,
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub runtime: Option<u64>,
    #[serde(default)]
    pub dont_store: bool,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl Application {
    /// A daemon Application has no declared runtime.
    pub fn is_daemon(&self) -> bool {
        self.runtime.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_nic_model")]
    pub nic_model: String,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub preserve_files: Vec<String>,
}

fn default_cores() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    256
}

fn default_nic_model() -> String {
    "virtio-net-pci".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestbedConfig {
    pub settings: Settings,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub integrations: Vec<Integration>,
    pub instances: Vec<Instance>,
}

impl TestbedConfig {
    pub fn from_json(raw: &str, skip_substitution: bool) -> Result<Self> {
        let substituted = substitute_env_placeholders(raw, skip_substitution)?;
        let config: TestbedConfig =
            serde_json::from_str(&substituted).context("parsing testbed configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path, skip_substitution: bool) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading testbed config at {}", path.display()))?;
        Self::from_json(&raw, skip_substitution)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural invariants from the data model: unique names, every network
    /// reference resolved, every dependency target resolved, and the daemon/
    /// finish-dependency rule. The DAG reachability/cycle checks live in
    /// `ptb-manager::dependency` since they need the cross-Instance graph.
    pub fn validate(&self) -> Result<()> {
        if self.instances.len() > SUPPORTED_INSTANCE_NUMBER {
            bail!(
                "{} Instances exceeds the supported limit of {}",
                self.instances.len(),
                SUPPORTED_INSTANCE_NUMBER
            );
        }

        let network_names: std::collections::HashSet<&str> =
            self.networks.iter().map(|n| n.name.as_str()).collect();

        let mut instance_names = std::collections::HashSet::new();
        let mut app_index: std::collections::HashMap<(&str, &str), &Application> =
            std::collections::HashMap::new();

        for instance in &self.instances {
            validate_id(&instance.name, "Instance")?;
            if !instance_names.insert(instance.name.as_str()) {
                bail!("duplicate Instance name '{}'", instance.name);
            }
            if instance.networks.len() > SUPPORTED_EXTRA_NETWORKS_PER_INSTANCE {
                bail!(
                    "Instance '{}' has {} networks, exceeding the limit of {}",
                    instance.name,
                    instance.networks.len(),
                    SUPPORTED_EXTRA_NETWORKS_PER_INSTANCE
                );
            }
            for net in &instance.networks {
                if !network_names.contains(net.as_str()) {
                    bail!(
                        "Instance '{}' references unknown network '{}'",
                        instance.name,
                        net
                    );
                }
            }

            let mut app_names = std::collections::HashSet::new();
            for app in &instance.applications {
                validate_id(&app.name, "Application")?;
                if !app_names.insert(app.name.as_str()) {
                    bail!(
                        "duplicate Application name '{}' on Instance '{}'",
                        app.name,
                        instance.name
                    );
                }
                app_index.insert((instance.name.as_str(), app.name.as_str()), app);
            }
        }

        for instance in &self.instances {
            for app in &instance.applications {
                for dep in &app.dependencies {
                    let target = app_index.get(&(dep.instance.as_str(), dep.application.as_str()));
                    let target = target.ok_or_else(|| {
                        anyhow::anyhow!(
                            "Application '{}.{}' depends on unknown '{}.{}'",
                            instance.name,
                            app.name,
                            dep.instance,
                            dep.application
                        )
                    })?;
                    if dep.at == DependencyAt::Finish && target.is_daemon() {
                        bail!(
                            "Application '{}.{}' has an at=finish dependency on daemon '{}.{}'",
                            instance.name,
                            app.name,
                            dep.instance,
                            dep.application
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Metrics-sink (InfluxDB) configuration, read from a file or falling back
/// to the `INFLUXDB_{DATABASE,HOST,PORT,USER,PASSWORD}` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSinkConfig {
    pub database: String,
    pub host: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_influx_port() -> u16 {
    8086
}

impl MetricsSinkConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading metrics sink config at {}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn from_env() -> Result<Self> {
        Ok(MetricsSinkConfig {
            database: std::env::var("INFLUXDB_DATABASE")
                .context("INFLUXDB_DATABASE not set")?,
            host: std::env::var("INFLUXDB_HOST").context("INFLUXDB_HOST not set")?,
            port: std::env::var("INFLUXDB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_influx_port),
            user: std::env::var("INFLUXDB_USER").ok(),
            password: std::env::var("INFLUXDB_PASSWORD").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> &'static str {
        r#"{
            "settings": {
                "management_network": "10.0.0.0/24",
                "diskimage_basepath": "/var/lib/ptb/images"
            },
            "networks": [{"name": "lan"}],
            "instances": [
                {
                    "name": "alice",
                    "image": "base.img",
                    "networks": ["lan"],
                    "applications": [
                        {"application": "ping", "name": "ping1", "runtime": 10}
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let cfg = TestbedConfig::from_json(minimal_config_json(), true).unwrap();
        assert_eq!(cfg.instances.len(), 1);
        assert_eq!(cfg.instances[0].applications[0].app_type, "ping");
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let cfg = TestbedConfig::from_json(minimal_config_json(), true).unwrap();
        let json = cfg.to_json().unwrap();
        let cfg2 = TestbedConfig::from_json(&json, true).unwrap();
        assert_eq!(cfg.instances.len(), cfg2.instances.len());
        assert_eq!(cfg.instances[0].name, cfg2.instances[0].name);
    }

    #[test]
    fn test_duplicate_instance_name_rejected() {
        let raw = r#"{
            "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
            "networks": [],
            "instances": [
                {"name": "alice", "image": "a.img"},
                {"name": "alice", "image": "b.img"}
            ]
        }"#;
        assert!(TestbedConfig::from_json(raw, true).is_err());
    }

    #[test]
    fn test_unknown_network_rejected() {
        let raw = r#"{
            "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
            "networks": [],
            "instances": [
                {"name": "alice", "image": "a.img", "networks": ["ghost"]}
            ]
        }"#;
        assert!(TestbedConfig::from_json(raw, true).is_err());
    }

    #[test]
    fn test_finish_dependency_on_daemon_rejected() {
        let raw = r#"{
            "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
            "networks": [],
            "instances": [
                {
                    "name": "server",
                    "image": "a.img",
                    "applications": [
                        {"application": "iperf3-server", "name": "srv"}
                    ]
                },
                {
                    "name": "client",
                    "image": "a.img",
                    "applications": [
                        {
                            "application": "iperf3-client",
                            "name": "cli",
                            "runtime": 5,
                            "dependencies": [
                                {"instance": "server", "application": "srv", "at": "finish"}
                            ]
                        }
                    ]
                }
            ]
        }"#;
        assert!(TestbedConfig::from_json(raw, true).is_err());
    }

    #[test]
    fn test_missing_dependency_target_rejected() {
        let raw = r#"{
            "settings": {"management_network": "10.0.0.0/24", "diskimage_basepath": "/x"},
            "networks": [],
            "instances": [
                {
                    "name": "alice",
                    "image": "a.img",
                    "applications": [
                        {
                            "application": "run-program",
                            "name": "a1",
                            "runtime": 5,
                            "dependencies": [
                                {"instance": "ghost", "application": "app1", "at": "start"}
                            ]
                        }
                    ]
                }
            ]
        }"#;
        assert!(TestbedConfig::from_json(raw, true).is_err());
    }

    #[test]
    fn test_env_placeholder_substitution() {
        unsafe {
            std::env::set_var("PTB_TEST_VALUE", "substituted");
        }
        let out = substitute_env_placeholders("hello {{PTB_TEST_VALUE}}", false).unwrap();
        assert_eq!(out, "hello substituted");
    }

    #[test]
    fn test_unresolved_placeholder_fails_unless_skipped() {
        let res = substitute_env_placeholders("{{PTB_DOES_NOT_EXIST}}", false);
        assert!(res.is_err());
        let res = substitute_env_placeholders("{{PTB_DOES_NOT_EXIST}}", true).unwrap();
        assert_eq!(res, "{{PTB_DOES_NOT_EXIST}}");
    }
}
