//! Result Aggregator: the per-run record of every log line, Application and
//! Instance status, and the checkpoint accounting described in §4.11.
//! Mirrors the Python `FullResultWrapper`/`LogEntry`/`*StatusReport` classes.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use ptb_core::config::{Application, Instance, TestbedConfig};
use ptb_core::instance::InstanceLifecycleState;
use ptb_core::protocol::{AppExecutionState, DownstreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Info => "[INFO]",
            LogLevel::Success => "[SUCCESS]",
            LogLevel::Warning => "[WARNING]",
            LogLevel::Error => "[ERROR]",
        }
    }
}

/// Map one of the Agent's `msg_*` downstream variants to a log line, if the
/// message is in fact a log message.
pub fn log_from_downstream(message: &DownstreamMessage) -> Option<(LogLevel, String)> {
    match message {
        DownstreamMessage::MsgDebug { message } => Some((LogLevel::Debug, message.clone())),
        DownstreamMessage::MsgInfo { message } => Some((LogLevel::Info, message.clone())),
        DownstreamMessage::MsgSuccess { message } => Some((LogLevel::Success, message.clone())),
        DownstreamMessage::MsgWarning { message } => Some((LogLevel::Warning, message.clone())),
        DownstreamMessage::MsgError { message } => Some((LogLevel::Error, message.clone())),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub after_snapshot: bool,
}

/// One `data_point` report (§4.10's local daemon `data{measurement, tags,
/// points}` command, relayed upstream). The wire envelope carries no
/// Application identity of its own, so series are kept per-Instance rather
/// than per-Application; a reporting Application is expected to put its own
/// name in `tags` if it needs to be told apart from others on the same
/// Instance, exactly as the Python collectors tag their own measurements.
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub time: DateTime<Utc>,
    pub measurement: String,
    pub tags: HashMap<String, String>,
    pub points: serde_json::Value,
    pub after_snapshot: bool,
}

#[derive(Debug, Clone)]
pub struct ApplicationStatusReport {
    pub config: Application,
    pub status: AppExecutionState,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct InstanceStatusReport {
    pub config: Instance,
    pub logs: Vec<LogEntry>,
    pub status: InstanceLifecycleState,
    /// (preservation target directory, number of files preserved)
    pub preserve: Option<(String, usize)>,
    pub data_series: Vec<DataPoint>,
}

/// The status of one full testbed run, checkpoint-aware per §4.11.
pub struct FullResult {
    application_status: HashMap<(String, String), ApplicationStatusReport>,
    instance_status: HashMap<String, InstanceStatusReport>,
    controller_log: Vec<LogEntry>,
    after_snapshot: bool,

    pub controller_failed: bool,
    pub integration_failed: bool,
    pub configuration_failed: bool,
    pub testbed_succeeded: bool,
    pub experiment_tag: Option<String>,
}

impl FullResult {
    pub fn new(config: &TestbedConfig) -> Self {
        let mut instance_status = HashMap::new();
        let mut application_status = HashMap::new();
        for instance in &config.instances {
            instance_status.insert(
                instance.name.clone(),
                InstanceStatusReport {
                    config: instance.clone(),
                    logs: Vec::new(),
                    status: InstanceLifecycleState::Unknown,
                    preserve: None,
                    data_series: Vec::new(),
                },
            );
            for app in &instance.applications {
                application_status.insert(
                    (instance.name.clone(), app.name.clone()),
                    ApplicationStatusReport {
                        config: app.clone(),
                        status: AppExecutionState::NeverStarted,
                        logs: Vec::new(),
                    },
                );
            }
        }

        FullResult {
            application_status,
            instance_status,
            controller_log: Vec::new(),
            after_snapshot: false,
            controller_failed: false,
            integration_failed: false,
            configuration_failed: false,
            testbed_succeeded: false,
            experiment_tag: None,
        }
    }

    /// §4.11: declare a checkpoint. Resets per-Application records for the
    /// new run, drops any log entry marked `after_snapshot` from the prior
    /// run, and retains everything before the checkpoint for context.
    pub fn checkpoint(&mut self, config: &TestbedConfig, experiment_tag: String) {
        self.after_snapshot = true;
        self.experiment_tag = Some(experiment_tag);
        self.controller_failed = false;
        self.integration_failed = false;
        self.configuration_failed = false;
        self.testbed_succeeded = false;

        self.application_status.clear();
        for instance in &config.instances {
            for app in &instance.applications {
                self.application_status.insert(
                    (instance.name.clone(), app.name.clone()),
                    ApplicationStatusReport {
                        config: app.clone(),
                        status: AppExecutionState::NeverStarted,
                        logs: Vec::new(),
                    },
                );
            }
        }

        for report in self.instance_status.values_mut() {
            report.logs.retain(|l| !l.after_snapshot);
            report.data_series.retain(|d| !d.after_snapshot);
            report.preserve = None;
            report.status = InstanceLifecycleState::Unknown;
        }
        self.controller_log.retain(|l| !l.after_snapshot);
    }

    pub fn append_application_log(&mut self, instance: &str, application: &str, level: LogLevel, message: String) -> anyhow::Result<()> {
        let entry = self
            .application_status
            .get_mut(&(instance.to_string(), application.to_string()))
            .ok_or_else(|| anyhow::anyhow!("unknown application {application}@{instance}"))?;
        entry.logs.push(LogEntry { time: Utc::now(), level, message, after_snapshot: self.after_snapshot });
        Ok(())
    }

    pub fn append_instance_log(&mut self, instance: &str, level: LogLevel, message: String) -> anyhow::Result<()> {
        let entry = self
            .instance_status
            .get_mut(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        entry.logs.push(LogEntry { time: Utc::now(), level, message, after_snapshot: self.after_snapshot });
        Ok(())
    }

    pub fn append_controller_log(&mut self, level: LogLevel, message: String) {
        self.controller_log.push(LogEntry { time: Utc::now(), level, message, after_snapshot: self.after_snapshot });
    }

    pub fn change_application_status(&mut self, instance: &str, application: &str, status: AppExecutionState) -> bool {
        match self.application_status.get_mut(&(instance.to_string(), application.to_string())) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn change_instance_status(&mut self, instance: &str, status: InstanceLifecycleState) -> bool {
        match self.instance_status.get_mut(instance) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn add_instance_preserved_files(&mut self, instance: &str, target: String, amount: usize) -> bool {
        match self.instance_status.get_mut(instance) {
            Some(entry) => {
                entry.preserve = Some((target, amount));
                true
            }
            None => false,
        }
    }

    pub fn record_data_point(
        &mut self,
        instance: &str,
        measurement: String,
        tags: HashMap<String, String>,
        points: serde_json::Value,
    ) -> anyhow::Result<()> {
        let after_snapshot = self.after_snapshot;
        let report = self
            .instance_status
            .get_mut(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        report.data_series.push(DataPoint { time: Utc::now(), measurement, tags, points, after_snapshot });
        Ok(())
    }

    pub fn data_series(&self, instance: &str) -> anyhow::Result<&[DataPoint]> {
        let report = self
            .instance_status
            .get(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        Ok(&report.data_series)
    }

    fn sorted(mut entries: Vec<LogEntry>) -> Vec<LogEntry> {
        entries.sort_by_key(|e| e.time);
        entries
    }

    pub fn instance_logs(&self, instance: &str, min_level: LogLevel) -> anyhow::Result<Vec<LogEntry>> {
        let report = self
            .instance_status
            .get(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        let filtered = report.logs.iter().filter(|l| l.level >= min_level).cloned().collect();
        Ok(Self::sorted(filtered))
    }

    pub fn application_logs(&self, instance: &str, application: &str, min_level: LogLevel) -> anyhow::Result<Vec<LogEntry>> {
        let report = self
            .application_status
            .get(&(instance.to_string(), application.to_string()))
            .ok_or_else(|| anyhow::anyhow!("unknown application {application}@{instance}"))?;
        let filtered = report.logs.iter().filter(|l| l.level >= min_level).cloned().collect();
        Ok(Self::sorted(filtered))
    }

    pub fn controller_logs(&self, min_level: LogLevel) -> Vec<LogEntry> {
        let filtered = self.controller_log.iter().filter(|l| l.level >= min_level).cloned().collect();
        Self::sorted(filtered)
    }

    pub fn combined_logs(&self, instance: &str, application: &str, min_level: LogLevel) -> anyhow::Result<Vec<LogEntry>> {
        let mut combined = self.instance_logs(instance, min_level)?;
        combined.extend(self.application_logs(instance, application, min_level)?);
        combined.sort_by_key(|e| e.time);
        Ok(combined)
    }

    /// Human-readable dump, e.g. for `ptb export`.
    pub fn dump_state<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(
            out,
            "### BEGIN Experiment: {:?}, success={}",
            self.experiment_tag, self.testbed_succeeded
        )?;
        writeln!(out, "Controller failed: {}", self.controller_failed)?;
        writeln!(out, "Integration failed: {}", self.integration_failed)?;
        writeln!(out, "Configuration failed: {}\n", self.configuration_failed)?;

        writeln!(out, "APPLICATIONS\n")?;
        for ((instance, app), report) in &self.application_status {
            writeln!(out, "----- {app}@{instance}: {:?}", report.status)?;
            for log in &report.logs {
                writeln!(out, "{} {} {} {}", log.time.to_rfc3339(), log.level.prefix(), log.message, if log.after_snapshot { "(X)" } else { "" })?;
            }
        }

        writeln!(out, "\nINSTANCES\n")?;
        for (name, report) in &self.instance_status {
            writeln!(out, "----- {name}: {:?}", report.status)?;
            if let Some((target, amount)) = &report.preserve {
                writeln!(out, "Preserved {amount} files to {target}")?;
            }
            for log in &report.logs {
                writeln!(out, "{} {} {} {}", log.time.to_rfc3339(), log.level.prefix(), log.message, if log.after_snapshot { "(X)" } else { "" })?;
            }
            for point in &report.data_series {
                writeln!(out, "{} data {} {:?} {}", point.time.to_rfc3339(), point.measurement, point.tags, point.points)?;
            }
        }

        writeln!(out, "\nCONTROLLER LOG\n")?;
        for log in &self.controller_log {
            writeln!(out, "{} {} {}", log.time.to_rfc3339(), log.level.prefix(), log.message)?;
        }
        writeln!(out, "### END Experiment: {:?}, success={}", self.experiment_tag, self.testbed_succeeded)
    }
}
