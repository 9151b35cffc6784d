//! Bridge from a running Application to the Agent's reporting channel.
//!
//! Mirrors the shape of the Python `GenericApplicationInterface`/
//! `ApplicationInterface` (`log`/`data_point`/`preserve_file`), but
//! Applications here run as Tokio tasks inside the Agent process rather than
//! as separate processes dialing back over a UNIX socket, so the transport
//! is an in-process channel instead of a reconnecting `AF_UNIX` client.

use std::collections::HashMap;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Error,
    Debug,
    Warning,
}

/// Event sent upstream by a running Application. The Agent's dispatch loop
/// drains these and turns them into `DownstreamMessage::Msg*`/`DataPoint`
/// frames (or, for `Preserve`, folds the path into the Instance's
/// preserve-file set consulted at `finish`).
#[derive(Debug, Clone)]
pub enum AppEvent {
    Log {
        app: String,
        level: LogLevel,
        message: String,
    },
    Data {
        app: String,
        measurement: String,
        tags: HashMap<String, String>,
        points: serde_json::Value,
    },
    Preserve {
        app: String,
        path: String,
    },
}

/// Handed to a running Application. Every call is fire-and-forget onto the
/// Agent's event channel.
#[derive(Clone)]
pub struct AppInterface {
    app_name: String,
    tx: mpsc::Sender<AppEvent>,
}

impl AppInterface {
    pub fn new(app_name: impl Into<String>, tx: mpsc::Sender<AppEvent>) -> Self {
        Self {
            app_name: app_name.into(),
            tx,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> anyhow::Result<()> {
        self.tx
            .send(AppEvent::Log {
                app: self.app_name.clone(),
                level,
                message: message.into(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("agent event channel closed"))
    }

    /// Pushes a data point. `tags["application"]` is always set to this
    /// Application's name, mirroring `ApplicationInterface.data_point`'s
    /// auto-injection (the daemon there further adds `tags.instance`).
    pub async fn data_point(
        &self,
        measurement: impl Into<String>,
        points: serde_json::Value,
        mut tags: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        tags.insert("application".to_string(), self.app_name.clone());
        self.tx
            .send(AppEvent::Data {
                app: self.app_name.clone(),
                measurement: measurement.into(),
                tags,
                points,
            })
            .await
            .map_err(|_| anyhow::anyhow!("agent event channel closed"))
    }

    pub async fn preserve_file(&self, path: impl Into<String>) -> anyhow::Result<()> {
        self.tx
            .send(AppEvent::Preserve {
                app: self.app_name.clone(),
                path: path.into(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("agent event channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_point_injects_application_tag() {
        let (tx, mut rx) = mpsc::channel(4);
        let interface = AppInterface::new("pinger", tx);
        interface
            .data_point("ping", serde_json::json!({"rtt": 1.0}), HashMap::new())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            AppEvent::Data { tags, app, .. } => {
                assert_eq!(app, "pinger");
                assert_eq!(tags.get("application"), Some(&"pinger".to_string()));
            }
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn test_log_and_preserve_carry_app_name() {
        let (tx, mut rx) = mpsc::channel(4);
        let interface = AppInterface::new("monitor", tx);
        interface.log(LogLevel::Warning, "slow poll").await.unwrap();
        interface.preserve_file("/tmp/out.log").await.unwrap();

        match rx.recv().await.unwrap() {
            AppEvent::Log { app, level, message } => {
                assert_eq!(app, "monitor");
                assert_eq!(level, LogLevel::Warning);
                assert_eq!(message, "slow poll");
            }
            _ => panic!("wrong event"),
        }
        match rx.recv().await.unwrap() {
            AppEvent::Preserve { app, path } => {
                assert_eq!(app, "monitor");
                assert_eq!(path, "/tmp/out.log");
            }
            _ => panic!("wrong event"),
        }
    }
}
