//! Local UNIX-socket daemon, exposing the `log`/`data`/`preserve`/`status`
//! commands to any process inside the guest — chiefly a `run-program`
//! Application's target script, which has no in-process channel into the
//! Agent the way built-in Applications do.
//!
//! Grounded in `original_source/instance-manager/management_daemon.py`'s
//! `IMDaemonServer`/`IMClientThread`: a listener thread accepting connections,
//! one handler thread per client reading newline-delimited JSON requests and
//! writing a `{"status": "ok"|"error", ...}` response per request. Ported as
//! a listener task plus one Tokio task per accepted connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ptb_apps::LogLevel;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::events::AgentEvent;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "preserve")]
    Preserve { path: String },
    #[serde(rename = "log")]
    Log { level: String, message: String },
    #[serde(rename = "data")]
    Data { measurement: String, tags: HashMap<String, String>, points: serde_json::Value },
}

fn parse_level(raw: &str) -> Option<LogLevel> {
    match raw {
        "SUCCESS" => Some(LogLevel::Success),
        "INFO" => Some(LogLevel::Info),
        "WARNING" => Some(LogLevel::Warning),
        "ERROR" => Some(LogLevel::Error),
        "DEBUG" => Some(LogLevel::Debug),
        _ => None,
    }
}

/// Binds `socket_path` (unlinking any stale socket first) and serves
/// connections until the listener task is aborted, forwarding every
/// successfully-parsed request onto `events`. `app_name` tags events with a
/// fixed label since external callers have no Application identity of
/// their own — `"external"` mirrors the catch-all the Python daemon used for
/// non-Application clients.
pub async fn serve(socket_path: &Path, events: mpsc::Sender<AgentEvent>) -> Result<()> {
    let _ = tokio::fs::remove_file(socket_path).await;
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding local daemon socket {}", socket_path.display()))?;

    loop {
        let (stream, _addr) = listener.accept().await.context("accepting daemon client")?;
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, events).await {
                tracing::warn!(error = %err, "local daemon client errored");
            }
        });
    }
}

async fn handle_client(stream: UnixStream, events: mpsc::Sender<AgentEvent>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("reading daemon request line")? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                respond_over(&mut writer, false, Some(&format!("invalid request: {err}"))).await?;
                continue;
            }
        };

        match request {
            Request::Status => respond_over(&mut writer, true, None).await?,
            Request::Preserve { path } => {
                let _ = events.send(AgentEvent::Preserve { app: "external".to_string(), path }).await;
                respond_over(&mut writer, true, None).await?;
            }
            Request::Log { level, message } => match parse_level(&level) {
                Some(level) => {
                    let _ = events.send(AgentEvent::Log { app: "external".to_string(), level, message }).await;
                    respond_over(&mut writer, true, None).await?;
                }
                None => respond_over(&mut writer, false, Some(&format!("invalid log level '{level}'"))).await?,
            },
            Request::Data { measurement, mut tags, points } => {
                tags.entry("application".to_string()).or_insert_with(|| "external".to_string());
                let _ = events
                    .send(AgentEvent::Data { app: "external".to_string(), measurement, tags, points })
                    .await;
                respond_over(&mut writer, true, None).await?;
            }
        }
    }
    Ok(())
}

async fn respond_over(writer: &mut tokio::net::unix::OwnedWriteHalf, ok: bool, message: Option<&str>) -> Result<()> {
    let mut body = serde_json::json!({ "status": if ok { "ok" } else { "error" } });
    if let Some(message) = message {
        body["message"] = serde_json::Value::String(message.to_string());
    }
    let mut line = serde_json::to_vec(&body)?;
    line.push(b'\n');
    writer.write_all(&line).await.context("writing daemon response")
}

/// Default socket path under an Instance's exchange mount, used by test
/// helper scripts that want to report data without an env-var override.
pub fn default_socket_path(exchange_mount: &Path) -> PathBuf {
    exchange_mount.join("ptb-agent.sock")
}
