//! `iperf3-client`/`iperf3-server` Applications and their shared iperf3
//! line-log parser, grounded in `original_source/applications/iperf_common.py`
//! and `iperf_{client,server}_application.py`.
//!
//! Written against iperf3 3.12's human-readable (non-JSON) line output.

use std::collections::HashMap;
use std::process::Stdio;

use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::interface::AppInterface;

const CONNECT_TIMEOUT_MULTIPLIER: f64 = 0.1;
const STATIC_DELAY_BEFORE_START: u64 = 5;

fn default_port() -> u32 {
    5201
}

fn default_report_interval() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Iperf3ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub reverse: Option<bool>,
    #[serde(default)]
    pub udp: Option<bool>,
    #[serde(default)]
    pub streams: Option<u32>,
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    #[serde(default)]
    pub bandwidth_kbps: Option<u64>,
    #[serde(default)]
    pub tcp_no_delay: Option<bool>,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Iperf3ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

pub fn client_runtime_upper_bound(runtime: u64) -> u64 {
    runtime + ((CONNECT_TIMEOUT_MULTIPLIER * runtime as f64) as u64) + STATIC_DELAY_BEFORE_START
}

pub async fn run_client(config: &Iperf3ClientConfig, runtime: u64, interface: &AppInterface) -> anyhow::Result<bool> {
    let mut command = vec!["/usr/bin/iperf3".to_string(), "--forceflush".to_string()];

    if config.reverse == Some(true) {
        command.push("--reverse".to_string());
    }

    if config.udp == Some(true) {
        if config.bandwidth_kbps.is_none() {
            anyhow::bail!("iperf3-client UDP settings need bandwidth_kbps");
        }
        command.push("--udp".to_string());
    }

    if let Some(bandwidth_kbps) = config.bandwidth_kbps {
        command.push("--bandwidth".to_string());
        command.push(format!("{bandwidth_kbps}k"));
    }

    if let Some(streams) = config.streams {
        command.push("--parallel".to_string());
        command.push(streams.to_string());
    }

    if config.tcp_no_delay == Some(true) {
        if config.udp == Some(true) {
            anyhow::bail!("tcp_no_delay cannot be combined with udp");
        }
        command.push("--no-delay".to_string());
    }

    command.push("--time".to_string());
    command.push(runtime.to_string());

    command.push("--interval".to_string());
    command.push(config.report_interval.to_string());

    let connect_timeout_ms =
        (STATIC_DELAY_BEFORE_START as f64).max(CONNECT_TIMEOUT_MULTIPLIER * runtime as f64) * 1000.0;
    command.push("--connect-timeout".to_string());
    command.push(connect_timeout_ms.to_string());

    command.push("--port".to_string());
    command.push(config.port.to_string());
    command.push("--client".to_string());
    command.push(config.host.clone());

    let code = run_iperf(&command, interface).await?;
    Ok(code == 0)
}

pub async fn run_server(config: &Iperf3ServerConfig, interface: &AppInterface) -> anyhow::Result<bool> {
    let command = vec![
        "/usr/bin/iperf3".to_string(),
        "--forceflush".to_string(),
        "--one-off".to_string(),
        "--interval".to_string(),
        config.report_interval.to_string(),
        "--port".to_string(),
        config.port.to_string(),
        "--server".to_string(),
        config.host.clone(),
    ];

    let code = run_iperf(&command, interface).await?;
    Ok(code == 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unknown,
    TcpClient,
    TcpServer,
    UdpClient,
    UdpServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Preamble,
    Running,
    Summary,
}

fn size_to_bytes(size: f64, unit: &str) -> anyhow::Result<f64> {
    Ok(match unit {
        "Bytes" => size,
        "KBytes" => size * 1024.0,
        "MBytes" => size * 1024.0 * 1024.0,
        "GBytes" => size * 1024.0 * 1024.0 * 1024.0,
        other => anyhow::bail!("unknown data size unit '{other}'"),
    })
}

fn rate_to_bytes(bits: f64, unit: &str) -> anyhow::Result<f64> {
    Ok(match unit {
        "bits/sec" => bits,
        "Kbits/sec" => bits * 1_000.0,
        "Mbits/sec" => bits * 1_000_000.0,
        "Gbits/sec" => bits * 1_000_000_000.0,
        other => anyhow::bail!("unknown data rate unit '{other}'"),
    })
}

async fn parse_line_tcp_client(
    interface: &AppInterface,
    time: f64,
    stream: i64,
    line: &[String],
) -> anyhow::Result<()> {
    if line.len() != 7 {
        anyhow::bail!("invalid iperf3 log line received");
    }
    let data = serde_json::json!({
        "time": time,
        "stream": stream,
        "transfer": size_to_bytes(line[0].parse()?, &line[1])?,
        "bitrate": rate_to_bytes(line[2].parse()?, &line[3])?,
        "retransmit": line[4].parse::<i64>()?,
        "congestion": size_to_bytes(line[5].parse()?, &line[6])?,
    });
    interface.data_point("iperf-tcp-client", data, HashMap::new()).await
}

async fn parse_line_tcp_server(
    interface: &AppInterface,
    time: f64,
    stream: i64,
    line: &[String],
) -> anyhow::Result<()> {
    if line.len() != 4 {
        anyhow::bail!("invalid iperf3 log line received");
    }
    let data = serde_json::json!({
        "time": time,
        "stream": stream,
        "transfer": size_to_bytes(line[0].parse()?, &line[1])?,
        "bitrate": rate_to_bytes(line[2].parse()?, &line[3])?,
    });
    interface.data_point("iperf-tcp-server", data, HashMap::new()).await
}

async fn parse_line_udp_client(
    interface: &AppInterface,
    time: f64,
    stream: i64,
    line: &[String],
) -> anyhow::Result<()> {
    if line.len() != 5 {
        anyhow::bail!("invalid iperf3 log line received");
    }
    let data = serde_json::json!({
        "time": time,
        "stream": stream,
        "transfer": size_to_bytes(line[0].parse()?, &line[1])?,
        "bitrate": rate_to_bytes(line[2].parse()?, &line[3])?,
        "datagrams": line[4].parse::<i64>()?,
    });
    interface.data_point("iperf-udp-client", data, HashMap::new()).await
}

async fn parse_line_udp_server(
    interface: &AppInterface,
    time: f64,
    stream: i64,
    line: &[String],
) -> anyhow::Result<()> {
    if line.len() != 8 {
        anyhow::bail!("invalid iperf3 log line received");
    }
    let dgram: Vec<&str> = line[6].split('/').collect();
    if dgram.len() != 2 {
        anyhow::bail!("invalid datagram loss field in iperf3 log line");
    }
    let data = serde_json::json!({
        "time": time,
        "stream": stream,
        "transfer": size_to_bytes(line[0].parse()?, &line[1])?,
        "bitrate": rate_to_bytes(line[2].parse()?, &line[3])?,
        "jitter": line[4].parse::<f64>()?,
        "datagrams_lost": dgram[0].parse::<i64>()?,
        "datagrams_total": dgram[1].parse::<i64>()?,
    });
    interface.data_point("iperf-udp-server", data, HashMap::new()).await
}

/// Streams an iperf3 invocation's stdout and reports every data row as a
/// data point. Returns the child's exit code on success.
async fn run_iperf(command: &[String], interface: &AppInterface) -> anyhow::Result<i32> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|err| anyhow::anyhow!("unable to start iperf3: {err}"))?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let bracket_re = Regex::new(r"\[\s*(\d+|SUM)\s*\]").expect("valid regex");
    let after_re = Regex::new(r"\]\s*(.*)").expect("valid regex");

    let mut mode = Mode::Unknown;
    let mut pos = Position::Preamble;
    let mut next_could_be_delimiter = false;
    let mut preamble_finished = false;

    while let Some(line) = lines.next_line().await? {
        if pos == Position::Summary {
            continue;
        }

        if pos == Position::Preamble && !line.starts_with('[') {
            continue;
        }
        pos = Position::Running;
        preamble_finished = true;

        if pos == Position::Running && line.starts_with('-') && !next_could_be_delimiter {
            pos = Position::Summary;
            continue;
        }
        next_could_be_delimiter = false;

        if pos == Position::Running && line.contains("ID") && !preamble_finished {
            pos = Position::Summary;
            continue;
        }
        preamble_finished = false;

        if !line.starts_with('[') {
            anyhow::bail!("invalid iperf3 log output");
        }

        if mode == Mode::Unknown {
            if line.contains("ID]") {
                mode = if line.contains("Jitter") {
                    Mode::UdpServer
                } else if line.contains("Total Datagrams") {
                    Mode::UdpClient
                } else if line.contains("Cwnd") {
                    Mode::TcpClient
                } else {
                    Mode::TcpServer
                };
            }
            continue;
        }

        let stream_raw = bracket_re
            .captures(&line)
            .and_then(|c| c.get(1))
            .ok_or_else(|| anyhow::anyhow!("unable to parse iperf3 logline"))?
            .as_str()
            .to_string();

        let remainder = after_re
            .captures(&line)
            .and_then(|c| c.get(1))
            .ok_or_else(|| anyhow::anyhow!("unable to parse iperf3 logline"))?
            .as_str()
            .to_string();

        let mut line_parts: Vec<String> = remainder.split_whitespace().map(str::to_string).collect();
        if line_parts.len() < 3 {
            anyhow::bail!("unable to parse iperf3 logline");
        }

        let time_token = line_parts.remove(0);
        let _ = line_parts.remove(0); // "sec" unit
        let time_spec: f64 = time_token
            .split('-')
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to parse iperf3 logline"))?
            .parse()?;

        if stream_raw.contains("SUM") {
            next_could_be_delimiter = true;
            continue;
        }

        let stream: i64 = stream_raw.parse()?;
        let line_parts: Vec<String> = line_parts.into_iter().map(|part| part.trim().to_string()).collect();

        match mode {
            Mode::TcpClient => parse_line_tcp_client(interface, time_spec, stream, &line_parts).await?,
            Mode::TcpServer => parse_line_tcp_server(interface, time_spec, stream, &line_parts).await?,
            Mode::UdpClient => parse_line_udp_client(interface, time_spec, stream, &line_parts).await?,
            Mode::UdpServer => parse_line_udp_server(interface, time_spec, stream, &line_parts).await?,
            Mode::Unknown => unreachable!("mode is checked above"),
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        let mut stderr_buf = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            stderr.read_to_string(&mut stderr_buf).await.ok();
        }
        anyhow::bail!("iperf3 exited with an error: {stderr_buf}");
    }

    if mode == Mode::Unknown {
        anyhow::bail!("unable to complete iperf3 log parsing");
    }

    Ok(status.code().unwrap_or(-1))
}
