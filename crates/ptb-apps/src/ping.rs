//! `ping` Application, grounded in `original_source/applications/ping_application.py`.

use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::interface::AppInterface;

fn default_interval() -> u64 {
    1
}

fn default_timeout() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    pub target: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub packetsize: Option<u32>,
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Parses one `-D` timestamped ping output line into its `key=value` tokens,
/// dropping the leading `[timestamp]` token exactly as the Python loop does.
fn parse_reply_tokens(line: &str) -> (bool, HashMap<&str, &str>) {
    let mut parts = line.split(' ');
    parts.next();
    let rest: Vec<&str> = parts.collect();

    let reachable = !matches!(rest.first().copied(), Some("no") | Some("From"));

    let mut results = HashMap::new();
    for token in &rest {
        if let Some((key, value)) = token.split_once('=') {
            results.insert(key, value);
        }
    }
    (reachable, results)
}

pub async fn run(config: &PingConfig, runtime: u64, interface: &AppInterface) -> anyhow::Result<bool> {
    let mut command = Command::new("/usr/bin/ping");
    command
        .arg("-O")
        .arg("-B")
        .arg("-D")
        .arg("-w")
        .arg(runtime.to_string())
        .arg("-W")
        .arg(config.timeout.to_string())
        .arg("-i")
        .arg(config.interval.to_string());

    if let Some(source) = &config.source {
        command.arg("-I").arg(source);
    }
    if let Some(ttl) = config.ttl {
        command.arg("-t").arg(ttl.to_string());
    }
    if let Some(packetsize) = config.packetsize {
        command.arg("-s").arg(packetsize.to_string());
    }
    command.arg(&config.target);
    command.stdout(Stdio::piped()).stderr(Stdio::null());

    let mut child = command
        .spawn()
        .map_err(|err| anyhow::anyhow!("unable to start ping: {err}"))?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut current_seq: i64 = 0;
    while let Some(line) = lines.next_line().await? {
        if !line.starts_with('[') {
            continue;
        }

        let (reachable, results) = parse_reply_tokens(&line);
        let Some(icmp_seq) = results.get("icmp_seq").and_then(|v| v.parse::<i64>().ok()) else {
            continue;
        };
        if current_seq >= icmp_seq {
            continue;
        }
        current_seq = icmp_seq;

        let rtt: f64 = results.get("time").and_then(|v| v.parse().ok()).unwrap_or(-1.0);
        let ttl: i64 = results.get("ttl").and_then(|v| v.parse().ok()).unwrap_or(-1);

        interface
            .data_point(
                "ping",
                serde_json::json!({
                    "rtt": rtt,
                    "ttl": ttl,
                    "reachable": reachable,
                    "icmp_seq": icmp_seq,
                }),
                HashMap::new(),
            )
            .await?;
    }

    let status = child.wait().await?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reachable_reply() {
        let (reachable, tokens) =
            parse_reply_tokens("[1699999999.123456] 64 bytes from 10.0.0.1: icmp_seq=3 ttl=64 time=0.123 ms");
        assert!(reachable);
        assert_eq!(tokens.get("icmp_seq"), Some(&"3"));
        assert_eq!(tokens.get("ttl"), Some(&"64"));
        assert_eq!(tokens.get("time"), Some(&"0.123"));
    }

    #[test]
    fn test_parse_unreachable_reply() {
        let (reachable, tokens) =
            parse_reply_tokens("[1699999999.654321] From 10.0.0.1 icmp_seq=5 Destination Host Unreachable");
        assert!(!reachable);
        assert_eq!(tokens.get("icmp_seq"), Some(&"5"));
    }

    #[test]
    fn test_parse_no_answer_yet() {
        let (reachable, tokens) = parse_reply_tokens("[1699999999.0] no answer yet for icmp_seq=7");
        assert!(!reachable);
        assert_eq!(tokens.get("icmp_seq"), Some(&"7"));
    }
}
