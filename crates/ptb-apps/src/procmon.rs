//! `procmon` Application, grounded in
//! `original_source/applications/procmon_application.py`. The Python original
//! polls `psutil`; this port reads the equivalent `/proc` counters directly
//! since no such crate is part of the workspace's dependency stack.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::interface::{AppInterface, LogLevel};

fn default_interval() -> u64 {
    2
}

fn default_system() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcmonConfig {
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub interfaces: Option<Vec<String>>,
    #[serde(default)]
    pub processes: Option<Vec<String>>,
    #[serde(default = "default_system")]
    pub system: bool,
}

type Counters = HashMap<&'static str, f64>;

fn diff(offset: &Counters, current: &Counters) -> Counters {
    current
        .iter()
        .map(|(key, value)| (*key, value - offset.get(key).copied().unwrap_or(0.0)))
        .collect()
}

fn clk_tck() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn page_size() -> f64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as f64
    } else {
        4096.0
    }
}

/// Parses `/proc/<pid>/stat`'s `utime`/`stime`/`cutime`/`cstime` fields (in
/// clock ticks) into seconds. The `comm` field may itself contain spaces and
/// parentheses, so indexing is anchored on the last `)`.
fn parse_proc_pid_stat(content: &str, clk_tck: f64) -> anyhow::Result<Counters> {
    let after_comm = content
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/<pid>/stat"))?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state; utime/stime/cutime/cstime are fields 11-14 (1-indexed
    // from `pid`), i.e. fields[10..14] once `pid (comm)` is stripped.
    if fields.len() < 14 {
        anyhow::bail!("truncated /proc/<pid>/stat");
    }
    let utime: f64 = fields[11].parse()?;
    let stime: f64 = fields[12].parse()?;
    let cutime: f64 = fields[13].parse()?;
    let cstime: f64 = fields[14].parse()?;

    let mut counters = Counters::new();
    counters.insert("cpu_user", utime / clk_tck);
    counters.insert("cpu_system", stime / clk_tck);
    counters.insert("cpu_child_user", cutime / clk_tck);
    counters.insert("cpu_child_system", cstime / clk_tck);
    Ok(counters)
}

fn parse_statm(content: &str, page_size: f64) -> anyhow::Result<Counters> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 3 {
        anyhow::bail!("truncated /proc/<pid>/statm");
    }
    let vms: f64 = fields[0].parse()?;
    let rss: f64 = fields[1].parse()?;
    let shared: f64 = fields[2].parse()?;

    let mut counters = Counters::new();
    counters.insert("mem_rss", rss * page_size);
    counters.insert("mem_vms", vms * page_size);
    counters.insert("mem_shared", shared * page_size);
    Ok(counters)
}

fn parse_proc_stat_cpu_line(content: &str, clk_tck: f64) -> anyhow::Result<Counters> {
    let cpu_line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| anyhow::anyhow!("missing aggregate cpu line in /proc/stat"))?;
    let fields: Vec<f64> = cpu_line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse().unwrap_or(0.0))
        .collect();
    if fields.len() < 7 {
        anyhow::bail!("truncated /proc/stat cpu line");
    }

    let mut counters = Counters::new();
    counters.insert("cpu_user", fields[0] / clk_tck);
    counters.insert("cpu_system", fields[2] / clk_tck);
    counters.insert("cpu_idle", fields[3] / clk_tck);
    counters.insert("cpu_iowait", fields[4] / clk_tck);
    counters.insert("cpu_irq", fields[5] / clk_tck);
    counters.insert("cpu_softirq", fields[6] / clk_tck);
    Ok(counters)
}

fn parse_meminfo(content: &str) -> anyhow::Result<Counters> {
    let mut kib: HashMap<&str, f64> = HashMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value_kib: f64 = rest
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);
        kib.insert(key, value_kib);
    }

    let total = kib.get("MemTotal").copied().unwrap_or(0.0);
    let free = kib.get("MemFree").copied().unwrap_or(0.0);
    let buffers = kib.get("Buffers").copied().unwrap_or(0.0);
    let cached = kib.get("Cached").copied().unwrap_or(0.0);

    let mut counters = Counters::new();
    counters.insert("mem_used", (total - free) * 1024.0);
    counters.insert("mem_free", free * 1024.0);
    counters.insert("mem_buffers", buffers * 1024.0);
    counters.insert("mem_chached", cached * 1024.0);
    Ok(counters)
}

/// Parses one interface line from `/proc/net/dev` (everything after the
/// `iface:` prefix has already been split off by the caller).
fn parse_net_dev_fields(fields: &str) -> anyhow::Result<Counters> {
    let values: Vec<f64> = fields
        .split_whitespace()
        .map(|field| field.parse().unwrap_or(0.0))
        .collect();
    if values.len() < 16 {
        anyhow::bail!("truncated /proc/net/dev interface line");
    }

    let mut counters = Counters::new();
    counters.insert("bytes_recv", values[0]);
    counters.insert("packets_recv", values[1]);
    counters.insert("errin", values[2]);
    counters.insert("dropin", values[3]);
    counters.insert("bytes_sent", values[8]);
    counters.insert("packets_sent", values[9]);
    counters.insert("errout", values[10]);
    counters.insert("dropout", values[11]);
    Ok(counters)
}

async fn system_snapshot() -> anyhow::Result<Counters> {
    let stat = tokio::fs::read_to_string("/proc/stat").await?;
    let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
    let mut counters = parse_proc_stat_cpu_line(&stat, clk_tck())?;
    counters.extend(parse_meminfo(&meminfo)?);
    Ok(counters)
}

async fn process_snapshot(pid: u32) -> anyhow::Result<Counters> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;
    let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await?;
    let mut counters = parse_proc_pid_stat(&stat, clk_tck())?;
    counters.extend(parse_statm(&statm, page_size())?);
    Ok(counters)
}

async fn interface_snapshot(name: &str) -> anyhow::Result<Counters> {
    let content = tokio::fs::read_to_string("/proc/net/dev").await?;
    let line = content
        .lines()
        .find_map(|line| line.split_once(':').filter(|(iface, _)| iface.trim() == name))
        .map(|(_, fields)| fields.to_string())
        .ok_or_else(|| anyhow::anyhow!("unable to find interface {name}"))?;
    parse_net_dev_fields(&line)
}

async fn find_pid_for_cmdline(pattern: &str) -> anyhow::Result<u32> {
    let mut entries = tokio::fs::read_dir("/proc").await?;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(raw) = tokio::fs::read(format!("/proc/{pid}/cmdline")).await else {
            continue;
        };
        let cmdline = raw
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if cmdline.starts_with(pattern) {
            return Ok(pid);
        }
    }
    anyhow::bail!("unable to find process with cmdline '{pattern}'")
}

async fn report(
    interface: &AppInterface,
    system: Option<&Counters>,
    processes: &HashMap<String, Counters>,
    interfaces: &HashMap<String, Counters>,
) -> anyhow::Result<()> {
    if let Some(system) = system {
        interface
            .data_point("proc-system", counters_to_json(system), HashMap::new())
            .await?;
    }
    for (name, counters) in processes {
        let mut tags = HashMap::new();
        tags.insert("process".to_string(), name.clone());
        interface.data_point("proc-process", counters_to_json(counters), tags).await?;
    }
    for (name, counters) in interfaces {
        let mut tags = HashMap::new();
        tags.insert("interface".to_string(), name.clone());
        interface
            .data_point("proc-interface", counters_to_json(counters), tags)
            .await?;
    }
    Ok(())
}

fn counters_to_json(counters: &Counters) -> serde_json::Value {
    serde_json::Value::Object(
        counters
            .iter()
            .map(|(key, value)| ((*key).to_string(), serde_json::json!(value)))
            .collect(),
    )
}

pub async fn run(config: &ProcmonConfig, runtime: u64, interface: &AppInterface) -> anyhow::Result<bool> {
    if !config.system && config.interfaces.is_none() && config.processes.is_none() {
        anyhow::bail!("procmon has nothing to do (system, process, and interface monitoring disabled)");
    }

    let mut process_pids: HashMap<String, u32> = HashMap::new();
    if let Some(processes) = &config.processes {
        for pattern in processes {
            process_pids.insert(pattern.clone(), find_pid_for_cmdline(pattern).await?);
        }
    }

    let mut process_offsets = HashMap::new();
    for (pattern, pid) in &process_pids {
        process_offsets.insert(pattern.clone(), process_snapshot(*pid).await?);
    }

    let mut interface_offsets = HashMap::new();
    if let Some(interfaces) = &config.interfaces {
        for name in interfaces {
            interface_offsets.insert(name.clone(), interface_snapshot(name).await?);
        }
    }

    let system_offset = if config.system { Some(system_snapshot().await?) } else { None };

    let interval = Duration::from_secs(config.interval.max(1));
    let mut time_left = Duration::from_secs(runtime);
    let mut tracking_errors: u32 = 0;
    let mut warned_cant_keep_up = false;

    loop {
        let tick_start = Instant::now();

        let mut run_processes = HashMap::new();
        for (pattern, offset) in &process_offsets {
            let pid = process_pids[pattern];
            match process_snapshot(pid).await {
                Ok(current) => run_processes.insert(pattern.clone(), diff(offset, &current)),
                Err(_) => {
                    tracking_errors += 1;
                    run_processes.insert(pattern.clone(), offset.clone())
                }
            };
        }

        let mut run_interfaces = HashMap::new();
        for (name, offset) in &interface_offsets {
            match interface_snapshot(name).await {
                Ok(current) => run_interfaces.insert(name.clone(), diff(offset, &current)),
                Err(_) => {
                    tracking_errors += 1;
                    run_interfaces.insert(name.clone(), offset.clone())
                }
            };
        }

        let run_system = match &system_offset {
            Some(offset) => Some(diff(offset, &system_snapshot().await?)),
            None => None,
        };

        report(interface, run_system.as_ref(), &run_processes, &run_interfaces).await?;

        let took = tick_start.elapsed();
        if took >= interval {
            if !warned_cant_keep_up {
                interface.log(LogLevel::Warning, "can't keep up with logging interval").await?;
                warned_cant_keep_up = true;
            }
            time_left = time_left.saturating_sub(took);
        } else {
            let sleep_for = time_left.saturating_sub(took).min(interval.saturating_sub(took));
            tokio::time::sleep(sleep_for).await;
            time_left = time_left.saturating_sub(sleep_for);
        }

        if time_left < interval {
            break;
        }
    }

    Ok(tracking_errors == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let sample = "MemTotal:       16331556 kB\nMemFree:         1234567 kB\nBuffers:           45678 kB\nCached:          2345678 kB\n";
        let counters = parse_meminfo(sample).unwrap();
        assert_eq!(counters["mem_free"], 1234567.0 * 1024.0);
        assert_eq!(counters["mem_chached"], 2345678.0 * 1024.0);
    }

    #[test]
    fn test_parse_proc_stat_cpu_line() {
        let sample = "cpu  100 0 200 7000 50 10 20 0 0 0\ncpu0 50 0 100 3500 25 5 10 0 0 0\n";
        let counters = parse_proc_stat_cpu_line(sample, 100.0).unwrap();
        assert_eq!(counters["cpu_user"], 1.0);
        assert_eq!(counters["cpu_idle"], 70.0);
    }

    #[test]
    fn test_parse_net_dev_fields() {
        let fields = "1000 10 0 0 0 0 0 0 2000 20 1 0 0 0 0 0";
        let counters = parse_net_dev_fields(fields).unwrap();
        assert_eq!(counters["bytes_recv"], 1000.0);
        assert_eq!(counters["bytes_sent"], 2000.0);
        assert_eq!(counters["errout"], 1.0);
    }

    #[test]
    fn test_parse_proc_pid_stat_handles_comm_with_spaces() {
        let sample = "1234 (my weird (proc)) S 1 1234 1234 0 -1 4194304 100 0 0 0 10 20 5 3 20 0 2 0 1000 1000000 100 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let counters = parse_proc_pid_stat(sample, 100.0).unwrap();
        assert_eq!(counters["cpu_user"], 0.10);
        assert_eq!(counters["cpu_system"], 0.20);
    }

    #[test]
    fn test_diff_subtracts_offset() {
        let mut offset = Counters::new();
        offset.insert("bytes_sent", 10.0);
        let mut current = Counters::new();
        current.insert("bytes_sent", 25.0);
        let diffed = diff(&offset, &current);
        assert_eq!(diffed["bytes_sent"], 15.0);
    }
}
