//! Enumerate and remove TAP/bridge devices left on the host, independent of
//! any particular run's `DismantleStack` — used by `prune --interfaces` to
//! sweep devices whose owning process is gone.
//!
//! Grounded in `original_source/controller/helper/network_helper.py`'s
//! `ip -j link show` JSON-parsing idiom (there used by `add_device` to find
//! an interface's current bridge membership); the prefix filter matches
//! `ptb_core::naming::{TAP_PREFIX, BRIDGE_PREFIX}` so a sweep never touches
//! an interface this crate didn't create.

use anyhow::{Context, Result};
use ptb_core::naming::{BRIDGE_PREFIX, TAP_PREFIX};
use serde::Deserialize;

use crate::runner::{CommandRunner, run_probe};

#[derive(Deserialize)]
struct LinkEntry {
    ifname: String,
}

/// Every currently-existing host interface whose name carries the TAP or
/// bridge prefix this crate uses, regardless of which run created it.
pub fn list_ptb_interfaces(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner
        .run("ip", &["-j", "link", "show"])
        .context("listing host interfaces")?;
    if !output.status.success() {
        anyhow::bail!(
            "ip -j link show failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let entries: Vec<LinkEntry> =
        serde_json::from_slice(&output.stdout).context("parsing `ip -j link show` output")?;
    Ok(entries
        .into_iter()
        .map(|entry| entry.ifname)
        .filter(|name| name.starts_with(TAP_PREFIX) || name.starts_with(BRIDGE_PREFIX))
        .collect())
}

/// Delete a TAP or bridge interface if it still exists. Returns `false`
/// without error if it's already gone, matching `delete_interface`'s
/// "does not exist" no-op in the original prune walk.
pub fn delete_interface(runner: &dyn CommandRunner, name: &str) -> Result<bool> {
    if !run_probe(runner, "ip", &["link", "show", name])? {
        return Ok(false);
    }
    let output = runner
        .run("ip", &["link", "del", name])
        .with_context(|| format!("deleting interface {name}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "ip link del {name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(true)
}
