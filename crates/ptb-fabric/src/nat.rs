use anyhow::Result;

use crate::dismantle::DismantleStack;
use crate::runner::{CommandRunner, run_checked, run_probe};

/// Enable outbound NAT (MASQUERADE) for a management subnet, idempotent via
/// the `iptables -C` existence check before `-A` appends a duplicate rule.
pub fn ensure_masquerade(runner: &dyn CommandRunner, stack: &mut DismantleStack, subnet_cidr: &str, bridge: &str) -> Result<()> {
    let rule = [
        "-t", "nat", "POSTROUTING", "-s", subnet_cidr, "!", "-o", bridge, "-j", "MASQUERADE",
    ];
    ensure_rule(runner, stack, &rule)?;

    let forward_out = ["FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"];
    ensure_rule(runner, stack, &forward_out)?;

    let forward_established = [
        "FORWARD", "!", "-i", bridge, "-o", bridge, "-m", "state", "--state", "RELATED,ESTABLISHED",
        "-j", "ACCEPT",
    ];
    ensure_rule(runner, stack, &forward_established)?;

    Ok(())
}

/// Forward a host TCP port to an Instance's management IP (the testbed
/// config's `host_ports` entries), via a DNAT PREROUTING rule.
pub fn forward_host_port(
    runner: &dyn CommandRunner,
    stack: &mut DismantleStack,
    host_port: u16,
    guest_ip: &str,
    guest_port: u16,
) -> Result<()> {
    let dest = format!("{guest_ip}:{guest_port}");
    let host_port = host_port.to_string();
    let rule = [
        "-t", "nat", "PREROUTING", "-p", "tcp", "--dport", &host_port, "-j", "DNAT",
        "--to-destination", &dest,
    ];
    ensure_rule(runner, stack, &rule)
}

/// Append an iptables rule unless an equivalent one (via `-C`) already
/// exists, pushing the inverse `-D` onto the dismantle stack only when the
/// rule was actually added.
fn ensure_rule(runner: &dyn CommandRunner, stack: &mut DismantleStack, spec: &[&str]) -> Result<()> {
    let check: Vec<&str> = std::iter::once("-C").chain(spec.iter().copied()).collect();
    if run_probe(runner, "iptables", &check)? {
        return Ok(());
    }
    let append: Vec<&str> = std::iter::once("-A").chain(spec.iter().copied()).collect();
    run_checked(runner, "iptables", &append)?;

    let delete: Vec<String> = std::iter::once("-D".to_string())
        .chain(spec.iter().map(|s| s.to_string()))
        .collect();
    let delete_refs: Vec<&str> = delete.iter().map(String::as_str).collect();
    stack.push("iptables", &delete_refs);
    Ok(())
}
