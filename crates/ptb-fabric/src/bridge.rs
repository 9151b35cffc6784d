use anyhow::Result;

use crate::dismantle::DismantleStack;
use crate::runner::{CommandRunner, run_checked, run_probe};

/// Create a bridge if it doesn't already exist, and bring it up. Idempotent:
/// safe to call again for an already-configured bridge.
pub fn ensure_bridge(runner: &dyn CommandRunner, stack: &mut DismantleStack, name: &str) -> Result<()> {
    if !run_probe(runner, "ip", &["link", "show", name])? {
        run_checked(runner, "ip", &["link", "add", name, "type", "bridge"])?;
        stack.push("ip", &["link", "del", name]);
    }
    run_checked(runner, "ip", &["link", "set", name, "up"])?;
    stack.push("ip", &["link", "set", name, "down"]);
    Ok(())
}

/// Assign the management gateway address (`addr/prefix`) to a bridge.
pub fn assign_address(runner: &dyn CommandRunner, stack: &mut DismantleStack, bridge: &str, addr_cidr: &str) -> Result<()> {
    run_checked(runner, "ip", &["addr", "add", addr_cidr, "dev", bridge])?;
    stack.push("ip", &["addr", "del", addr_cidr, "dev", bridge]);
    Ok(())
}
