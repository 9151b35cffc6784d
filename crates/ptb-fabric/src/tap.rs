use anyhow::Result;

use crate::dismantle::DismantleStack;
use crate::runner::{CommandRunner, run_checked};

/// Create a TAP device and attach it to a bridge. Each NIC on an Instance
/// gets its own TAP, matching up to the MAC derived in `ptb-core::naming`.
pub fn ensure_tap(runner: &dyn CommandRunner, stack: &mut DismantleStack, tap: &str, bridge: &str) -> Result<()> {
    run_checked(runner, "ip", &["tuntap", "add", "dev", tap, "mode", "tap"])?;
    stack.push("ip", &["link", "del", tap]);

    run_checked(runner, "ip", &["link", "set", tap, "master", bridge])?;
    run_checked(runner, "ip", &["link", "set", tap, "up"])?;
    stack.push("ip", &["link", "set", tap, "down"]);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;

    #[test]
    fn test_ensure_tap_creates_and_attaches() {
        let runner = MockRunner::new();
        let mut stack = DismantleStack::new();

        ensure_tap(&runner, &mut stack, "ptb-t-aaaaaaaa", "ptb-b-aaaaaaaa").unwrap();

        assert_eq!(
            runner.call_count("ip tuntap add dev ptb-t-aaaaaaaa mode tap"),
            1
        );
        assert_eq!(
            runner.call_count("ip link set ptb-t-aaaaaaaa master ptb-b-aaaaaaaa"),
            1
        );
        assert_eq!(stack.len(), 2);
    }
}
