use crate::runner::{CommandRunner, run_checked};

/// A LIFO stack of inverse commands, one pushed for every setup step that
/// needs undoing. Teardown runs the whole stack in reverse, continuing past
/// failures so a single stuck rule doesn't strand the rest of the fabric.
#[derive(Default)]
pub struct DismantleStack {
    actions: Vec<(String, Vec<String>)>,
}

impl DismantleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, program: &str, args: &[&str]) {
        self.actions
            .push((program.to_string(), args.iter().map(|s| s.to_string()).collect()));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Execute every inverse action LIFO. Returns `true` only if every one
    /// of them succeeded.
    pub fn dismantle(&mut self, runner: &dyn CommandRunner) -> bool {
        let mut all_ok = true;
        while let Some((program, args)) = self.actions.pop() {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if run_checked(runner, &program, &arg_refs).is_err() {
                tracing::warn!(program = %program, args = ?args, "dismantle action failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;

    #[test]
    fn test_dismantle_runs_in_reverse_order() {
        let runner = MockRunner::new();
        let mut stack = DismantleStack::new();
        stack.push("ip", &["link", "del", "ptb-b-1"]);
        stack.push("ip", &["link", "set", "ptb-b-1", "down"]);

        assert!(stack.dismantle(&runner));
        assert_eq!(
            *runner.calls.borrow(),
            vec!["ip link set ptb-b-1 down".to_string(), "ip link del ptb-b-1".to_string()]
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_dismantle_continues_past_failures() {
        let runner = MockRunner::new();
        runner.fail("ip link set ptb-b-1 down");
        let mut stack = DismantleStack::new();
        stack.push("ip", &["link", "del", "ptb-b-1"]);
        stack.push("ip", &["link", "set", "ptb-b-1", "down"]);

        let ok = stack.dismantle(&runner);
        assert!(!ok);
        // Both actions still ran despite the first (now-last-popped) one failing.
        assert_eq!(runner.calls.borrow().len(), 2);
    }
}
