use std::process::{Command, Output};

use anyhow::{Context, Result};

/// Abstracts process execution so bridge/tap/NAT logic can be unit tested
/// without actually touching host networking.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("running {program} {}", args.join(" ")))
    }
}

/// Run a mutating command, treating a non-zero exit as an error.
pub fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<()> {
    let output = runner.run(program, args)?;
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Run an existence/rule-presence check (`ip link show`, `iptables -C ...`):
/// exit status is the answer, not an error condition.
pub fn run_probe(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<bool> {
    Ok(runner.run(program, args)?.status.success())
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    /// Records every invocation and lets tests mark specific invocations as
    /// failing, keyed by `"program arg1 arg2 ..."`.
    #[derive(Default)]
    pub struct MockRunner {
        pub calls: RefCell<Vec<String>>,
        failing: RefCell<HashSet<String>>,
        responses: RefCell<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail(&self, signature: &str) {
            self.failing.borrow_mut().insert(signature.to_string());
        }

        /// Sets the stdout bytes returned for a given invocation signature.
        /// Invocations with no configured response return empty stdout.
        pub fn respond(&self, signature: &str, stdout: &[u8]) {
            self.responses.borrow_mut().insert(signature.to_string(), stdout.to_vec());
        }

        pub fn call_count(&self, signature: &str) -> usize {
            self.calls.borrow().iter().filter(|c| *c == signature).count()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
            let signature = format!("{program} {}", args.join(" "));
            self.calls.borrow_mut().push(signature.clone());
            let ok = !self.failing.borrow().contains(&signature);
            let stdout = self.responses.borrow().get(&signature).cloned().unwrap_or_default();
            Ok(Output {
                status: ExitStatus::from_raw(if ok { 0 } else { 1 << 8 }),
                stdout: if ok { stdout } else { Vec::new() },
                stderr: if ok { Vec::new() } else { b"mock failure".to_vec() },
            })
        }
    }
}
