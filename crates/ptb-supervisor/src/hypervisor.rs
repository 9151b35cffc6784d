//! Hypervisor process lifecycle (§4.3 steps 3-5): command-line assembly,
//! spawn, monitor-prompt wait, orderly shutdown with escalation to kill.
//!
//! Grounded in the teacher's `-enable-kvm`/`-cpu host`/`-snapshot` command
//! shape, adapted from per-NIC tap args plus the 9p exchange/testbed-package
//! exports and the control-endpoint chardev.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

const KVM_OPTS: &[&str] = &["-enable-kvm", "-cpu", "host"];
const MONITOR_PROMPT: &str = "(qemu)";

/// One NIC to attach: a TAP device name, its MAC and the shared model tag.
pub struct NicSpec<'a> {
    pub tap: &'a str,
    pub mac: &'a str,
}

/// Everything needed to assemble and spawn one Instance's hypervisor.
pub struct LaunchSpec<'a> {
    pub cores: u32,
    pub memory_mb: u64,
    pub nic_model: &'a str,
    pub image: &'a Path,
    pub seed_iso: &'a Path,
    pub nics: &'a [NicSpec<'a>],
    pub exchange_dir: &'a Path,
    pub testbed_package_dir: &'a Path,
    pub control_socket: &'a Path,
    pub disable_kvm: bool,
}

fn build_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-boot".into(),
        "c".into(),
        "-m".into(),
        spec.memory_mb.to_string(),
        "-smp".into(),
        spec.cores.to_string(),
        "-machine".into(),
        "q35".into(),
        "-hda".into(),
        spec.image.to_string_lossy().into_owned(),
        "-chardev".into(),
        format!(
            "socket,id=mgmtchardev,path={},server=on,wait=off",
            spec.control_socket.display()
        ),
        "-device".into(),
        "pci-serial,chardev=mgmtchardev".into(),
        "-virtfs".into(),
        format!(
            "local,path={},mount_tag=exchange,security_model=passthrough,id=exchange",
            spec.exchange_dir.display()
        ),
        "-virtfs".into(),
        format!(
            "local,path={},mount_tag=tbp,security_model=passthrough,id=tbp,readonly=on",
            spec.testbed_package_dir.display()
        ),
    ];

    if !spec.disable_kvm {
        args.extend(KVM_OPTS.iter().map(|s| s.to_string()));
    }

    for nic in spec.nics {
        args.push("-nic".into());
        args.push(format!(
            "tap,model={},ifname={},mac={}",
            spec.nic_model, nic.tap, nic.mac
        ));
    }

    args.push("-snapshot".into());
    args.push("-cdrom".into());
    args.push(spec.seed_iso.to_string_lossy().into_owned());
    args.push("-display".into());
    args.push("none".into());
    args.push("-monitor".into());
    args.push("stdio".into());

    args
}

/// A spawned hypervisor process. The monitor prompt is read from `stdio`,
/// matching the teacher's `pexpect`-driven QEMU monitor in the original.
pub struct HypervisorProcess {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

impl HypervisorProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send a monitor command line (e.g. `system_powerdown`, `info status`).
    pub async fn monitor_command(&mut self, command: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{command}\n").as_bytes())
            .await
            .context("writing hypervisor monitor command")?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read lines from the monitor until the prompt reappears, within `deadline`.
    async fn wait_for_prompt(&mut self, deadline: Duration) -> Result<()> {
        timeout(deadline, async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = self.stdout.read_line(&mut line).await?;
                if n == 0 {
                    bail!("hypervisor monitor stream closed unexpectedly");
                }
                if line.contains(MONITOR_PROMPT) {
                    return Ok(());
                }
            }
        })
        .await
        .context("timed out waiting for hypervisor monitor prompt")?
    }

    /// Orderly shutdown: ask the monitor to power down, wait for the process
    /// to exit within `graceful`, then escalate to SIGKILL.
    pub async fn shutdown(mut self, graceful: Duration) -> Result<()> {
        let _ = self.monitor_command("system_powerdown").await;
        match timeout(graceful, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            _ => {
                tracing::warn!("hypervisor did not exit gracefully, escalating to SIGKILL");
                self.child.start_kill().context("sending SIGKILL to hypervisor")?;
                self.child.wait().await.context("waiting for hypervisor after SIGKILL")?;
                Ok(())
            }
        }
    }
}

/// Launch the hypervisor for one Instance and wait for the monitor prompt,
/// bounded by `startup_timeout`.
pub async fn launch(binary: &str, spec: &LaunchSpec<'_>, startup_timeout: Duration) -> Result<HypervisorProcess> {
    let args = build_args(spec);

    let mut child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning hypervisor {binary}"))?;

    let stdin = child.stdin.take().context("hypervisor stdin not piped")?;
    let stdout = BufReader::new(child.stdout.take().context("hypervisor stdout not piped")?);

    let mut process = HypervisorProcess { child, stdin, stdout };
    process.wait_for_prompt(startup_timeout).await?;
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec<'a>(
        image: &'a Path,
        seed_iso: &'a Path,
        exchange_dir: &'a Path,
        testbed_package_dir: &'a Path,
        control_socket: &'a Path,
        nics: &'a [NicSpec<'a>],
    ) -> LaunchSpec<'a> {
        LaunchSpec {
            cores: 2,
            memory_mb: 1024,
            nic_model: "virtio-net-pci",
            image,
            seed_iso,
            nics,
            exchange_dir,
            testbed_package_dir,
            control_socket,
            disable_kvm: false,
        }
    }

    #[test]
    fn test_build_args_includes_kvm_and_snapshot() {
        let nics = [NicSpec { tap: "ptb-t-aaaaaaaa", mac: "02:aa:bb:cc:dd:00" }];
        let spec = sample_spec(
            Path::new("/img/base.img"),
            Path::new("/tmp/seed.iso"),
            Path::new("/tmp/exchange"),
            Path::new("/tmp/tbp"),
            Path::new("/tmp/mgmt.sock"),
            &nics,
        );
        let args = build_args(&spec);

        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(args.contains(&"-snapshot".to_string()));
        assert!(args.iter().any(|a| a.contains("mount_tag=exchange")));
        assert!(args.iter().any(|a| a.contains("mount_tag=tbp")));
        assert!(args.iter().any(|a| a.contains("ifname=ptb-t-aaaaaaaa")));
    }

    #[test]
    fn test_build_args_omits_kvm_when_disabled() {
        let nics = [];
        let mut spec = sample_spec(
            Path::new("/img/base.img"),
            Path::new("/tmp/seed.iso"),
            Path::new("/tmp/exchange"),
            Path::new("/tmp/tbp"),
            Path::new("/tmp/mgmt.sock"),
            &nics,
        );
        spec.disable_kvm = true;
        let args = build_args(&spec);
        assert!(!args.contains(&"-enable-kvm".to_string()));
    }
}
