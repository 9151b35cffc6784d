//! `run-program` Application, grounded in
//! `original_source/applications/run_program_application.py`.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::interface::AppInterface;

#[derive(Debug, Clone, Deserialize)]
pub struct RunProgramConfig {
    pub command: String,
    #[serde(default)]
    pub ignore_timeout: bool,
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
}

/// Result of resolving `command` against the testbed package root at load
/// time, mirroring `RunProgramApplication.set_and_validate_config`.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    executable: PathBuf,
    args: String,
    relative: PathBuf,
    from_testbed_package: bool,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o777);
    std::fs::set_permissions(path, perms)
}

/// Splits `command` into its executable and argument string, resolves a
/// relative executable against `testbed_package_dir`, and ensures it exists
/// and is executable — chmod'ing it (matching the Python fallback) only when
/// the executable lives outside the testbed package.
pub fn resolve(config: &RunProgramConfig, testbed_package_dir: &Path) -> anyhow::Result<ResolvedCommand> {
    let mut parts = config.command.splitn(2, ' ');
    let first = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or_default().to_string();
    let relative = PathBuf::from(first);

    let (executable, from_testbed_package) = if relative.is_absolute() {
        (relative.clone(), false)
    } else {
        (testbed_package_dir.join(&relative), true)
    };

    if !executable.exists() {
        if from_testbed_package {
            anyhow::bail!("unable to find file: 'TESTBED-PACKAGE/{}'", relative.display());
        }
        anyhow::bail!("unable to find file: '{}'", executable.display());
    }

    if !is_executable(&executable) {
        if from_testbed_package {
            anyhow::bail!("file 'TESTBED-PACKAGE/{}' is not executable", relative.display());
        }
        make_executable(&executable)
            .map_err(|err| anyhow::anyhow!("unable to make '{}' executable: {err}", executable.display()))?;
    }

    Ok(ResolvedCommand {
        executable,
        args,
        relative,
        from_testbed_package,
    })
}

fn label(resolved: &ResolvedCommand) -> String {
    if resolved.from_testbed_package {
        format!("TESTBED-PACKAGE/{}", resolved.relative.display())
    } else {
        resolved.executable.display().to_string()
    }
}

pub async fn run(
    config: &RunProgramConfig,
    resolved: &ResolvedCommand,
    runtime: u64,
    _interface: &AppInterface,
) -> anyhow::Result<bool> {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(format!("{} {}", resolved.executable.display(), resolved.args));

    if let Some(environment) = &config.environment {
        for (key, value) in environment {
            command.env(key, value);
        }
    }

    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| anyhow::anyhow!("unable to run program '{}': {err}", label(resolved)))?;

    match tokio::time::timeout(Duration::from_secs(runtime), child.wait()).await {
        Ok(status_result) => {
            let status = status_result?;
            if !status.success() {
                let mut stdout_buf = String::new();
                let mut stderr_buf = String::new();
                if let Some(mut out) = child.stdout.take() {
                    out.read_to_string(&mut stdout_buf).await.ok();
                }
                if let Some(mut err) = child.stderr.take() {
                    err.read_to_string(&mut stderr_buf).await.ok();
                }
                anyhow::bail!(
                    "program '{}' exited with code {}.\nSTDOUT: {stdout_buf}\nSTDERR: {stderr_buf}",
                    label(resolved),
                    status.code().unwrap_or(-1),
                );
            }
            Ok(true)
        }
        Err(_) => {
            child.kill().await.ok();
            if config.ignore_timeout {
                Ok(true)
            } else {
                anyhow::bail!("timeout during program execution of '{}'", label(resolved));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> RunProgramConfig {
        RunProgramConfig {
            command: command.to_string(),
            ignore_timeout: false,
            environment: None,
        }
    }

    #[test]
    fn test_resolve_absolute_existing_executable() {
        let resolved = resolve(&config("/bin/echo hello world"), Path::new("/nonexistent")).unwrap();
        assert_eq!(resolved.args, "hello world");
        assert!(!resolved.from_testbed_package);
    }

    #[test]
    fn test_resolve_missing_relative_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&config("no-such-script.sh"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("TESTBED-PACKAGE"));
    }

    #[test]
    fn test_resolve_chmods_non_executable_outside_package() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&script, perms).unwrap();

        let resolved = resolve(&config(&script.display().to_string()), Path::new("/nonexistent")).unwrap();
        assert!(is_executable(&resolved.executable));
    }

    #[tokio::test]
    async fn test_run_reports_success() {
        let cfg = config("/bin/true");
        let resolved = resolve(&cfg, Path::new("/nonexistent")).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let interface = AppInterface::new("runner", tx);
        assert!(run(&cfg, &resolved, 5, &interface).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_surfaces_non_zero_exit() {
        let cfg = config("/bin/false");
        let resolved = resolve(&cfg, Path::new("/nonexistent")).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let interface = AppInterface::new("runner", tx);
        assert!(run(&cfg, &resolved, 5, &interface).await.is_err());
    }

    #[tokio::test]
    async fn test_run_honours_ignore_timeout() {
        let mut cfg = config("/bin/sleep 5");
        cfg.ignore_timeout = true;
        let resolved = resolve(&cfg, Path::new("/nonexistent")).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let interface = AppInterface::new("runner", tx);
        assert!(run(&cfg, &resolved, 1, &interface).await.unwrap());
    }
}
