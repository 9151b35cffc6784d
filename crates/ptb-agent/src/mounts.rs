//! Mounts the two 9p shares the hypervisor exports (`exchange`, read-write;
//! `tbp`, the read-only testbed package), grounded in
//! `original_source/instance-manager/preserve_handler.py`'s lazy
//! `mount -t 9p -o trans=virtio` invocation — generalised here to also cover
//! the testbed-package mount, which the Python original receives over HTTP
//! from a file server instead.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Idempotently mounts 9p share `tag` onto `target`, creating `target` first.
/// A no-op if `target` is already a mount point.
pub async fn ensure_9p_mount(tag: &str, target: &Path, readonly: bool) -> Result<()> {
    tokio::fs::create_dir_all(target)
        .await
        .with_context(|| format!("creating mount point {}", target.display()))?;

    if is_mounted(target).await? {
        return Ok(());
    }

    let mut opts = "trans=virtio,version=9p2000.L".to_string();
    if readonly {
        opts.push_str(",ro");
    }

    let output = Command::new("mount")
        .args(["-t", "9p", "-o", &opts, tag, &target.to_string_lossy()])
        .output()
        .await
        .with_context(|| format!("running mount for 9p share '{tag}'"))?;

    if !output.status.success() {
        bail!(
            "mounting 9p share '{tag}' at {} failed ({}):\n{}",
            target.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr),
        );
    }
    Ok(())
}

async fn is_mounted(target: &Path) -> Result<bool> {
    let mounts = tokio::fs::read_to_string("/proc/mounts")
        .await
        .context("reading /proc/mounts")?;
    let target = target.to_string_lossy();
    Ok(mounts.lines().any(|line| line.split_whitespace().nth(1) == Some(target.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_mounted_false_for_untracked_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mounted(dir.path()).await.unwrap());
    }
}
