//! Checkpoint/snapshot persistence marker (§4.11): a sentinel file in the
//! exchange mount written on first successful `initialize` and checked on
//! every subsequent boot, so a snapshot-restored Instance skips re-running
//! the setup script.

use std::path::Path;

use anyhow::{Context, Result};

const MARKER_FILENAME: &str = ".ptb-initialized";

pub async fn is_present(exchange_mount: &Path) -> bool {
    tokio::fs::try_exists(exchange_mount.join(MARKER_FILENAME)).await.unwrap_or(false)
}

pub async fn write(exchange_mount: &Path) -> Result<()> {
    let path = exchange_mount.join(MARKER_FILENAME);
    tokio::fs::write(&path, crate::clock::utc_now_rfc3339().as_bytes())
        .await
        .with_context(|| format!("writing persistence marker {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_marker_absent_then_present_after_write() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_present(dir.path()).await);
        write(dir.path()).await.unwrap();
        assert!(is_present(dir.path()).await);
    }
}
