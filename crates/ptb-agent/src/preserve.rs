//! Accumulates paths to preserve and copies them into the exchange mount at
//! `finish`, grounded in
//! `original_source/instance-manager/preserve_handler.py`'s `PreserveHandler`.
//!
//! Unlike the Python original, there is no dedicated downstream wire message
//! for a live Application's `preserve_file()` call (see `ptb-apps::interface`
//! doc comment) — paths reported by a running Application arrive locally via
//! `AppEvent::Preserve` and are folded into the same set as the explicit
//! `Finish{preserve_files}` list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

#[derive(Debug, Default)]
pub struct PreserveSet {
    paths: HashSet<String>,
}

impl PreserveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    pub fn extend(&mut self, paths: impl IntoIterator<Item = String>) {
        self.paths.extend(paths);
    }

    /// Copies every preserved path into `exchange_mount`, skipping paths that
    /// are not absolute, already live under the exchange mount, or no longer
    /// exist — each skip is logged rather than failing the whole batch,
    /// mirroring `PreserveHandler.preserve`'s per-file error reporting.
    pub async fn copy_into(&self, exchange_mount: &Path) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            return Ok(());
        }

        for raw in &self.paths {
            let path = PathBuf::from(raw);
            if !path.is_absolute() {
                warn!(path = %raw, "unable to preserve: not an absolute path");
                continue;
            }
            if raw.starts_with(&*exchange_mount.to_string_lossy()) {
                continue;
            }
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(path = %raw, "unable to preserve: path does not exist");
                continue;
            }

            let destination = exchange_mount.join(raw.trim_start_matches('/'));
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating preserve destination dir {}", parent.display()))?;
            }
            copy_recursive(&path, &destination).await.with_context(|| format!("preserving '{raw}'"))?;
        }
        Ok(())
    }
}

pub(crate) async fn copy_recursive(source: &Path, destination: &Path) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(source).await?;
    if metadata.is_dir() {
        tokio::fs::create_dir_all(destination).await?;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child_dest = destination.join(entry.file_name());
            Box::pin(copy_recursive(&entry.path(), &child_dest)).await?;
        }
    } else {
        tokio::fs::copy(source, destination).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_into_copies_absolute_existing_file() {
        let source_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let source_file = source_dir.path().join("result.log");
        tokio::fs::write(&source_file, b"data").await.unwrap();

        let mut set = PreserveSet::new();
        set.add(source_file.to_string_lossy().to_string());
        set.copy_into(dest_dir.path()).await.unwrap();

        let copied = dest_dir.path().join(source_file.to_string_lossy().trim_start_matches('/'));
        assert_eq!(tokio::fs::read(&copied).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_copy_into_skips_relative_and_missing_paths() {
        let dest_dir = tempfile::tempdir().unwrap();
        let mut set = PreserveSet::new();
        set.add("relative/path.log");
        set.add("/does/not/exist.log");
        // Neither entry should cause an error; both are silently skipped.
        set.copy_into(dest_dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_into_noop_when_empty() {
        let dest_dir = tempfile::tempdir().unwrap();
        let set = PreserveSet::new();
        set.copy_into(dest_dir.path()).await.unwrap();
    }
}
