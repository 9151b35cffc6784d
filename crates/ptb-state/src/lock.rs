use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;

use ptb_core::config::GLOBAL_LOCKFILE;

/// Advisory lock guarding the whole state directory. Every mutation of the
/// reservation map or experiment registry happens while this is held, so
/// concurrent `ptb` invocations on the same host serialize around it.
pub struct StateLock {
    file: std::fs::File,
}

impl StateLock {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(state_dir, std::fs::Permissions::from_mode(0o777)).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(state_dir.join(GLOBAL_LOCKFILE))
            .context("opening global state lockfile")?;
        Ok(StateLock { file })
    }

    /// Block until the lock is held, returning a guard that releases it on drop.
    pub fn lock(&self) -> Result<StateLockGuard<'_>> {
        self.file
            .lock_exclusive()
            .context("acquiring global state lock")?;
        Ok(StateLockGuard { lock: self })
    }
}

pub struct StateLockGuard<'a> {
    lock: &'a StateLock,
}

impl Drop for StateLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.file.unlock();
    }
}
