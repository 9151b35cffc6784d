//! Runs the Instance's setup script, grounded in
//! `original_source/instance-manager/manager_main.py`'s `main()` steps 2.2-2.3
//! (fetch, chmod, `chdir`, environment injection, `/bin/bash <script>`).
//!
//! The Python original downloads the script from an HTTP file server; this
//! port reads it directly off the read-only testbed-package 9p mount instead,
//! since that mount already carries the whole package by the time `initialize`
//! arrives.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Copies `script` (a path relative to the testbed package) into a scratch
/// directory, marks it executable, and runs it with `environment` merged
/// into the child's environment and the scratch directory as its cwd.
pub async fn run_setup_script(
    testbed_package_dir: &Path,
    script: &str,
    environment: &HashMap<String, String>,
) -> Result<()> {
    let source = testbed_package_dir.join(script);
    if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        bail!("setup script '{script}' not found in testbed package");
    }

    let exec_dir = tempfile::tempdir().context("creating setup script scratch directory")?;
    let basename = Path::new(script).file_name().and_then(|n| n.to_str()).unwrap_or(script);
    let dest = exec_dir.path().join(basename);
    tokio::fs::copy(&source, &dest).await.context("copying setup script to scratch dir")?;

    let mut perms = tokio::fs::metadata(&dest).await?.permissions();
    perms.set_mode(0o744);
    tokio::fs::set_permissions(&dest, perms).await?;

    let output = Command::new("/bin/bash")
        .arg(basename)
        .current_dir(exec_dir.path())
        .envs(environment)
        .output()
        .await
        .context("running setup script")?;

    if !output.status.success() {
        bail!(
            "setup script failed ({})\nSTDOUT: {}\nSTDERR: {}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_setup_script_succeeds_and_sees_environment() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("setup.sh"), "#!/bin/bash\n[ \"$FOO\" = \"bar\" ] || exit 1\n")
            .await
            .unwrap();

        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        run_setup_script(dir.path(), "setup.sh", &env).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_setup_script_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_setup_script(dir.path(), "ghost.sh", &HashMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_run_setup_script_surfaces_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("fail.sh"), "#!/bin/bash\nexit 3\n").await.unwrap();
        assert!(run_setup_script(dir.path(), "fail.sh", &HashMap::new()).await.is_err());
    }
}
