use std::path::Path;

use anyhow::{Context, Result};

use ptb_core::config::MACHINE_STATE_FILE;
use ptb_core::instance::PersistedInstanceState;
use ptb_core::naming::INTERCHANGE_DIR_PREFIX;

/// Load every interchange directory's persisted instance state found under
/// `base`. Entries whose `state.json` is missing or unparsable are skipped —
/// such a directory is either mid-setup or left over from a crash, and
/// `prune` will reclaim it once its owning process is confirmed gone.
pub fn scan(base: &Path) -> Result<Vec<PersistedInstanceState>> {
    let mut found = Vec::new();
    if !base.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(base).with_context(|| format!("reading {}", base.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(INTERCHANGE_DIR_PREFIX) || !path.is_dir() {
            continue;
        }
        let state_path = path.join(MACHINE_STATE_FILE);
        let Ok(raw) = std::fs::read_to_string(&state_path) else {
            continue;
        };
        let Ok(state) = serde_json::from_str::<PersistedInstanceState>(&raw) else {
            continue;
        };
        found.push(state);
    }
    Ok(found)
}

/// Whether the process that wrote a persisted state is still the one
/// running: the pid must exist and its `/proc/<pid>/cmdline` must still
/// contain the recorded command line (pids get reused).
pub fn is_process_running(pid: u32, expected_cmdline: &str) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(bytes) => {
            let cmdline = String::from_utf8_lossy(&bytes).replace('\0', " ");
            cmdline.contains(expected_cmdline.trim())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptb_core::instance::InterfaceMapping;

    fn sample_state(uuid: uuid::Uuid) -> PersistedInstanceState {
        PersistedInstanceState {
            name: "alice".to_string(),
            uuid,
            pid: 1,
            cmdline: "ptb run testbed.json".to_string(),
            experiment: "run-1".to_string(),
            mgmt_ip: "10.0.0.5".to_string(),
            interfaces: vec![InterfaceMapping {
                index: 0,
                bridge: "ptb-b-aaaaaaaa".to_string(),
                tap: "ptb-t-aaaaaaaa".to_string(),
                mac: "02:aa:bb:cc:dd:00".to_string(),
            }],
        }
    }

    #[test]
    fn test_scan_finds_interchange_dirs_with_state() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = uuid::Uuid::new_v4();
        let instance_dir = dir.path().join(format!("{INTERCHANGE_DIR_PREFIX}{uuid}"));
        std::fs::create_dir_all(&instance_dir).unwrap();
        let state = sample_state(uuid);
        std::fs::write(
            instance_dir.join(MACHINE_STATE_FILE),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();

        let found = scan(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "alice");
    }

    #[test]
    fn test_scan_skips_dirs_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("not-an-interchange-dir")).unwrap();
        let found = scan(dir.path()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_is_process_running_pid1_exists() {
        // pid 1 always exists on a running Linux system (init/systemd).
        assert!(std::path::Path::new("/proc/1/cmdline").exists());
    }

    #[test]
    fn test_is_process_running_rejects_nonexistent_pid() {
        assert!(!is_process_running(u32::MAX, "anything"));
    }
}
