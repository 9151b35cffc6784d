use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Per-Instance lifecycle state (§4.5). Backward motion is only ever to
/// `Disconnected` (transport loss) or the terminal `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycleState {
    Unknown,
    Started,
    Initialized,
    AppsInstalled,
    AppsReady,
    InExperiment,
    Finished,
    FilesPreserved,
    Disconnected,
    Failed,
}

impl std::fmt::Display for InstanceLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Started => "started",
            Self::Initialized => "initialized",
            Self::AppsInstalled => "apps_installed",
            Self::AppsReady => "apps_ready",
            Self::InExperiment => "in_experiment",
            Self::Finished => "finished",
            Self::FilesPreserved => "files_preserved",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Validate a state transition per the §4.5 state machine. Any state may
/// move to `Failed`; a forward-only chain is otherwise enforced, with
/// `Disconnected` the sole permitted backward move.
pub fn validate_transition(
    from: InstanceLifecycleState,
    to: InstanceLifecycleState,
) -> Result<()> {
    use InstanceLifecycleState::*;

    if to == Failed {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (Unknown, Started)
            | (Started, Initialized)
            | (Initialized, AppsInstalled)
            | (AppsInstalled, AppsReady)
            | (AppsReady, InExperiment)
            | (InExperiment, Finished)
            | (Finished, FilesPreserved)
            | (FilesPreserved, Disconnected)
            // transport loss can be observed from any live state
            | (Started, Disconnected)
            | (Initialized, Disconnected)
            | (AppsInstalled, Disconnected)
            | (AppsReady, Disconnected)
            | (InExperiment, Disconnected)
            | (Finished, Disconnected)
    );

    if valid {
        Ok(())
    } else {
        bail!("invalid Instance state transition: {} -> {}", from, to)
    }
}

/// Bridge ↔ TAP ↔ MAC binding for one NIC. Index 0 is reserved for the
/// management network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceMapping {
    pub index: u8,
    pub bridge: String,
    pub tap: String,
    pub mac: String,
}

/// Per-Instance state persisted to `state.json` in the interchange directory (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInstanceState {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub pid: u32,
    pub cmdline: String,
    pub experiment: String,
    pub mgmt_ip: String,
    pub interfaces: Vec<InterfaceMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceLifecycleState::*;

    #[test]
    fn test_forward_chain_is_valid() {
        assert!(validate_transition(Unknown, Started).is_ok());
        assert!(validate_transition(Started, Initialized).is_ok());
        assert!(validate_transition(Initialized, AppsInstalled).is_ok());
        assert!(validate_transition(AppsInstalled, AppsReady).is_ok());
        assert!(validate_transition(AppsReady, InExperiment).is_ok());
        assert!(validate_transition(InExperiment, Finished).is_ok());
        assert!(validate_transition(Finished, FilesPreserved).is_ok());
        assert!(validate_transition(FilesPreserved, Disconnected).is_ok());
    }

    #[test]
    fn test_failed_reachable_from_any_state() {
        for state in [
            Unknown,
            Started,
            Initialized,
            AppsInstalled,
            AppsReady,
            InExperiment,
            Finished,
            FilesPreserved,
            Disconnected,
        ] {
            assert!(
                validate_transition(state, Failed).is_ok(),
                "{state} -> Failed should be valid"
            );
        }
    }

    #[test]
    fn test_skipping_states_is_invalid() {
        assert!(validate_transition(Unknown, Initialized).is_err());
        assert!(validate_transition(Started, AppsReady).is_err());
        assert!(validate_transition(Finished, Started).is_err());
    }

    #[test]
    fn test_disconnected_is_the_only_backward_move() {
        assert!(validate_transition(InExperiment, Disconnected).is_ok());
        assert!(validate_transition(InExperiment, Started).is_err());
    }

    #[test]
    fn test_display_matches_wire_tags() {
        assert_eq!(InExperiment.to_string(), "in_experiment");
        assert_eq!(AppsInstalled.to_string(), "apps_installed");
    }

    #[test]
    fn test_persisted_state_roundtrip() {
        let state = PersistedInstanceState {
            name: "alice".to_string(),
            uuid: uuid::Uuid::new_v4(),
            pid: 4242,
            cmdline: "firecracker --api-sock /tmp/x.sock".to_string(),
            experiment: "run-1".to_string(),
            mgmt_ip: "10.0.0.5".to_string(),
            interfaces: vec![InterfaceMapping {
                index: 0,
                bridge: "ptb-b-aaaaaaaa".to_string(),
                tap: "ptb-t-aaaaaaaa".to_string(),
                mac: "02:aa:bb:cc:dd:00".to_string(),
            }],
        };
        let json = serde_json::to_string(&state).unwrap();
        let parsed: PersistedInstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "alice");
        assert_eq!(parsed.interfaces.len(), 1);
    }
}
