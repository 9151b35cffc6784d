//! §4.5: Instance State Manager. Owns the per-Instance lifecycle state and
//! the `wait_for_all` rendezvous primitive, mirroring the Python
//! `MachineStateManager`/`MachineState` pair.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use ptb_core::instance::{InstanceLifecycleState, validate_transition};
use tokio::sync::{Mutex, Notify};

/// Result of a `wait_for_all` rendezvous. Precedence on simultaneous causes
/// is `Interrupted > Timeout > Shutdown > Failed > Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ok,
    Failed,
    Timeout,
    Interrupted,
    Shutdown,
}

/// Per-Instance bookkeeping: lifecycle state plus the interchange directory
/// handle the Controller owns for it.
pub struct InstanceEntry {
    pub name: String,
    state: InstanceLifecycleState,
    pub interchange_dir: Option<PathBuf>,
    pub mgmt_ip: Option<String>,
}

impl InstanceEntry {
    fn new(name: &str) -> Self {
        InstanceEntry {
            name: name.to_string(),
            state: InstanceLifecycleState::Unknown,
            interchange_dir: None,
            mgmt_ip: None,
        }
    }

    pub fn state(&self) -> InstanceLifecycleState {
        self.state
    }
}

struct Inner {
    machines: HashMap<String, InstanceEntry>,
    change_counter: u64,
}

/// The rendezvous + bookkeeping manager shared by the Controller's per-
/// Instance tasks. Mirrors `MachineStateManager`: a single lock guards
/// transitions and is held only for the in-memory update, never across I/O.
pub struct StateManager {
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: AtomicBool,
    interrupted: AtomicBool,
}

impl StateManager {
    pub fn new(instance_names: impl IntoIterator<Item = String>) -> Self {
        let machines = instance_names
            .into_iter()
            .map(|name| {
                let entry = InstanceEntry::new(&name);
                (name, entry)
            })
            .collect();
        StateManager {
            inner: Mutex::new(Inner { machines, change_counter: 0 }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Transition one Instance's state, validating the move and waking any
    /// `wait_for_all` rendezvous that might now be satisfied.
    pub async fn transition(&self, instance: &str, to: InstanceLifecycleState) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .machines
                .get_mut(instance)
                .ok_or_else(|| anyhow::anyhow!("unknown Instance '{instance}'"))?;
            if entry.state == to {
                return Ok(());
            }
            validate_transition(entry.state, to)?;
            entry.state = to;
            inner.change_counter += 1;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn set_interchange_dir(&self, instance: &str, dir: PathBuf) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .machines
            .get_mut(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown Instance '{instance}'"))?;
        entry.interchange_dir = Some(dir);
        Ok(())
    }

    pub async fn set_mgmt_ip(&self, instance: &str, ip: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .machines
            .get_mut(instance)
            .ok_or_else(|| anyhow::anyhow!("unknown Instance '{instance}'"))?;
        entry.mgmt_ip = Some(ip);
        Ok(())
    }

    pub async fn state_of(&self, instance: &str) -> Option<InstanceLifecycleState> {
        self.inner.lock().await.machines.get(instance).map(|e| e.state())
    }

    pub async fn all_states(&self) -> Vec<(String, InstanceLifecycleState)> {
        self.inner
            .lock()
            .await
            .machines
            .values()
            .map(|e| (e.name.clone(), e.state()))
            .collect()
    }

    /// Request an interrupt (SIGINT/SIGTERM at the Controller top-level):
    /// any in-flight or future `wait_for_all` returns `Interrupted` at once.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Request a shutdown rendezvous short-circuit, separate from an
    /// operator interrupt (e.g. a clean early-exit signal).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Block until every Instance reaches `expected`, any Instance reaches
    /// `Failed`, the timeout elapses, or an interrupt/shutdown is signalled.
    pub async fn wait_for_all(&self, expected: InstanceLifecycleState, timeout: Duration) -> WaitResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Precedence on simultaneous causes: Interrupted > Timeout >
            // Shutdown > Failed > Ok, matching the doc comment above.
            if self.is_interrupted() {
                return WaitResult::Interrupted;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return WaitResult::Timeout;
            }

            if self.shutdown.swap(false, Ordering::SeqCst) {
                return WaitResult::Shutdown;
            }

            {
                let inner = self.inner.lock().await;
                if inner.machines.values().any(|e| e.state() == InstanceLifecycleState::Failed) {
                    return WaitResult::Failed;
                }
                if inner.machines.values().all(|e| e.state() == expected) {
                    return WaitResult::Ok;
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub async fn change_counter(&self) -> u64 {
        self.inner.lock().await.change_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceLifecycleState::*;

    #[tokio::test]
    async fn test_wait_for_all_succeeds_once_every_instance_transitions() {
        let mgr = StateManager::new(["alice".to_string(), "bob".to_string()]);

        let waiter = {
            let mgr = &mgr;
            async move { mgr.wait_for_all(Started, Duration::from_secs(2)).await }
        };

        let driver = async {
            mgr.transition("alice", Started).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            mgr.transition("bob", Started).await.unwrap();
        };

        let (result, _) = tokio::join!(waiter, driver);
        assert_eq!(result, WaitResult::Ok);
    }

    #[tokio::test]
    async fn test_wait_for_all_short_circuits_on_failure() {
        let mgr = StateManager::new(["alice".to_string(), "bob".to_string()]);
        mgr.transition("alice", Started).await.unwrap();
        mgr.transition("bob", Failed).await.unwrap();

        let result = mgr.wait_for_all(Initialized, Duration::from_millis(200)).await;
        assert_eq!(result, WaitResult::Failed);
    }

    #[tokio::test]
    async fn test_wait_for_all_times_out() {
        let mgr = StateManager::new(["alice".to_string()]);
        let result = mgr.wait_for_all(Started, Duration::from_millis(50)).await;
        assert_eq!(result, WaitResult::Timeout);
    }

    #[tokio::test]
    async fn test_interrupt_short_circuits_wait() {
        let mgr = StateManager::new(["alice".to_string()]);
        mgr.interrupt();
        let result = mgr.wait_for_all(Started, Duration::from_secs(5)).await;
        assert_eq!(result, WaitResult::Interrupted);
    }

    #[tokio::test]
    async fn test_shutdown_outranks_failed() {
        let mgr = StateManager::new(["alice".to_string()]);
        mgr.transition("alice", Failed).await.unwrap();
        mgr.request_shutdown();
        let result = mgr.wait_for_all(Initialized, Duration::from_secs(5)).await;
        assert_eq!(result, WaitResult::Shutdown);
    }

    #[tokio::test]
    async fn test_timeout_outranks_shutdown() {
        let mgr = StateManager::new(["alice".to_string()]);
        mgr.request_shutdown();
        let result = mgr.wait_for_all(Initialized, Duration::ZERO).await;
        assert_eq!(result, WaitResult::Timeout);
    }

    #[test]
    fn test_invalid_transition_rejected_via_validate_transition() {
        assert!(validate_transition(Unknown, Initialized).is_err());
    }
}
