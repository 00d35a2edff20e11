use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Requests the registry can deliver to the task supervising a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Ask the process to exit (SIGTERM on unix).
    Terminate,
    /// Kill it outright.
    Kill,
}

/// The registry's view of one live process.
///
/// Only the supervising task touches the OS child; the handle carries the
/// channel used to reach that task.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
}

impl ExecutionHandle {
    pub fn new(pid: Option<u32>) -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, rx) = mpsc::unbounded_channel();
        (Self { pid, control }, rx)
    }

    fn send(&self, message: Control) -> bool {
        self.control.send(message).is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("execution '{0}' is already registered")]
pub struct DuplicateExecution(pub String);

/// Live process handles keyed by execution id.
///
/// Cloning shares the same underlying map. Each executor owns its own
/// registry so independent instances never see each other's processes.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    inner: Arc<Mutex<HashMap<String, ExecutionHandle>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExecutionHandle>> {
        // a panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: &str, handle: ExecutionHandle) -> Result<(), DuplicateExecution> {
        let mut map = self.lock();
        if map.contains_key(id) {
            return Err(DuplicateExecution(id.to_string()));
        }
        map.insert(id.to_string(), handle);
        Ok(())
    }

    /// Returns whether an entry was actually removed.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn broadcast(&self, message: Control) -> usize {
        self.lock()
            .iter()
            .filter(|(id, handle)| {
                let delivered = handle.send(message);
                if !delivered {
                    debug!(execution = %id, ?message, "supervisor already gone");
                }
                delivered
            })
            .count()
    }

    /// Terminate every registered process, escalate to a kill after `grace`,
    /// then empty the registry regardless of what is left in it.
    pub async fn shutdown(&self, grace: Duration) {
        let pending = self.len();
        if pending == 0 {
            self.lock().clear();
            return;
        }

        info!(pending, grace_ms = grace.as_millis() as u64, "terminating active executions");
        self.broadcast(Control::Terminate);

        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20).min(grace)).await;
        }

        let survivors = self.ids();
        if !survivors.is_empty() {
            warn!(count = survivors.len(), ?survivors, "force killing executions after grace period");
            self.broadcast(Control::Kill);
        }

        self.lock().clear();
    }
}

/// Removes the registry entry when dropped, unless it was already removed.
///
/// Backstops the terminal transition so an early return or a cancelled
/// supervisor never strands an entry.
pub(crate) struct RegistryEntryGuard {
    registry: ExecutionRegistry,
    id: String,
}

impl RegistryEntryGuard {
    pub(crate) fn new(registry: ExecutionRegistry, id: String) -> Self {
        Self { registry, id }
    }

    pub(crate) fn release(&self) -> bool {
        self.registry.remove(&self.id)
    }
}

impl Drop for RegistryEntryGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_handle_per_id() {
        let registry = ExecutionRegistry::new();
        let (first, _rx1) = ExecutionHandle::new(Some(1));
        let (second, _rx2) = ExecutionHandle::new(Some(2));

        registry.insert("exec-1", first).unwrap();
        let err = registry.insert("exec-1", second).unwrap_err();
        assert_eq!(err.to_string(), "execution 'exec-1' is already registered");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_happens_once() {
        let registry = ExecutionRegistry::new();
        let (handle, _rx) = ExecutionHandle::new(None);
        registry.insert("exec-1", handle).unwrap();

        assert!(registry.remove("exec-1"));
        assert!(!registry.remove("exec-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state_but_instances_do_not() {
        let a = ExecutionRegistry::new();
        let shared = a.clone();
        let b = ExecutionRegistry::new();

        let (handle, _rx) = ExecutionHandle::new(None);
        a.insert("exec-1", handle).unwrap();

        assert!(shared.contains("exec-1"));
        assert!(!b.contains("exec-1"));
    }

    #[test]
    fn guard_removes_entry_on_drop() {
        let registry = ExecutionRegistry::new();
        let (handle, _rx) = ExecutionHandle::new(None);
        registry.insert("exec-1", handle).unwrap();
        {
            let _guard = RegistryEntryGuard::new(registry.clone(), "exec-1".into());
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_escalates_and_empties_registry() {
        let registry = ExecutionRegistry::new();
        let (cooperative, mut cooperative_rx) = ExecutionHandle::new(Some(10));
        let (stubborn, mut stubborn_rx) = ExecutionHandle::new(Some(11));
        registry.insert("cooperative", cooperative).unwrap();
        registry.insert("stubborn", stubborn).unwrap();

        // the cooperative supervisor exits on terminate; the stubborn one ignores it
        let coop_registry = registry.clone();
        tokio::spawn(async move {
            if cooperative_rx.recv().await == Some(Control::Terminate) {
                coop_registry.remove("cooperative");
            }
        });
        let stubborn_seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = stubborn_rx.recv().await {
                seen.push(message);
            }
            seen
        });

        registry.shutdown(Duration::from_millis(100)).await;
        assert!(registry.is_empty());

        // dropping the registry's handles closes the stubborn channel
        let seen = stubborn_seen.await.unwrap();
        assert_eq!(seen, vec![Control::Terminate, Control::Kill]);
    }

    #[tokio::test]
    async fn shutdown_on_empty_registry_returns_immediately() {
        let registry = ExecutionRegistry::new();
        let started = std::time::Instant::now();
        registry.shutdown(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
