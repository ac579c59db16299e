//! Registry of in-flight OS processes.
//!
//! Maps a backend command id to the live child it spawned. Exclusive
//! ownership of each entry lives here from registration until removal;
//! removal happens exactly once, whichever of natural exit or explicit
//! cancellation gets there first.

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A process tracked by the registry.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Concurrent map from command id to live process handle.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned process under the given command id.
    ///
    /// A duplicate id is a caller bug; it is logged and the newer handle
    /// wins rather than crashing the agent.
    pub fn register(&self, id: &str, pid: u32) {
        let entry = ManagedProcess {
            pid,
            started_at: Utc::now(),
        };
        let mut map = self.lock();
        if let Some(old) = map.insert(id.to_string(), entry) {
            warn!(
                "duplicate registration for command {id}: replacing pid {} with {pid}",
                old.pid
            );
        }
    }

    /// Look up the live process for a command id, if any.
    pub fn lookup(&self, id: &str) -> Option<ManagedProcess> {
        self.lock().get(id).cloned()
    }

    /// Remove and return the entry for a command id. Idempotent: a second
    /// removal (or removal of an unknown id) returns `None`.
    pub fn remove(&self, id: &str) -> Option<ManagedProcess> {
        self.lock().remove(id)
    }

    /// Number of tracked processes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `sig` to every tracked process and clear the registry.
    ///
    /// Works on a snapshot so concurrent registration cannot deadlock the
    /// sweep; no ordering is guaranteed among the terminated processes.
    /// Safe to call repeatedly: the second sweep sees an empty map.
    pub fn terminate_all(&self, sig: Signal) -> usize {
        let snapshot: HashMap<String, ManagedProcess> = std::mem::take(&mut *self.lock());
        for (id, proc) in &snapshot {
            debug!("terminating process for command {id} (pid {}, {sig})", proc.pid);
            send_signal(proc.pid, sig);
        }
        snapshot.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Deliver a signal to a single process, tolerating the usual races.
///
/// ESRCH means the process is already gone, which is an expected outcome
/// during shutdown sweeps. PIDs 0 and 1 are never targeted.
pub fn send_signal(pid: u32, sig: Signal) {
    if pid <= 1 {
        warn!("refusing to signal pid {pid}");
        return;
    }
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => debug!("sent {sig} to pid {pid}"),
        Err(nix::errno::Errno::ESRCH) => debug!("pid {pid} already exited"),
        Err(e) => warn!("failed to send {sig} to pid {pid}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_remove() {
        let registry = ProcessRegistry::new();
        registry.register("cmd-1", 4242);

        let proc = registry.lookup("cmd-1").unwrap();
        assert_eq!(proc.pid, 4242);

        let removed = registry.remove("cmd-1").unwrap();
        assert_eq!(removed.pid, 4242);
        assert!(registry.lookup("cmd-1").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ProcessRegistry::new();
        registry.register("cmd-1", 4242);

        assert!(registry.remove("cmd-1").is_some());
        assert!(registry.remove("cmd-1").is_none());
        assert!(registry.remove("never-registered").is_none());
    }

    #[test]
    fn duplicate_registration_keeps_newer_handle() {
        let registry = ProcessRegistry::new();
        registry.register("cmd-1", 100);
        registry.register("cmd-1", 200);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("cmd-1").unwrap().pid, 200);
    }

    #[test]
    fn terminate_all_clears_and_is_safe_twice() {
        let registry = ProcessRegistry::new();
        // PIDs that certainly do not exist; ESRCH is tolerated.
        registry.register("cmd-1", 4_000_001);
        registry.register("cmd-2", 4_000_002);

        assert_eq!(registry.terminate_all(Signal::SIGTERM), 2);
        assert!(registry.is_empty());

        // Second sweep: nothing to do, no error, no double-signal.
        assert_eq!(registry.terminate_all(Signal::SIGKILL), 0);
    }

    #[test]
    fn send_signal_refuses_protected_pids() {
        // Must not panic or actually signal init.
        send_signal(0, Signal::SIGKILL);
        send_signal(1, Signal::SIGKILL);
    }

    #[test]
    fn concurrent_register_and_remove_do_not_lose_entries() {
        use std::sync::Arc;

        let registry = Arc::new(ProcessRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let reg = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    let id = format!("cmd-{i}-{j}");
                    reg.register(&id, 4_100_000 + i * 100 + j);
                    assert!(reg.lookup(&id).is_some());
                    assert!(reg.remove(&id).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());
    }
}
