//! Registry of running subprocesses keyed by command id.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use proto::{CommandId, WorkerError};
use serde::Serialize;
use tracing::{debug, info};

/// A live subprocess started for a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    /// Command the process was started for.
    pub command_id: CommandId,
    /// OS process id; also the process group id.
    pub pid: u32,
    /// When the process was registered.
    pub started_at: DateTime<Utc>,
    /// Token distinguishing this record from later ones reusing the id.
    pub registration: u64,
}

/// Concurrent map of running subprocesses
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: DashMap<CommandId, ProcessRecord>,
    next_registration: AtomicU64,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pid` under `command_id`. Fails if the id is already live.
    pub fn register(&self, command_id: CommandId, pid: u32) -> Result<ProcessRecord, WorkerError> {
        match self.records.entry(command_id.clone()) {
            Entry::Occupied(_) => Err(WorkerError::CommandIdInUse(command_id.to_string())),
            Entry::Vacant(slot) => {
                let record = ProcessRecord {
                    command_id,
                    pid,
                    started_at: Utc::now(),
                    registration: self.next_registration.fetch_add(1, Ordering::Relaxed),
                };
                slot.insert(record.clone());
                debug!(command_id = %record.command_id, pid, "Process registered");
                Ok(record)
            }
        }
    }

    /// Looks up a live record.
    pub fn get(&self, command_id: &CommandId) -> Option<ProcessRecord> {
        self.records.get(command_id).map(|r| r.value().clone())
    }

    /// Atomically removes and returns the record for `command_id`.
    pub fn take(&self, command_id: &CommandId) -> Option<ProcessRecord> {
        self.records.remove(command_id).map(|(_, record)| record)
    }

    /// Removes the record only if it still carries `registration`.
    ///
    /// Returns `false` when STOP already took the record or a newer command
    /// reused the id.
    pub fn release(&self, command_id: &CommandId, registration: u64) -> bool {
        self.records
            .remove_if(command_id, |_, record| record.registration == registration)
            .is_some()
    }

    /// Takes the record and sends SIGTERM to its process group.
    pub fn stop(&self, command_id: &CommandId) -> Result<ProcessRecord, WorkerError> {
        let record = self
            .take(command_id)
            .ok_or_else(|| WorkerError::ProcessNotFound(command_id.to_string()))?;
        terminate_group(&record)?;
        info!(command_id = %record.command_id, pid = record.pid, "Process group terminated");
        Ok(record)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when nothing is running.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copies all live records, oldest first.
    pub fn snapshot(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.registration);
        records
    }
}

#[cfg(unix)]
fn terminate_group(record: &ProcessRecord) -> Result<(), WorkerError> {
    use nix::errno::Errno;
    use nix::sys::signal::Signal;

    match signal_group(record.pid, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(WorkerError::ProcessNotFound(record.command_id.to_string())),
        Err(e) => Err(WorkerError::Signal {
            command_id: record.command_id.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn terminate_group(record: &ProcessRecord) -> Result<(), WorkerError> {
    Err(WorkerError::Signal {
        command_id: record.command_id.to_string(),
        reason: "process groups are not supported on this platform".to_string(),
    })
}

/// Sends `signal` to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    killpg(Pid::from_raw(pgid), signal)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn register_rejects_live_duplicates() {
        let registry = ProcessRegistry::new();
        registry
            .register(CommandId::from("c1"), 100)
            .expect("first register");
        let err = registry
            .register(CommandId::from("c1"), 101)
            .expect_err("duplicate");
        assert!(matches!(err, WorkerError::CommandIdInUse(ref id) if id == "c1"));
        assert_eq!(registry.get(&CommandId::from("c1")).map(|r| r.pid), Some(100));
    }

    #[test]
    fn take_removes_exactly_once() {
        let registry = ProcessRegistry::new();
        registry.register(CommandId::from("c1"), 7).expect("register");
        assert!(registry.take(&CommandId::from("c1")).is_some());
        assert!(registry.take(&CommandId::from("c1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_release_keeps_newer_record() {
        let registry = ProcessRegistry::new();
        let id = CommandId::from("reused");
        let old = registry.register(id.clone(), 1).expect("old");
        assert!(registry.take(&id).is_some());
        let new = registry.register(id.clone(), 2).expect("new");

        assert!(!registry.release(&id, old.registration));
        assert_eq!(registry.get(&id), Some(new.clone()));
        assert!(registry.release(&id, new.registration));
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn id_can_be_reused_after_release() {
        let registry = ProcessRegistry::new();
        let id = CommandId::from("c1");
        let first = registry.register(id.clone(), 1).expect("first");
        assert!(registry.release(&id, first.registration));
        let second = registry.register(id, 2).expect("second");
        assert!(second.registration > first.registration);
    }

    #[test]
    fn stop_unknown_id_is_not_found() {
        let registry = ProcessRegistry::new();
        let err = registry
            .stop(&CommandId::from("abc123"))
            .expect_err("unknown");
        assert_eq!(err.to_string(), "Subprocess abc123 not found.");
    }

    #[test]
    fn concurrent_take_and_release_clean_up_once() {
        for round in 0..200 {
            let registry = Arc::new(ProcessRegistry::new());
            let id = CommandId::from(format!("race-{round}"));
            let record = registry.register(id.clone(), 1).expect("register");
            let wins = Arc::new(AtomicUsize::new(0));

            let stopper = {
                let (registry, id, wins) = (registry.clone(), id.clone(), wins.clone());
                std::thread::spawn(move || {
                    if registry.take(&id).is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };
            let exiter = {
                let (registry, id, wins) = (registry.clone(), id.clone(), wins.clone());
                std::thread::spawn(move || {
                    if registry.release(&id, record.registration) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };
            stopper.join().expect("stopper");
            exiter.join().expect("exiter");

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn snapshot_is_ordered_by_registration() {
        let registry = ProcessRegistry::new();
        registry.register(CommandId::from("b"), 2).expect("b");
        registry.register(CommandId::from("a"), 1).expect("a");
        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|r| r.command_id.to_string())
            .collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(registry.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_the_process_group() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");

        let registry = ProcessRegistry::new();
        registry.register(CommandId::from("sleeper"), pid).expect("register");
        registry.stop(&CommandId::from("sleeper")).expect("stop");
        assert!(registry.get(&CommandId::from("sleeper")).is_none());

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child exits promptly")
            .expect("wait");
        assert_eq!(status.signal(), Some(15));
    }
}
