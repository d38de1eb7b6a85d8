// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Access to the operating system process table.
//!
//! Everything the registry and the adapters need from the OS goes through
//! [`ProcessTable`] so orphan detection and pid verification can be tested
//! against a fake table.

use std::sync::Mutex;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Short OS-reported name (`comm` on linux, truncated to 15 bytes).
    pub name: String,
}

pub trait ProcessTable: Send + Sync {
    fn list(&self) -> Vec<ProcessInfo>;

    fn name_of(&self, pid: u32) -> Option<String>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM). False when the signal could not
    /// be delivered.
    fn terminate(&self, pid: u32) -> bool;

    /// SIGKILL.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo` for enumeration and `libc` signals.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("process table lock poisoned; recovering");
                poisoned.into_inner()
            }
        };
        f(&mut system)
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessInfo> {
        self.with_system(|system| {
            system.refresh_processes();
            system
                .processes()
                .iter()
                .map(|(pid, process)| ProcessInfo {
                    pid: pid.as_u32(),
                    name: process.name().to_string(),
                })
                .collect()
        })
    }

    fn name_of(&self, pid: u32) -> Option<String> {
        self.with_system(|system| {
            let pid = Pid::from_u32(pid);
            if !system.refresh_process(pid) {
                return None;
            }
            system.process(pid).map(|p| p.name().to_string())
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            let Ok(raw) = libc::pid_t::try_from(pid) else {
                return false;
            };
            // signal 0 performs the permission and existence checks only.
            unsafe { libc::kill(raw, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            self.name_of(pid).is_some()
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.kill(pid)
        }
    }

    fn kill(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            self.with_system(|system| {
                let pid = Pid::from_u32(pid);
                system.refresh_process(pid);
                system.process(pid).map(|p| p.kill()).unwrap_or(false)
            })
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        // 0 and negatives address process groups.
        return false;
    }
    unsafe { libc::kill(raw, signal) == 0 }
}

/// True when an OS-reported process name plausibly belongs to `executable`.
///
/// Linux truncates `comm` to 15 bytes, so a 15-byte name that prefixes the
/// expected executable also matches.
pub fn name_matches(name: &str, executable: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let executable = executable.to_ascii_lowercase();
    if executable.is_empty() {
        return false;
    }
    let name = name.trim_end_matches(".exe");
    let executable = executable.trim_end_matches(".exe");
    name == executable
        || name.contains(executable)
        || (name.len() == 15 && executable.starts_with(name))
}

/// Graceful-then-forceful termination of a process we do not own a handle for.
///
/// With `force` the process is killed straight away. Returns whether the
/// process is gone afterwards.
pub async fn terminate_pid(
    table: &dyn ProcessTable,
    pid: u32,
    force: bool,
    grace: Duration,
) -> bool {
    if !table.is_alive(pid) {
        debug!("pid={} already gone", pid);
        return true;
    }

    if !force {
        info!("terminating pid={}", pid);
        if table.terminate(pid) && wait_for_exit(table, pid, grace).await {
            return true;
        }
        warn!("pid={} did not exit within {:?}; killing", pid, grace);
    } else {
        info!("force killing pid={}", pid);
    }

    table.kill(pid);
    wait_for_exit(table, pid, Duration::from_secs(5)).await
}

async fn wait_for_exit(table: &dyn ProcessTable, pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !table.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory process table. `stubborn` pids ignore SIGTERM and
    /// `immortal` ones survive SIGKILL too, like a process stuck in the
    /// kernel.
    #[derive(Default)]
    pub struct FakeProcessTable {
        pub procs: Mutex<BTreeMap<u32, String>>,
        pub stubborn: Mutex<Vec<u32>>,
        pub immortal: Mutex<Vec<u32>>,
        pub signals: Mutex<Vec<(u32, &'static str)>>,
    }

    impl FakeProcessTable {
        pub fn with(procs: &[(u32, &str)]) -> Self {
            let table = Self::default();
            {
                let mut map = table.procs.lock().unwrap();
                for (pid, name) in procs {
                    map.insert(*pid, name.to_string());
                }
            }
            table
        }

        pub fn remove(&self, pid: u32) {
            self.procs.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn list(&self) -> Vec<ProcessInfo> {
            self.procs
                .lock()
                .unwrap()
                .iter()
                .map(|(pid, name)| ProcessInfo {
                    pid: *pid,
                    name: name.clone(),
                })
                .collect()
        }

        fn name_of(&self, pid: u32) -> Option<String> {
            self.procs.lock().unwrap().get(&pid).cloned()
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.procs.lock().unwrap().contains_key(&pid)
        }

        fn terminate(&self, pid: u32) -> bool {
            self.signals.lock().unwrap().push((pid, "TERM"));
            if !self.stubborn.lock().unwrap().contains(&pid) {
                self.remove(pid);
            }
            true
        }

        fn kill(&self, pid: u32) -> bool {
            self.signals.lock().unwrap().push((pid, "KILL"));
            if !self.immortal.lock().unwrap().contains(&pid) {
                self.remove(pid);
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProcessTable;
    use super::*;

    #[test]
    fn names_match_truncated_comm() {
        assert!(name_matches("llama-server", "llama-server"));
        assert!(name_matches("LLAMA-SERVER.EXE", "llama-server"));
        assert!(name_matches("my-llama-server-v2", "llama-server"));
        assert!(name_matches("llama-server-cu", "llama-server-cuda12"));
        assert!(!name_matches("python3", "llama-server"));
        assert!(!name_matches("llama", "llama-server"));
        assert!(!name_matches("anything", ""));
    }

    #[tokio::test]
    async fn graceful_termination_escalates_for_stubborn_process() {
        let table = FakeProcessTable::with(&[(10, "llama-server"), (11, "llama-server")]);
        table.stubborn.lock().unwrap().push(11);

        assert!(terminate_pid(&table, 10, false, Duration::from_millis(200)).await);
        assert!(terminate_pid(&table, 11, false, Duration::from_millis(200)).await);

        let signals = table.signals.lock().unwrap().clone();
        assert_eq!(signals, vec![(10, "TERM"), (11, "TERM"), (11, "KILL")]);
    }

    #[tokio::test]
    async fn force_skips_sigterm_and_gone_pids_are_noops() {
        let table = FakeProcessTable::with(&[(20, "llama-server")]);
        assert!(terminate_pid(&table, 20, true, Duration::from_secs(1)).await);
        assert!(terminate_pid(&table, 21, false, Duration::from_secs(1)).await);
        assert_eq!(*table.signals.lock().unwrap(), vec![(20, "KILL")]);
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive_in_system_table() {
        let table = SystemProcessTable::new();
        assert!(table.is_alive(std::process::id()));
        assert!(table.name_of(std::process::id()).is_some());
        assert!(!table.kill(0));
    }
}
