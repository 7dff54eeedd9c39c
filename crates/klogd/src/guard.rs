//! Respawn guard - makes sure only one daemon instance is running.
//!
//! A freshly started daemon looks for other processes with its own name
//! and terminates them, re-scanning until none are left. This frees the
//! listening port and the log device before the supervisor starts.
//!
//! Uses the `sysinfo` crate to walk the process table.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::process;
use std::thread;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tracing::{debug, info};

/// How many scan/terminate rounds to run before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 20;

/// Pause between rounds, giving terminated processes time to exit.
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(250);

/// Errors that can occur while clearing out other instances.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Some instances were still alive after every attempt
    #[error("Other '{name}' processes still running: {pids:?}")]
    Survivors { name: String, pids: Vec<u32> },
}

/// Lists the PIDs of other processes named exactly `name`.
///
/// The current process and its threads are never included.
pub fn find_other_instances(name: &str) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    matching_pids(&system, name)
}

fn matching_pids(system: &System, name: &str) -> Vec<u32> {
    let own_pid = process::id();
    let wanted = OsStr::new(name);

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, proc_)| {
            pid.as_u32() != own_pid && proc_.thread_kind().is_none() && proc_.name() == wanted
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// Terminates every other process named `name`.
///
/// Sends SIGTERM (falling back to a plain kill where unsupported), waits
/// `pause`, and repeats until no duplicate remains or `attempts` rounds have
/// run. Returns how many distinct processes were signalled.
pub fn terminate_other_instances(
    name: &str,
    attempts: u32,
    pause: Duration,
) -> Result<usize, GuardError> {
    let mut system = System::new();
    let mut signalled = HashSet::new();

    for attempt in 1..=attempts.max(1) {
        system.refresh_processes(ProcessesToUpdate::All, true);
        let others = matching_pids(&system, name);
        if others.is_empty() {
            debug!(attempt, "No other instances running");
            return Ok(signalled.len());
        }

        for pid in others {
            if let Some(proc_) = system.process(Pid::from_u32(pid)) {
                let sent = proc_
                    .kill_with(Signal::Term)
                    .unwrap_or_else(|| proc_.kill());
                info!(pid, sent, attempt, "Terminating stale instance");
                signalled.insert(pid);
            }
        }

        thread::sleep(pause);
    }

    let survivors = find_other_instances(name);
    if survivors.is_empty() {
        Ok(signalled.len())
    } else {
        Err(GuardError::Survivors {
            name: name.to_string(),
            pids: survivors,
        })
    }
}
