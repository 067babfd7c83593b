//! Child process reaping
//!
//! When a process's parent dies it is reparented to PID 1, which must
//! wait() on it to clean up the zombie.  The reaper drains every pending
//! exit in one pass, so several simultaneous deaths batch into a single
//! supervisor step.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Exit status of a reaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Process exited normally with code
    Exited(i32),
    /// Process killed by signal
    Signaled(i32),
    Unknown,
}

impl WaitResult {
    /// True for a clean exit(0)
    pub fn success(&self) -> bool {
        matches!(self, WaitResult::Exited(0))
    }
}

/// One reaped child
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    pub pid: i32,
    pub result: WaitResult,
}

fn classify(status: WaitStatus) -> Option<Reaped> {
    match status {
        WaitStatus::Exited(pid, code) => Some(Reaped {
            pid: pid.as_raw(),
            result: WaitResult::Exited(code),
        }),
        WaitStatus::Signaled(pid, signal, _core) => Some(Reaped {
            pid: pid.as_raw(),
            result: WaitResult::Signaled(signal as i32),
        }),
        // Stop/continue notifications are not exits
        _ => None,
    }
}

/// Reap every available zombie (non-blocking)
pub fn reap_all() -> Vec<Reaped> {
    let mut reaped = Vec::new();

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(child) = classify(status) {
                    log::debug!("Reaped PID {} ({:?})", child.pid, child.result);
                    reaped.push(child);
                }
            }
            Err(Errno::ECHILD) => break,
            Err(e) => {
                log::error!("waitpid error: {}", e);
                break;
            }
        }
    }

    reaped
}

/// Wait for one specific child
///
/// Blocking form is used for sequential `run` commands and sysv stop
/// scripts, whose completion gates the caller.
pub fn reap_pid(pid: i32, block: bool) -> Option<Reaped> {
    if pid <= 1 {
        return None;
    }

    let flags = if block {
        None
    } else {
        Some(WaitPidFlag::WNOHANG)
    };

    match waitpid(Pid::from_raw(pid), flags) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => classify(status),
        Err(Errno::ECHILD) => None,
        Err(e) => {
            log::error!("waitpid({}) error: {}", pid, e);
            None
        }
    }
}
