//! PID 1 responsibilities
//!
//! Everything specific to running as init:
//! - Mounting the base filesystems
//! - Converting signals into supervisor events
//! - Reaping orphaned zombies
//! - Final halt/poweroff/reboot

mod mount;
mod reaper;
mod shutdown;
mod signals;

pub use mount::{mount_base_filesystems, MountError};
pub use reaper::{reap_all, reap_pid, Reaped, WaitResult};
pub use shutdown::{finalize, HaltKind};
pub use signals::{SignalHandler, SupSignal};

use std::process;

/// Check if we are running as PID 1
pub fn is_pid1() -> bool {
    process::id() == 1
}

/// Initialize the PID 1 environment
///
/// Mounts the base filesystems; the condition store becomes usable only
/// after this returns.
pub fn init() -> Result<(), Pid1Error> {
    if !is_pid1() {
        log::debug!("Not PID 1 (pid={}), skipping init setup", process::id());
        return Ok(());
    }

    log::info!("Running as PID 1, initializing init environment");
    mount::mount_base_filesystems()?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Pid1Error {
    #[error("Mount failed: {0}")]
    Mount(#[from] MountError),

    #[error("Signal setup failed: {0}")]
    Signal(String),
}
