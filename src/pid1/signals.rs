//! Signal handling
//!
//! Signals are converted to synchronous events consumed by the main
//! loop; no supervisor logic ever runs inside a handler.  The map:
//!
//! - SIGCHLD: reap children
//! - SIGHUP: reload configuration
//! - SIGINT/SIGTERM: shut down (poweroff)
//! - SIGUSR1: halt
//! - SIGUSR2: reboot
//! - SIGTSTP/SIGCONT: pause/resume respawning

use tokio::signal::unix::{signal, Signal, SignalKind};

use super::shutdown::HaltKind;

/// A signal, decoded to the supervisor action it requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupSignal {
    /// One or more children changed state
    Child,
    /// Reload configuration files
    Reload,
    /// Tear the machine down
    Shutdown(HaltKind),
    /// Stop respawning services until resumed
    PauseRespawn,
    ResumeRespawn,
}

/// Owns the per-signal streams for the lifetime of the daemon
pub struct SignalHandler {
    sigchld: Signal,
    sighup: Signal,
    sigint: Signal,
    sigterm: Signal,
    sigusr1: Signal,
    sigusr2: Signal,
    sigtstp: Signal,
    sigcont: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            sighup: signal(SignalKind::hangup())?,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigusr2: signal(SignalKind::user_defined2())?,
            sigtstp: signal(SignalKind::from_raw(libc::SIGTSTP))?,
            sigcont: signal(SignalKind::from_raw(libc::SIGCONT))?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> SupSignal {
        tokio::select! {
            _ = self.sigchld.recv() => SupSignal::Child,
            _ = self.sighup.recv() => SupSignal::Reload,
            _ = self.sigint.recv() => SupSignal::Shutdown(HaltKind::Poweroff),
            _ = self.sigterm.recv() => SupSignal::Shutdown(HaltKind::Poweroff),
            _ = self.sigusr1.recv() => SupSignal::Shutdown(HaltKind::Halt),
            _ = self.sigusr2.recv() => SupSignal::Shutdown(HaltKind::Reboot),
            _ = self.sigtstp.recv() => SupSignal::PauseRespawn,
            _ = self.sigcont.recv() => SupSignal::ResumeRespawn,
        }
    }
}
