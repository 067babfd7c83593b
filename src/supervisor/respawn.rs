//! Respawn controller and kill escalation
//!
//! Crashed daemons are restarted with a damped schedule: the first retry
//! is immediate (a 1 ms timer, only there to bounce through the step
//! loop), then every 2 s for the first half of the budget, then every
//! 5 s.  A daemon that crashes [`RESPAWN_MAX`] times in a row is blocked
//! as crashing and stays down until an operator start.
//!
//! The retry timer doubles as the success detector: when it fires and
//! finds the service no longer halted-restarting, the run counts as
//! stable and the crash counter resets.

use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::svc::{BlockReason, SvcId, SvcState};

use super::{Supervisor, TimerKind};

/// Consecutive crashes tolerated before a service is blocked
pub const RESPAWN_MAX: u32 = 10;

/// Retry cadence while under half the budget
const RETRY_FAST: Duration = Duration::from_secs(2);
/// Retry cadence for the second half
const RETRY_SLOW: Duration = Duration::from_secs(5);

impl Supervisor {
    /// Arm the immediate post-crash bounce timer
    pub(super) fn schedule_retry_bounce(&mut self, id: SvcId) {
        log::debug!(
            "Delayed restart of {}",
            self.registry.get(id).map(|s| s.ident()).unwrap_or_default()
        );
        self.timers.arm(
            id,
            TimerKind::Retry,
            Duration::from_millis(1),
            Instant::now(),
        );
    }

    /// Retry timer fired for `id`
    pub(super) fn retry_svc(&mut self, id: SvcId, now: Instant) {
        let Some(svc) = self.registry.get_mut(id) else {
            return;
        };

        if svc.state != SvcState::Halted || svc.block != BlockReason::Restarting {
            // Not crashing anymore; the run was stable
            log::debug!("{} not crashing anymore", svc.ident());
            svc.restart_cnt = 0;
            return;
        }

        if svc.restart_cnt >= RESPAWN_MAX {
            log::warn!(
                "Service {} keeps crashing, not restarting.",
                svc.ident()
            );
            svc.block = BlockReason::Crashing;
            svc.restart_cnt = 0;
            self.step(id);
            return;
        }

        svc.restart_cnt += 1;
        let attempt = svc.restart_cnt;
        log::warn!(
            "Service {}[{}] died, restarting ({}/{})",
            svc.ident(),
            svc.oldpid,
            attempt,
            RESPAWN_MAX
        );
        svc.block = BlockReason::None;
        self.step(id);

        let timeout = if attempt <= RESPAWN_MAX / 2 {
            RETRY_FAST
        } else {
            RETRY_SLOW
        };
        self.timers.arm(id, TimerKind::Retry, timeout, now);
    }

    /// Kill-escalation timer fired: the service ignored its halt signal
    pub(super) fn kill_svc(&mut self, id: SvcId) {
        let Some(svc) = self.registry.get(id) else {
            return;
        };

        if !svc.has_pid() {
            // Already terminated; nothing to escalate
            log::debug!("{}: aborting SIGKILL, already terminated", svc.ident());
            return;
        }

        let pid = svc.pid;
        let ident = svc.ident();
        let desc = svc.desc.clone();

        log::warn!("Stopping {}[{}], sending SIGKILL ...", ident, pid);
        if self.progress() {
            self.console.desc("Killing ", &desc);
        }

        let rc = kill(Pid::from_raw(-pid), Signal::SIGKILL);

        // SIGKILLs stand out as [WARN]
        if self.progress() {
            self.console.warn();
        }

        // A vanished process group will never be reaped under this pid;
        // book it so STOPPING can complete.
        if rc == Err(nix::errno::Errno::ESRCH) {
            if let Some(svc) = self.registry.get_mut(id) {
                svc.book_stopped();
            }
            self.step(id);
        }
    }
}
