//! Per-service state machine
//!
//! `step()` evaluates one service against its enablement, its condition
//! expression and its child state, re-running until the pass produces no
//! transition.  Any transition posts a work request so every service is
//! re-stepped: a service leaving RUNNING may flip a condition another
//! service gates on.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cond::CondState;
use crate::svc::{BlockReason, SvcId, SvcKind, SvcState};

use super::{Supervisor, TimerKind};

impl Supervisor {
    /// Transition one task/run/service until quiescent
    pub fn step(&mut self, id: SvcId) {
        let mut changed = false;

        loop {
            let Some(svc) = self.registry.get(id) else {
                return;
            };
            let old_state = svc.state;
            let enabled = self.svc_enabled(svc);
            let cond = self.conds.get_agg(&svc.conds);

            log::trace!(
                "{:>16}[{}]: {} {}abled/{} cond:{}",
                svc.ident(),
                svc.pid,
                svc.state.as_str(),
                if enabled { "en" } else { "dis" },
                if svc.dirty { "dirty" } else { "clean" },
                cond.as_str()
            );

            match old_state {
                SvcState::Halted => {
                    if enabled {
                        self.set_state(id, SvcState::Ready);
                    }
                }

                SvcState::Done => {
                    let svc = self.registry.get(id).expect("checked above");
                    // A completed sysv record leaving its runlevel still
                    // owes its stop script
                    if svc.kind == SvcKind::Sysv && svc.started && !enabled {
                        log::info!("Calling '{} stop' ...", svc.cmd);
                        self.run_sysv_script(id, "stop");
                        if let Some(svc) = self.registry.get_mut(id) {
                            svc.started = false;
                        }
                    }
                    if self.registry.get(id).is_some_and(|svc| svc.dirty) {
                        self.set_state(id, SvcState::Halted);
                    }
                }

                SvcState::Stopping => {
                    let svc = self.registry.get(id).expect("checked above");
                    if !svc.has_pid() {
                        // Child was collected normally, no need for SIGKILL
                        self.timers.cancel(id);
                        let cond_name = svc.provides_cond();
                        self.conds.clear(&cond_name);

                        match svc.kind {
                            SvcKind::Service | SvcKind::Tty => {
                                self.set_state(id, SvcState::Halted)
                            }
                            SvcKind::Task | SvcKind::Run | SvcKind::Sysv => {
                                self.set_state(id, SvcState::Done)
                            }
                        }
                    }
                }

                SvcState::Ready => {
                    if !enabled {
                        self.set_state(id, SvcState::Halted);
                    } else if cond == CondState::On {
                        // Hold new launches until teardown has drained
                        if self.in_teardown() {
                            break;
                        }

                        if self.start_svc(id) {
                            let svc = self.registry.get_mut(id).expect("started");
                            svc.dirty = false;
                            if svc.state == SvcState::Ready {
                                self.set_state(id, SvcState::Running);
                            }
                        } else {
                            let svc = self.registry.get_mut(id).expect("checked above");
                            if svc.block == BlockReason::Missing {
                                self.set_state(id, SvcState::Halted);
                            } else {
                                // Launch failures count as crashes
                                svc.restart_cnt += 1;
                                break;
                            }
                        }
                    }
                }

                SvcState::Running => {
                    if !enabled {
                        self.stop_svc(id);
                        if self.state_changed(id, old_state) {
                            changed = true;
                            continue;
                        }
                        break;
                    }

                    let svc = self.registry.get(id).expect("checked above");
                    if !svc.has_pid() {
                        if svc.is_daemon() {
                            // Crashed; hand over to the respawn controller
                            let svc = self.registry.get_mut(id).expect("checked above");
                            svc.block = BlockReason::Restarting;
                            self.set_state(id, SvcState::Halted);
                            self.schedule_retry_bounce(id);
                            changed = true;
                            continue;
                        }

                        if svc.is_runtask() {
                            let svc = self.registry.get_mut(id).expect("checked above");
                            svc.once += 1;
                            // Synthetic stop; the STOPPING pass completes
                            // it into DONE
                            self.set_state(id, SvcState::Stopping);
                            changed = true;
                            continue;
                        }
                    }

                    match cond {
                        CondState::Off => {
                            self.stop_svc(id);
                        }
                        CondState::Flux => {
                            if svc.has_pid() {
                                let _ = kill(Pid::from_raw(svc.pid), Signal::SIGSTOP);
                                self.set_state(id, SvcState::Waiting);
                            }
                        }
                        CondState::On => {
                            if svc.dirty {
                                if !svc.sighup {
                                    self.stop_svc(id);
                                } else {
                                    if self.in_teardown() {
                                        break;
                                    }
                                    self.restart_sighup(id);
                                }
                                if let Some(svc) = self.registry.get_mut(id) {
                                    svc.dirty = false;
                                }
                            }
                        }
                    }
                }

                SvcState::Waiting => {
                    let svc = self.registry.get(id).expect("checked above");
                    if !enabled {
                        if svc.has_pid() {
                            let _ = kill(Pid::from_raw(svc.pid), Signal::SIGCONT);
                        }
                        self.stop_svc(id);
                        if self.state_changed(id, old_state) {
                            changed = true;
                            continue;
                        }
                        break;
                    }

                    if !svc.has_pid() {
                        let svc = self.registry.get_mut(id).expect("checked above");
                        svc.restart_cnt += 1;
                        self.set_state(id, SvcState::Ready);
                        changed = true;
                        continue;
                    }

                    match cond {
                        CondState::On => {
                            let pid = svc.pid;
                            let dirty = svc.dirty;
                            let cond_name = svc.provides_cond();
                            let _ = kill(Pid::from_raw(pid), Signal::SIGCONT);
                            self.set_state(id, SvcState::Running);
                            // Reassert our own condition if nothing changed
                            if !dirty {
                                log::debug!("Reasserting condition {}", cond_name);
                                self.conds.set(&cond_name);
                            }
                        }
                        CondState::Off => {
                            log::debug!(
                                "Condition for {} is off, sending SIGCONT + halt signal",
                                svc.ident()
                            );
                            let _ = kill(Pid::from_raw(svc.pid), Signal::SIGCONT);
                            self.stop_svc(id);
                        }
                        CondState::Flux => {}
                    }
                }
            }

            if self.state_changed(id, old_state) {
                changed = true;
                continue;
            }
            break;
        }

        // Other services may depend on the transitions we just made
        if changed {
            self.work_pending = true;
        }
    }

    fn state_changed(&self, id: SvcId, old_state: SvcState) -> bool {
        self.registry
            .get(id)
            .map(|svc| svc.state != old_state)
            .unwrap_or(false)
    }

    /// Enter a new state; entering STOPPING arms the kill-escalation
    /// timer so an ignored halt signal cannot wedge the teardown.
    pub(super) fn set_state(&mut self, id: SvcId, new: SvcState) {
        let Some(svc) = self.registry.get_mut(id) else {
            return;
        };
        log::trace!("{:>16}[{}]: -> {}", svc.ident(), svc.pid, new.as_str());
        svc.state = new;

        if new == SvcState::Stopping {
            let killdelay = svc.killdelay;
            log::debug!(
                "{} is stopping, waiting {:?} before sending SIGKILL",
                svc.ident(),
                killdelay
            );
            self.timers
                .arm(id, TimerKind::Kill, killdelay, std::time::Instant::now());
        }
    }

    /// Stop a service: send the halt signal to its process group, or run
    /// the sysv stop script synchronously.
    pub(super) fn stop_svc(&mut self, id: SvcId) {
        let Some(svc) = self.registry.get(id) else {
            return;
        };
        // Already on the way down (or idle)
        if matches!(
            svc.state,
            SvcState::Halted | SvcState::Done | SvcState::Stopping
        ) {
            return;
        }

        self.timers.cancel(id);

        if svc.kind == SvcKind::Sysv {
            log::info!("Calling '{} stop' ...", svc.cmd);
            let progress = self.progress();
            if progress {
                self.console.desc("Stopping ", &svc.desc);
            }
            self.set_state(id, SvcState::Stopping);
            let rc = self.run_sysv_script(id, "stop");
            if progress {
                self.console.result(rc);
            }
            return;
        }

        if !svc.has_pid() {
            // Lost or never really started
            if let Some(svc) = self.registry.get_mut(id) {
                svc.book_stopped();
            }
            return;
        }

        let pid = svc.pid;
        let sighalt = svc.sighalt;
        let ident = svc.ident();
        let desc = svc.desc.clone();

        log::info!("Stopping {}[{}], sending {} ...", ident, pid, sighalt);
        self.set_state(id, SvcState::Stopping);

        if self.progress() {
            self.console.desc("Stopping ", &desc);
        }

        // Signal the whole process group, sweeping helpers with it
        let rc = match kill(Pid::from_raw(-pid), sighalt) {
            Ok(()) => 0,
            Err(nix::errno::Errno::ESRCH) => {
                // Nobody home; the reaper will not fire for this one
                if let Some(svc) = self.registry.get_mut(id) {
                    svc.book_stopped();
                }
                0
            }
            Err(e) => {
                log::error!("Failed stopping {}[{}]: {}", ident, pid, e);
                1
            }
        };

        if self.progress() {
            self.console.result(rc);
        }
    }

    pub(super) fn progress(&self) -> bool {
        self.runlevel != 1
    }
}
