//! The service supervision engine
//!
//! One [`Supervisor`] owns the registry, the condition store, the timer
//! queue and the global state machine.  It is driven from a single task:
//! external events (child exits, timer fires, operator commands, config
//! reloads) are handed to it synchronously, each followed by stepping
//! every service until quiescence.
//!
//! The global FSM sequences runlevel changes and reloads:
//!
//! ```text
//! Bootstrap ──► RunlevelChange ──► RunlevelWait ──► Running
//!                    ▲                                │ ▲
//!                    └──────── newlevel ◄─────────────┘ │
//!                         ReloadChange ──► ReloadWait ──┘
//! ```
//!
//! The `*Change` states move newly-disabled services into STOPPING; the
//! `*Wait` states hold new launches back until every stopping service has
//! drained, preserving orderly teardown.

mod launch;
mod reload;
mod respawn;
mod step;
mod timers;

pub use respawn::RESPAWN_MAX;
pub use timers::{TimerKind, TimerQueue};

use std::path::{Path, PathBuf};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cond::CondStore;
use crate::conf;
use crate::console::Console;
use crate::hooks::{HookPoint, Hooks};
use crate::pid1::{self, HaltKind, Reaped, SupSignal};
use crate::protocol::{Request, Response, SvcInfo};
use crate::runlevel::{self, RUNLEVEL_S};
use crate::svc::{BlockReason, Registry, Svc, SvcId, SvcState};

/// Runaway guard for the step-to-quiescence loop
const MAX_STEP_ROUNDS: u32 = 128;

/// Poll cadence while waiting for a forking daemon's pidfile
pub(crate) const PIDFILE_POLL: std::time::Duration = std::time::Duration::from_millis(50);

/// How long a forking daemon gets to write its pidfile
const PIDFILE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmState {
    Bootstrap,
    Running,
    RunlevelChange,
    RunlevelWait,
    ReloadChange,
    ReloadWait,
}

/// The supervision engine
pub struct Supervisor {
    registry: Registry,
    conds: CondStore,
    timers: TimerQueue,
    hooks: Hooks,
    console: Console,

    conf_dir: PathBuf,
    runlevel: u8,
    prevlevel: u8,
    default_runlevel: u8,

    sm: SmState,
    newlevel: Option<u8>,
    reload_pending: bool,
    work_pending: bool,
    norespawn: bool,
    halting: Option<HaltKind>,
    verbose: bool,
}

impl Supervisor {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(conf_dir: P, cond_dir: Q) -> Self {
        Self {
            registry: Registry::new(),
            conds: CondStore::new(cond_dir),
            timers: TimerQueue::new(),
            hooks: Hooks::new(),
            console: Console::new(false),
            conf_dir: conf_dir.into(),
            runlevel: RUNLEVEL_S,
            prevlevel: RUNLEVEL_S,
            default_runlevel: 2,
            sm: SmState::Bootstrap,
            newlevel: None,
            reload_pending: false,
            work_pending: false,
            norespawn: false,
            halting: None,
            verbose: false,
        }
    }

    // Accessors, mostly for the binaries and tests

    pub fn conds(&self) -> &CondStore {
        &self.conds
    }

    pub fn conds_mut(&mut self) -> &mut CondStore {
        &mut self.conds
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Run a hook point against the condition store
    pub fn run_hook(&mut self, point: HookPoint) {
        self.hooks.run(point, &mut self.conds);
    }

    pub fn set_default_runlevel(&mut self, level: u8) {
        self.default_runlevel = level;
    }

    pub fn svc(&self, id: SvcId) -> Option<&Svc> {
        self.registry.get(id)
    }

    pub fn svc_mut(&mut self, id: SvcId) -> Option<&mut Svc> {
        self.registry.get_mut(id)
    }

    pub fn find(&self, ident: &str) -> Option<SvcId> {
        self.registry.find_by_ident(ident)
    }

    pub fn ids(&self) -> Vec<SvcId> {
        self.registry.ids()
    }

    pub fn timer_armed(&self, id: SvcId) -> Option<TimerKind> {
        self.timers.armed(id)
    }

    pub fn runlevel(&self) -> u8 {
        self.runlevel
    }

    pub fn halting(&self) -> Option<HaltKind> {
        self.halting
    }

    pub fn set_console(&mut self, enabled: bool) {
        self.console.set_enabled(enabled);
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Load the configuration directory and register every stanza.
    /// Returns the number of live records.
    pub fn load_config(&mut self) -> std::io::Result<usize> {
        let config = conf::load_dir(&self.conf_dir)?;
        if let Some(level) = config.default_runlevel {
            self.default_runlevel = level;
        }
        for stanza in &config.stanzas {
            self.register_stanza(stanza);
        }
        Ok(self.registry.len())
    }

    /// Enter the bootstrap runlevel and start stepping
    pub fn bootstrap(&mut self) {
        log::info!("Entering runlevel S (bootstrap)");
        self.step_all();
        self.sm_step();
        self.drain_work();
    }

    /// Is a service administratively cleared to run right now?
    fn svc_enabled(&self, svc: &Svc) -> bool {
        !svc.removed && svc.block == BlockReason::None && svc.in_runlevel(self.runlevel)
    }

    fn in_teardown(&self) -> bool {
        matches!(
            self.sm,
            SmState::RunlevelChange
                | SmState::RunlevelWait
                | SmState::ReloadChange
                | SmState::ReloadWait
        )
    }

    /// True when nothing is left draining towards HALTED/DONE
    pub fn teardown_complete(&self) -> bool {
        !self
            .registry
            .iter()
            .any(|(_, svc)| svc.state == SvcState::Stopping)
    }

    /// Have all enabled run/task records completed in this runlevel?
    ///
    /// Tasks gated on post-bootstrap hooks are skipped; they cannot run
    /// until the system is up.
    pub fn service_completed(&self) -> bool {
        self.registry.iter().all(|(_, svc)| {
            !svc.is_runtask()
                || !self.svc_enabled(svc)
                || svc
                    .conds
                    .iter()
                    .any(|c| c == "hook/svc-up" || c == "hook/system-up")
                || svc.once > 0
        })
    }

    /// Reset run-once bookkeeping when entering a new runlevel
    fn runtask_clean(&mut self) {
        for (_, svc) in self.registry.iter_mut() {
            if !svc.is_runtask() {
                continue;
            }
            svc.once = 0;
            svc.started = false;
            if svc.state == SvcState::Done {
                svc.state = SvcState::Halted;
            }
        }
    }

    /// Request a runlevel change; `init <N>`
    pub fn set_runlevel(&mut self, level: u8) {
        if level > runlevel::RUNLEVEL_MAX && level != RUNLEVEL_S {
            log::error!("Invalid runlevel {}", level);
            return;
        }

        let was_low = runlevel::is_pre_multiuser(self.runlevel);
        if was_low && level > 1 && level != RUNLEVEL_S {
            self.networking(true);
        }

        self.newlevel = Some(level);
        self.sm_step();
        self.drain_work();

        if !was_low && runlevel::is_pre_multiuser(self.runlevel) {
            self.networking(false);
        }
    }

    /// Request a configuration reload; SIGHUP or `servdctl reload`
    pub fn reload(&mut self) {
        self.reload_pending = true;
        self.sm_step();
        self.drain_work();
    }

    /// Begin machine teardown.  The caller waits for
    /// [`Supervisor::teardown_complete`] and then finalizes via
    /// [`crate::pid1::finalize`].
    pub fn shutdown(&mut self, kind: HaltKind) {
        if self.halting.is_some() {
            return;
        }
        log::info!("Shutting down ({})", kind.as_str());
        self.halting = Some(kind);
        self.hooks.run(HookPoint::Shutdown, &mut self.conds);

        let level = match kind {
            HaltKind::Reboot => 6,
            _ => 0,
        };
        self.newlevel = Some(level);
        self.sm_step();
        self.drain_work();
    }

    /// Bring networking up or down around the single-user boundary
    fn networking(&mut self, up: bool) {
        let script = Path::new("/etc/servd/network");
        if script.exists() {
            let arg = if up { "start" } else { "stop" };
            log::info!("Running {} {}", script.display(), arg);
            self.run_script(script, arg);
        }

        let point = if up {
            HookPoint::NetworkUp
        } else {
            HookPoint::NetworkDown
        };
        self.hooks.run(point, &mut self.conds);
    }

    // Global state machine

    fn sm_step(&mut self) {
        loop {
            match self.sm {
                SmState::Bootstrap => {
                    if self.newlevel.is_some() {
                        self.sm = SmState::RunlevelChange;
                        continue;
                    }
                    if self.service_completed() {
                        log::info!("Bootstrap complete");
                        self.hooks.run(HookPoint::SvcUp, &mut self.conds);
                        self.newlevel = Some(self.default_runlevel);
                        self.sm = SmState::RunlevelChange;
                        continue;
                    }
                    break;
                }

                SmState::Running => {
                    if self.reload_pending {
                        self.sm = SmState::ReloadChange;
                        continue;
                    }
                    if self.newlevel.is_some() {
                        self.sm = SmState::RunlevelChange;
                        continue;
                    }
                    break;
                }

                SmState::RunlevelChange => {
                    let level = self.newlevel.take().unwrap_or(self.default_runlevel);
                    self.prevlevel = self.runlevel;
                    self.runlevel = level;
                    log::info!(
                        "Switching runlevel {} -> {}",
                        runlevel::runlevel_name(self.prevlevel),
                        runlevel::runlevel_name(level)
                    );
                    self.hooks.run(HookPoint::RunlevelChange, &mut self.conds);
                    self.step_all();
                    self.sm = SmState::RunlevelWait;
                    continue;
                }

                SmState::RunlevelWait => {
                    if !self.teardown_complete() {
                        break;
                    }
                    self.runtask_clean();
                    self.hooks.run(HookPoint::RunlevelUp, &mut self.conds);
                    if self.prevlevel == RUNLEVEL_S {
                        self.hooks.run(HookPoint::SystemUp, &mut self.conds);
                    }
                    self.sm = SmState::Running;
                    self.step_all();
                    continue;
                }

                SmState::ReloadChange => {
                    self.reload_pending = false;
                    self.reload_conf();
                    self.step_all();
                    self.sm = SmState::ReloadWait;
                    continue;
                }

                SmState::ReloadWait => {
                    if !self.teardown_complete() {
                        break;
                    }
                    self.sm = SmState::Running;
                    self.step_all();
                    continue;
                }
            }
        }
    }

    // Event entry points

    /// Process one decoded signal
    pub fn handle_signal(&mut self, sig: SupSignal) {
        match sig {
            SupSignal::Child => self.collect(),
            SupSignal::Reload => self.reload(),
            SupSignal::Shutdown(kind) => self.shutdown(kind),
            SupSignal::PauseRespawn => {
                log::info!("Respawn paused by operator");
                self.norespawn = true;
            }
            SupSignal::ResumeRespawn => {
                if self.norespawn {
                    log::info!("Respawn resumed by operator");
                    self.norespawn = false;
                    self.work_pending = true;
                    self.drain_work();
                }
            }
        }
    }

    /// Drain every pending child exit, then step
    pub fn collect(&mut self) {
        for reaped in pid1::reap_all() {
            self.handle_reaped(reaped);
        }
    }

    /// Book one reaped child into the state machine
    pub fn handle_reaped(&mut self, reaped: Reaped) {
        let Reaped { pid, result } = reaped;
        if pid <= 1 {
            return;
        }

        let Some(id) = self.registry.find_by_pid(pid) else {
            log::debug!("Collected unknown PID {}", pid);
            return;
        };

        let svc = match self.registry.get_mut(id) {
            Some(svc) => svc,
            None => return,
        };
        log::debug!("Collected {}[{}], {:?}", svc.ident(), pid, result);
        svc.status = Some(result);

        // A forking daemon's first child is only an intermediate parent;
        // its exit is always ignored.  The daemon usually writes its
        // pidfile after this exit, so adopt now if it is already there
        // and otherwise poll for it.
        if svc.starting && svc.is_forking() {
            if let Some(real_pid) = read_live_pidfile(svc) {
                log::debug!("{}: adopted forked pid {}", svc.ident(), real_pid);
                svc.pid = real_pid;
                svc.starting = false;
                let cond_name = svc.provides_cond();
                self.conds.set(&cond_name);
            } else {
                log::debug!(
                    "{}: pre-daemonize exit, waiting for pidfile",
                    svc.ident()
                );
                self.timers
                    .arm(id, TimerKind::Adopt, PIDFILE_POLL, Instant::now());
            }
            return;
        }

        if svc.is_daemon() {
            remove_pidfile(svc);
            let cond_name = svc.provides_cond();
            self.conds.clear(&cond_name);
        } else if svc.is_runtask() {
            svc.started = result.success();
        }

        // Sweep any children left in the service's process group
        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);

        svc.book_stopped();
        self.step(id);

        // Bootstrap-only tasks have had their time in the sun
        let remove = self.registry.get(id).is_some_and(|svc| {
            svc.is_runtask() && svc.runlevels.bootstrap_exclusive() && svc.state == SvcState::Done
        });
        if remove {
            if let Some(svc) = self.registry.remove(id) {
                log::debug!("Collected bootstrap task {}, removing", svc.ident());
            }
            self.timers.cancel(id);
        }

        self.sm_step();
        self.drain_work();
    }

    /// Fire due timers and drive the state machine; the event loop calls
    /// this after every wakeup with the current instant.
    pub fn tick(&mut self, now: Instant) {
        for (id, kind) in self.timers.pop_due(now) {
            if self.registry.get(id).is_none() {
                continue;
            }
            match kind {
                TimerKind::Kill => self.kill_svc(id),
                TimerKind::Retry => self.retry_svc(id, now),
                TimerKind::Adopt => self.adopt_svc(id, now),
            }
        }

        self.sm_step();
        self.drain_work();
    }

    /// Adopt timer fired: look for the pidfile a forking daemon owes us
    fn adopt_svc(&mut self, id: SvcId, now: Instant) {
        let Some(svc) = self.registry.get_mut(id) else {
            return;
        };
        if !svc.starting || !svc.is_forking() {
            return;
        }

        if let Some(real_pid) = read_live_pidfile(svc) {
            log::debug!("{}: adopted forked pid {}", svc.ident(), real_pid);
            svc.pid = real_pid;
            svc.starting = false;
            let cond_name = svc.provides_cond();
            self.conds.set(&cond_name);
            return;
        }

        let waited = svc
            .start_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if waited < PIDFILE_TIMEOUT {
            self.timers.arm(id, TimerKind::Adopt, PIDFILE_POLL, now);
            return;
        }

        // The daemon never declared itself; treat it as a failed start
        log::warn!(
            "{}: no pidfile after {:?}, treating as failed start",
            svc.ident(),
            waited
        );
        svc.starting = false;
        let pid = svc.pid;
        let cond_name = svc.provides_cond();
        svc.book_stopped();
        if pid > 1 {
            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
        }
        self.conds.clear(&cond_name);
        self.step(id);
        self.sm_step();
        self.drain_work();
    }

    /// Earliest instant [`Supervisor::tick`] wants to run
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Step every service; posted work requests re-step until quiescence
    pub fn step_all(&mut self) {
        for id in self.registry.ids() {
            self.step(id);
        }
        self.sweep_removed();
    }

    fn drain_work(&mut self) {
        let mut rounds = 0;
        while self.work_pending {
            self.work_pending = false;
            self.step_all();
            rounds += 1;
            if rounds > MAX_STEP_ROUNDS {
                log::error!("Step loop not reaching quiescence, giving up this turn");
                break;
            }
        }
    }

    /// Delete records a reload orphaned, once they have drained
    fn sweep_removed(&mut self) {
        let gone: Vec<SvcId> = self
            .registry
            .iter()
            .filter(|(_, svc)| {
                svc.removed
                    && !svc.has_pid()
                    && matches!(svc.state, SvcState::Halted | SvcState::Done)
            })
            .map(|(id, _)| id)
            .collect();

        for id in gone {
            self.timers.cancel(id);
            if let Some(svc) = self.registry.remove(id) {
                log::info!("Removed service {}", svc.ident());
                self.conds.clear(&svc.provides_cond());
            }
        }
    }

    // Operator interface

    /// Handle one control request
    pub fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::List => Response::Services(
                self.registry
                    .iter()
                    .map(|(_, svc)| svc_info(svc))
                    .collect(),
            ),

            Request::Status { ident } => match self.find(&ident) {
                Some(id) => Response::Services(vec![svc_info(
                    self.registry.get(id).expect("id from find"),
                )]),
                None => Response::Error(format!("no such service: {}", ident)),
            },

            Request::Start { ident } => match self.find(&ident) {
                Some(id) => {
                    self.op_start(id);
                    Response::Ok
                }
                None => Response::Error(format!("no such service: {}", ident)),
            },

            Request::Stop { ident } => match self.find(&ident) {
                Some(id) => self.op_stop(id),
                None => Response::Error(format!("no such service: {}", ident)),
            },

            Request::Restart { ident } => match self.find(&ident) {
                Some(id) => self.op_restart(id),
                None => Response::Error(format!("no such service: {}", ident)),
            },

            Request::Reload => {
                self.reload();
                Response::Ok
            }

            Request::Runlevel { level } => match level {
                0 => {
                    self.shutdown(HaltKind::Poweroff);
                    Response::Ok
                }
                6 => {
                    self.shutdown(HaltKind::Reboot);
                    Response::Ok
                }
                level if level <= runlevel::RUNLEVEL_MAX => {
                    self.set_runlevel(level);
                    Response::Runlevel {
                        current: runlevel::runlevel_name(self.runlevel),
                        previous: runlevel::runlevel_name(self.prevlevel),
                    }
                }
                level => Response::Error(format!("invalid runlevel {}", level)),
            },

            Request::Conditions => Response::Conditions(self.conds.list()),
        }
    }

    /// Operator start: clears manual and crashing blocks
    fn op_start(&mut self, id: SvcId) {
        if let Some(svc) = self.registry.get_mut(id) {
            log::info!("Operator start of {}", svc.ident());
            svc.block = BlockReason::None;
        }
        self.step(id);
        self.drain_work();
    }

    /// Operator stop: sets the manual block and tears the service down
    fn op_stop(&mut self, id: SvcId) -> Response {
        let Some(svc) = self.registry.get_mut(id) else {
            return Response::Error("service vanished".into());
        };
        if svc.state == SvcState::Stopping {
            // Already draining; a transient state never earns a block
            return Response::Error(format!("{} is already stopping", svc.ident()));
        }
        log::info!("Operator stop of {}", svc.ident());
        svc.block = BlockReason::Manual;
        self.step(id);
        self.drain_work();
        Response::Ok
    }

    /// Operator restart: plain stop/start cycle, no block involved
    fn op_restart(&mut self, id: SvcId) -> Response {
        let Some(svc) = self.registry.get(id) else {
            return Response::Error("service vanished".into());
        };
        if !svc.has_pid() {
            return Response::Error(format!("{} is not running", svc.ident()));
        }
        log::info!("Operator restart of {}", svc.ident());
        self.stop_svc(id);
        self.drain_work();
        Response::Ok
    }
}

fn svc_info(svc: &Svc) -> SvcInfo {
    SvcInfo {
        ident: svc.ident(),
        kind: svc.kind.as_str().into(),
        state: svc.state.as_str().into(),
        block: svc.block.as_str().into(),
        pid: svc.pid,
        runlevels: svc.runlevels.to_string(),
        command: svc.cmd.clone(),
        description: svc.desc.clone(),
    }
}

fn read_live_pidfile(svc: &Svc) -> Option<i32> {
    let path = svc.pidfile.as_ref().map(|p| p.path.as_path())?;
    let content = std::fs::read_to_string(path).ok()?;
    let pid = content.trim().parse::<i32>().ok().filter(|pid| *pid > 1)?;
    // A stale file naming a dead pid is not an adoption
    kill(Pid::from_raw(pid), None).ok()?;
    Some(pid)
}

fn remove_pidfile(svc: &Svc) {
    let Some(pidfile) = &svc.pidfile else {
        return;
    };
    if let Err(e) = std::fs::remove_file(&pidfile.path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!(
                "Failed removing {} pidfile {}: {}",
                svc.ident(),
                pidfile.path.display(),
                e
            );
        }
    }
}
