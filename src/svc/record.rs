//! The service record and its small state types

use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::pid1::WaitResult;
use crate::runlevel::RunlevelMask;
use crate::tty::TtyConf;

/// Default grace period between the halt signal and SIGKILL
pub const DEFAULT_KILLDELAY: Duration = Duration::from_millis(3000);

/// Kind of supervised command; selects the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcKind {
    /// Long-running daemon, respawned on exit
    Service,
    /// One-shot command, may run in parallel with others
    Task,
    /// One-shot command, run sequentially
    Run,
    /// Script controlled via `start`/`stop` subcommands
    Sysv,
    /// Getty on a terminal line
    Tty,
}

impl SvcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Task => "task",
            Self::Run => "run",
            Self::Sysv => "sysv",
            Self::Tty => "tty",
        }
    }

    /// Daemons are monitored and respawned
    pub fn is_daemon(&self) -> bool {
        matches!(self, Self::Service | Self::Tty)
    }

    /// Run/task/sysv commands run to completion per runlevel
    pub fn is_runtask(&self) -> bool {
        matches!(self, Self::Task | Self::Run | Self::Sysv)
    }
}

/// Per-service state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SvcState {
    /// Idle, not cleared to start
    Halted,
    /// One-shot completed for this runlevel
    Done,
    /// Halt signal sent, awaiting reap
    Stopping,
    /// Cleared to start, awaiting conditions
    Ready,
    /// Paused via SIGSTOP on a condition in flux
    Waiting,
    /// Child alive
    Running,
}

impl SvcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "halted",
            Self::Done => "done",
            Self::Stopping => "stopping",
            Self::Ready => "ready",
            Self::Waiting => "waiting",
            Self::Running => "running",
        }
    }
}

/// Why a service is administratively disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    /// Stopped by the operator, or declared `manual:yes`
    Manual,
    /// Command or environment file not found
    Missing,
    /// Hit the respawn cap; needs an operator start
    Crashing,
    /// Between crash and scheduled retry
    Restarting,
    /// A conflicting operation is already in progress
    Busy,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Manual => "manual",
            Self::Missing => "missing",
            Self::Crashing => "crashing",
            Self::Restarting => "restarting",
            Self::Busy => "busy",
        }
    }
}

/// Environment file reference, `env:/path` or `env:-/path` (optional)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFile {
    pub path: PathBuf,
    pub required: bool,
}

/// Where a service's stdout/stderr goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Drop all output
    #[default]
    Null,
    /// The system console
    Console,
    /// Append to a file
    File,
}

/// Parsed `log:...` stanza option
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig {
    pub enabled: bool,
    pub target: LogTarget,
    pub file: Option<PathBuf>,
    pub ident: Option<String>,
}

/// Parsed `pid:[!]/path` stanza option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidfileConf {
    pub path: PathBuf,
    /// `pid:!/path`: the daemon forks and writes the file itself
    pub forking: bool,
}

/// One supervised command
///
/// Configuration fields come from the stanza parser and are refreshed in
/// place on reload; runtime fields belong to the state machine.
#[derive(Debug, Clone)]
pub struct Svc {
    // Identity
    pub kind: SvcKind,
    pub cmd: String,
    pub args: Vec<String>,
    /// Instance tag from `:id`, empty by default
    pub instance: String,
    /// From `name:NAME`, defaults to the command basename
    pub name: String,
    pub desc: String,

    // Configuration
    pub runlevels: RunlevelMask,
    pub conds: Vec<String>,
    /// False when declared `<!...>`: reload means stop/start
    pub sighup: bool,
    pub sighalt: Signal,
    pub killdelay: Duration,
    pub username: Option<String>,
    pub group: Option<String>,
    pub env_file: Option<EnvFile>,
    pub log: LogConfig,
    pub pidfile: Option<PidfileConf>,
    pub rlimits: Vec<(String, u64)>,
    pub cgroup: Option<String>,
    pub tty: Option<TtyConf>,
    /// Originating .conf file, none for built-in records
    pub file: Option<PathBuf>,
    /// Stanza text minus description, compared on reload for changes
    pub stanza: String,

    // Runtime
    pub state: SvcState,
    pub block: BlockReason,
    /// 0 while not running; never 1 (we must not signal ourselves)
    pub pid: i32,
    pub oldpid: i32,
    pub status: Option<WaitResult>,
    pub start_time: Option<Instant>,
    pub restart_cnt: u32,
    /// Completions in the current runlevel, for run/task records
    pub once: u32,
    /// Sysv start script succeeded this runlevel
    pub started: bool,
    /// Stanza text changed since last start
    pub dirty: bool,
    /// Forking daemon launched, awaiting its pidfile
    pub starting: bool,
    /// Marked for removal by a config reload
    pub removed: bool,
}

impl Svc {
    pub fn new(kind: SvcKind, cmd: &str, instance: &str) -> Self {
        let name = cmd.rsplit('/').next().unwrap_or(cmd).to_string();
        Self {
            kind,
            cmd: cmd.to_string(),
            args: Vec::new(),
            instance: instance.to_string(),
            name,
            desc: String::new(),
            runlevels: RunlevelMask::default_service(),
            conds: Vec::new(),
            sighup: true,
            sighalt: Signal::SIGTERM,
            killdelay: DEFAULT_KILLDELAY,
            username: None,
            group: None,
            env_file: None,
            log: LogConfig::default(),
            pidfile: None,
            rlimits: Vec::new(),
            cgroup: None,
            tty: None,
            file: None,
            stanza: String::new(),
            state: SvcState::Halted,
            block: BlockReason::None,
            pid: 0,
            oldpid: 0,
            status: None,
            start_time: None,
            restart_cnt: 0,
            once: 0,
            started: false,
            dirty: false,
            starting: false,
            removed: false,
        }
    }

    /// Identifier shown to operators: `name` or `name:instance`
    pub fn ident(&self) -> String {
        if self.instance.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.instance)
        }
    }

    /// Condition this service provides while running
    pub fn provides_cond(&self) -> String {
        format!("pid/{}", self.ident())
    }

    pub fn is_daemon(&self) -> bool {
        self.kind.is_daemon()
    }

    pub fn is_runtask(&self) -> bool {
        self.kind.is_runtask()
    }

    pub fn in_runlevel(&self, level: u8) -> bool {
        self.runlevels.contains(level)
    }

    pub fn has_cond(&self) -> bool {
        !self.conds.is_empty()
    }

    /// A tracked child exists; pid 1 and below are never tracked
    pub fn has_pid(&self) -> bool {
        self.pid > 1
    }

    /// Declared with `pid:!/path`: the launched process is only an
    /// intermediate parent
    pub fn is_forking(&self) -> bool {
        self.pidfile.as_ref().map(|p| p.forking).unwrap_or(false)
    }

    /// Forget the child after reap or a lost signal
    pub fn book_stopped(&mut self) {
        self.oldpid = self.pid;
        self.pid = 0;
        self.start_time = None;
        self.starting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident() {
        let svc = Svc::new(SvcKind::Service, "/usr/sbin/sshd", "");
        assert_eq!(svc.ident(), "sshd");
        assert_eq!(svc.provides_cond(), "pid/sshd");

        let svc = Svc::new(SvcKind::Service, "/sbin/udhcpc", "eth1");
        assert_eq!(svc.ident(), "udhcpc:eth1");
        assert_eq!(svc.provides_cond(), "pid/udhcpc:eth1");
    }

    #[test]
    fn test_kinds() {
        assert!(SvcKind::Service.is_daemon());
        assert!(SvcKind::Tty.is_daemon());
        assert!(!SvcKind::Task.is_daemon());
        assert!(SvcKind::Task.is_runtask());
        assert!(SvcKind::Run.is_runtask());
        assert!(SvcKind::Sysv.is_runtask());
        assert!(!SvcKind::Service.is_runtask());
    }

    #[test]
    fn test_pid_guard() {
        let mut svc = Svc::new(SvcKind::Service, "/bin/x", "");
        assert!(!svc.has_pid());
        svc.pid = 1;
        assert!(!svc.has_pid());
        svc.pid = 4711;
        assert!(svc.has_pid());
        svc.book_stopped();
        assert!(!svc.has_pid());
        assert_eq!(svc.oldpid, 4711);
    }
}
