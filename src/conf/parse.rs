//! Stanza line parser
//!
//! Grammar, options in any order before the command:
//!
//! ```text
//! <kind> [@user[:group]] [[!]runlevels] [<[!]cond[,cond..]>] [:id]
//!        [log[:...]] [pid:[!]/path] [name:NAME] [manual:yes]
//!        [halt:SIGNAL] [kill:SECONDS] [env:[-]/path]
//!        [cgroup[.GROUP]:key=val,...]
//!        /path/to/binary arg1 arg2 ... [-- Description]
//! ```
//!
//! A `<!>` condition marks a service that does not support SIGHUP and
//! must be stop/started on reconfiguration.  `pid:!/path` declares a
//! forking daemon whose real pid appears in the file.  `-- ` introduces
//! the description; a bare trailing `--` means an empty one.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::runlevel::{self, RunlevelError, RunlevelMask};
use crate::svc::{EnvFile, LogConfig, LogTarget, PidfileConf, SvcKind};
use crate::tty::{self, TtyConf, TtyError};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Incomplete stanza, no command given")]
    Incomplete,

    #[error("Unknown stanza kind '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Runlevels(#[from] RunlevelError),

    #[error("Unknown signal '{0}'")]
    BadSignal(String),

    #[error("kill delay '{0}' out of range (1-60 seconds)")]
    BadKillDelay(String),

    #[error(transparent)]
    Tty(#[from] TtyError),

    #[error("Invalid rlimit directive '{0}'")]
    BadRlimit(String),

    #[error("Invalid runlevel directive '{0}'")]
    BadRunlevelDirective(String),

    #[error("Unbalanced quoting")]
    Tokenize,
}

/// One parsed configuration line
#[derive(Debug)]
pub enum ConfItem {
    Stanza(Stanza),
    /// `runlevel N` - the level entered after bootstrap
    Runlevel(u8),
    /// `rlimit RESOURCE LIMIT` - global resource limit
    Rlimit(String, u64),
}

/// A parsed service/task/run/sysv/tty stanza
///
/// Field-for-field input to service registration; `text` keeps the line
/// minus its description, so reloads can detect records whose behavior
/// actually changed (editing only the description never restarts).
#[derive(Debug, Clone)]
pub struct Stanza {
    pub kind: SvcKind,
    pub text: String,
    pub file: Option<PathBuf>,

    pub username: Option<String>,
    pub group: Option<String>,
    pub runlevels: RunlevelMask,
    pub conds: Vec<String>,
    pub sighup: bool,
    pub instance: String,
    pub name: Option<String>,
    pub manual: bool,
    pub log: LogConfig,
    pub pidfile: Option<PidfileConf>,
    pub sighalt: Option<Signal>,
    pub killdelay: Option<Duration>,
    pub env_file: Option<EnvFile>,
    pub cgroup: Option<String>,
    pub rlimits: Vec<(String, u64)>,
    pub tty: Option<TtyConf>,

    pub cmd: String,
    pub args: Vec<String>,
    pub desc: String,
}

/// Parse one configuration line
///
/// Returns `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<ConfItem>, ParseError> {
    let text = line.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with(';') {
        return Ok(None);
    }

    let (body, desc) = split_description(text);
    let tokens = shlex::split(body).ok_or(ParseError::Tokenize)?;
    let Some(keyword) = tokens.first() else {
        return Ok(None);
    };

    let kind = match keyword.as_str() {
        "service" => SvcKind::Service,
        "task" => SvcKind::Task,
        "run" => SvcKind::Run,
        "sysv" => SvcKind::Sysv,
        "tty" => SvcKind::Tty,
        "runlevel" => {
            let level = tokens
                .get(1)
                .and_then(|t| t.parse::<u8>().ok())
                .filter(|l| (1..=9).contains(l))
                .ok_or_else(|| ParseError::BadRunlevelDirective(text.to_string()))?;
            return Ok(Some(ConfItem::Runlevel(level)));
        }
        "rlimit" => return parse_rlimit(&tokens, text).map(Some),
        other => return Err(ParseError::UnknownKind(other.to_string())),
    };

    let mut stanza = Stanza {
        kind,
        text: body.trim().to_string(),
        file: None,
        username: None,
        group: None,
        runlevels: default_runlevels(kind),
        conds: Vec::new(),
        sighup: true,
        instance: String::new(),
        name: None,
        manual: false,
        log: LogConfig::default(),
        pidfile: None,
        sighalt: None,
        killdelay: None,
        env_file: None,
        cgroup: None,
        rlimits: Vec::new(),
        tty: None,
        cmd: String::new(),
        args: Vec::new(),
        desc: desc.unwrap_or_default(),
    };

    let mut iter = tokens[1..].iter().peekable();
    while let Some(tok) = iter.peek() {
        let tok = tok.as_str();
        if let Some(user) = tok.strip_prefix('@') {
            match user.split_once(':') {
                Some((user, group)) => {
                    stanza.username = Some(user.to_string());
                    stanza.group = Some(group.to_string());
                }
                None => stanza.username = Some(user.to_string()),
            }
        } else if tok.starts_with('[') {
            stanza.runlevels = runlevel::parse_runlevels(Some(tok))?;
        } else if tok.starts_with('<') {
            parse_conds(tok, &mut stanza);
        } else if let Some(id) = tok.strip_prefix(':') {
            stanza.instance = id.to_string();
        } else if tok == "log" || tok.starts_with("log:") {
            stanza.log = parse_log(tok);
        } else if let Some(pid) = tok.strip_prefix("pid:") {
            stanza.pidfile = Some(parse_pidfile(pid));
        } else if let Some(name) = tok.strip_prefix("name:") {
            stanza.name = Some(name.to_string());
        } else if tok.eq_ignore_ascii_case("manual:yes") {
            stanza.manual = true;
        } else if let Some(halt) = tok.strip_prefix("halt:") {
            stanza.sighalt =
                Some(sig_from_name(halt).ok_or_else(|| ParseError::BadSignal(halt.to_string()))?);
        } else if let Some(delay) = tok.strip_prefix("kill:") {
            let secs: u64 = delay
                .parse()
                .ok()
                .filter(|s| (1..=60).contains(s))
                .ok_or_else(|| ParseError::BadKillDelay(delay.to_string()))?;
            stanza.killdelay = Some(Duration::from_secs(secs));
        } else if let Some(env) = tok.strip_prefix("env:") {
            stanza.env_file = Some(match env.strip_prefix('-') {
                Some(path) => EnvFile {
                    path: PathBuf::from(path),
                    required: false,
                },
                None => EnvFile {
                    path: PathBuf::from(env),
                    required: true,
                },
            });
        } else if tok.starts_with("cgroup:") || tok.starts_with("cgroup.") {
            stanza.cgroup = Some(tok["cgroup".len()..].trim_start_matches(':').to_string());
        } else {
            break;
        }
        iter.next();
    }

    let rest: Vec<String> = iter.cloned().collect();

    if kind == SvcKind::Tty {
        let tty = tty::parse_tty_args(&rest)?;
        stanza.cmd = tty.command();
        stanza.instance = tty.instance();
        stanza.name = Some("getty".into());
        stanza.tty = Some(tty);
        return Ok(Some(ConfItem::Stanza(stanza)));
    }

    let Some((cmd, args)) = rest.split_first() else {
        return Err(ParseError::Incomplete);
    };
    stanza.cmd = cmd.clone();
    stanza.args = args.to_vec();

    Ok(Some(ConfItem::Stanza(stanza)))
}

fn default_runlevels(kind: SvcKind) -> RunlevelMask {
    match kind {
        // Gettys usually live on 1-5 so single-user still has a console
        SvcKind::Tty => RunlevelMask::EMPTY
            .with(1)
            .with(2)
            .with(3)
            .with(4)
            .with(5),
        _ => RunlevelMask::default_service(),
    }
}

/// Split off the trailing description: `cmd args -- Description`
fn split_description(text: &str) -> (&str, Option<String>) {
    if let Some((body, desc)) = text.split_once(" -- ") {
        return (body, Some(desc.trim().to_string()));
    }
    // Bare trailing "--" denotes an explicitly empty description
    if let Some(body) = text.strip_suffix(" --") {
        return (body, Some(String::new()));
    }
    (text, None)
}

/// `<[!][cond][,cond..]>`; leading '!' clears SIGHUP support
fn parse_conds(tok: &str, stanza: &mut Stanza) {
    let inner = tok.trim_start_matches('<').trim_end_matches('>');
    let inner = match inner.strip_prefix('!') {
        Some(rest) => {
            stanza.sighup = false;
            rest
        }
        None => inner,
    };
    stanza.conds = inner
        .split(',')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
}

/// `log`, `log:null`, `log:console`, `log:/path[,ident:NAME]`
fn parse_log(tok: &str) -> LogConfig {
    let mut log = LogConfig {
        enabled: true,
        ..Default::default()
    };

    let Some(rest) = tok.strip_prefix("log:") else {
        return log;
    };

    for part in rest.split(',') {
        match part {
            "null" | "/dev/null" => log.target = LogTarget::Null,
            "console" | "/dev/console" => log.target = LogTarget::Console,
            _ if part.starts_with('/') => {
                log.target = LogTarget::File;
                log.file = Some(PathBuf::from(part));
            }
            _ => {
                if let Some(ident) = part
                    .strip_prefix("ident:")
                    .or_else(|| part.strip_prefix("tag:"))
                {
                    log.ident = Some(ident.to_string());
                }
            }
        }
    }
    log
}

fn parse_pidfile(arg: &str) -> PidfileConf {
    match arg.strip_prefix('!') {
        Some(path) => PidfileConf {
            path: PathBuf::from(path),
            forking: true,
        },
        None => PidfileConf {
            path: PathBuf::from(arg),
            forking: false,
        },
    }
}

fn parse_rlimit(tokens: &[String], text: &str) -> Result<ConfItem, ParseError> {
    let bad = || ParseError::BadRlimit(text.to_string());
    let resource = tokens.get(1).ok_or_else(bad)?;
    let limit = tokens.get(2).ok_or_else(bad)?;
    let limit = match limit.as_str() {
        "unlimited" | "infinity" => libc::RLIM_INFINITY,
        num => num.parse().map_err(|_| bad())?,
    };
    Ok(ConfItem::Rlimit(resource.to_lowercase(), limit))
}

/// Resolve a signal name, with or without the SIG prefix
pub fn sig_from_name(name: &str) -> Option<Signal> {
    let upper = name.to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(line: &str) -> Stanza {
        match parse_line(line).unwrap().unwrap() {
            ConfItem::Stanza(s) => s,
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_service() {
        let s = stanza("service /usr/sbin/sshd -D -- SSH daemon");
        assert_eq!(s.kind, SvcKind::Service);
        assert_eq!(s.cmd, "/usr/sbin/sshd");
        assert_eq!(s.args, vec!["-D"]);
        assert_eq!(s.desc, "SSH daemon");
        assert!(s.sighup);
        assert!(s.conds.is_empty());
        assert_eq!(s.runlevels, RunlevelMask::default_service());
    }

    #[test]
    fn test_all_options() {
        let s = stanza(
            "service @quagga:quagga [2345] <pid/zebra,net/eth0/up> :inst \
             log:/var/log/ospfd.log name:ospfd manual:yes halt:SIGINT kill:5 \
             env:-/etc/default/ospfd pid:/run/ospfd.pid /usr/sbin/ospfd -d -- OSPF",
        );
        assert_eq!(s.username.as_deref(), Some("quagga"));
        assert_eq!(s.group.as_deref(), Some("quagga"));
        assert_eq!(s.conds, vec!["pid/zebra", "net/eth0/up"]);
        assert_eq!(s.instance, "inst");
        assert_eq!(s.name.as_deref(), Some("ospfd"));
        assert!(s.manual);
        assert_eq!(s.sighalt, Some(Signal::SIGINT));
        assert_eq!(s.killdelay, Some(Duration::from_secs(5)));
        let env = s.env_file.unwrap();
        assert!(!env.required);
        assert_eq!(env.path, PathBuf::from("/etc/default/ospfd"));
        let pidfile = s.pidfile.unwrap();
        assert!(!pidfile.forking);
        assert_eq!(pidfile.path, PathBuf::from("/run/ospfd.pid"));
        assert_eq!(s.log.target, LogTarget::File);
        assert_eq!(s.cmd, "/usr/sbin/ospfd");
        assert_eq!(s.args, vec!["-d"]);
    }

    #[test]
    fn test_nohup_marker() {
        let s = stanza("service <!> /sbin/dropbear -- SSH");
        assert!(!s.sighup);
        assert!(s.conds.is_empty());

        let s = stanza("service <!pid/zebra> /usr/sbin/ospfd -- OSPF");
        assert!(!s.sighup);
        assert_eq!(s.conds, vec!["pid/zebra"]);
    }

    #[test]
    fn test_forking_pidfile() {
        let s = stanza("service pid:!/run/dnsmasq.pid /usr/sbin/dnsmasq -- DNS");
        assert!(s.pidfile.unwrap().forking);
    }

    #[test]
    fn test_empty_description() {
        let s = stanza("task [S] /sbin/mkswap /dev/sda2 --");
        assert_eq!(s.desc, "");
        assert_eq!(s.args, vec!["/dev/sda2"]);

        let s = stanza("task [S] /sbin/mkswap /dev/sda2");
        assert_eq!(s.desc, "");
    }

    #[test]
    fn test_quoted_args() {
        let s = stanza(r#"run [S] /bin/sh -c "echo hello world" -- Greeting"#);
        assert_eq!(s.args, vec!["-c", "echo hello world"]);
    }

    #[test]
    fn test_tty_stanza() {
        let s = stanza("tty [12345] /dev/ttyS0 115200 noclear vt220");
        assert_eq!(s.kind, SvcKind::Tty);
        let tty = s.tty.unwrap();
        assert_eq!(tty.dev.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(s.instance, "ttyS0");
        assert_eq!(s.name.as_deref(), Some("getty"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_line("service [2345] -- Nothing"),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            parse_line("dance /bin/true"),
            Err(ParseError::UnknownKind(_))
        ));
        assert!(matches!(
            parse_line("service kill:0 /bin/x"),
            Err(ParseError::BadKillDelay(_))
        ));
        assert!(matches!(
            parse_line("service kill:61 /bin/x"),
            Err(ParseError::BadKillDelay(_))
        ));
        assert!(matches!(
            parse_line("service halt:SIGWOBBLE /bin/x"),
            Err(ParseError::BadSignal(_))
        ));
    }

    #[test]
    fn test_comments_and_blanks() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# a comment").unwrap().is_none());
        assert!(parse_line("; also a comment").unwrap().is_none());
    }

    #[test]
    fn test_sig_from_name() {
        assert_eq!(sig_from_name("SIGTERM"), Some(Signal::SIGTERM));
        assert_eq!(sig_from_name("term"), Some(Signal::SIGTERM));
        assert_eq!(sig_from_name("USR1"), Some(Signal::SIGUSR1));
        assert_eq!(sig_from_name("bogus"), None);
    }
}
