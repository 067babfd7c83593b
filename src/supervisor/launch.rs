//! Process launcher
//!
//! Forks children with the configured credentials, rlimits, environment
//! and stdio redirection.  Every child calls setsid() and so owns its own
//! process group; stopping and sweeping a service signals `-pid`.
//!
//! Word expansion of argv is restricted to environment variable
//! substitution (`$VAR` and `${VAR}`).  Shell globs and command
//! substitution are not honored, deliberately: a stanza is a command
//! line, not a shell script.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::pid1::{reap_pid, WaitResult};
use crate::svc::{BlockReason, LogTarget, Svc, SvcId, SvcKind, SvcState};
use crate::tty;

use super::{Supervisor, TimerKind, PIDFILE_POLL};

const PATH_DEFAULT: &str = "/usr/bin:/bin";

impl Supervisor {
    /// Launch a service.  Returns true when a child is running (or, for
    /// `run` commands, has run); false leaves the record in READY with
    /// either a raised crash count or a missing block.
    pub(super) fn start_svc(&mut self, id: SvcId) -> bool {
        // Ignore while respawning is paused
        if self.norespawn || Path::new("/run/servd/norespawn").exists() {
            return false;
        }

        let Some(svc) = self.registry.get(id) else {
            return false;
        };

        let argv = match build_argv(svc) {
            Ok(argv) => argv,
            Err(e) => {
                log::warn!("{}: {}", svc.ident(), e);
                self.svc_missing(id);
                return false;
            }
        };

        if which(&argv[0]).is_none() {
            log::warn!("{}: missing or not in $PATH", argv[0]);
            self.svc_missing(id);
            return false;
        }

        if let Some(env) = &svc.env_file {
            if env.required && !env.path.exists() {
                log::warn!("{}: missing env file {}", svc.cmd, env.path.display());
                self.svc_missing(id);
                return false;
            }
        }

        if svc.kind == SvcKind::Sysv {
            log::info!("Calling '{} start' ...", svc.cmd);
        }

        let progress = self.progress() && !svc.desc.is_empty();
        if progress {
            if svc.is_daemon() || svc.kind == SvcKind::Sysv {
                self.console.desc("Starting ", &svc.desc);
            } else {
                self.console.desc("", &svc.desc);
            }
        }

        let svc = self.registry.get(id).expect("checked above");
        let child = match spawn_child(svc, &argv, self.verbose) {
            Ok(child) => child,
            Err(e) => {
                log::error!("{}: failed to start: {}", svc.ident(), e);
                if progress {
                    self.console.result(1);
                }
                return false;
            }
        };

        let pid = child.id() as i32;
        // The handle is dropped; all children are collected through the
        // reaper, std children do not kill on drop.
        drop(child);

        let svc = self.registry.get_mut(id).expect("checked above");
        svc.pid = pid;
        svc.start_time = Some(Instant::now());
        svc.starting = svc.is_forking();
        log::info!("Starting {}[{}]", svc.ident(), pid);

        apply_cgroup(svc, pid);

        let mut rc = 0;
        match svc.kind {
            SvcKind::Run => {
                // Sequential commands complete before we move on
                let result = reap_pid(pid, true)
                    .map(|r| r.result)
                    .unwrap_or(WaitResult::Unknown);
                rc = if result.success() { 0 } else { 1 };
                let svc = self.registry.get_mut(id).expect("checked above");
                svc.status = Some(result);
                svc.once += 1;
                svc.started = result.success();
                svc.book_stopped();
                self.set_state(id, SvcState::Stopping);
            }
            SvcKind::Service | SvcKind::Tty => {
                let svc = self.registry.get(id).expect("checked above");
                write_pidfile(svc, pid);
                // Forking daemons assert their condition once the real
                // pid has been adopted from the pidfile
                if !svc.is_forking() {
                    self.conds.set(&svc.provides_cond());
                }
            }
            _ => {}
        }

        if progress {
            self.console.result(rc);
        }
        rc == 0
    }

    /// Reload a SIGHUP-capable service in place
    pub(super) fn restart_sighup(&mut self, id: SvcId) {
        if self.norespawn {
            return;
        }
        let Some(svc) = self.registry.get(id) else {
            return;
        };
        if !svc.sighup {
            return;
        }
        if !svc.has_pid() {
            log::debug!("Bad PID {} for {}, cannot SIGHUP", svc.pid, svc.ident());
            if let Some(svc) = self.registry.get_mut(id) {
                svc.book_stopped();
            }
            return;
        }

        let pid = svc.pid;
        let ident = svc.ident();
        let desc = svc.desc.clone();
        let progress = self.progress() && !desc.is_empty();

        if progress {
            self.console.desc("Restarting ", &desc);
        }

        log::info!("Restarting {}[{}], sending SIGHUP ...", ident, pid);
        let lost = match nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGHUP,
        ) {
            Err(nix::errno::Errno::ESRCH) => true,
            _ => {
                let svc = self.registry.get_mut(id).expect("checked above");
                if svc.is_forking() {
                    // Declare we are waiting for the pidfile to reappear
                    svc.starting = true;
                    self.timers
                        .arm(id, TimerKind::Adopt, PIDFILE_POLL, Instant::now());
                } else if let Some(pidfile) = &svc.pidfile {
                    touch(&pidfile.path);
                }
                false
            }
        };

        if progress {
            self.console.result(if lost { 1 } else { 0 });
        }

        if lost {
            // Nobody home; feed the exit through the normal monitor path
            self.handle_reaped(crate::pid1::Reaped {
                pid,
                result: WaitResult::Exited(0),
            });
        }
    }

    /// Run a sysv script (`cmd start` / `cmd stop`) to completion
    pub(super) fn run_sysv_script(&mut self, id: SvcId, verb: &str) -> i32 {
        let Some(svc) = self.registry.get(id) else {
            return 1;
        };

        let mut cmd = Command::new(&svc.cmd);
        cmd.arg(verb)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id() as i32;
                drop(child);
                match reap_pid(pid, true).map(|r| r.result) {
                    Some(WaitResult::Exited(code)) => code,
                    Some(_) => 1,
                    None => 1,
                }
            }
            Err(e) => {
                log::error!("Failed to fork for '{} {}': {}", svc.cmd, verb, e);
                1
            }
        }
    }

    /// Run a helper script outside service supervision (networking)
    pub(super) fn run_script(&self, path: &Path, arg: &str) {
        let status = Command::new(path)
            .arg(arg)
            .stdin(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => log::warn!("{} {} exited with {}", path.display(), arg, status),
            Err(e) => log::warn!("Cannot run {} {}: {}", path.display(), arg, e),
        }
    }

    fn svc_missing(&mut self, id: SvcId) {
        if let Some(svc) = self.registry.get_mut(id) {
            svc.block = BlockReason::Missing;
        }
    }
}

/// Resolve the argv a service execs
fn build_argv(svc: &Svc) -> Result<Vec<String>, String> {
    match svc.kind {
        SvcKind::Sysv => Ok(vec![svc.cmd.clone(), "start".into()]),
        SvcKind::Tty => {
            let conf = svc.tty.as_ref().ok_or("tty record without tty config")?;
            let argv = conf.build_argv().map_err(|e| e.to_string())?;
            if let Some(dev) = conf.dev.as_deref().filter(|d| *d != "@console") {
                tty::check_device(dev).map_err(|e| e.to_string())?;
            }
            Ok(argv)
        }
        _ => {
            let env = compose_env(svc);
            let mut argv = vec![svc.cmd.clone()];
            argv.extend(svc.args.iter().map(|arg| expand_word(arg, &env)));
            Ok(argv)
        }
    }
}

/// Fork and exec the child with full plumbing
fn spawn_child(svc: &Svc, argv: &[String], verbose: bool) -> std::io::Result<std::process::Child> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);

    for (key, value) in compose_env(svc) {
        cmd.env(key, value);
    }

    // Stdio is wired up parent-side; the tty kind overrides it in the
    // child once the device is its controlling terminal.
    if svc.kind == SvcKind::Tty {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    } else {
        cmd.stdin(Stdio::null());
        let (out, err) = redirect_stdio(svc, verbose);
        cmd.stdout(out).stderr(err);
    }

    let uid_gid = resolve_credentials(svc);
    let rlimits = svc.rlimits.clone();
    let tty_dev = match (&svc.kind, &svc.tty) {
        (SvcKind::Tty, Some(conf)) => conf
            .dev
            .as_deref()
            .filter(|d| *d != "@console")
            .map(str::to_string)
            .or_else(|| tty::atcon().ok()),
        _ => None,
    };

    unsafe {
        cmd.pre_exec(move || {
            // Detach from our controlling terminal and own a fresh
            // process group, so kill(-pid) reaches the whole service.
            libc::setsid();

            for (name, limit) in &rlimits {
                if !apply_rlimit(name, *limit) {
                    log::warn!("Failed setting rlimit {}", name);
                }
            }

            if let Some((uid, gid, _)) = &uid_gid {
                if libc::setgid(*gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(*uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(dev) = &tty_dev {
                setup_tty(dev)?;
            }

            Ok(())
        });
    }

    cmd.spawn()
}

/// In-child terminal setup for tty services
fn setup_tty(dev: &str) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = fs::OpenOptions::new().read(true).write(true).open(dev)?;
    let fd = file.as_raw_fd();

    unsafe {
        if libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
        if fd > 2 {
            libc::close(fd);
        }
    }
    // The fd lives on as 0/1/2
    std::mem::forget(file);
    Ok(())
}

/// Compose the child environment: inherited, user defaults, env file
fn compose_env(svc: &Svc) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    if let Some((uid, _, home)) = resolve_credentials(svc) {
        if uid > 0 {
            env.insert("PATH".into(), PATH_DEFAULT.into());
        }
        if let Some(home) = home {
            env.insert("HOME".into(), home);
        }
    }

    if let Some(env_file) = &svc.env_file {
        match load_env_file(&env_file.path) {
            Ok(vars) => env.extend(vars),
            Err(e) => {
                if env_file.required {
                    log::warn!("{}: env file {}: {}", svc.ident(), env_file.path.display(), e);
                }
            }
        }
    }

    env
}

/// KEY=VALUE lines; `#` and `;` comments, quotes stripped, whitespace
/// trimmed on both sides of the `=`
fn load_env_file(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let content = fs::read_to_string(path)?;
    let mut vars = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && (value.starts_with('"') && value.ends_with('"')
                || value.starts_with('\'') && value.ends_with('\''))
        {
            value = &value[1..value.len() - 1];
        }
        vars.insert(key.to_string(), value.to_string());
    }

    Ok(vars)
}

/// Restricted word expansion: `$VAR` and `${VAR}` only
fn expand_word(word: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                if let Some(value) = env.get(&name) {
                    out.push_str(value);
                }
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(value) = env.get(&name) {
                    out.push_str(value);
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Map a username/group to (uid, gid, home)
fn resolve_credentials(svc: &Svc) -> Option<(libc::uid_t, libc::gid_t, Option<String>)> {
    let username = svc.username.as_deref()?;
    let (uid, mut gid, home) = lookup_user(username)?;

    if let Some(group) = svc.group.as_deref() {
        if let Some(found) = lookup_group(group) {
            gid = found;
        } else {
            log::warn!("{}: unknown group {}", svc.ident(), group);
        }
    }

    Some((uid, gid, home))
}

fn lookup_user(user: &str) -> Option<(libc::uid_t, libc::gid_t, Option<String>)> {
    use std::ffi::{CStr, CString};

    if let Ok(uid) = user.parse::<libc::uid_t>() {
        return Some((uid, uid, None));
    }

    let name = CString::new(user).ok()?;
    unsafe {
        let pwd = libc::getpwnam(name.as_ptr());
        if pwd.is_null() {
            return None;
        }
        let home = if (*pwd).pw_dir.is_null() {
            None
        } else {
            Some(CStr::from_ptr((*pwd).pw_dir).to_string_lossy().into_owned())
        };
        Some(((*pwd).pw_uid, (*pwd).pw_gid, home))
    }
}

fn lookup_group(group: &str) -> Option<libc::gid_t> {
    use std::ffi::CString;

    if let Ok(gid) = group.parse::<libc::gid_t>() {
        return Some(gid);
    }

    let name = CString::new(group).ok()?;
    unsafe {
        let grp = libc::getgrnam(name.as_ptr());
        if grp.is_null() {
            None
        } else {
            Some((*grp).gr_gid)
        }
    }
}

/// setrlimit by resource name; returns false for unknown names
fn apply_rlimit(name: &str, limit: u64) -> bool {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let rc = unsafe {
        match name {
            "as" => libc::setrlimit(libc::RLIMIT_AS, &rlim),
            "core" => libc::setrlimit(libc::RLIMIT_CORE, &rlim),
            "cpu" => libc::setrlimit(libc::RLIMIT_CPU, &rlim),
            "data" => libc::setrlimit(libc::RLIMIT_DATA, &rlim),
            "fsize" => libc::setrlimit(libc::RLIMIT_FSIZE, &rlim),
            "memlock" => libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim),
            "nofile" => libc::setrlimit(libc::RLIMIT_NOFILE, &rlim),
            "nproc" => libc::setrlimit(libc::RLIMIT_NPROC, &rlim),
            "stack" => libc::setrlimit(libc::RLIMIT_STACK, &rlim),
            _ => return false,
        }
    };
    rc == 0
}

/// Where the child's stdout/stderr go
fn redirect_stdio(svc: &Svc, verbose: bool) -> (Stdio, Stdio) {
    if !svc.log.enabled {
        return if verbose {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };
    }

    let path: PathBuf = match svc.log.target {
        LogTarget::Null => return (Stdio::null(), Stdio::null()),
        LogTarget::Console => PathBuf::from("/dev/console"),
        LogTarget::File => svc
            .log
            .file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/log/{}.log", svc.ident()))),
    };

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(out) => match out.try_clone() {
            Ok(err) => (Stdio::from(out), Stdio::from(err)),
            Err(_) => (Stdio::from(out), Stdio::null()),
        },
        Err(e) => {
            log::warn!("{}: cannot open log {}: {}", svc.ident(), path.display(), e);
            (Stdio::null(), Stdio::null())
        }
    }
}

/// Create the pidfile for a freshly started, non-forking daemon
fn write_pidfile(svc: &Svc, pid: i32) {
    let Some(pidfile) = &svc.pidfile else {
        return;
    };
    if pidfile.forking {
        // The daemon writes this file itself
        return;
    }
    if let Some(parent) = pidfile.path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(e) = fs::write(&pidfile.path, format!("{}\n", pid)) {
        log::warn!(
            "{}: cannot write pidfile {}: {}",
            svc.ident(),
            pidfile.path.display(),
            e
        );
    }
}

fn touch(path: &Path) {
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path);
}

/// Apply cgroup settings; best effort, the tree may not be mounted
fn apply_cgroup(svc: &Svc, pid: i32) {
    let Some(settings) = &svc.cgroup else {
        return;
    };

    let (group, settings) = match settings.split_once(':') {
        Some((group, rest)) => (group.to_string(), rest),
        None => (svc.ident(), settings.as_str()),
    };

    let dir = PathBuf::from("/sys/fs/cgroup/servd").join(group);
    if fs::create_dir_all(&dir).is_err() {
        log::debug!("{}: no cgroup tree, skipping", svc.ident());
        return;
    }

    if let Err(e) = fs::write(dir.join("cgroup.procs"), pid.to_string()) {
        log::warn!("{}: cannot move into cgroup: {}", svc.ident(), e);
        return;
    }

    for setting in settings.split(',').filter(|s| !s.is_empty()) {
        let Some((key, value)) = setting.split_once('=') else {
            continue;
        };
        if let Err(e) = fs::write(dir.join(key), value) {
            log::warn!("{}: cgroup {}={}: {}", svc.ident(), key, value, e);
        }
    }
}

/// Find an executable: explicit paths are checked directly, bare names
/// searched in $PATH
fn which(cmd: &str) -> Option<PathBuf> {
    let executable = |path: &Path| {
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return executable(&path).then_some(path);
    }

    let search = std::env::var("PATH").unwrap_or_else(|_| PATH_DEFAULT.into());
    search
        .split(':')
        .map(|dir| Path::new(dir).join(cmd))
        .find(|path| executable(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_word() {
        let mut env = HashMap::new();
        env.insert("IFACE".to_string(), "eth0".to_string());
        env.insert("OPTS".to_string(), "-v".to_string());

        assert_eq!(expand_word("plain", &env), "plain");
        assert_eq!(expand_word("$IFACE", &env), "eth0");
        assert_eq!(expand_word("${IFACE}", &env), "eth0");
        assert_eq!(expand_word("-i$IFACE", &env), "-ieth0");
        assert_eq!(expand_word("$IFACE/$OPTS", &env), "eth0/-v");
        assert_eq!(expand_word("$MISSING", &env), "");
        assert_eq!(expand_word("$$IFACE", &env), "$IFACE");
        assert_eq!(expand_word("a$", &env), "a$");
        // Globs are not expansion business
        assert_eq!(expand_word("*.conf", &env), "*.conf");
    }

    #[test]
    fn test_load_env_file() {
        let path = PathBuf::from(format!(
            "/tmp/servd-env-test-{}",
            std::process::id()
        ));
        fs::write(
            &path,
            "# comment\n; also comment\nFOO=bar\n  SPACED = \"quoted value\" \nNOEQ\nEMPTY=\n",
        )
        .unwrap();

        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(
            vars.get("SPACED").map(String::as_str),
            Some("quoted value")
        );
        assert_eq!(vars.get("EMPTY").map(String::as_str), Some(""));
        assert!(!vars.contains_key("NOEQ"));
        assert!(!vars.contains_key("# comment"));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_which() {
        assert!(which("/bin/sh").is_some());
        assert!(which("sh").is_some());
        assert!(which("/bin/definitely-not-here").is_none());
        assert!(which("definitely-not-here").is_none());
    }
}
