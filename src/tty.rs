//! TTY lines
//!
//! A `tty` stanza is a degenerate service kind: it runs a getty (built-in
//! via agetty, or an external one like the BusyBox getty) on a terminal
//! line and respawns it like any other daemon.  Three shapes are accepted:
//!
//! ```text
//! tty [12345] /dev/ttyAMA0 115200 noclear vt220        # built-in
//! tty [12345] /sbin/getty -L 115200 ttyS0 vt100        # external
//! tty [12345] notty                                    # fallback shell
//! ```
//!
//! The `@console` wildcard resolves to the active kernel console(s) from
//! /sys/class/tty/console/active.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// sysexits(3) code for a missing or unusable TTY device
pub const EX_CONFIG: i32 = 78;
/// sysexits(3) code for a character device that is not a terminal
pub const EX_OSFILE: i32 = 72;

const DEFAULT_BAUD: &str = "115200,57600,38400,9600";
const GETTY: &str = "/sbin/agetty";
const SHELL: &str = "/bin/sh";

/// Parsed tty stanza
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TtyConf {
    /// Canonical device path, none for `notty`
    pub dev: Option<String>,
    /// Baud rate list for the built-in getty
    pub baud: Option<String>,
    /// TERM value for the built-in getty
    pub term: Option<String>,
    /// External getty command and its arguments
    pub cmd: Option<String>,
    pub args: Vec<String>,
    pub noclear: bool,
    pub nowait: bool,
    /// Fallback shell on the console, no getty and no login
    pub notty: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TtyError {
    #[error("Incomplete or non-existing TTY device given")]
    NoDevice,

    #[error("{0} is not a character device")]
    NotCharDev(String),

    #[error("Cannot resolve system console")]
    NoConsole,
}

/// Parse the tokens of a tty stanza, after kind and runlevels
pub fn parse_tty_args(tokens: &[String]) -> Result<TtyConf, TtyError> {
    let mut tty = TtyConf::default();
    let mut dev: Option<String> = None;
    let mut words = Vec::new();

    for tok in tokens {
        match tok.as_str() {
            "noclear" => tty.noclear = true,
            "nowait" => tty.nowait = true,
            "notty" => tty.notty = true,
            _ => words.push(tok.clone()),
        }
    }

    // A bringup shell needs no device probe
    if tty.notty {
        return Ok(tty);
    }

    for (idx, word) in words.iter().enumerate() {
        if idx == 0 {
            // First word decides built-in vs external getty
            if word == "@console"
                || word.starts_with("/dev")
                || word.starts_with("tty")
                || word == "console"
            {
                dev = Some(word.clone());
            } else {
                tty.cmd = Some(word.clone());
            }
            continue;
        }

        if tty.cmd.is_some() {
            // External getty: everything else is its argv
            tty.args.push(word.clone());
            continue;
        }

        // Built-in getty: BAUD[,BAUD...] then an optional trailing TERM
        if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            tty.baud = Some(word.clone());
        } else if idx + 1 == words.len() {
            tty.term = Some(word.clone());
        }
    }

    if let Some(cmd) = &tty.cmd {
        // External getty names its device in its own argv
        tty.dev = Some(
            tty.args
                .iter()
                .find(|a| a.starts_with("/dev") || a.starts_with("tty"))
                .cloned()
                .unwrap_or_else(|| cmd.clone()),
        );
        return Ok(tty);
    }

    let dev = dev.ok_or(TtyError::NoDevice)?;
    if dev == "@console" {
        tty.dev = Some(dev);
    } else {
        tty.dev = Some(canonicalize(&dev));
    }

    Ok(tty)
}

/// Prefix a bare device name with /dev
pub fn canonicalize(dev: &str) -> String {
    if dev.starts_with("/dev") {
        dev.to_string()
    } else {
        format!("/dev/{}", dev)
    }
}

/// Resolve the `@console` wildcard against the active kernel console
pub fn atcon() -> Result<String, TtyError> {
    let active =
        fs::read_to_string("/sys/class/tty/console/active").map_err(|_| TtyError::NoConsole)?;
    active
        .split_whitespace()
        .next()
        .map(canonicalize)
        .ok_or(TtyError::NoConsole)
}

/// Validate a TTY device before exec
///
/// Missing devices map to EX_CONFIG, present non-character devices to
/// EX_OSFILE, matching what a failed getty launch exits with.
pub fn check_device(dev: &str) -> Result<(), TtyError> {
    let meta = fs::metadata(Path::new(dev)).map_err(|_| TtyError::NoDevice)?;
    if !meta.file_type().is_char_device() {
        return Err(TtyError::NotCharDev(dev.to_string()));
    }
    Ok(())
}

impl TtyConf {
    /// Instance tag for the registry, derived from the device
    pub fn instance(&self) -> String {
        if self.notty {
            return "console".into();
        }
        self.dev
            .as_deref()
            .and_then(|d| d.rsplit('/').next())
            .unwrap_or("tty")
            .to_string()
    }

    /// Command path recorded on the service
    pub fn command(&self) -> String {
        if self.notty {
            SHELL.into()
        } else {
            self.cmd.clone().unwrap_or_else(|| GETTY.into())
        }
    }

    /// Build the argv to exec, resolving `@console` late so a console
    /// that appears after boot still works.
    pub fn build_argv(&self) -> Result<Vec<String>, TtyError> {
        if self.notty {
            return Ok(vec![SHELL.to_string()]);
        }

        if let Some(cmd) = &self.cmd {
            let mut argv = vec![cmd.clone()];
            argv.extend(self.args.iter().cloned());
            return Ok(argv);
        }

        let dev = match self.dev.as_deref() {
            Some("@console") => atcon()?,
            Some(dev) => dev.to_string(),
            None => return Err(TtyError::NoDevice),
        };

        let mut argv = vec![GETTY.to_string()];
        if self.noclear {
            argv.push("--noclear".into());
        }
        if self.nowait {
            argv.push("--skip-login".into());
        }
        // agetty wants the bare port name
        argv.push(dev.trim_start_matches("/dev/").to_string());
        argv.push(self.baud.clone().unwrap_or_else(|| DEFAULT_BAUD.into()));
        if let Some(term) = &self.term {
            argv.push(term.clone());
        }
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_builtin() {
        let tty = parse_tty_args(&toks("/dev/ttyAMA0 115200 noclear vt220")).unwrap();
        assert_eq!(tty.dev.as_deref(), Some("/dev/ttyAMA0"));
        assert_eq!(tty.baud.as_deref(), Some("115200"));
        assert_eq!(tty.term.as_deref(), Some("vt220"));
        assert!(tty.noclear);
        assert!(!tty.nowait);
        assert!(tty.cmd.is_none());

        let argv = tty.build_argv().unwrap();
        assert_eq!(argv[0], GETTY);
        assert!(argv.contains(&"--noclear".to_string()));
        assert!(argv.contains(&"ttyAMA0".to_string()));
        assert!(argv.contains(&"vt220".to_string()));
    }

    #[test]
    fn test_parse_bare_device() {
        let tty = parse_tty_args(&toks("ttyS0")).unwrap();
        assert_eq!(tty.dev.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(tty.instance(), "ttyS0");
    }

    #[test]
    fn test_parse_external() {
        let tty = parse_tty_args(&toks("/sbin/getty -L 115200 ttyS0 vt100 noclear")).unwrap();
        assert_eq!(tty.cmd.as_deref(), Some("/sbin/getty"));
        assert_eq!(tty.args, toks("-L 115200 ttyS0 vt100"));
        assert!(tty.noclear);

        let argv = tty.build_argv().unwrap();
        assert_eq!(argv[0], "/sbin/getty");
        assert_eq!(argv[1..], toks("-L 115200 ttyS0 vt100")[..]);
    }

    #[test]
    fn test_parse_notty() {
        let tty = parse_tty_args(&toks("notty noclear")).unwrap();
        assert!(tty.notty);
        assert_eq!(tty.build_argv().unwrap(), vec![SHELL.to_string()]);
        assert_eq!(tty.instance(), "console");
    }

    #[test]
    fn test_parse_no_device() {
        assert_eq!(parse_tty_args(&toks("noclear")), Err(TtyError::NoDevice));
    }

    #[test]
    fn test_check_device() {
        assert!(check_device("/dev/null").is_ok());
        assert_eq!(
            check_device("/dev/does-not-exist"),
            Err(TtyError::NoDevice)
        );
        assert!(matches!(
            check_device("/bin/sh"),
            Err(TtyError::NotCharDev(_))
        ));
    }
}
