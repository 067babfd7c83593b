//! Configuration handling
//!
//! servd is configured with stanza files, one directive per line:
//!
//! ```text
//! runlevel 2
//! rlimit nofile 1024
//!
//! service [2345] <pid/zebra> @quagga /usr/sbin/ospfd -- OSPF daemon
//! task [S] /sbin/mkswap /dev/sda2 -- Prepare swap
//! run [S] /sbin/hwclock -s -- Restore system clock
//! sysv [345] /etc/init.d/legacy -- Legacy service
//! tty [12345] /dev/ttyS0 115200 noclear vt220
//! ```
//!
//! The parser refuses malformed stanzas one by one; a bad line never
//! takes down the rest of the file.

mod parse;

pub use parse::{parse_line, sig_from_name, ConfItem, ParseError, Stanza};

use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration directory
pub const CONF_DIR: &str = "/etc/servd.d";

/// Everything gathered from a configuration directory
#[derive(Debug, Default)]
pub struct Config {
    /// From a `runlevel N` directive, the level entered after bootstrap
    pub default_runlevel: Option<u8>,
    /// Global `rlimit` directives, applied to every stanza
    pub rlimits: Vec<(String, u64)>,
    pub stanzas: Vec<Stanza>,
}

/// Load and parse every `.conf` file in `dir`, sorted by name
///
/// Parse errors are logged and the offending line skipped; other
/// services are unaffected.
pub fn load_dir(dir: &Path) -> std::io::Result<Config> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    files.sort();

    let mut config = Config::default();
    for path in files {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::error!("Cannot read {}: {}", path.display(), e);
                continue;
            }
        };
        parse_into(&mut config, &content, Some(&path));
    }

    // Globals come first, stanzas inherit them
    for stanza in &mut config.stanzas {
        stanza.rlimits = config.rlimits.clone();
    }

    Ok(config)
}

/// Parse a configuration string, logging and skipping bad lines
pub fn parse_into(config: &mut Config, content: &str, file: Option<&Path>) {
    for (lineno, line) in content.lines().enumerate() {
        match parse_line(line) {
            Ok(None) => {}
            Ok(Some(ConfItem::Runlevel(level))) => config.default_runlevel = Some(level),
            Ok(Some(ConfItem::Rlimit(name, limit))) => config.rlimits.push((name, limit)),
            Ok(Some(ConfItem::Stanza(mut stanza))) => {
                stanza.file = file.map(Path::to_path_buf);
                config.stanzas.push(stanza);
            }
            Err(e) => {
                log::error!(
                    "{}:{}: refusing stanza: {}",
                    file.map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<inline>".into()),
                    lineno + 1,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_line_does_not_poison_file() {
        let mut config = Config::default();
        parse_into(
            &mut config,
            "service /bin/a -- A\nservice [zz] /bin/broken\nservice /bin/b -- B\n",
            None,
        );
        assert_eq!(config.stanzas.len(), 2);
        assert_eq!(config.stanzas[0].cmd, "/bin/a");
        assert_eq!(config.stanzas[1].cmd, "/bin/b");
    }

    #[test]
    fn test_globals() {
        let mut config = Config::default();
        parse_into(
            &mut config,
            "runlevel 3\nrlimit nofile 1024\nservice /bin/a -- A\n",
            None,
        );
        assert_eq!(config.default_runlevel, Some(3));
        assert_eq!(config.rlimits, vec![("nofile".to_string(), 1024)]);
    }
}
