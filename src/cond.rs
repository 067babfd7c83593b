//! Condition store
//!
//! Conditions are named tri-state predicates (`on`/`off`/`flux`) consumed
//! by services as start gates.  They live as files under a tmpfs directory
//! (default `/run/servd/cond`): an absent file is `off`, a file holding the
//! asserted sentinel is `on`, and a file holding the reassert sentinel is
//! `flux` - a transient that makes dependent services pause rather than
//! stop.
//!
//! Well-known namespaces:
//! - `pid/<name>` - asserted while a supervised process runs
//! - `net/<iface>/up`, `net/<iface>/exists` - interface state
//! - `hook/<name>` - boot/shutdown hook points
//!
//! The store only becomes usable once the base filesystems are mounted.
//! Before that, writes are silently dropped (never queued) and reads
//! report `on` so bootstrap tasks are not stalled.

use std::fs;
use std::path::{Path, PathBuf};

/// Default condition directory on the /run tmpfs
pub const COND_DIR: &str = "/run/servd/cond";

const ON_SENTINEL: &str = "+";
const FLUX_SENTINEL: &str = "~";

/// Tri-state condition value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    On,
    Off,
    Flux,
}

impl CondState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Flux => "flux",
        }
    }
}

/// Filesystem-backed condition store
#[derive(Debug)]
pub struct CondStore {
    dir: PathBuf,
    available: bool,
}

impl CondStore {
    /// Create a store rooted at `dir`.  The store starts unavailable;
    /// call [`CondStore::set_available`] once base filesystems are up.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            available: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Flip availability.  Creates the backing directory on first enable.
    pub fn set_available(&mut self, available: bool) {
        if available && fs::create_dir_all(&self.dir).is_err() {
            log::error!("Cannot create condition directory {}", self.dir.display());
            return;
        }
        self.available = available;
    }

    /// Path of the backing file for `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read a single condition
    pub fn get(&self, name: &str) -> CondState {
        if !self.available {
            // Pre-mount reads report on, so bootstrap tasks are not stalled
            return CondState::On;
        }

        match fs::read_to_string(self.path(name)) {
            Ok(body) if body.trim_end() == ON_SENTINEL => CondState::On,
            Ok(_) => CondState::Flux,
            Err(_) => CondState::Off,
        }
    }

    /// Assert a condition.  Idempotent; drops the write when unavailable.
    pub fn set(&self, name: &str) {
        self.write(name, ON_SENTINEL);
    }

    /// Assert a condition unless it is already on.  Used for hook
    /// conditions that must fire exactly once per boot.
    pub fn set_oneshot(&self, name: &str) {
        if self.available && self.get(name) == CondState::On {
            return;
        }
        self.write(name, ON_SENTINEL);
    }

    /// Clear a condition.  Removing an absent file is not an error.
    pub fn clear(&self, name: &str) {
        if !self.available {
            return;
        }
        if let Err(e) = fs::remove_file(self.path(name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed clearing condition {}: {}", name, e);
            }
        }
    }

    /// Mark an asserted condition as in flux.  Dependent services observe
    /// the transient and pause until the owner re-asserts with
    /// [`CondStore::set`].
    pub fn reassert(&self, name: &str) {
        if !self.available {
            return;
        }
        if self.path(name).exists() {
            self.write(name, FLUX_SENTINEL);
        }
    }

    fn write(&self, name: &str, sentinel: &str) {
        if !self.available || !valid_name(name) {
            return;
        }

        let path = self.path(name);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                log::warn!("Cannot create condition parent for {}", name);
                return;
            }
        }
        if let Err(e) = fs::write(&path, sentinel) {
            log::warn!("Failed asserting condition {}: {}", name, e);
        }
    }

    /// List every known condition with its state, for the operator
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if self.available {
            walk(&self.dir, &self.dir, &mut out);
        }
        out.sort();
        out.iter()
            .map(|name| (name.clone(), self.get(name).as_str().to_string()))
            .collect()
    }

    /// Aggregate a condition expression: `on` iff all are on, `off` if
    /// any is off, otherwise `flux`.  The empty expression is `on`.
    pub fn get_agg(&self, expr: &[String]) -> CondState {
        let mut agg = CondState::On;
        for name in expr {
            match self.get(name) {
                CondState::Off => return CondState::Off,
                CondState::Flux => agg = CondState::Flux,
                CondState::On => {}
            }
        }
        agg
    }
}

/// Does a change of `changed` affect the expression `expr`?
///
/// A condition affects an expression when it is referenced verbatim or
/// when one is a path-parent of the other, e.g. `net/eth0` affects
/// `net/eth0/up`.
pub fn cond_affects(changed: &str, expr: &[String]) -> bool {
    expr.iter().any(|name| {
        name == changed
            || name.starts_with(&format!("{}/", changed))
            || changed.starts_with(&format!("{}/", name))
    })
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !Path::new(name)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_store() -> CondStore {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = format!("/tmp/servd-cond-test-{}-{}", std::process::id(), id);
        let _ = fs::remove_dir_all(&dir);
        let mut store = CondStore::new(dir);
        store.set_available(true);
        store
    }

    #[test]
    fn test_set_get_clear() {
        let store = test_store();
        assert_eq!(store.get("pid/zebra"), CondState::Off);

        store.set("pid/zebra");
        assert_eq!(store.get("pid/zebra"), CondState::On);

        // Idempotent
        store.set("pid/zebra");
        assert_eq!(store.get("pid/zebra"), CondState::On);

        store.clear("pid/zebra");
        assert_eq!(store.get("pid/zebra"), CondState::Off);

        // Clearing twice is fine
        store.clear("pid/zebra");
        assert_eq!(store.get("pid/zebra"), CondState::Off);
    }

    #[test]
    fn test_reassert_flux_cycle() {
        let store = test_store();

        // Reassert of an absent condition does not create it
        store.reassert("net/eth0/up");
        assert_eq!(store.get("net/eth0/up"), CondState::Off);

        store.set("net/eth0/up");
        store.reassert("net/eth0/up");
        assert_eq!(store.get("net/eth0/up"), CondState::Flux);

        store.set("net/eth0/up");
        assert_eq!(store.get("net/eth0/up"), CondState::On);
    }

    #[test]
    fn test_aggregate() {
        let store = test_store();
        let expr = vec!["a".to_string(), "b".to_string()];

        assert_eq!(store.get_agg(&[]), CondState::On);
        assert_eq!(store.get_agg(&expr), CondState::Off);

        store.set("a");
        assert_eq!(store.get_agg(&expr), CondState::Off);

        store.set("b");
        assert_eq!(store.get_agg(&expr), CondState::On);

        store.reassert("b");
        assert_eq!(store.get_agg(&expr), CondState::Flux);

        // Off dominates flux regardless of order
        store.clear("a");
        assert_eq!(store.get_agg(&expr), CondState::Off);
    }

    #[test]
    fn test_unavailable_gate() {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = format!("/tmp/servd-cond-test-{}-u{}", std::process::id(), id);
        let _ = fs::remove_dir_all(&dir);
        let mut store = CondStore::new(dir.clone());

        // Writes are dropped, reads report on
        store.set("hook/banana");
        assert_eq!(store.get("hook/banana"), CondState::On);
        assert!(!Path::new(&dir).join("hook/banana").exists());

        store.set_available(true);
        assert_eq!(store.get("hook/banana"), CondState::Off);
    }

    #[test]
    fn test_oneshot() {
        let store = test_store();
        store.set_oneshot("hook/basefs-up");
        assert_eq!(store.get("hook/basefs-up"), CondState::On);
        store.set_oneshot("hook/basefs-up");
        assert_eq!(store.get("hook/basefs-up"), CondState::On);
    }

    #[test]
    fn test_affects() {
        let expr = vec!["net/eth0/up".to_string(), "pid/zebra".to_string()];
        assert!(cond_affects("pid/zebra", &expr));
        assert!(cond_affects("net/eth0", &expr));
        assert!(cond_affects("net/eth0/up", &expr));
        assert!(!cond_affects("net/eth1", &expr));
        assert!(!cond_affects("pid/zebr", &expr));
    }

    #[test]
    fn test_bad_names_rejected() {
        let store = test_store();
        store.set("../escape");
        assert_eq!(store.get("../escape"), CondState::Off);
    }
}
