//! Service registration and configuration reload
//!
//! Records are created on first registration and refreshed in place on
//! reload: fields are overwritten, and `dirty` is raised only when the
//! stanza text actually changed.  Reload marks every record removed,
//! re-registers what the parser still produces, and tears down the rest.

use nix::sys::signal::Signal;

use crate::cond;
use crate::conf::{self, Stanza};
use crate::runlevel::RUNLEVEL_S;
use crate::svc::{BlockReason, Svc, SvcId, DEFAULT_KILLDELAY};

use super::Supervisor;

impl Supervisor {
    /// Register or refresh one stanza.  Returns the record id, or none
    /// when the stanza is skipped (bootstrap-only after bootstrap).
    pub fn register_stanza(&mut self, stanza: &Stanza) -> Option<SvcId> {
        // Bootstrap-only records make no sense once bootstrap is done
        if self.runlevel != RUNLEVEL_S
            && stanza.runlevels.bootstrap_exclusive()
            && self.registry.find(&stanza.cmd, &stanza.instance).is_none()
        {
            log::debug!("Skipping {}, bootstrap is completed", stanza.cmd);
            return None;
        }

        let (id, is_new) = match self.registry.find(&stanza.cmd, &stanza.instance) {
            Some(id) => (id, false),
            None => {
                log::debug!(
                    "Creating new {} record for {} id '{}'",
                    stanza.kind.as_str(),
                    stanza.cmd,
                    stanza.instance
                );
                let svc = Svc::new(stanza.kind, &stanza.cmd, &stanza.instance);
                (self.registry.insert(svc), true)
            }
        };

        let svc = self.registry.get_mut(id).expect("just inserted or found");

        // Text comparison decides dirtiness; identical stanzas are a
        // no-op beyond the field refresh.
        let changed = !is_new && svc.stanza != stanza.text;
        svc.dirty = changed;
        svc.removed = false;

        // A record that failed with a missing binary gets another chance
        if svc.block == BlockReason::Missing {
            svc.block = BlockReason::None;
        }

        svc.kind = stanza.kind;
        svc.args = stanza.args.clone();
        svc.desc = stanza.desc.clone();
        svc.runlevels = stanza.runlevels;
        svc.conds = stanza.conds.clone();
        svc.sighup = stanza.sighup;
        svc.username = stanza.username.clone();
        svc.group = stanza.group.clone();
        svc.log = stanza.log.clone();
        svc.pidfile = stanza.pidfile.clone();
        svc.env_file = stanza.env_file.clone();
        svc.cgroup = stanza.cgroup.clone();
        svc.rlimits = stanza.rlimits.clone();
        svc.tty = stanza.tty.clone();
        svc.file = stanza.file.clone();
        svc.stanza = stanza.text.clone();

        // Optional fields fall back to their defaults when a reload
        // drops them from the stanza
        svc.name = stanza.name.clone().unwrap_or_else(|| {
            stanza
                .cmd
                .rsplit('/')
                .next()
                .unwrap_or(&stanza.cmd)
                .to_string()
        });
        svc.sighalt = stanza.sighalt.unwrap_or(Signal::SIGTERM);
        svc.killdelay = stanza.killdelay.unwrap_or(DEFAULT_KILLDELAY);

        if is_new && stanza.manual && svc.is_daemon() {
            svc.block = BlockReason::Manual;
        }

        Some(id)
    }

    /// Re-read the configuration directory; called from the global FSM
    pub(super) fn reload_conf(&mut self) {
        log::info!("Reloading configuration from {}", self.conf_dir.display());

        // Everything is provisionally gone until the parser says otherwise
        for (_, svc) in self.registry.iter_mut() {
            svc.removed = true;
        }

        match conf::load_dir(&self.conf_dir) {
            Ok(config) => {
                if let Some(level) = config.default_runlevel {
                    self.default_runlevel = level;
                }
                for stanza in &config.stanzas {
                    self.register_stanza(stanza);
                }
            }
            Err(e) => {
                // Keep running with what we have; a bad reload must not
                // take down the machine
                log::error!("Reload failed, keeping old configuration: {}", e);
                for (_, svc) in self.registry.iter_mut() {
                    svc.removed = false;
                }
                return;
            }
        }

        self.update_rdeps();
    }

    /// Propagate dirtiness through the condition graph: if the provider
    /// of a condition changed, everything gated on it changes too.
    fn update_rdeps(&mut self) {
        let dirty_conds: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, svc)| svc.dirty)
            .map(|(_, svc)| svc.provides_cond())
            .collect();

        for changed in dirty_conds {
            for (_, svc) in self.registry.iter_mut() {
                if svc.has_cond() && !svc.dirty && cond::cond_affects(&changed, &svc.conds) {
                    log::debug!("{} depends on {}, marking dirty", svc.ident(), changed);
                    svc.dirty = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{parse_line, ConfItem};
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_supervisor() -> Supervisor {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let base = format!("/tmp/servd-reload-test-{}-{}", std::process::id(), id);
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(format!("{}/conf", base)).unwrap();
        let mut sup = Supervisor::new(format!("{}/conf", base), format!("{}/cond", base));
        sup.conds_mut().set_available(true);
        sup
    }

    fn stanza(line: &str) -> Stanza {
        match parse_line(line).unwrap().unwrap() {
            ConfItem::Stanza(s) => s,
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_register_twice_is_clean() {
        let mut sup = test_supervisor();
        let line = "service /usr/sbin/sshd -D -- SSH daemon";

        let id = sup.register_stanza(&stanza(line)).unwrap();
        assert!(!sup.svc(id).unwrap().dirty);

        // Identical text: refresh only, still clean
        let again = sup.register_stanza(&stanza(line)).unwrap();
        assert_eq!(id, again);
        assert!(!sup.svc(id).unwrap().dirty);

        // Changed argv: dirty
        let changed = sup
            .register_stanza(&stanza("service /usr/sbin/sshd -D -e -- SSH daemon"))
            .unwrap();
        assert_eq!(id, changed);
        assert!(sup.svc(id).unwrap().dirty);
    }

    #[test]
    fn test_instances_are_distinct() {
        let mut sup = test_supervisor();
        let a = sup
            .register_stanza(&stanza("service :eth1 /sbin/udhcpc -i eth1 -- DHCP"))
            .unwrap();
        let b = sup
            .register_stanza(&stanza("service :eth2 /sbin/udhcpc -i eth2 -- DHCP"))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(sup.svc(a).unwrap().ident(), "udhcpc:eth1");
        assert_eq!(sup.svc(b).unwrap().ident(), "udhcpc:eth2");
    }

    #[test]
    fn test_manual_block() {
        let mut sup = test_supervisor();
        let id = sup
            .register_stanza(&stanza("service manual:yes /usr/sbin/sshd -- SSH"))
            .unwrap();
        assert_eq!(sup.svc(id).unwrap().block, BlockReason::Manual);

        // Re-registration does not clear an operator-style block
        sup.register_stanza(&stanza("service manual:yes /usr/sbin/sshd -- SSH"));
        assert_eq!(sup.svc(id).unwrap().block, BlockReason::Manual);
    }

    #[test]
    fn test_rdeps_propagation() {
        let mut sup = test_supervisor();
        let zebra = sup
            .register_stanza(&stanza("service /usr/sbin/zebra -- Routing"))
            .unwrap();
        let ospfd = sup
            .register_stanza(&stanza("service <pid/zebra> /usr/sbin/ospfd -- OSPF"))
            .unwrap();

        // Simulate a reload where only zebra's stanza changed
        sup.svc_mut(zebra).unwrap().dirty = true;
        sup.update_rdeps();

        assert!(sup.svc(ospfd).unwrap().dirty);
    }

    #[test]
    fn test_bootstrap_only_skipped_after_bootstrap() {
        let mut sup = test_supervisor();
        sup.runlevel = 2;
        assert!(sup
            .register_stanza(&stanza("task [S] /bin/true -- Bootstrap task"))
            .is_none());
    }
}
