//! Boot and shutdown hook points
//!
//! Plugins register callbacks on named points in the boot/shutdown
//! sequence.  Running a point also asserts the one-shot condition
//! `hook/<name>`, so services can gate on e.g. `<hook/system-up>`.
//! Before the condition store is available these writes are dropped,
//! never queued; a pre-mount hook leaves no trace.

use crate::cond::CondStore;

/// Named points in the boot/shutdown sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Base filesystems mounted, condition store usable
    BasefsUp,
    /// All bootstrap tasks have completed
    SvcUp,
    /// The configured runlevel has been reached
    SystemUp,
    /// A runlevel change has begun
    RunlevelChange,
    /// A runlevel change has completed its teardown
    RunlevelUp,
    NetworkUp,
    NetworkDown,
    /// Shutdown has begun
    Shutdown,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BasefsUp => "basefs-up",
            Self::SvcUp => "svc-up",
            Self::SystemUp => "system-up",
            Self::RunlevelChange => "runlevel-change",
            Self::RunlevelUp => "runlevel-up",
            Self::NetworkUp => "network-up",
            Self::NetworkDown => "network-down",
            Self::Shutdown => "shutdown",
        }
    }

    /// Condition asserted when this point runs
    pub fn cond_name(&self) -> String {
        format!("hook/{}", self.as_str())
    }
}

/// Callback invoked when a hook point runs
pub type HookFn = Box<dyn FnMut(HookPoint, &mut CondStore)>;

/// Registered hook callbacks
#[derive(Default)]
pub struct Hooks {
    callbacks: Vec<HookFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: HookFn) {
        self.callbacks.push(callback);
    }

    /// Run a hook point: invoke callbacks, then assert its condition
    pub fn run(&mut self, point: HookPoint, conds: &mut CondStore) {
        log::debug!("Running hook {}", point.as_str());
        for callback in &mut self.callbacks {
            callback(point, conds);
        }

        match point {
            // Taking the network down retracts the up condition
            HookPoint::NetworkDown => conds.clear(&HookPoint::NetworkUp.cond_name()),
            point => conds.set_oneshot(&point.cond_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::CondState;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_conds() -> CondStore {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = format!("/tmp/servd-hooks-test-{}-{}", std::process::id(), id);
        let _ = std::fs::remove_dir_all(&dir);
        let mut conds = CondStore::new(dir);
        conds.set_available(true);
        conds
    }

    #[test]
    fn test_run_asserts_condition() {
        let mut conds = test_conds();
        let mut hooks = Hooks::new();
        hooks.run(HookPoint::SystemUp, &mut conds);
        assert_eq!(conds.get("hook/system-up"), CondState::On);
    }

    #[test]
    fn test_callbacks_see_store() {
        let mut conds = test_conds();
        let mut hooks = Hooks::new();
        hooks.register(Box::new(|point, conds| {
            if point == HookPoint::NetworkUp {
                conds.set("net/eth0/up");
            }
        }));

        hooks.run(HookPoint::NetworkUp, &mut conds);
        assert_eq!(conds.get("net/eth0/up"), CondState::On);
        assert_eq!(conds.get("hook/network-up"), CondState::On);

        hooks.run(HookPoint::NetworkDown, &mut conds);
        assert_eq!(conds.get("hook/network-up"), CondState::Off);
    }

    #[test]
    fn test_pre_mount_writes_dropped() {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = format!("/tmp/servd-hooks-test-{}-p{}", std::process::id(), id);
        let mut conds = CondStore::new(dir);

        let mut hooks = Hooks::new();
        hooks.run(HookPoint::BasefsUp, &mut conds);

        conds.set_available(true);
        assert_eq!(conds.get("hook/basefs-up"), CondState::Off);
    }
}
