//! Service registry
//!
//! An arena of service records keyed by stable integer ids.  Conditions
//! reference services by name and services reference conditions by name,
//! so the registry itself holds no cross-record pointers; reverse lookups
//! are computed by scanning, which only happens at reload time and on
//! child exit.

use std::fmt;

use super::record::Svc;

/// Stable handle to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SvcId(pub u32);

impl fmt::Display for SvcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The set of known service records
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Option<Svc>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, reusing the first free slot
    pub fn insert(&mut self, svc: Svc) -> SvcId {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(svc);
                return SvcId(idx as u32);
            }
        }
        self.slots.push(Some(svc));
        SvcId(self.slots.len() as u32 - 1)
    }

    pub fn get(&self, id: SvcId) -> Option<&Svc> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SvcId) -> Option<&mut Svc> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: SvcId) -> Option<Svc> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find by composite key (command path, instance tag)
    pub fn find(&self, cmd: &str, instance: &str) -> Option<SvcId> {
        self.iter()
            .find(|(_, svc)| svc.cmd == cmd && svc.instance == instance)
            .map(|(id, _)| id)
    }

    /// Find the service owning a child pid
    pub fn find_by_pid(&self, pid: i32) -> Option<SvcId> {
        if pid <= 1 {
            return None;
        }
        self.iter()
            .find(|(_, svc)| svc.pid == pid)
            .map(|(id, _)| id)
    }

    /// Find by operator identifier: `name`, `name:instance` or command
    pub fn find_by_ident(&self, ident: &str) -> Option<SvcId> {
        self.iter()
            .find(|(_, svc)| svc.ident() == ident || svc.name == ident || svc.cmd == ident)
            .map(|(id, _)| id)
    }

    /// Live ids, in insertion order
    pub fn ids(&self) -> Vec<SvcId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| SvcId(idx as u32)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SvcId, &Svc)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|svc| (SvcId(idx as u32), svc)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SvcId, &mut Svc)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_mut().map(|svc| (SvcId(idx as u32), svc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::SvcKind;

    #[test]
    fn test_insert_find_remove() {
        let mut reg = Registry::new();
        let a = reg.insert(Svc::new(SvcKind::Service, "/sbin/zebra", ""));
        let b = reg.insert(Svc::new(SvcKind::Service, "/sbin/udhcpc", "eth0"));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.find("/sbin/zebra", ""), Some(a));
        assert_eq!(reg.find("/sbin/udhcpc", "eth0"), Some(b));
        assert_eq!(reg.find("/sbin/udhcpc", ""), None);

        let gone = reg.remove(a).unwrap();
        assert_eq!(gone.cmd, "/sbin/zebra");
        assert_eq!(reg.find("/sbin/zebra", ""), None);
        assert_eq!(reg.len(), 1);

        // Slot is reused
        let c = reg.insert(Svc::new(SvcKind::Task, "/bin/true", ""));
        assert_eq!(c, a);
    }

    #[test]
    fn test_find_by_pid() {
        let mut reg = Registry::new();
        let id = reg.insert(Svc::new(SvcKind::Service, "/sbin/zebra", ""));
        assert_eq!(reg.find_by_pid(4711), None);

        reg.get_mut(id).unwrap().pid = 4711;
        assert_eq!(reg.find_by_pid(4711), Some(id));

        // Pid 1 and below are never tracked
        reg.get_mut(id).unwrap().pid = 1;
        assert_eq!(reg.find_by_pid(1), None);
        reg.get_mut(id).unwrap().pid = 0;
        assert_eq!(reg.find_by_pid(0), None);
    }

    #[test]
    fn test_find_by_ident() {
        let mut reg = Registry::new();
        let id = reg.insert(Svc::new(SvcKind::Service, "/sbin/udhcpc", "eth1"));
        assert_eq!(reg.find_by_ident("udhcpc:eth1"), Some(id));
        assert_eq!(reg.find_by_ident("udhcpc"), Some(id));
        assert_eq!(reg.find_by_ident("/sbin/udhcpc"), Some(id));
        assert_eq!(reg.find_by_ident("dnsmasq"), None);
    }
}
