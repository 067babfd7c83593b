//! One-shot timers keyed by service
//!
//! Each service has at most one pending timer; arming a new one cancels
//! the prior.  Cancellation is lazy: the heap entry stays behind with a
//! stale generation and is skipped when it surfaces.  Timer fires carry
//! only `(SvcId, TimerKind)` - the state machine looks the service up on
//! fire and safely ignores timers for services that no longer exist.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::svc::SvcId;

/// What a pending timer will do when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Kill escalation: SIGKILL a service stuck in STOPPING
    Kill,
    /// Respawn retry for a crashed daemon
    Retry,
    /// Poll for a forking daemon's pidfile to adopt the real pid
    Adopt,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    gen: u64,
    id: SvcId,
    kind: TimerKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.gen == other.gen
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.gen.cmp(&other.gen))
    }
}

/// Pending one-shot timers
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    armed: HashMap<SvcId, (TimerKind, u64)>,
    next_gen: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `id`, cancelling any prior one
    pub fn arm(&mut self, id: SvcId, kind: TimerKind, delay: Duration, now: Instant) {
        self.next_gen += 1;
        let gen = self.next_gen;
        self.armed.insert(id, (kind, gen));
        self.heap.push(Reverse(Entry {
            deadline: now + delay,
            gen,
            id,
            kind,
        }));
    }

    pub fn cancel(&mut self, id: SvcId) {
        self.armed.remove(&id);
    }

    /// The pending timer for `id`, if any
    pub fn armed(&self, id: SvcId) -> Option<TimerKind> {
        self.armed.get(&id).map(|(kind, _)| *kind)
    }

    /// Earliest live deadline, for the event loop's sleep
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if self.is_live(&entry) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every timer due at `now`, skipping cancelled entries
    pub fn pop_due(&mut self, now: Instant) -> Vec<(SvcId, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.heap.pop();
            if self.is_live(&entry) {
                self.armed.remove(&entry.id);
                due.push((entry.id, entry.kind));
            }
        }
        due
    }

    fn is_live(&self, entry: &Entry) -> bool {
        self.armed.get(&entry.id) == Some(&(entry.kind, entry.gen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_fire() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(SvcId(1), TimerKind::Kill, Duration::from_millis(100), now);

        assert_eq!(timers.armed(SvcId(1)), Some(TimerKind::Kill));
        assert!(timers.pop_due(now).is_empty());

        let due = timers.pop_due(now + Duration::from_millis(100));
        assert_eq!(due, vec![(SvcId(1), TimerKind::Kill)]);
        assert_eq!(timers.armed(SvcId(1)), None);
    }

    #[test]
    fn test_rearm_cancels_prior() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(SvcId(1), TimerKind::Kill, Duration::from_millis(10), now);
        timers.arm(SvcId(1), TimerKind::Retry, Duration::from_secs(2), now);

        // At most one timer per service: the kill timer is gone
        assert_eq!(timers.armed(SvcId(1)), Some(TimerKind::Retry));
        assert!(timers.pop_due(now + Duration::from_millis(500)).is_empty());

        let due = timers.pop_due(now + Duration::from_secs(2));
        assert_eq!(due, vec![(SvcId(1), TimerKind::Retry)]);
    }

    #[test]
    fn test_cancel() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(SvcId(1), TimerKind::Retry, Duration::from_millis(1), now);
        timers.cancel(SvcId(1));

        assert_eq!(timers.armed(SvcId(1)), None);
        assert!(timers.pop_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_next_deadline_ordering() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(SvcId(1), TimerKind::Retry, Duration::from_secs(5), now);
        timers.arm(SvcId(2), TimerKind::Kill, Duration::from_secs(2), now);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(2)));

        timers.cancel(SvcId(2));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_independent_services() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.arm(SvcId(1), TimerKind::Kill, Duration::from_millis(10), now);
        timers.arm(SvcId(2), TimerKind::Retry, Duration::from_millis(10), now);

        let due = timers.pop_due(now + Duration::from_millis(10));
        assert_eq!(due.len(), 2);
    }
}
