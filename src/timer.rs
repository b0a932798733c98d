//! Deadline queue behind the reactor's timer watchers.
//!
//! Cancelled or rescheduled timers leave stale entries in the heap; they are
//! recognised by comparing against the live entry and skipped lazily.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    time::{Duration, Instant},
};

/// Identifier handed back by [`Reactor::add_timer`](crate::reactor::Reactor::add_timer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Once,
    Periodic,
}

struct Entry<T> {
    deadline: Instant,
    interval: Duration,
    mode: TimerMode,
    payload: T,
}

pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry<T>>,
    next_id: u64,
}

impl<T: Clone> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, now: Instant, after: Duration, mode: TimerMode, payload: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now + after;
        self.entries.insert(
            id,
            Entry {
                deadline,
                interval: after,
                mode,
                payload,
            },
        );
        self.heap.push(Reverse((deadline, id)));
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.is_live(deadline, id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the earliest timer due at `now`. A periodic timer is rescheduled
    /// one interval after `now`, so a stalled loop does not fire a burst.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if !self.is_live(deadline, id) {
                continue;
            }
            let rescheduled = match self.entries.get_mut(&id) {
                Some(entry) if entry.mode == TimerMode::Periodic => {
                    entry.deadline = now + entry.interval.max(Duration::from_millis(1));
                    Some((entry.deadline, entry.payload.clone()))
                }
                _ => None,
            };
            match rescheduled {
                Some((next, payload)) => {
                    self.heap.push(Reverse((next, id)));
                    return Some((TimerId(id), payload));
                }
                None => {
                    if let Some(entry) = self.entries.remove(&id) {
                        return Some((TimerId(id), entry.payload));
                    }
                }
            }
        }
        None
    }

    /// Pops every timer due at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some(timer) = self.pop_due(now) {
            due.push(timer);
        }
        due
    }

    fn is_live(&self, deadline: Instant, id: u64) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.deadline == deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let a = queue.insert(now, Duration::from_millis(5), TimerMode::Once, "a");
        let b = queue.insert(now, Duration::from_millis(5), TimerMode::Once, "b");
        assert_eq!(a.as_u64(), 1);
        assert!(b > a);
    }

    #[test]
    fn test_once_fires_once() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.insert(now, Duration::from_millis(10), TimerMode::Once, "once");

        assert!(queue.expire(now).is_empty());
        let fired = queue.expire(now + Duration::from_millis(10));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "once");
        assert!(queue.is_empty());
        assert!(queue.expire(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_periodic_reschedules() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let id = queue.insert(now, Duration::from_millis(10), TimerMode::Periodic, ());

        let t1 = now + Duration::from_millis(10);
        assert_eq!(queue.expire(t1).len(), 1);
        assert_eq!(queue.next_deadline(), Some(t1 + Duration::from_millis(10)));

        let t2 = t1 + Duration::from_millis(10);
        assert_eq!(queue.expire(t2).len(), 1);
        assert!(queue.contains(id));
    }

    #[test]
    fn test_cancel_skips_stale_entries() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let early = queue.insert(now, Duration::from_millis(5), TimerMode::Once, 1);
        queue.insert(now, Duration::from_millis(20), TimerMode::Once, 2);

        assert!(queue.cancel(early));
        assert!(!queue.cancel(early));
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(20)));

        let fired = queue.expire(now + Duration::from_millis(30));
        assert_eq!(fired.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_cancel_between_pops() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.insert(now, Duration::from_millis(1), TimerMode::Once, "first");
        let second = queue.insert(now, Duration::from_millis(2), TimerMode::Once, "second");

        let later = now + Duration::from_millis(10);
        assert_eq!(queue.pop_due(later).map(|(_, v)| v), Some("first"));
        assert!(queue.cancel(second));
        assert!(queue.pop_due(later).is_none());
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.insert(now, Duration::from_millis(30), TimerMode::Once, "late");
        queue.insert(now, Duration::from_millis(10), TimerMode::Once, "early");
        let fired: Vec<_> = queue
            .expire(now + Duration::from_millis(40))
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(fired, vec!["early", "late"]);
    }
}
