//! Deadline-based timers
//!
//! Components never sleep. They arm named deadlines and the owner polls for
//! the earliest due one. Cancelling a timer removes its record so a stale
//! deadline can never fire.

use smallvec::SmallVec;

use crate::types::Timestamp;

/// Set of named deadlines, at most one per kind
#[derive(Debug, Clone)]
pub struct Timers<K> {
    deadlines: SmallVec<[(K, Timestamp); 4]>,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            deadlines: SmallVec::new(),
        }
    }
}

impl<K: Copy + PartialEq> Timers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at `at`, replacing any pending deadline of that kind
    pub fn arm(&mut self, kind: K, at: Timestamp) {
        self.cancel(kind);
        self.deadlines.push((kind, at));
    }

    /// Cancel `kind`; returns whether it was pending
    pub fn cancel(&mut self, kind: K) -> bool {
        let before = self.deadlines.len();
        self.deadlines.retain(|(k, _)| *k != kind);
        before != self.deadlines.len()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: K) -> bool {
        self.deadlines.iter().any(|(k, _)| *k == kind)
    }

    pub fn deadline(&self, kind: K) -> Option<Timestamp> {
        self.deadlines
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, at)| *at)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines.iter().map(|(_, at)| *at).min()
    }

    /// Remove and return the earliest deadline that is due at `now`
    pub fn pop_due(&mut self, now: Timestamp) -> Option<K> {
        let index = self
            .deadlines
            .iter()
            .enumerate()
            .filter(|(_, (_, at))| *at <= now)
            .min_by_key(|(_, (_, at))| *at)
            .map(|(index, _)| index)?;
        Some(self.deadlines.remove(index).0)
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Auth,
        Ping,
    }

    #[test]
    fn test_arm_replaces_previous_deadline() {
        let mut timers = Timers::new();
        timers.arm(Kind::Auth, Timestamp::new(100));
        timers.arm(Kind::Auth, Timestamp::new(300));
        assert_eq!(timers.deadline(Kind::Auth), Some(Timestamp::new(300)));
        assert_eq!(timers.pop_due(Timestamp::new(200)), None);
        assert_eq!(timers.pop_due(Timestamp::new(300)), Some(Kind::Auth));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut timers = Timers::new();
        timers.arm(Kind::Ping, Timestamp::new(50));
        timers.arm(Kind::Auth, Timestamp::new(20));
        assert_eq!(timers.next_deadline(), Some(Timestamp::new(20)));
        assert_eq!(timers.pop_due(Timestamp::new(60)), Some(Kind::Auth));
        assert_eq!(timers.pop_due(Timestamp::new(60)), Some(Kind::Ping));
        assert_eq!(timers.pop_due(Timestamp::new(60)), None);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut timers = Timers::new();
        timers.arm(Kind::Auth, Timestamp::new(10));
        assert!(timers.cancel(Kind::Auth));
        assert!(!timers.cancel(Kind::Auth));
        assert_eq!(timers.pop_due(Timestamp::new(1_000)), None);
    }
}
