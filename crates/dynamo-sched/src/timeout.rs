//! Sorted timeout queue for sleeping/condvar-waiting threads.

use dynamo_types::ThreadId;

/// `(awaken_ms, tid)` pairs kept sorted ascending by `awaken_ms`. Stale
/// entries (the thread's recorded `awaken_at` no longer matches — it woke
/// up for some other reason first) are tolerated: the scheduler discards
/// them silently on expiry rather than treating a mismatch as an error.
#[derive(Default)]
pub struct TimeoutQueue {
    entries: Vec<(u64, ThreadId)>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        TimeoutQueue { entries: Vec::new() }
    }

    pub fn insert(&mut self, awaken_ms: u64, tid: ThreadId) {
        let pos = self.entries.partition_point(|&(t, _)| t <= awaken_ms);
        self.entries.insert(pos, (awaken_ms, tid));
    }

    pub fn remove(&mut self, tid: ThreadId) {
        self.entries.retain(|&(_, t)| t != tid);
    }

    pub fn peek_deadline(&self) -> Option<u64> {
        self.entries.first().map(|&(t, _)| t)
    }

    /// Pops every entry whose deadline has passed `now`, in ascending order.
    /// Callers must cross-check each returned `tid`'s live `awaken_at`
    /// against the popped deadline before acting — an earlier wakeup for a
    /// different reason leaves a stale entry here.
    pub fn pop_expired(&mut self, now: u64) -> Vec<(u64, ThreadId)> {
        let split = self.entries.partition_point(|&(t, _)| t <= now);
        self.entries.drain(..split).collect()
    }

    pub fn is_sorted_ascending(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].0 <= w[1].0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_ascending_order() {
        let mut q = TimeoutQueue::new();
        q.insert(500, ThreadId::new(3));
        q.insert(100, ThreadId::new(1));
        q.insert(300, ThreadId::new(2));
        assert!(q.is_sorted_ascending());
        assert_eq!(q.peek_deadline(), Some(100));
    }

    #[test]
    fn pop_expired_only_takes_entries_at_or_before_now() {
        let mut q = TimeoutQueue::new();
        q.insert(100, ThreadId::new(1));
        q.insert(200, ThreadId::new(2));
        let expired = q.pop_expired(150);
        assert_eq!(expired, vec![(100, ThreadId::new(1))]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_drops_a_stale_entry_before_it_expires() {
        let mut q = TimeoutQueue::new();
        q.insert(100, ThreadId::new(1));
        q.remove(ThreadId::new(1));
        assert!(q.is_empty());
    }
}
