//! The fixed-size per-thread record table the scheduler round-robins over.

use dynamo_cpu_core::BaseBlock;
use dynamo_types::{GuestAddr, ThreadId, MAX_THREADS};

/// No timeout registered for this thread.
pub const NO_TIMEOUT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Empty,
    Runnable,
    WaitJoinee,
    WaitJoiner,
    Sleeping,
    WaitMx,
    WaitCv,
    WaitSys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    Deferred,
    Asynchronous,
}

/// A pending cancellation request, recorded but not yet delivered.
#[derive(Debug, Clone, Copy)]
pub struct PendingCancel {
    pub kind: CancelKind,
    pub handler_addr: GuestAddr,
}

/// One guest thread's full state outside the base block: the parts that
/// only matter while the thread is *not* the one currently loaded.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub status: ThreadStatus,
    pub snapshot: BaseBlock,
    pub stack_base: GuestAddr,
    pub stack_size: u32,
    pub stack_high_water: GuestAddr,
    pub ldt_ptr: GuestAddr,

    pub joinee_tid: ThreadId,
    pub joiner_tid: ThreadId,
    pub detached: bool,
    pub join_return: Option<GuestAddr>,

    /// `NO_TIMEOUT` when not waiting on a deadline.
    pub awaken_at: u64,
    pub associated_mx: GuestAddr,
    pub associated_cv: GuestAddr,

    pub cancel_pending: Option<PendingCancel>,
    pub cancel_enabled: bool,

    pub tsd: Vec<GuestAddr>,
    pub sigmask: u64,

    pub pending_syscall: Option<u32>,
    /// Opaque handle into whatever owns the real kernel thread issuing this
    /// guest thread's blocking syscalls. `None` until one is leased.
    pub proxy_handle: Option<u32>,
}

impl ThreadRecord {
    fn empty() -> Self {
        ThreadRecord {
            status: ThreadStatus::Empty,
            snapshot: BaseBlock::default(),
            stack_base: 0,
            stack_size: 0,
            stack_high_water: 0,
            ldt_ptr: 0,
            joinee_tid: ThreadId::NONE,
            joiner_tid: ThreadId::NONE,
            detached: false,
            join_return: None,
            awaken_at: NO_TIMEOUT,
            associated_mx: 0,
            associated_cv: 0,
            cancel_pending: None,
            cancel_enabled: true,
            tsd: Vec::new(),
            sigmask: 0,
            pending_syscall: None,
            proxy_handle: None,
        }
    }

    /// An `Empty` record must have every other field at its zero value —
    /// the thread-table invariant the scheduler's sanity pass checks.
    pub fn is_well_formed_empty(&self) -> bool {
        self.status == ThreadStatus::Empty
            && self.associated_mx == 0
            && self.associated_cv == 0
            && self.joinee_tid.is_none()
            && self.joiner_tid.is_none()
            && self.awaken_at == NO_TIMEOUT
    }
}

/// Fixed-size array of thread records indexed by [`ThreadId`]; at most one
/// is ever "currently in base block" (tracked separately by the scheduler,
/// not this table, since loading/saving is a cross-cutting concern involving
/// the live `BaseBlock` too).
pub struct ThreadTable {
    slots: Vec<ThreadRecord>,
}

impl ThreadTable {
    pub fn new() -> Self {
        ThreadTable {
            slots: (0..MAX_THREADS).map(|_| ThreadRecord::empty()).collect(),
        }
    }

    pub fn get(&self, tid: ThreadId) -> &ThreadRecord {
        &self.slots[tid.index()]
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> &mut ThreadRecord {
        &mut self.slots[tid.index()]
    }

    /// Claims the first `Empty` slot for a new thread, or `None` if the
    /// table is full.
    pub fn alloc(&mut self) -> Option<ThreadId> {
        let idx = self.slots.iter().position(|r| r.status == ThreadStatus::Empty)?;
        self.slots[idx] = ThreadRecord::empty();
        self.slots[idx].status = ThreadStatus::Runnable;
        Some(ThreadId::from_index(idx))
    }

    pub fn free(&mut self, tid: ThreadId) {
        self.slots[tid.index()] = ThreadRecord::empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &ThreadRecord)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, r)| (ThreadId::from_index(i), r))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ThreadId, &mut ThreadRecord)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, r)| (ThreadId::from_index(i), r))
    }

    pub fn any_runnable(&self) -> bool {
        self.slots.iter().any(|r| r.status == ThreadStatus::Runnable)
    }

    /// Whether some thread is making externally-driven progress: a pending
    /// timeout, syscall, or condvar wait will eventually (or can be made to)
    /// unblock it without another guest thread's help. A table with no
    /// runnable thread and none of these is wedged — `WaitMx`/`WaitJoiner`
    /// alone can only be broken by another thread, which by definition
    /// isn't running either.
    pub fn any_externally_progressing_wait(&self) -> bool {
        self.slots
            .iter()
            .any(|r| matches!(r.status, ThreadStatus::Sleeping | ThreadStatus::WaitSys | ThreadStatus::WaitCv))
    }

    pub fn all_empty_or_waiting_for_join(&self) -> bool {
        self.slots
            .iter()
            .all(|r| matches!(r.status, ThreadStatus::Empty | ThreadStatus::WaitJoiner))
    }

    /// Every invariant the thread table is expected to hold continuously:
    /// waiters carry the resource they're waiting on, and an `Empty` slot is
    /// fully zeroed.
    pub fn sanity_check(&self) -> Result<(), &'static str> {
        for (_, r) in self.iter() {
            match r.status {
                ThreadStatus::WaitMx if r.associated_mx == 0 => {
                    return Err("WaitMx thread with no associated mutex")
                }
                ThreadStatus::WaitCv if r.associated_cv == 0 || r.associated_mx == 0 => {
                    return Err("WaitCv thread missing its condvar or mutex")
                }
                ThreadStatus::Empty if !r.is_well_formed_empty() => {
                    return Err("Empty slot has stale fields")
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_distinct_ids_until_full() {
        let mut t = ThreadTable::new();
        let a = t.alloc().unwrap();
        let b = t.alloc().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn freed_slot_is_well_formed_empty() {
        let mut t = ThreadTable::new();
        let tid = t.alloc().unwrap();
        t.get_mut(tid).associated_mx = 0x4000;
        t.get_mut(tid).status = ThreadStatus::WaitMx;
        t.free(tid);
        assert!(t.get(tid).is_well_formed_empty());
    }

    #[test]
    fn sanity_check_rejects_waitmx_without_mutex() {
        let mut t = ThreadTable::new();
        let tid = t.alloc().unwrap();
        t.get_mut(tid).status = ThreadStatus::WaitMx;
        assert!(t.sanity_check().is_err());
    }

    #[test]
    fn waiting_for_join_is_not_a_deadlock() {
        let mut t = ThreadTable::new();
        let tid = t.alloc().unwrap();
        t.get_mut(tid).status = ThreadStatus::WaitJoiner;
        assert!(!t.any_runnable());
        assert!(!t.any_externally_progressing_wait());
        assert!(t.all_empty_or_waiting_for_join());
    }

    #[test]
    fn mutex_waiter_with_no_other_progress_is_a_deadlock() {
        let mut t = ThreadTable::new();
        let tid = t.alloc().unwrap();
        t.get_mut(tid).status = ThreadStatus::WaitMx;
        t.get_mut(tid).associated_mx = 0x4000;
        assert!(!t.any_runnable());
        assert!(!t.any_externally_progressing_wait());
        assert!(!t.all_empty_or_waiting_for_join());
    }
}
