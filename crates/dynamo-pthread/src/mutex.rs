//! `pthread_mutex_lock`/`unlock` as the engine implements them: no internal
//! mutex table at all. The guest's own `pthread_mutex_t` fields *are* the
//! state; the engine reads and writes them directly through a
//! [`GuestBus`](dynamo_cpu_core::GuestBus), and ownership/waiter tracking
//! lives on the thread table instead of a side table keyed by mutex pointer.

use crate::error::PthreadError;
use dynamo_cpu_core::GuestBus;
use dynamo_sched::{ThreadStatus, ThreadTable};
use dynamo_types::{GuestAddr, ThreadId};

/// Field layout of the guest-visible mutex structure this engine
/// interprets directly. `kind` distinguishes a recursive mutex (count may
/// exceed 1 for its owner) from every other kind, which this engine treats
/// uniformly as non-recursive.
pub mod layout {
    pub const KIND_OFFSET: u32 = 0;
    pub const OWNER_OFFSET: u32 = 4;
    pub const COUNT_OFFSET: u32 = 8;
    pub const KIND_RECURSIVE: u32 = 1;
}

fn kind_of(bus: &mut impl GuestBus, mx: GuestAddr) -> u32 {
    bus.read_u32(mx + layout::KIND_OFFSET)
}

fn owner_of(bus: &mut impl GuestBus, mx: GuestAddr) -> ThreadId {
    let raw = bus.read_u32(mx + layout::OWNER_OFFSET);
    if raw == 0 {
        ThreadId::NONE
    } else {
        ThreadId::new(raw)
    }
}

fn count_of(bus: &mut impl GuestBus, mx: GuestAddr) -> u32 {
    bus.read_u32(mx + layout::COUNT_OFFSET)
}

fn set_owner_count(bus: &mut impl GuestBus, mx: GuestAddr, owner: ThreadId, count: u32) {
    bus.write_u32(mx + layout::OWNER_OFFSET, owner.raw());
    bus.write_u32(mx + layout::COUNT_OFFSET, count);
}

/// Outcome of a lock attempt: either the caller now owns the mutex (count
/// already reflects it) or it must park and wait for a future unlock to
/// hand ownership over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    WouldBlock,
}

/// `MUTEX_LOCK(mx, trylock)`. On `WouldBlock` with `trylock == false`, the
/// caller is responsible for parking `tid` as `WaitMx`/`associated_mx = mx`
/// — this function only decides whether blocking is needed, since dispatch
/// (not this module) owns the thread table's write access pattern.
pub fn lock(
    bus: &mut impl GuestBus,
    threads: &ThreadTable,
    tid: ThreadId,
    mx: GuestAddr,
    trylock: bool,
) -> Result<LockOutcome, PthreadError> {
    let _ = threads;
    let count = count_of(bus, mx);
    if count == 0 {
        set_owner_count(bus, mx, tid, 1);
        return Ok(LockOutcome::Acquired);
    }
    let owner = owner_of(bus, mx);
    if owner == tid && kind_of(bus, mx) == layout::KIND_RECURSIVE {
        set_owner_count(bus, mx, tid, count + 1);
        return Ok(LockOutcome::Acquired);
    }
    if trylock {
        return Err(PthreadError::MutexBusy);
    }
    Ok(LockOutcome::WouldBlock)
}

/// `MUTEX_UNLOCK(mx)`. On the final unlock, scans the thread table for a
/// `WaitMx` waiter on this mutex and transfers ownership to it directly
/// (returns that thread's id so the caller can flip it to `Runnable`).
/// Waiter order is first-found in table-index order — no separate wait
/// queue is kept, matching the "no internal waiter list" design.
pub fn unlock(
    bus: &mut impl GuestBus,
    threads: &ThreadTable,
    tid: ThreadId,
    mx: GuestAddr,
) -> Result<Option<ThreadId>, PthreadError> {
    let owner = owner_of(bus, mx);
    if owner != tid {
        return Err(PthreadError::UnlockNotOwned);
    }
    let count = count_of(bus, mx);
    if count > 1 {
        set_owner_count(bus, mx, tid, count - 1);
        return Ok(None);
    }
    let waiter = threads
        .iter()
        .find(|(_, r)| r.status == ThreadStatus::WaitMx && r.associated_mx == mx)
        .map(|(t, _)| t);
    match waiter {
        Some(next) => {
            set_owner_count(bus, mx, next, 1);
            Ok(Some(next))
        }
        None => {
            set_owner_count(bus, mx, ThreadId::NONE, 0);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamo_cpu_core::GuestMemory;

    const MX: GuestAddr = 0x4000;

    #[test]
    fn first_lock_is_acquired_uncontended() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        let outcome = lock(&mut mem, &threads, ThreadId::new(1), MX, false).unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);
        assert_eq!(count_of(&mut mem, MX), 1);
    }

    #[test]
    fn non_recursive_relock_by_owner_would_block() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        lock(&mut mem, &threads, t1, MX, false).unwrap();
        let outcome = lock(&mut mem, &threads, t1, MX, false).unwrap();
        assert_eq!(outcome, LockOutcome::WouldBlock);
    }

    #[test]
    fn recursive_relock_by_owner_increments_count() {
        let mut mem = GuestMemory::new();
        mem.write_u32(MX + layout::KIND_OFFSET, layout::KIND_RECURSIVE);
        let threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        lock(&mut mem, &threads, t1, MX, false).unwrap();
        lock(&mut mem, &threads, t1, MX, false).unwrap();
        assert_eq!(count_of(&mut mem, MX), 2);
    }

    #[test]
    fn trylock_on_a_held_mutex_returns_ebusy() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        lock(&mut mem, &threads, ThreadId::new(1), MX, false).unwrap();
        let result = lock(&mut mem, &threads, ThreadId::new(2), MX, true);
        assert_eq!(result, Err(PthreadError::MutexBusy));
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        lock(&mut mem, &threads, ThreadId::new(1), MX, false).unwrap();
        let result = unlock(&mut mem, &threads, ThreadId::new(2), MX);
        assert_eq!(result, Err(PthreadError::UnlockNotOwned));
    }

    #[test]
    fn unlock_transfers_ownership_to_a_waiting_thread() {
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        let t2 = ThreadId::new(2);
        lock(&mut mem, &threads, t1, MX, false).unwrap();
        threads.get_mut(t2).status = ThreadStatus::WaitMx;
        threads.get_mut(t2).associated_mx = MX;

        let transferred = unlock(&mut mem, &threads, t1, MX).unwrap();
        assert_eq!(transferred, Some(t2));
        assert_eq!(owner_of(&mut mem, MX), t2);
        assert_eq!(count_of(&mut mem, MX), 1);
    }

    #[test]
    fn unlock_with_no_waiter_clears_the_mutex() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        lock(&mut mem, &threads, t1, MX, false).unwrap();
        let transferred = unlock(&mut mem, &threads, t1, MX).unwrap();
        assert_eq!(transferred, None);
        assert_eq!(count_of(&mut mem, MX), 0);
    }
}
