//! `pthread_cond_wait`/`signal`/`broadcast`. Condvars carry no engine-side
//! state at all — they are identified solely by their guest pointer value,
//! and waiters are found by scanning the thread table for a matching
//! `associated_cv`, exactly as mutex waiters are found by `associated_mx`.

use crate::mutex;
use dynamo_cpu_core::GuestBus;
use dynamo_sched::{ThreadStatus, ThreadTable};
use dynamo_types::{GuestAddr, ThreadId};

/// What the caller must do with `tid` after a successful [`wait`] call:
/// the mutex has already been released on the caller's behalf, so the
/// thread can be parked immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkedWait {
    pub woke_mutex_waiter: Option<ThreadId>,
}

/// `COND_WAIT(cv, mx, deadline_ms)`. Releases `mx` (transferring it to a
/// waiter if one exists, exactly like an explicit unlock) and reports what
/// the scheduler must do to park the caller: set `status = WaitCv`,
/// `associated_cv = cv`, `associated_mx = mx`, and `awaken_at` from
/// `deadline_ms` if one was given (`NO_TIMEOUT` otherwise, via the
/// scheduler's timeout queue) — this function only performs the mutex
/// handoff, since parking is a thread-table write the caller already holds
/// a mutable borrow for.
pub fn wait(
    bus: &mut impl GuestBus,
    threads: &ThreadTable,
    tid: ThreadId,
    mx: GuestAddr,
) -> Result<ParkedWait, crate::error::PthreadError> {
    let woke_mutex_waiter = mutex::unlock(bus, threads, tid, mx)?;
    Ok(ParkedWait { woke_mutex_waiter })
}

/// Outcome of waking one condvar waiter: either it can resume running
/// immediately because the mutex was free, or it must move to `WaitMx`
/// because another thread (possibly also just woken) still holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    ResumesRunning,
    MovesToWaitMx,
}

/// Re-applies the mutex-acquisition step a waking `COND_WAIT` caller must
/// go through before it can actually resume: it does not simply inherit
/// the mutex, since the signaler may not itself hold it (condvars and
/// their associated mutex are independent resources once released).
fn reacquire(bus: &mut impl GuestBus, threads: &ThreadTable, tid: ThreadId, mx: GuestAddr) -> WakeOutcome {
    match mutex::lock(bus, threads, tid, mx, false).expect("lock(trylock=false) never returns Err") {
        mutex::LockOutcome::Acquired => WakeOutcome::ResumesRunning,
        mutex::LockOutcome::WouldBlock => WakeOutcome::MovesToWaitMx,
    }
}

/// `COND_SIGNAL(cv)`. Wakes at most one `WaitCv` waiter on this condvar —
/// the first found in table-index order, matching the "no internal waiter
/// list" design — and reports how it should be requeued.
pub fn signal(bus: &mut impl GuestBus, threads: &ThreadTable, cv: GuestAddr) -> Option<(ThreadId, WakeOutcome)> {
    let waiter = threads
        .iter()
        .find(|(_, r)| r.status == ThreadStatus::WaitCv && r.associated_cv == cv)
        .map(|(t, r)| (t, r.associated_mx))?;
    let (tid, mx) = waiter;
    Some((tid, reacquire(bus, threads, tid, mx)))
}

/// `COND_BROADCAST(cv)`. Wakes every `WaitCv` waiter on this condvar.
pub fn broadcast(bus: &mut impl GuestBus, threads: &ThreadTable, cv: GuestAddr) -> Vec<(ThreadId, WakeOutcome)> {
    let waiters: Vec<(ThreadId, GuestAddr)> = threads
        .iter()
        .filter(|(_, r)| r.status == ThreadStatus::WaitCv && r.associated_cv == cv)
        .map(|(t, r)| (t, r.associated_mx))
        .collect();
    waiters
        .into_iter()
        .map(|(tid, mx)| (tid, reacquire(bus, threads, tid, mx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamo_cpu_core::GuestMemory;
    use dynamo_sched::thread_table::NO_TIMEOUT;

    const CV: GuestAddr = 0x5000;
    const MX: GuestAddr = 0x6000;

    fn park_waiting(threads: &mut ThreadTable, tid: ThreadId, cv: GuestAddr, mx: GuestAddr) {
        let r = threads.get_mut(tid);
        r.status = ThreadStatus::WaitCv;
        r.associated_cv = cv;
        r.associated_mx = mx;
        r.awaken_at = NO_TIMEOUT;
    }

    #[test]
    fn wait_releases_the_mutex_with_no_other_waiter() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        mutex::lock(&mut mem, &threads, t1, MX, false).unwrap();
        let parked = wait(&mut mem, &threads, t1, MX).unwrap();
        assert_eq!(parked.woke_mutex_waiter, None);
    }

    #[test]
    fn signal_with_no_waiters_is_a_no_op() {
        let mut mem = GuestMemory::new();
        let threads = ThreadTable::new();
        assert_eq!(signal(&mut mem, &threads, CV), None);
    }

    #[test]
    fn signal_wakes_a_single_waiter_and_it_reacquires_the_free_mutex() {
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        park_waiting(&mut threads, t1, CV, MX);
        let (tid, outcome) = signal(&mut mem, &threads, CV).unwrap();
        assert_eq!(tid, t1);
        assert_eq!(outcome, WakeOutcome::ResumesRunning);
    }

    #[test]
    fn signal_wakes_only_one_of_two_waiters() {
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        let t2 = ThreadId::new(2);
        park_waiting(&mut threads, t1, CV, MX);
        park_waiting(&mut threads, t2, CV, MX);
        let (woken, _) = signal(&mut mem, &threads, CV).unwrap();
        assert!(woken == t1 || woken == t2);
    }

    #[test]
    fn broadcast_wakes_every_waiter_on_that_condvar_only() {
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        let t2 = ThreadId::new(2);
        let t3 = ThreadId::new(3);
        park_waiting(&mut threads, t1, CV, MX);
        park_waiting(&mut threads, t2, CV, MX);
        park_waiting(&mut threads, t3, 0x7777, MX);

        let woken = broadcast(&mut mem, &threads, CV);
        assert_eq!(woken.len(), 2);
        assert!(woken.iter().any(|(t, _)| *t == t1));
        assert!(woken.iter().any(|(t, _)| *t == t2));
    }

    #[test]
    fn woken_waiter_moves_to_waitmx_when_the_mutex_is_already_held() {
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let holder = ThreadId::new(9);
        mutex::lock(&mut mem, &threads, holder, MX, false).unwrap();
        let t1 = ThreadId::new(1);
        park_waiting(&mut threads, t1, CV, MX);
        let (_, outcome) = signal(&mut mem, &threads, CV).unwrap();
        assert_eq!(outcome, WakeOutcome::MovesToWaitMx);
    }
}
