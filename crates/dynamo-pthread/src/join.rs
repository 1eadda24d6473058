//! `pthread_join`/exit rendezvous. A joinable thread that exits before
//! anyone joins it parks as `WaitJoinee` holding its return value; a
//! thread that calls `JOIN` before the joinee has exited parks as
//! `WaitJoiner` instead. Whichever side arrives second completes the
//! rendezvous immediately rather than parking.

use crate::error::PthreadError;
use dynamo_sched::{ThreadStatus, ThreadTable};
use dynamo_types::{GuestAddr, ThreadId};

/// What the caller of [`join`] must now do to `tid`'s own thread record —
/// this module never mutates the table itself, since parking also touches
/// the live base block snapshot that only `dynamo-machine` has in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The joinee already exited; its return value is ready now and its
    /// slot should be freed.
    Immediate(Option<GuestAddr>),
    /// The joinee hasn't exited yet; park the caller as `WaitJoiner`.
    MustWait,
}

/// `JOIN(jee)` called by thread `tid`.
pub fn join(threads: &ThreadTable, tid: ThreadId, jee: ThreadId) -> Result<JoinOutcome, PthreadError> {
    if jee == tid {
        return Err(PthreadError::SelfJoin);
    }
    let record = threads.get(jee);
    if record.status == ThreadStatus::Empty {
        return Err(PthreadError::NoSuchThread);
    }
    if record.detached {
        return Err(PthreadError::JoinOfDetached);
    }
    if !record.joiner_tid.is_none() {
        return Err(PthreadError::SecondJoiner);
    }
    if record.status == ThreadStatus::WaitJoinee {
        return Ok(JoinOutcome::Immediate(record.join_return));
    }
    Ok(JoinOutcome::MustWait)
}

/// What the caller of [`quit`] must now do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitOutcome {
    /// Nobody is waiting (or ever can wait) on this thread; free it now.
    Detached,
    /// A joiner is already parked as `WaitJoiner` on this thread; wake it
    /// with the given return value and free this thread's slot.
    WakesJoiner(ThreadId, Option<GuestAddr>),
    /// Nobody has called `JOIN` yet; park this thread as `WaitJoinee`
    /// holding its return value.
    MustWaitForJoiner,
}

/// `QUIT(retval)` called by thread `tid` as it exits. `WAIT_JOINER` is the
/// same decision point reached from the thread's own exit path rather than
/// an explicit client request, so it shares this function rather than
/// duplicating the rendezvous logic.
pub fn quit(threads: &ThreadTable, tid: ThreadId, retval: GuestAddr) -> QuitOutcome {
    let record = threads.get(tid);
    if record.detached {
        return QuitOutcome::Detached;
    }
    if !record.joiner_tid.is_none() {
        return QuitOutcome::WakesJoiner(record.joiner_tid, Some(retval));
    }
    QuitOutcome::MustWaitForJoiner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joining_yourself_is_rejected() {
        let threads = ThreadTable::new();
        let t1 = ThreadId::new(1);
        assert_eq!(join(&threads, t1, t1), Err(PthreadError::SelfJoin));
    }

    #[test]
    fn joining_a_detached_thread_is_rejected() {
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        threads.get_mut(jee).detached = true;
        let joiner = ThreadId::new(jee.raw() + 1);
        assert_eq!(join(&threads, joiner, jee), Err(PthreadError::JoinOfDetached));
    }

    #[test]
    fn joining_a_thread_that_already_has_a_joiner_is_rejected() {
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        threads.get_mut(jee).joiner_tid = ThreadId::new(jee.raw() + 1);
        let other = ThreadId::new(jee.raw() + 2);
        assert_eq!(join(&threads, other, jee), Err(PthreadError::SecondJoiner));
    }

    #[test]
    fn joining_a_still_running_thread_must_wait() {
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        let joiner = ThreadId::new(jee.raw() + 1);
        assert_eq!(join(&threads, joiner, jee), Ok(JoinOutcome::MustWait));
    }

    #[test]
    fn joining_an_already_exited_thread_completes_immediately() {
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        threads.get_mut(jee).status = ThreadStatus::WaitJoinee;
        threads.get_mut(jee).join_return = Some(0xabcd);
        let joiner = ThreadId::new(jee.raw() + 1);
        assert_eq!(join(&threads, joiner, jee), Ok(JoinOutcome::Immediate(Some(0xabcd))));
    }

    #[test]
    fn quit_of_a_detached_thread_frees_it_directly() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        threads.get_mut(tid).detached = true;
        assert_eq!(quit(&threads, tid, 0), QuitOutcome::Detached);
    }

    #[test]
    fn quit_with_a_waiting_joiner_wakes_it() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        let joiner = ThreadId::new(tid.raw() + 1);
        threads.get_mut(tid).joiner_tid = joiner;
        assert_eq!(quit(&threads, tid, 0x42), QuitOutcome::WakesJoiner(joiner, Some(0x42)));
    }

    #[test]
    fn quit_with_no_joiner_yet_must_park() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        assert_eq!(quit(&threads, tid, 0), QuitOutcome::MustWaitForJoiner);
    }
}
