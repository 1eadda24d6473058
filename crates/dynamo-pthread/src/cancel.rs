//! `pthread_cancel` and the deferred/asynchronous cancellation-point
//! protocol. A cancellation is only ever *recorded*; delivery happens the
//! next time the target thread reaches a cancellation point (deferred) or,
//! for threads in asynchronous mode, as soon as the scheduler next has a
//! chance to redirect it.

use crate::error::PthreadError;
use dynamo_sched::thread_table::{CancelKind, PendingCancel};
use dynamo_sched::ThreadTable;
use dynamo_types::{GuestAddr, ThreadId};

/// `CANCEL(target, handler_addr)`. Records the request; does not touch
/// control flow itself. A thread already cancelled twice just has its
/// pending request overwritten — cancellation is idempotent, not queued.
pub fn cancel(
    threads: &mut ThreadTable,
    target: ThreadId,
    handler_addr: GuestAddr,
) -> Result<(), PthreadError> {
    if threads.get(target).status == dynamo_sched::ThreadStatus::Empty {
        return Err(PthreadError::NoSuchThread);
    }
    let effective_kind = pending_kind(threads, target);
    threads.get_mut(target).cancel_pending = Some(PendingCancel {
        kind: effective_kind,
        handler_addr,
    });
    Ok(())
}

fn pending_kind(threads: &ThreadTable, target: ThreadId) -> CancelKind {
    if threads.get(target).cancel_enabled {
        CancelKind::Deferred
    } else {
        CancelKind::Asynchronous
    }
}

/// `SET_CANCEL_STATE(enabled)`, called by the thread on itself.
pub fn set_cancel_state(threads: &mut ThreadTable, tid: ThreadId, enabled: bool) {
    threads.get_mut(tid).cancel_enabled = enabled;
}

/// `TESTCANCEL()`: a deferred cancellation point. Returns the handler
/// address to redirect to if a cancellation is pending, clearing it so it
/// fires exactly once.
pub fn testcancel(threads: &mut ThreadTable, tid: ThreadId) -> Option<GuestAddr> {
    let pending = threads.get(tid).cancel_pending.take();
    pending.map(|p| p.handler_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_a_live_thread_records_the_request() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        cancel(&mut threads, tid, 0x1234).unwrap();
        assert!(threads.get(tid).cancel_pending.is_some());
    }

    #[test]
    fn cancelling_an_unused_slot_is_rejected() {
        let mut threads = ThreadTable::new();
        let tid = ThreadId::new(1);
        assert_eq!(cancel(&mut threads, tid, 0x1234), Err(PthreadError::NoSuchThread));
    }

    #[test]
    fn testcancel_fires_once_then_clears() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        cancel(&mut threads, tid, 0x9999).unwrap();
        assert_eq!(testcancel(&mut threads, tid), Some(0x9999));
        assert_eq!(testcancel(&mut threads, tid), None);
    }

    #[test]
    fn disabling_cancellation_makes_new_requests_asynchronous() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        set_cancel_state(&mut threads, tid, false);
        cancel(&mut threads, tid, 0x1).unwrap();
        assert_eq!(threads.get(tid).cancel_pending.unwrap().kind, CancelKind::Asynchronous);
    }
}
