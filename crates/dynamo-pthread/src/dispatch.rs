//! Top-level client-request dispatch: routes a [`ClientRequest`] to the
//! right module and reports what the caller (the machine's dispatch loop)
//! must do to the live thread next — write a return value to `%edx` and
//! keep running, park the thread, free it outright, or redirect it into a
//! cancellation handler.

use crate::cancel;
use crate::condvar;
use crate::error::PthreadError;
use crate::join::{self, JoinOutcome, QuitOutcome};
use crate::key::KeyTable;
use crate::mutex::{self, LockOutcome};
use crate::requests::{self, ClientRequest};
use crate::signal::{self, MaskHow};
use dynamo_cpu_core::GuestBus;
use dynamo_sched::thread_table::NO_TIMEOUT;
use dynamo_sched::{ThreadStatus, ThreadTable};
use dynamo_types::ThreadId;

/// What the caller must do to the requesting thread (and possibly others)
/// after a request has been serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Write this value to the requesting thread's `%edx` and resume it.
    Completed(u32),
    /// Like `Completed`, but a mutex hand-off or condvar wake just made
    /// another thread runnable; the caller should bias the scheduler
    /// toward it via `need_resched` rather than waiting for its own
    /// quantum to expire.
    CompletedWoke(u32, ThreadId),
    /// The requesting thread has been parked (its status already updated);
    /// do not resume it.
    Parked,
    /// The requesting thread has exited and its slot freed (or moved to
    /// `WaitJoinee`, in which case its status is already set — either way
    /// it must not be resumed here).
    Terminated,
    /// Redirect the requesting thread's guest program counter to this
    /// address instead of returning from the request normally — used for
    /// cancellation delivery.
    Redirect(dynamo_types::GuestAddr),
}

/// Engine-global state not owned by any one thread record: the
/// thread-specific-data key table. Mutex/condvar/join state all live on
/// the guest mutex struct and the thread table respectively, so this is
/// the only piece of state this engine keeps for itself.
pub struct PthreadEngine {
    keys: KeyTable,
}

impl PthreadEngine {
    pub fn new() -> Self {
        PthreadEngine { keys: KeyTable::new() }
    }

    pub fn dispatch(
        &mut self,
        bus: &mut impl GuestBus,
        threads: &mut ThreadTable,
        tid: ThreadId,
        req: ClientRequest,
    ) -> Outcome {
        match req.code {
            requests::MUTEX_LOCK => self.mutex_lock(bus, threads, tid, req.args[0], false),
            requests::MUTEX_TRYLOCK => self.mutex_lock(bus, threads, tid, req.args[0], true),
            requests::MUTEX_UNLOCK => self.mutex_unlock(bus, threads, tid, req.args[0]),
            requests::COND_WAIT => self.cond_wait(bus, threads, tid, req.args[0], req.args[1], req.args[2]),
            requests::COND_SIGNAL => self.cond_signal(bus, threads, req.args[0]),
            requests::COND_BROADCAST => self.cond_broadcast(bus, threads, req.args[0]),
            requests::JOIN => self.join(threads, tid, req.args[0]),
            requests::QUIT => self.quit(threads, tid, req.args[0]),
            requests::WAIT_JOINER => self.quit(threads, tid, req.args[0]),
            requests::CANCEL => self.cancel(threads, req.args[0], req.args[1]),
            requests::SET_CANCEL_STATE => {
                cancel::set_cancel_state(threads, tid, req.args[0] != 0);
                Outcome::Completed(0)
            }
            requests::TESTCANCEL => match cancel::testcancel(threads, tid) {
                Some(handler) => Outcome::Redirect(handler),
                None => Outcome::Completed(0),
            },
            requests::KEY_CREATE => match self.keys.create() {
                Ok(key) => Outcome::Completed(key as u32),
                Err(e) => Outcome::Completed(e.errno() as u32),
            },
            requests::KEY_DELETE => match self.keys.delete(req.args[0] as usize) {
                Ok(()) => Outcome::Completed(0),
                Err(e) => Outcome::Completed(e.errno() as u32),
            },
            requests::KEY_GETSPECIFIC_PTR => {
                match crate::key::get_specific(&self.keys, threads, tid, req.args[0] as usize) {
                    Ok(v) => Outcome::Completed(v),
                    Err(_) => Outcome::Completed(0),
                }
            }
            requests::KEY_SETSPECIFIC_PTR => {
                match crate::key::set_specific(&self.keys, threads, tid, req.args[0] as usize, req.args[1]) {
                    Ok(()) => Outcome::Completed(0),
                    Err(e) => Outcome::Completed(e.errno() as u32),
                }
            }
            requests::SIGMASK => {
                let how = match req.args[0] {
                    0 => MaskHow::Block,
                    1 => MaskHow::Unblock,
                    _ => MaskHow::SetMask,
                };
                let old = signal::sigmask(threads, tid, how, req.args[1] as u64);
                Outcome::Completed(old as u32)
            }
            requests::KILL => {
                // Actual delivery belongs to the signal layer; this engine
                // only reports whether the target currently masks it.
                match thread_id_or_err(req.args[0]) {
                    Ok(target) => Outcome::Completed(signal::is_masked(threads, target, req.args[1]) as u32),
                    Err(e) => Outcome::Completed(e.errno() as u32),
                }
            }
            other => {
                tracing::warn!(code = other, "unknown pthread client request");
                Outcome::Completed(PthreadError::UnknownKey.errno() as u32)
            }
        }
    }

    fn mutex_lock(
        &self,
        bus: &mut impl GuestBus,
        threads: &mut ThreadTable,
        tid: ThreadId,
        mx: u32,
        trylock: bool,
    ) -> Outcome {
        match mutex::lock(bus, threads, tid, mx, trylock) {
            Ok(LockOutcome::Acquired) => Outcome::Completed(0),
            Ok(LockOutcome::WouldBlock) => {
                let r = threads.get_mut(tid);
                r.status = ThreadStatus::WaitMx;
                r.associated_mx = mx;
                Outcome::Parked
            }
            Err(e) => Outcome::Completed(e.errno() as u32),
        }
    }

    fn mutex_unlock(&self, bus: &mut impl GuestBus, threads: &mut ThreadTable, tid: ThreadId, mx: u32) -> Outcome {
        match mutex::unlock(bus, threads, tid, mx) {
            Ok(Some(woken)) => {
                threads.get_mut(woken).status = ThreadStatus::Runnable;
                threads.get_mut(woken).associated_mx = 0;
                Outcome::CompletedWoke(0, woken)
            }
            Ok(None) => Outcome::Completed(0),
            Err(e) => Outcome::Completed(e.errno() as u32),
        }
    }

    fn cond_wait(
        &self,
        bus: &mut impl GuestBus,
        threads: &mut ThreadTable,
        tid: ThreadId,
        cv: u32,
        mx: u32,
        deadline_tick: u32,
    ) -> Outcome {
        match condvar::wait(bus, threads, tid, mx) {
            Ok(parked) => {
                if let Some(woken) = parked.woke_mutex_waiter {
                    threads.get_mut(woken).status = ThreadStatus::Runnable;
                    threads.get_mut(woken).associated_mx = 0;
                }
                let r = threads.get_mut(tid);
                r.status = ThreadStatus::WaitCv;
                r.associated_cv = cv;
                r.associated_mx = mx;
                r.awaken_at = if deadline_tick == 0 { NO_TIMEOUT } else { deadline_tick as u64 };
                Outcome::Parked
            }
            Err(e) => Outcome::Completed(e.errno() as u32),
        }
    }

    fn cond_signal(&self, bus: &mut impl GuestBus, threads: &mut ThreadTable, cv: u32) -> Outcome {
        match condvar::signal(bus, threads, cv) {
            Some((tid, outcome)) => {
                requeue_woken_waiter(threads, tid, outcome);
                Outcome::CompletedWoke(0, tid)
            }
            None => Outcome::Completed(0),
        }
    }

    fn cond_broadcast(&self, bus: &mut impl GuestBus, threads: &mut ThreadTable, cv: u32) -> Outcome {
        let mut first_woken = None;
        for (tid, outcome) in condvar::broadcast(bus, threads, cv) {
            requeue_woken_waiter(threads, tid, outcome);
            first_woken.get_or_insert(tid);
        }
        match first_woken {
            Some(tid) => Outcome::CompletedWoke(0, tid),
            None => Outcome::Completed(0),
        }
    }

    fn join(&self, threads: &mut ThreadTable, tid: ThreadId, jee_raw: u32) -> Outcome {
        let jee = match thread_id_or_err(jee_raw) {
            Ok(jee) => jee,
            Err(e) => return Outcome::Completed(e.errno() as u32),
        };
        match join::join(threads, tid, jee) {
            Ok(JoinOutcome::Immediate(ret)) => {
                threads.free(jee);
                Outcome::Completed(ret.unwrap_or(0))
            }
            Ok(JoinOutcome::MustWait) => {
                threads.get_mut(jee).joiner_tid = tid;
                let r = threads.get_mut(tid);
                r.status = ThreadStatus::WaitJoiner;
                r.joinee_tid = jee;
                Outcome::Parked
            }
            Err(e) => Outcome::Completed(e.errno() as u32),
        }
    }

    fn quit(&self, threads: &mut ThreadTable, tid: ThreadId, retval: u32) -> Outcome {
        match join::quit(threads, tid, retval) {
            QuitOutcome::Detached => {
                threads.free(tid);
                Outcome::Terminated
            }
            QuitOutcome::WakesJoiner(joiner, ret) => {
                let j = threads.get_mut(joiner);
                j.status = ThreadStatus::Runnable;
                j.join_return = ret;
                threads.free(tid);
                Outcome::Terminated
            }
            QuitOutcome::MustWaitForJoiner => {
                let r = threads.get_mut(tid);
                r.status = ThreadStatus::WaitJoinee;
                r.join_return = Some(retval);
                Outcome::Terminated
            }
        }
    }

    fn cancel(&self, threads: &mut ThreadTable, target_raw: u32, handler_addr: u32) -> Outcome {
        let target = match thread_id_or_err(target_raw) {
            Ok(target) => target,
            Err(e) => return Outcome::Completed(e.errno() as u32),
        };
        match cancel::cancel(threads, target, handler_addr) {
            Ok(()) => Outcome::Completed(0),
            Err(e) => Outcome::Completed(e.errno() as u32),
        }
    }
}

impl Default for PthreadEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Guest-supplied thread ids arrive as raw `u32`s that may be `0` or out of
/// range; `ThreadId::new` panics on `0`, so every path that turns a request
/// argument into a `ThreadId` goes through here instead.
fn thread_id_or_err(raw: u32) -> Result<ThreadId, PthreadError> {
    if raw == 0 {
        return Err(PthreadError::NoSuchThread);
    }
    Ok(ThreadId::new(raw))
}

fn requeue_woken_waiter(threads: &mut ThreadTable, tid: ThreadId, outcome: condvar::WakeOutcome) {
    let r = threads.get_mut(tid);
    r.associated_cv = 0;
    r.status = match outcome {
        condvar::WakeOutcome::ResumesRunning => {
            r.associated_mx = 0;
            ThreadStatus::Runnable
        }
        condvar::WakeOutcome::MovesToWaitMx => ThreadStatus::WaitMx,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamo_cpu_core::GuestMemory;

    fn req(code: u32, args: [u32; 4]) -> ClientRequest {
        ClientRequest { code, args }
    }

    #[test]
    fn mutex_lock_then_unlock_round_trips_uncontended() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();

        let outcome = engine.dispatch(&mut mem, &mut threads, tid, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Completed(0));

        let outcome = engine.dispatch(&mut mem, &mut threads, tid, req(requests::MUTEX_UNLOCK, [0x4000, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Completed(0));
    }

    #[test]
    fn contended_lock_parks_the_second_thread() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = threads.alloc().unwrap();
        let t2 = threads.alloc().unwrap();

        engine.dispatch(&mut mem, &mut threads, t1, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        let outcome = engine.dispatch(&mut mem, &mut threads, t2, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Parked);
        assert_eq!(threads.get(t2).status, ThreadStatus::WaitMx);
    }

    #[test]
    fn unlock_wakes_the_parked_waiter() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = threads.alloc().unwrap();
        let t2 = threads.alloc().unwrap();

        engine.dispatch(&mut mem, &mut threads, t1, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        engine.dispatch(&mut mem, &mut threads, t2, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        let outcome = engine.dispatch(&mut mem, &mut threads, t1, req(requests::MUTEX_UNLOCK, [0x4000, 0, 0, 0]));

        assert_eq!(threads.get(t2).status, ThreadStatus::Runnable);
        assert_eq!(outcome, Outcome::CompletedWoke(0, t2));
    }

    #[test]
    fn cond_signal_wakes_one_waiter() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = threads.alloc().unwrap();
        let t2 = threads.alloc().unwrap();

        engine.dispatch(&mut mem, &mut threads, t1, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        engine.dispatch(&mut mem, &mut threads, t1, req(requests::COND_WAIT, [0x5000, 0x4000, 0, 0]));
        let outcome = engine.dispatch(&mut mem, &mut threads, t2, req(requests::COND_SIGNAL, [0x5000, 0, 0, 0]));

        assert_eq!(outcome, Outcome::CompletedWoke(0, t1));
    }

    #[test]
    fn cond_broadcast_with_no_waiters_completes_without_waking_anyone() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();

        let outcome = engine.dispatch(&mut mem, &mut threads, tid, req(requests::COND_BROADCAST, [0x5000, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Completed(0));
    }

    #[test]
    fn cond_broadcast_wakes_every_waiter_and_reports_the_first() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let t1 = threads.alloc().unwrap();
        let t2 = threads.alloc().unwrap();
        let signaler = threads.alloc().unwrap();

        engine.dispatch(&mut mem, &mut threads, t1, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        engine.dispatch(&mut mem, &mut threads, t1, req(requests::COND_WAIT, [0x5000, 0x4000, 0, 0]));
        engine.dispatch(&mut mem, &mut threads, t2, req(requests::MUTEX_LOCK, [0x4000, 0, 0, 0]));
        engine.dispatch(&mut mem, &mut threads, t2, req(requests::COND_WAIT, [0x5000, 0x4000, 0, 0]));

        let outcome = engine.dispatch(&mut mem, &mut threads, signaler, req(requests::COND_BROADCAST, [0x5000, 0, 0, 0]));
        match outcome {
            Outcome::CompletedWoke(0, first) => assert!(first == t1 || first == t2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn join_of_a_running_thread_parks_the_joiner() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        let joiner = threads.alloc().unwrap();

        let outcome = engine.dispatch(&mut mem, &mut threads, joiner, req(requests::JOIN, [jee.raw(), 0, 0, 0]));
        assert_eq!(outcome, Outcome::Parked);
        assert_eq!(threads.get(joiner).status, ThreadStatus::WaitJoiner);
    }

    #[test]
    fn quit_wakes_a_waiting_joiner_with_the_return_value() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let jee = threads.alloc().unwrap();
        let joiner = threads.alloc().unwrap();

        engine.dispatch(&mut mem, &mut threads, joiner, req(requests::JOIN, [jee.raw(), 0, 0, 0]));
        let outcome = engine.dispatch(&mut mem, &mut threads, jee, req(requests::QUIT, [0x42, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Terminated);
        assert_eq!(threads.get(joiner).status, ThreadStatus::Runnable);
        assert_eq!(threads.get(joiner).join_return, Some(0x42));
    }

    #[test]
    fn key_lifecycle_round_trips_through_dispatch() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();

        let key = match engine.dispatch(&mut mem, &mut threads, tid, req(requests::KEY_CREATE, [0; 4])) {
            Outcome::Completed(k) => k,
            other => panic!("unexpected outcome: {other:?}"),
        };
        engine.dispatch(&mut mem, &mut threads, tid, req(requests::KEY_SETSPECIFIC_PTR, [key, 0xbeef, 0, 0]));
        let outcome = engine.dispatch(&mut mem, &mut threads, tid, req(requests::KEY_GETSPECIFIC_PTR, [key, 0, 0, 0]));
        assert_eq!(outcome, Outcome::Completed(0xbeef));
    }

    #[test]
    fn unknown_request_code_reports_an_error_instead_of_panicking() {
        let mut engine = PthreadEngine::new();
        let mut mem = GuestMemory::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        let outcome = engine.dispatch(&mut mem, &mut threads, tid, req(0xdead_beef, [0; 4]));
        assert_eq!(outcome, Outcome::Completed(PthreadError::UnknownKey.errno() as u32));
    }
}
