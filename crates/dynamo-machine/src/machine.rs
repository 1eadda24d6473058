//! The wired-together engine: a [`Scheduler`] driving compiled guest code,
//! with client requests and `int $0x80` syscalls routed out to
//! `dynamo-pthread`/`dynamo-syscall` before the thread resumes.

use crate::helper_table::HelperTable;
use crate::plugin::{Tool, ToolEvent};
use crate::Config;
use dynamo_cpu_core::GuestBus;
use dynamo_pthread::{ClientRequest, Outcome as PthreadOutcome, PthreadEngine};
use dynamo_sched::{GuestCodeSource, HostExit, SchedError, Scheduler, ThreadStatus, TurnOutcome};
use dynamo_syscall::{
    is_blocking, post_syscall, pre_syscall, AddressSpace, FaultOutcome, HandlerTable, ProxyLwp, SyncFault,
    SyscallArgs, SyscallResult,
};
use dynamo_sched::ThreadTable;
use dynamo_types::{GuestAddr, ThreadId, MAX_THREADS};
use std::sync::mpsc;

/// The 20-byte args packet a client request's `%eax` points at:
/// `[request_code, arg0, arg1, arg2, arg3]`.
const CLIENT_REQUEST_PACKET_BYTES: u32 = 20;

/// Sentinel written to a cancelled thread's saved `%eax` before redirecting
/// it into its cancellation handler, mirroring glibc's `PTHREAD_CANCELED`
/// (`(void *) -1`).
const PTHREAD_CANCELED: u32 = 0xffff_ffff;

/// Outcome of one [`Machine::step`], richer than the scheduler's own
/// [`TurnOutcome`] since a client request or syscall may resolve without
/// the thread ever becoming externally observable as blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Ran(ThreadId, HostExit),
    Idle,
    /// A synchronous fault had no installed guest handler; the framework
    /// cannot continue this thread (or the process, depending on the
    /// caller's policy).
    Fatal(ThreadId, i32),
}

struct ProxySlot {
    lwp: ProxyLwp,
    pending: Option<SyscallArgs>,
}

pub struct Machine<S: GuestCodeSource + GuestBus + AddressSpace> {
    scheduler: Scheduler<S>,
    pthread: PthreadEngine,
    handlers: HandlerTable,
    tool: Box<dyn Tool>,
    config: Config,
    proxies: Vec<Option<ProxySlot>>,
    results_tx: mpsc::Sender<SyscallResult>,
    results_rx: mpsc::Receiver<SyscallResult>,
}

impl<S: GuestCodeSource + GuestBus + AddressSpace> Machine<S> {
    pub fn new(code: S, mut tool: Box<dyn Tool>, config: Config) -> Result<Self, SchedError> {
        let mut scheduler = Scheduler::new(code)?;
        let mut helpers = HelperTable::new();
        tool.register_helpers(&mut helpers);
        let compact: Vec<u32> = helpers.compact_addrs().iter().map(|&a| a as u32).collect();
        let noncompact: Vec<u32> = helpers.noncompact_addrs().iter().map(|&a| a as u32).collect();
        scheduler.install_plugin_helpers(&compact, &noncompact);
        let (results_tx, results_rx) = mpsc::channel();
        Ok(Machine {
            scheduler,
            pthread: PthreadEngine::new(),
            handlers: HandlerTable::new(),
            tool,
            config,
            proxies: (0..MAX_THREADS).map(|_| None).collect(),
            results_tx,
            results_rx,
        })
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<S> {
        &mut self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    pub fn tool_mut(&mut self) -> &mut dyn Tool {
        self.tool.as_mut()
    }

    /// Drives client-request and syscall handling directly, bypassing
    /// `run_one_turn`, so cross-crate scenario tests can set up a thread's
    /// saved registers exactly as a real exit would have left them without
    /// actually compiling and running guest code.
    pub fn handle_client_request_for_test(&mut self, tid: ThreadId) {
        self.handle_client_request(tid);
    }

    pub fn handle_syscall_for_test(&mut self, tid: ThreadId) {
        self.handle_syscall(tid);
    }

    pub fn tool_events_for_test(&self) -> &[ToolEvent] {
        self.tool.events()
    }

    /// Drains every syscall result a proxy LWP has finished since the last
    /// call, writing its return value back to the requesting thread and
    /// making it runnable again.
    fn drain_proxy_results(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            let slot = self.proxies[result.tid.index()].as_mut();
            let pending = slot.and_then(|s| s.pending.take());
            if let Some(call) = pending {
                if let Err(err) = post_syscall(self.scheduler.code_mut(), call, result.retval) {
                    self.tool.on_error_event(ToolEvent::InvalidSyscallPointer { tid: result.tid, addr: err.addr });
                }
            }
            self.scheduler.set_saved_eax(result.tid, result.retval as u32);
            let rec = self.scheduler.threads_mut().get_mut(result.tid);
            rec.pending_syscall = None;
            if rec.status == ThreadStatus::WaitSys {
                rec.status = ThreadStatus::Runnable;
            }
        }
    }

    fn proxy_for(&mut self, tid: ThreadId) -> &mut ProxySlot {
        let idx = tid.index();
        if self.proxies[idx].is_none() {
            self.proxies[idx] = Some(ProxySlot { lwp: ProxyLwp::spawn(tid, self.results_tx.clone()), pending: None });
        }
        self.proxies[idx].as_mut().expect("just populated above")
    }

    fn handle_syscall(&mut self, tid: ThreadId) {
        let regs = self.scheduler.saved_regs(tid);
        let call = SyscallArgs {
            nr: regs.eax as i64,
            args: [regs.ebx as i64, regs.ecx as i64, regs.edx as i64, regs.esi as i64, regs.edi as i64, regs.ebp as i64],
        };
        if let Err(err) = pre_syscall(self.scheduler.code_mut(), call) {
            self.tool.on_error_event(ToolEvent::InvalidSyscallPointer { tid, addr: err.addr });
            self.scheduler.set_saved_eax(tid, (-libc::EFAULT) as u32);
            return;
        }
        if is_blocking(call.nr) {
            let rec = self.scheduler.threads_mut().get_mut(tid);
            rec.status = ThreadStatus::WaitSys;
            rec.pending_syscall = Some(call.nr as u32);
            let slot = self.proxy_for(tid);
            slot.pending = Some(call);
            slot.lwp.run(call);
        } else {
            let retval = issue_inline(call);
            if let Err(err) = post_syscall(self.scheduler.code_mut(), call, retval) {
                self.tool.on_error_event(ToolEvent::InvalidSyscallPointer { tid, addr: err.addr });
            }
            self.scheduler.set_saved_eax(tid, retval as u32);
        }
    }

    fn handle_client_request(&mut self, tid: ThreadId) {
        let packet_ptr = self.scheduler.saved_eax(tid);
        if !self.scheduler.code_mut().is_mapped(packet_ptr, CLIENT_REQUEST_PACKET_BYTES) {
            self.tool.on_error_event(ToolEvent::InvalidClientRequestPointer { tid, addr: packet_ptr });
            self.scheduler.set_saved_edx(tid, (-libc::EFAULT) as u32);
            return;
        }
        let (bus, threads) = self.scheduler.code_and_threads_mut();
        let code = bus.read_u32(packet_ptr);
        let args = [
            bus.read_u32(packet_ptr.wrapping_add(4)),
            bus.read_u32(packet_ptr.wrapping_add(8)),
            bus.read_u32(packet_ptr.wrapping_add(12)),
            bus.read_u32(packet_ptr.wrapping_add(16)),
        ];
        if code == dynamo_pthread::requests::DISCARD_TRANSLATIONS {
            self.scheduler.trace_cache_mut().invalidate_range(args[0], args[1]);
            self.scheduler.set_saved_edx(tid, 0);
            return;
        }
        observe_condvar_misuse(self.tool.as_mut(), bus, threads, tid, code, args);
        let hooks = self.tool.hooks();
        if hooks.pre_mutex_lock && matches!(code, dynamo_pthread::requests::MUTEX_LOCK | dynamo_pthread::requests::MUTEX_TRYLOCK) {
            self.tool.on_pre_mutex_lock(tid, args[0]);
        }
        let req = ClientRequest { code, args };
        let (bus, threads) = self.scheduler.code_and_threads_mut();
        let outcome = self.pthread.dispatch(bus, threads, tid, req);
        match outcome {
            PthreadOutcome::Completed(value) => {
                self.scheduler.set_saved_edx(tid, value);
                if errno_shaped(code) && value != 0 {
                    self.tool.on_error_event(ToolEvent::PthreadError { tid, errno: value as i32 });
                } else if code == dynamo_pthread::requests::CANCEL && value == 0 && args[0] != 0 {
                    self.deliver_cancellation_to_blocked_syscall(ThreadId::new(args[0]));
                } else if hooks.post_mutex_lock
                    && value == 0
                    && matches!(code, dynamo_pthread::requests::MUTEX_LOCK | dynamo_pthread::requests::MUTEX_TRYLOCK)
                {
                    self.tool.on_post_mutex_lock(tid, args[0]);
                } else if hooks.post_mutex_unlock && value == 0 && code == dynamo_pthread::requests::MUTEX_UNLOCK {
                    self.tool.on_post_mutex_unlock(tid, args[0]);
                } else if hooks.post_thread_join && code == dynamo_pthread::requests::JOIN {
                    self.tool.on_post_thread_join(tid, ThreadId::new(args[0]));
                }
            }
            PthreadOutcome::CompletedWoke(value, woken) => {
                self.scheduler.set_saved_edx(tid, value);
                // Bias the scheduler toward the thread this hand-off just
                // made runnable instead of letting it wait out the rest of
                // the unlocking/signalling thread's quantum.
                self.scheduler.need_resched(Some(woken));
            }
            PthreadOutcome::Parked => {}
            PthreadOutcome::Terminated => {}
            PthreadOutcome::Redirect(addr) => self.scheduler.set_saved_eip(tid, addr),
        }
    }

    /// A thread blocked in a real (proxied) syscall has no guest
    /// instruction pointer of its own to reach a cancellation point at —
    /// the engine must interrupt the blocking call itself and redirect it
    /// into the handler immediately, the same way a real libc cancels a
    /// thread sitting in `read(2)`. A no-op if the target isn't currently
    /// `WaitSys` or has no cancellation pending (e.g. the `CANCEL` request
    /// failed, or the target is a guest-runnable thread that will reach an
    /// ordinary deferred cancellation point on its own).
    fn deliver_cancellation_to_blocked_syscall(&mut self, target: ThreadId) {
        let threads = self.scheduler.threads_mut();
        if threads.get(target).status != ThreadStatus::WaitSys {
            return;
        }
        let Some(pending) = threads.get_mut(target).cancel_pending.take() else {
            return;
        };
        if let Some(slot) = self.proxies[target.index()].as_ref() {
            slot.lwp.abort();
        }
        let rec = self.scheduler.threads_mut().get_mut(target);
        rec.status = ThreadStatus::Runnable;
        rec.pending_syscall = None;
        self.scheduler.set_saved_eip(target, pending.handler_addr);
        self.scheduler.set_saved_eax(target, PTHREAD_CANCELED);
    }

    fn handle_fault(&mut self, tid: ThreadId, signal: i32) -> StepOutcome {
        let Some(fault) = sync_fault_of(signal) else {
            return StepOutcome::Fatal(tid, signal);
        };
        match dynamo_syscall::signal::route_sync_fault(&self.handlers, fault) {
            FaultOutcome::Deliver(handler) => {
                self.scheduler.set_saved_eip(tid, handler);
                StepOutcome::Ran(tid, HostExit::UnresumableSignal { signal, fault_addr: 0 })
            }
            FaultOutcome::Fatal => StepOutcome::Fatal(tid, signal),
        }
    }

    /// Advances the scheduler by one turn, resolving whatever the compiled
    /// block exited for before returning. A client request or non-blocking
    /// syscall is fully resolved inline; a blocking syscall leaves the
    /// thread in `WaitSys` for a later [`Machine::step`]'s result drain to
    /// pick up.
    pub fn step(&mut self) -> Result<StepOutcome, SchedError> {
        self.drain_proxy_results();
        match self.scheduler.run_one_turn()? {
            TurnOutcome::Idle => Ok(StepOutcome::Idle),
            TurnOutcome::Ran(tid, exit) => {
                if self.tool.hooks().thread_run {
                    self.tool.on_thread_run(tid);
                }
                match exit {
                    HostExit::ClientReq => {
                        self.handle_client_request(tid);
                        Ok(StepOutcome::Ran(tid, exit))
                    }
                    HostExit::Syscall => {
                        self.handle_syscall(tid);
                        Ok(StepOutcome::Ran(tid, exit))
                    }
                    HostExit::UnresumableSignal { signal, fault_addr: _ } => Ok(self.handle_fault(tid, signal)),
                    HostExit::Yield | HostExit::InnerCounterZero | HostExit::FastMiss => {
                        Ok(StepOutcome::Ran(tid, exit))
                    }
                }
            }
        }
    }
}

fn errno_shaped(code: u32) -> bool {
    use dynamo_pthread::requests;
    matches!(
        code,
        requests::MUTEX_LOCK
            | requests::MUTEX_UNLOCK
            | requests::MUTEX_TRYLOCK
            | requests::COND_WAIT
            | requests::JOIN
            | requests::CANCEL
            | requests::SET_CANCEL_STATE
            | requests::KEY_CREATE
            | requests::KEY_DELETE
            | requests::KEY_SETSPECIFIC_PTR
            | requests::KILL
    )
}

/// Observes the two condvar misuses the guest could legally-but-dangerously
/// commit — POSIX leaves both undefined rather than erroring, so neither
/// blocks the request; this only gives a tool visibility into them.
fn observe_condvar_misuse(
    tool: &mut dyn Tool,
    bus: &mut impl GuestBus,
    threads: &ThreadTable,
    tid: ThreadId,
    code: u32,
    args: [u32; 4],
) {
    use dynamo_pthread::requests;
    use dynamo_sched::ThreadStatus;

    match code {
        requests::COND_WAIT => {
            let (cv, mx) = (args[0], args[1]);
            let conflicts = threads
                .iter()
                .any(|(_, r)| r.status == ThreadStatus::WaitCv && r.associated_cv == cv && r.associated_mx != mx);
            if conflicts {
                tool.on_error_event(ToolEvent::PthreadError { tid, errno: libc::EINVAL });
            }
        }
        requests::COND_SIGNAL | requests::COND_BROADCAST => {
            let cv = args[0];
            if let Some(waiter_mx) = threads
                .iter()
                .find(|(_, r)| r.status == ThreadStatus::WaitCv && r.associated_cv == cv)
                .map(|(_, r)| r.associated_mx)
            {
                if !signaler_owns(bus, waiter_mx, tid) {
                    tool.on_error_event(ToolEvent::PthreadError { tid, errno: libc::EPERM });
                }
            }
        }
        _ => {}
    }
}

/// Whether `tid` currently owns guest mutex `mx`, read directly off its
/// guest-memory layout rather than through a side table — the same fields
/// [`dynamo_pthread::mutex`] itself reads and writes.
fn signaler_owns(bus: &mut impl GuestBus, mx: GuestAddr, tid: ThreadId) -> bool {
    use dynamo_pthread::mutex::layout;
    let owner = bus.read_u32(mx + layout::OWNER_OFFSET);
    let count = bus.read_u32(mx + layout::COUNT_OFFSET);
    count > 0 && owner == tid.raw()
}

fn sync_fault_of(signal: i32) -> Option<SyncFault> {
    if signal == libc::SIGSEGV {
        Some(SyncFault::Segv)
    } else if signal == libc::SIGBUS {
        Some(SyncFault::Bus)
    } else if signal == libc::SIGILL {
        Some(SyncFault::Ill)
    } else if signal == libc::SIGFPE {
        Some(SyncFault::Fpe)
    } else {
        None
    }
}

/// Issues a non-blocking syscall directly on the dispatch thread, the same
/// raw mechanism a proxy LWP uses for a blocking one — skipping the proxy
/// hop is safe precisely because the call is known not to block.
fn issue_inline(call: SyscallArgs) -> i64 {
    unsafe {
        libc::syscall(
            call.nr as libc::c_long,
            call.args[0],
            call.args[1],
            call.args[2],
            call.args[3],
            call.args[4],
            call.args[5],
        ) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::NullTool;
    use dynamo_cpu_core::GuestMemory;

    fn machine() -> Machine<GuestMemory> {
        Machine::new(GuestMemory::new(), Box::new(NullTool::default()), Config::default()).expect("machine")
    }

    #[test]
    fn idle_with_no_threads_is_reported_as_a_scheduler_error() {
        let mut m = machine();
        assert!(m.step().is_err());
    }

    #[test]
    fn an_invalid_client_request_pointer_is_reported_to_the_tool_not_panicked_on() {
        let mut m = machine();
        let tid = m.scheduler_mut().threads_mut().alloc().unwrap();
        m.scheduler_mut().threads_mut().get_mut(tid).snapshot.eip = 0;
        m.scheduler_mut().set_saved_eax(tid, 0xdead_0000);
        m.handle_client_request(tid);
        assert_eq!(m.scheduler.saved_regs(tid).edx, (-libc::EFAULT) as u32);
    }

    #[test]
    fn a_non_blocking_syscall_resolves_inline_within_one_step() {
        let mut m = machine();
        let tid = m.scheduler_mut().threads_mut().alloc().unwrap();
        let rec = m.scheduler_mut().threads_mut().get_mut(tid);
        rec.snapshot.eax = libc::SYS_getpid as u32;
        m.handle_syscall(tid);
        assert_ne!(m.scheduler.saved_regs(tid).eax, 0);
    }

    #[test]
    fn mutex_lock_client_request_round_trips_through_dispatch() {
        let mut m = machine();
        let tid = m.scheduler_mut().threads_mut().alloc().unwrap();
        let packet_addr = 0x9000u32;
        {
            let bus = m.scheduler_mut().code_mut();
            bus.write_u32(packet_addr, dynamo_pthread::requests::MUTEX_LOCK);
            bus.write_u32(packet_addr + 4, 0x4000); // mutex address
        }
        m.scheduler_mut().set_saved_eax(tid, packet_addr);
        m.handle_client_request(tid);
        assert_eq!(m.scheduler.saved_regs(tid).edx, 0);
    }

    #[derive(Default)]
    struct RecordingInner {
        pre_lock: Vec<(ThreadId, GuestAddr)>,
        post_lock: Vec<(ThreadId, GuestAddr)>,
        post_unlock: Vec<(ThreadId, GuestAddr)>,
        post_join: Vec<(ThreadId, ThreadId)>,
    }

    #[derive(Clone, Default)]
    struct RecordingTool(std::rc::Rc<std::cell::RefCell<RecordingInner>>);

    impl Tool for RecordingTool {
        fn hooks(&self) -> crate::plugin::HookSubscriptions {
            crate::plugin::HookSubscriptions {
                pre_mutex_lock: true,
                post_mutex_lock: true,
                post_mutex_unlock: true,
                post_thread_join: true,
                thread_run: false,
            }
        }
        fn on_pre_mutex_lock(&mut self, tid: ThreadId, mutex: GuestAddr) {
            self.0.borrow_mut().pre_lock.push((tid, mutex));
        }
        fn on_post_mutex_lock(&mut self, tid: ThreadId, mutex: GuestAddr) {
            self.0.borrow_mut().post_lock.push((tid, mutex));
        }
        fn on_post_mutex_unlock(&mut self, tid: ThreadId, mutex: GuestAddr) {
            self.0.borrow_mut().post_unlock.push((tid, mutex));
        }
        fn on_post_thread_join(&mut self, joiner: ThreadId, joinee: ThreadId) {
            self.0.borrow_mut().post_join.push((joiner, joinee));
        }
    }

    #[test]
    fn subscribed_mutex_hooks_fire_around_lock_and_unlock() {
        let recorder = RecordingTool::default();
        let mut m = Machine::new(GuestMemory::new(), Box::new(recorder.clone()), Config::default()).expect("machine");
        let tid = m.scheduler_mut().threads_mut().alloc().unwrap();
        let mx = 0x4000u32;

        m.scheduler_mut().set_saved_eax(tid, 0x9000);
        {
            let bus = m.scheduler_mut().code_mut();
            bus.write_u32(0x9000, dynamo_pthread::requests::MUTEX_LOCK);
            bus.write_u32(0x9004, mx);
        }
        m.handle_client_request(tid);

        m.scheduler_mut().set_saved_eax(tid, 0x9100);
        {
            let bus = m.scheduler_mut().code_mut();
            bus.write_u32(0x9100, dynamo_pthread::requests::MUTEX_UNLOCK);
            bus.write_u32(0x9104, mx);
        }
        m.handle_client_request(tid);

        let inner = recorder.0.borrow();
        assert_eq!(inner.pre_lock, vec![(tid, mx)]);
        assert_eq!(inner.post_lock, vec![(tid, mx)]);
        assert_eq!(inner.post_unlock, vec![(tid, mx)]);
    }

    #[test]
    fn post_thread_join_hook_fires_when_the_joinee_already_quit() {
        let recorder = RecordingTool::default();
        let mut m = Machine::new(GuestMemory::new(), Box::new(recorder.clone()), Config::default()).expect("machine");
        let jee = m.scheduler_mut().threads_mut().alloc().unwrap();
        let joiner = m.scheduler_mut().threads_mut().alloc().unwrap();

        m.scheduler_mut().set_saved_eax(jee, 0x9200);
        {
            let bus = m.scheduler_mut().code_mut();
            bus.write_u32(0x9200, dynamo_pthread::requests::QUIT);
            bus.write_u32(0x9204, 0);
        }
        m.handle_client_request(jee);

        m.scheduler_mut().set_saved_eax(joiner, 0x9300);
        {
            let bus = m.scheduler_mut().code_mut();
            bus.write_u32(0x9300, dynamo_pthread::requests::JOIN);
            bus.write_u32(0x9304, jee.raw());
        }
        m.handle_client_request(joiner);

        let inner = recorder.0.borrow();
        assert_eq!(inner.post_join, vec![(joiner, jee)]);
    }
}
