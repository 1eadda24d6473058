//! The main dispatch loop: thread selection, trace-cache lookup and
//! on-demand translation, and the termination-code handling for whatever a
//! compiled block exits with.

use crate::code_source::GuestCodeSource;
use crate::dispatch::run_compiled;
use crate::thread_table::{ThreadStatus, ThreadTable, NO_TIMEOUT};
use crate::timeout::TimeoutQueue;
use dynamo_cpu_core::rescue::{run_rescued, RescueOutcome};
use dynamo_cpu_core::time::Clock;
use dynamo_cpu_core::trace_cache::{TraceCache, TraceCacheError};
use dynamo_cpu_core::BaseBlock;
use dynamo_jit_x86::{compile_block, encode_chain_jmp, helpers, CodegenError, ExitTag};
use dynamo_types::{GuestAddr, ThreadId, SCHEDULING_QUANTUM};
use dynamo_ucode::HelperId;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Reseats every core `HelperId`'s base-block slot with its actual host
/// address. Run once per `Scheduler`, since these never change afterward —
/// `CCall` codegen addresses them as `[%ebp + off]` rather than baking the
/// address into the generated code, exactly like a tool-registered helper.
fn install_core_helpers(bb: &mut BaseBlock) {
    for i in 0..HelperId::COUNT as u32 {
        let id = HelperId::from_u32(i).expect("0..COUNT is exactly the valid HelperId range");
        bb.core_helpers[i as usize] = helpers::address_of(id) as u32;
    }
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("translation cache: {0}")]
    TraceCache(#[from] TraceCacheError),
    #[error("decode failed: {0}")]
    Decode(#[from] dynamo_decoder::DecodeError),
    #[error("codegen failed: {0}")]
    Codegen(#[from] CodegenError),
    #[error("translated gBB violates the 0 < {what} <= 65535 byte bound")]
    BlockTooLarge { what: &'static str },
    #[error("every guest thread is blocked with no external progress possible")]
    Deadlock,
}

/// Why one pass through a thread's compiled code returned control to the
/// scheduler. `FastMiss` never reaches a caller of [`Scheduler::run_one_turn`]
/// — a trace-cache miss is resolved internally by translating and retrying
/// the same thread, same as the source engine's `tt_fast`-miss retry — but
/// the variant stays here since the scheduler logs it under this name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    FastMiss,
    Syscall,
    ClientReq,
    Yield,
    InnerCounterZero,
    UnresumableSignal { signal: i32, fault_addr: usize },
}

/// Result of asking the scheduler to advance by one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Ran(ThreadId, HostExit),
    /// No thread is runnable, but at least one is making externally-driven
    /// progress (timer, syscall, condvar) — the caller should poll/sleep
    /// on its own result channel and call again.
    Idle,
}

pub struct Scheduler<S: GuestCodeSource> {
    threads: ThreadTable,
    timeouts: TimeoutQueue,
    trace_cache: TraceCache,
    live: BaseBlock,
    code: S,
    clock: Clock,
    /// Blocks to run before the next turn returns `InnerCounterZero`.
    /// Shrunk by `need_resched` to hasten a wakeup; otherwise reset to
    /// `SCHEDULING_QUANTUM` at the top of every turn.
    quantum: u32,
    prefer: Option<ThreadId>,
}

impl<S: GuestCodeSource> Scheduler<S> {
    pub fn new(code: S) -> Result<Self, SchedError> {
        let mut live = BaseBlock::default();
        install_core_helpers(&mut live);
        Ok(Scheduler {
            threads: ThreadTable::new(),
            timeouts: TimeoutQueue::new(),
            trace_cache: TraceCache::new()?,
            live,
            code,
            clock: Clock::new(),
            quantum: SCHEDULING_QUANTUM,
            prefer: None,
        })
    }

    /// Writes a tool's registered plugin-helper addresses into the live base
    /// block's helper banks, the same slots `CCall`'s `call *off(%ebp)`
    /// indirection reads from for the core helpers.
    pub fn install_plugin_helpers(&mut self, compact: &[u32], noncompact: &[u32]) {
        self.live.compact_helpers[..compact.len()].copy_from_slice(compact);
        self.live.noncompact_helpers[..noncompact.len()].copy_from_slice(noncompact);
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn threads_mut(&mut self) -> &mut ThreadTable {
        &mut self.threads
    }

    pub fn timeouts_mut(&mut self) -> &mut TimeoutQueue {
        &mut self.timeouts
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_nanos() / 1_000_000
    }

    pub fn trace_cache_mut(&mut self) -> &mut TraceCache {
        &mut self.trace_cache
    }

    /// The guest code source, re-exposed so a caller that also needs to
    /// read/write guest memory directly (the pthread engine dereferencing a
    /// mutex, the syscall layer validating a pointer) can reuse the same
    /// backing store the scheduler fetches instructions from, rather than
    /// keeping a second, divergent one.
    pub fn code_mut(&mut self) -> &mut S {
        &mut self.code
    }

    /// Disjoint mutable access to the code source and the thread table at
    /// once — needed wherever a single call (dispatching a client request
    /// through `dynamo-pthread`) must pass both, since the two `&mut self`
    /// accessor methods can't be borrowed simultaneously from outside this
    /// module.
    pub fn code_and_threads_mut(&mut self) -> (&mut S, &mut ThreadTable) {
        (&mut self.code, &mut self.threads)
    }

    /// `tid`'s `%eax` as of its last exit, as left by a block that just
    /// exited with `HostExit::ClientReq` — the client-request ABI's
    /// args-array pointer, untouched by the exit-tag bookkeeping since that
    /// only overwrites the host trampoline's return register, not this
    /// field. Reads the saved per-thread snapshot, not the scheduler's
    /// scratch base block, which is poisoned before `run_one_turn` returns.
    pub fn saved_eax(&self, tid: ThreadId) -> GuestAddr {
        self.threads.get(tid).snapshot.eax
    }

    /// Writes a syscall's return value into `tid`'s saved `%eax`, per the
    /// `int $0x80` ABI's "EAX carries the return value" convention.
    pub fn set_saved_eax(&mut self, tid: ThreadId, value: u32) {
        self.threads.get_mut(tid).snapshot.eax = value;
    }

    /// Writes the client request's result into `tid`'s saved `%edx`, per the
    /// client-request ABI's "EDX carries the return value" convention. Takes
    /// effect the next time `tid` is loaded and run.
    pub fn set_saved_edx(&mut self, tid: ThreadId, value: u32) {
        self.threads.get_mut(tid).snapshot.edx = value;
    }

    /// `tid`'s full saved register file, for a caller decoding a syscall's
    /// `%eax`/`%ebx`/`%ecx`/`%edx`/`%esi`/`%edi`/`%ebp` argument convention
    /// after a `HostExit::Syscall` exit.
    pub fn saved_regs(&self, tid: ThreadId) -> BaseBlock {
        self.threads.get(tid).snapshot
    }

    /// Redirects `tid`'s next resumption to `eip` — used to deliver a
    /// pending cancellation or a routed synchronous-fault handler without
    /// waiting for the guest to reach the address on its own.
    pub fn set_saved_eip(&mut self, tid: ThreadId, eip: GuestAddr) {
        self.threads.get_mut(tid).snapshot.eip = eip;
    }

    /// Shrinks the remaining quantum to 2 and records a preferred next pick —
    /// used to bias the scheduler toward a thread that was just woken (e.g.
    /// by a mutex handoff) without starving everyone else outright.
    pub fn need_resched(&mut self, prefer: Option<ThreadId>) {
        self.quantum = self.quantum.min(2);
        self.prefer = prefer;
    }

    fn next_runnable_round_robin(&self) -> Option<ThreadId> {
        if let Some(p) = self.prefer {
            if self.threads.get(p).status == ThreadStatus::Runnable {
                return Some(p);
            }
        }
        self.threads
            .iter()
            .find(|(_, r)| r.status == ThreadStatus::Runnable)
            .map(|(tid, _)| tid)
    }

    /// Moves any thread whose timeout has passed back to `Runnable` (or, for
    /// a condvar wait, lets the caller re-check mutex availability — this
    /// just flips status/clears the timeout; `dynamo-pthread` owns the
    /// mutex-reacquisition decision). A stale entry (the thread's live
    /// `awaken_at` no longer matches what was queued) is silently dropped.
    pub fn expire_timeouts(&mut self) {
        let now = self.now_ms();
        for (deadline, tid) in self.timeouts.pop_expired(now) {
            let rec = self.threads.get_mut(tid);
            if rec.awaken_at != deadline {
                continue;
            }
            rec.awaken_at = NO_TIMEOUT;
            if rec.status == ThreadStatus::Sleeping {
                rec.status = ThreadStatus::Runnable;
            }
            // WaitCv threads are left for dynamo-pthread's timeout handler,
            // which must attempt mutex reacquisition before the thread can
            // become Runnable again.
        }
    }

    /// `sanity()` from the main-loop pseudocode: every invariant the thread
    /// table is expected to hold continuously.
    pub fn sanity(&self) -> Result<(), &'static str> {
        self.threads.sanity_check()?;
        if !self.timeouts.is_sorted_ascending() {
            return Err("timeout queue is not sorted ascending");
        }
        Ok(())
    }

    /// Advances by one scheduling turn: picks a `Runnable` thread, runs it
    /// until its quantum is exhausted or it exits for a reason the caller
    /// must act on (syscall, client request, yield, unresumable signal).
    pub fn run_one_turn(&mut self) -> Result<TurnOutcome, SchedError> {
        self.expire_timeouts();
        let Some(tid) = self.next_runnable_round_robin() else {
            if !self.threads.any_externally_progressing_wait() {
                return Err(SchedError::Deadlock);
            }
            return Ok(TurnOutcome::Idle);
        };
        self.prefer = None;

        self.live.load_state(&self.threads.get(tid).snapshot);
        self.live.owner = tid.raw();

        let mut budget = self.quantum;
        self.quantum = SCHEDULING_QUANTUM;

        let exit = loop {
            if budget == 0 {
                break HostExit::InnerCounterZero;
            }
            budget -= 1;

            let pc = self.live.eip;
            if self.trace_cache.lookup(pc).is_none() {
                trace!(pc, "fastmiss: creating translation");
                self.create_translation_for(pc)?;
            }
            let compiled = self.trace_cache.lookup(pc).expect("just inserted above on miss");
            let entry = self.trace_cache.host_addr_of(compiled);

            let live_ptr: *mut BaseBlock = &mut self.live;
            let mut exit_eax = 0u32;
            let rescue = run_rescued(|| {
                // SAFETY: `entry` was produced by `compile_block` and lives
                // in the trace cache's executable buffer; `live_ptr` is the
                // single base block currently loaded for `tid`.
                exit_eax = unsafe { run_compiled(entry, live_ptr) };
            });
            if let Err(RescueOutcome::Fault { signal, fault_addr }) = rescue {
                break HostExit::UnresumableSignal { signal, fault_addr };
            }

            if exit_eax == ExitTag::Continue as u32 {
                continue;
            } else if exit_eax == ExitTag::Syscall as u32 {
                break HostExit::Syscall;
            } else if exit_eax == ExitTag::ClientReq as u32 {
                break HostExit::ClientReq;
            } else if exit_eax == ExitTag::Yield as u32 {
                break HostExit::Yield;
            } else {
                error!(exit_eax, "compiled block returned an unrecognized exit tag");
                break HostExit::UnresumableSignal { signal: 0, fault_addr: 0 };
            }
        };

        self.live.save_state(&mut self.threads.get_mut(tid).snapshot);
        self.live.poison_fill();
        Ok(TurnOutcome::Ran(tid, exit))
    }

    /// Decodes, compiles, and inserts the translation for guest address
    /// `pc`, asserting the 0 < size <= 65535 bound on both the guest and
    /// host byte counts.
    pub fn create_translation_for(&mut self, pc: GuestAddr) -> Result<(), SchedError> {
        let window = self.code.read_code(pc, dynamo_decoder::MAX_GBB_BYTES + 32);
        let decoded = dynamo_decoder::decode_block(pc, &window)?;
        if decoded.orig_size == 0 || decoded.orig_size > 0xFFFF {
            return Err(SchedError::BlockTooLarge { what: "orig_size" });
        }
        let compiled = compile_block(&decoded.ucode)?;
        if compiled.code.is_empty() || compiled.code.len() > 0xFFFF {
            return Err(SchedError::BlockTooLarge { what: "host_size" });
        }
        let host_len = compiled.code.len();
        self.trace_cache
            .insert(pc, &compiled.code, decoded.orig_size, compiled.patch_sites)?;
        debug!(pc, orig = decoded.orig_size, host_len, "translation created");
        Ok(())
    }

    /// Patches every chainable exit from `from_pc` that targets `to_pc` to
    /// jump straight into `to_pc`'s compiled code. A no-op if either block
    /// hasn't been translated yet.
    pub fn chain(&mut self, from_pc: GuestAddr, to_pc: GuestAddr) {
        self.trace_cache.chain(from_pc, to_pc, |patch_host_addr, target_host_addr| {
            encode_chain_jmp(patch_host_addr as *const u8, target_host_addr)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamo_cpu_core::GuestMemory;

    #[test]
    fn deadlock_is_reported_when_no_thread_can_make_progress() {
        let mut sched = Scheduler::new(GuestMemory::new()).expect("scheduler");
        let tid = sched.threads_mut().alloc().unwrap();
        sched.threads_mut().get_mut(tid).status = ThreadStatus::WaitMx;
        sched.threads_mut().get_mut(tid).associated_mx = 0x4000;
        assert!(matches!(sched.run_one_turn(), Err(SchedError::Deadlock)));
    }

    #[test]
    fn idle_is_reported_when_only_externally_progressing_waits_remain() {
        let mut sched = Scheduler::new(GuestMemory::new()).expect("scheduler");
        let tid = sched.threads_mut().alloc().unwrap();
        sched.threads_mut().get_mut(tid).status = ThreadStatus::Sleeping;
        sched.threads_mut().get_mut(tid).awaken_at = 10_000_000;
        assert_eq!(sched.run_one_turn().unwrap(), TurnOutcome::Idle);
    }

    #[test]
    fn need_resched_caps_the_quantum_and_records_a_preference() {
        let mut sched = Scheduler::new(GuestMemory::new()).expect("scheduler");
        let a = sched.threads_mut().alloc().unwrap();
        sched.need_resched(Some(a));
        assert_eq!(sched.quantum, 2);
        assert_eq!(sched.prefer, Some(a));
    }
}
