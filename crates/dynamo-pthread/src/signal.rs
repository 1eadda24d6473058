//! `SIGMASK`/`KILL` client requests. Actual signal delivery — picking a
//! handler frame and redirecting guest execution — is the signal layer's
//! job; this module only maintains the per-thread mask and records a
//! pending-kill target for that layer to act on.

use dynamo_sched::ThreadTable;
use dynamo_types::ThreadId;

/// Mirrors the three `how` values `sigprocmask`/`pthread_sigmask` accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

/// `SIGMASK(how, new)`. Returns the mask that was in effect before the
/// change, matching `pthread_sigmask`'s `oldset` output parameter.
pub fn sigmask(threads: &mut ThreadTable, tid: ThreadId, how: MaskHow, new: u64) -> u64 {
    let record = threads.get_mut(tid);
    let old = record.sigmask;
    record.sigmask = match how {
        MaskHow::Block => old | new,
        MaskHow::Unblock => old & !new,
        MaskHow::SetMask => new,
    };
    old
}

/// `KILL(tid, sig)`. Queues `sig` for asynchronous delivery to `tid`
/// through the signal layer, unless it is currently masked, in which case
/// it is recorded as pending and re-checked the next time the mask
/// changes. This module just reports whether `sig` would be masked right
/// now — the caller owns the actual pending-signal set.
pub fn is_masked(threads: &ThreadTable, tid: ThreadId, sig: u32) -> bool {
    let bit = 1u64 << (sig as u64 % 64);
    threads.get(tid).sigmask & bit != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_adds_bits_to_the_mask() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        sigmask(&mut threads, tid, MaskHow::Block, 0b0001);
        sigmask(&mut threads, tid, MaskHow::Block, 0b0010);
        assert_eq!(threads.get(tid).sigmask, 0b0011);
    }

    #[test]
    fn unblock_clears_only_the_given_bits() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        sigmask(&mut threads, tid, MaskHow::SetMask, 0b0111);
        sigmask(&mut threads, tid, MaskHow::Unblock, 0b0010);
        assert_eq!(threads.get(tid).sigmask, 0b0101);
    }

    #[test]
    fn setmask_replaces_the_mask_outright() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        sigmask(&mut threads, tid, MaskHow::Block, 0xff);
        let old = sigmask(&mut threads, tid, MaskHow::SetMask, 0x1);
        assert_eq!(old, 0xff);
        assert_eq!(threads.get(tid).sigmask, 0x1);
    }

    #[test]
    fn masked_signal_is_reported_as_masked() {
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        sigmask(&mut threads, tid, MaskHow::Block, 1 << 2);
        assert!(is_masked(&threads, tid, 2));
        assert!(!is_masked(&threads, tid, 3));
    }
}
