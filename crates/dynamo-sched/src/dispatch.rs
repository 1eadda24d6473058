//! The raw entry point into compiled host code.
//!
//! Generated basic blocks expect `%ebp` to hold a live `BaseBlock*` for
//! their whole duration and leave the block's exit value in `%eax` before
//! their final `ret`. Neither survives a plain `extern "C"` call — `%ebp` is
//! callee-saved under cdecl, and a normal call gives no way to read back a
//! value the callee left in a register other than `%eax`/`%edx` — so entry
//! goes through a short hand-written trampoline instead of a function
//! pointer call. The allocatable register set (`%ebx`/`%esi`/`%edi`
//! included) is never restored by generated code, so the trampoline must
//! treat all of them as clobbered, not callee-saved, across the call.

use dynamo_cpu_core::BaseBlock;

/// Calls into one compiled host basic block with `bb` loaded into `%ebp`,
/// and returns the `dynamo_jit_x86::ExitTag` the block left in `%eax`,
/// encoded as a raw `u32`. The guest PC it is exiting to is not in the
/// return value — it was already written into `bb.eip` by the block itself,
/// since `%eax` is reserved for signalling *why* control came back.
///
/// # Safety
/// `entry` must point at the start of a basic block produced by
/// `dynamo_jit_x86::compile_block` and installed in an executable page, and
/// `bb` must be a valid, exclusively-owned `BaseBlock`. The call only makes
/// sense on an x86-32 host, since the generated bytes are 32-bit machine
/// code addressed through a 32-bit `%ebp`.
#[cfg(target_arch = "x86")]
pub unsafe fn run_compiled(entry: *const u8, bb: *mut BaseBlock) -> u32 {
    let exit_eax: u32;
    std::arch::asm!(
        "push ebp",
        "mov ebp, {bb}",
        "call {entry}",
        "pop ebp",
        bb = in(reg) bb,
        entry = in(reg) entry,
        out("eax") exit_eax,
        out("ecx") _,
        out("edx") _,
        out("ebx") _,
        out("esi") _,
        out("edi") _,
    );
    exit_eax
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn run_compiled(_entry: *const u8, _bb: *mut BaseBlock) -> u32 {
    unimplemented!("compiled host blocks only run on an x86-32 host; this build can translate and inspect them but not execute them")
}
