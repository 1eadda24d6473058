//! What a compiled block leaves in `%eax` right before its final `ret`.
//!
//! The new guest PC is always written to `BaseBlock.eip` before the `ret`;
//! `%eax` separately tells the dispatcher *why* it got control back, since a
//! literal function-call return value is the only channel a trampoline call
//! can read back out of generated code. A chained (patched) exit never
//! produces this value at all — it jumps straight into the next block's
//! code — so this tag only matters for the still-unchained or
//! can't-ever-chain cases.
use dynamo_ucode::JumpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitTag {
    /// Ordinary control flow continuing into another translated block; also
    /// used for `Call`/`Return` jump kinds, which need no special dispatcher
    /// handling beyond the usual translation-cache lookup.
    Continue = 0,
    Syscall = 1,
    ClientReq = 2,
    Yield = 3,
}

pub fn tag_for(kind: JumpKind) -> ExitTag {
    match kind {
        JumpKind::Boring | JumpKind::Call | JumpKind::Return => ExitTag::Continue,
        JumpKind::Syscall => ExitTag::Syscall,
        JumpKind::ClientReq => ExitTag::ClientReq,
        JumpKind::Yield => ExitTag::Yield,
    }
}

/// Whether a literal-target jump of this kind is safe to chain (patch in
/// place to jump directly into the target block, bypassing the dispatcher
/// entirely). Only `Continue`-tagged exits qualify — a syscall or
/// client-request jump must always come back through the dispatcher so it
/// can actually service the request.
pub fn is_chainable(kind: JumpKind) -> bool {
    tag_for(kind) == ExitTag::Continue
}
