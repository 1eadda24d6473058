//! Maps UCode's architectural-register tags to `BaseBlock` field offsets
//!. This is the single point where
//! codegen's idea of the register file's shape meets `dynamo-cpu-core`'s —
//! every `mov [%ebp+disp], ...` codegen emits goes through here.

use dynamo_cpu_core::state::offsets;
use dynamo_ucode::ArchReg;

pub fn offset_of(reg: ArchReg) -> i32 {
    (match reg {
        ArchReg::Eax => offsets::EAX,
        ArchReg::Ecx => offsets::ECX,
        ArchReg::Edx => offsets::EDX,
        ArchReg::Ebx => offsets::EBX,
        ArchReg::Esp => offsets::ESP,
        ArchReg::Ebp => offsets::EBP,
        ArchReg::Esi => offsets::ESI,
        ArchReg::Edi => offsets::EDI,
        ArchReg::Eip => offsets::EIP,
        ArchReg::Eflags => offsets::EFLAGS,
        ArchReg::Cs => offsets::CS,
        ArchReg::Ss => offsets::SS,
        ArchReg::Ds => offsets::DS,
        ArchReg::Es => offsets::ES,
        ArchReg::Fs => offsets::FS,
        ArchReg::Gs => offsets::GS,
    }) as i32
}

/// The shadow-register offset `ArchRegS(reg)` addresses, as distinct from
/// `ArchReg(reg)`'s own offset.
pub fn shadow_offset_of(reg: ArchReg) -> i32 {
    offsets::shadow_of(offset_of(reg) as usize) as i32
}

pub fn spill_offset(slot: u16) -> i32 {
    offsets::spill_slot(slot as usize) as i32
}

/// Offset of core helper `id`'s call-site slot, reseated at scheduler
/// start-up from `dynamo-jit-x86`'s own fixed helper table.
pub fn core_helper_offset(id: dynamo_ucode::HelperId) -> i32 {
    offsets::core_helper_slot(id as usize) as i32
}

pub const EIP_OFFSET: i32 = offsets::EIP as i32;
pub const EFLAGS_OFFSET: i32 = offsets::EFLAGS as i32;
