//! Cross-checks `state::offsets` (built on stable `std::mem::offset_of!`)
//! against an independently-implemented offset macro, so a typo in one
//! can't silently ship as a wrong codegen ABI offset.

use dynamo_cpu_core::state::{offsets, BaseBlock};
use memoffset::offset_of;

#[test]
fn offsets_agree_with_memoffset() {
    assert_eq!(offsets::EAX, offset_of!(BaseBlock, eax));
    assert_eq!(offsets::ECX, offset_of!(BaseBlock, ecx));
    assert_eq!(offsets::EDX, offset_of!(BaseBlock, edx));
    assert_eq!(offsets::EBX, offset_of!(BaseBlock, ebx));
    assert_eq!(offsets::ESP, offset_of!(BaseBlock, esp));
    assert_eq!(offsets::EBP, offset_of!(BaseBlock, ebp));
    assert_eq!(offsets::ESI, offset_of!(BaseBlock, esi));
    assert_eq!(offsets::EDI, offset_of!(BaseBlock, edi));
    assert_eq!(offsets::EIP, offset_of!(BaseBlock, eip));
    assert_eq!(offsets::EFLAGS, offset_of!(BaseBlock, eflags));
    assert_eq!(offsets::SPILL, offset_of!(BaseBlock, spill));
    assert_eq!(offsets::OWNER, offset_of!(BaseBlock, owner));
}
