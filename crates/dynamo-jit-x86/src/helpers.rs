//! Host-side implementations of the `CCall` helper table. Compiled code never inlines these operations; it
//! loads the helper's address and makes an indirect call.
//!
//! Calling convention: arguments and results pass through `BaseBlock`
//! fields directly (the helper receives a pointer to the live register
//! file), so no argument marshalling happens in generated code beyond
//! staging inputs into the fields each helper documents.

use dynamo_cpu_core::BaseBlock;
use dynamo_ucode::HelperId;

pub type HelperFn = extern "C" fn(*mut BaseBlock);

/// `%eax:%edx` / `%ecx` staging convention: dividend in `edx:eax`, divisor
/// in `ecx`; quotient back in `eax`, remainder in `edx`.
extern "C" fn helper_div_u32(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    if bb.ecx == 0 {
        // Division by zero is a guest-visible #DE; the caller checks for
        // this by re-reading `owner` after the call and routing to the
        // fault path rather than trusting the (unchanged) quotient.
        return;
    }
    let dividend = ((bb.edx as u64) << 32) | bb.eax as u64;
    bb.eax = (dividend / bb.ecx as u64) as u32;
    bb.edx = (dividend % bb.ecx as u64) as u32;
}

extern "C" fn helper_div_s32(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let divisor = bb.ecx as i32;
    if divisor == 0 {
        return;
    }
    let dividend = (((bb.edx as u64) << 32) | bb.eax as u64) as i64;
    bb.eax = (dividend / divisor as i64) as u32;
    bb.edx = (dividend % divisor as i64) as u32;
}

/// `mul`: `edx:eax = eax * ecx`.
extern "C" fn helper_mul_wide_u32(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let wide = bb.eax as u64 * bb.ecx as u64;
    bb.eax = wide as u32;
    bb.edx = (wide >> 32) as u32;
}

extern "C" fn helper_mul_wide_s32(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let wide = (bb.eax as i32 as i64) * (bb.ecx as i32 as i64);
    bb.eax = wide as u32;
    bb.edx = (wide >> 32) as u32;
}

extern "C" fn helper_cpuid(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    #[cfg(target_arch = "x86_64")]
    let result = unsafe { core::arch::x86_64::__cpuid_count(bb.eax, bb.ecx) };
    #[cfg(target_arch = "x86")]
    let result = unsafe { core::arch::x86::__cpuid_count(bb.eax, bb.ecx) };
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let result = core::arch::x86_64::CpuidResult {
        eax: 0,
        ebx: 0,
        ecx: 0,
        edx: 0,
    };
    bb.eax = result.eax;
    bb.ebx = result.ebx;
    bb.ecx = result.ecx;
    bb.edx = result.edx;
}

extern "C" fn helper_rdtsc(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    #[cfg(target_arch = "x86_64")]
    let tsc = unsafe { core::arch::x86_64::_rdtsc() };
    #[cfg(target_arch = "x86")]
    let tsc = unsafe { core::arch::x86::_rdtsc() };
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let tsc: u64 = 0;
    bb.eax = tsc as u32;
    bb.edx = (tsc >> 32) as u32;
}

/// `aaa`: ASCII-adjust `%al` after addition.
const CF_BIT: u32 = 1 << 0;
const AF_BIT: u32 = 1 << 4;

extern "C" fn helper_bcd_aaa(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let al = (bb.eax & 0xFF) as u8;
    let ah = ((bb.eax >> 8) & 0xFF) as u8;
    if (al & 0x0F) > 9 || (bb.eflags & AF_BIT) != 0 {
        let (al, ah) = (al.wrapping_add(6), ah.wrapping_add(1));
        bb.eax = (bb.eax & !0xFFFF) | ((ah as u32) << 8) | ((al & 0x0F) as u32);
        bb.eflags |= CF_BIT | AF_BIT;
    } else {
        bb.eax = (bb.eax & !0xFFFF) | ((ah as u32) << 8) | ((al & 0x0F) as u32);
        bb.eflags &= !(CF_BIT | AF_BIT);
    }
}

extern "C" fn helper_bcd_aas(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let al = (bb.eax & 0xFF) as u8;
    let ah = ((bb.eax >> 8) & 0xFF) as u8;
    if (al & 0x0F) > 9 || (bb.eflags & AF_BIT) != 0 {
        let (al, ah) = (al.wrapping_sub(6), ah.wrapping_sub(1));
        bb.eax = (bb.eax & !0xFFFF) | ((ah as u32) << 8) | ((al & 0x0F) as u32);
        bb.eflags |= CF_BIT | AF_BIT;
    } else {
        bb.eax = (bb.eax & !0xFFFF) | ((ah as u32) << 8) | ((al & 0x0F) as u32);
        bb.eflags &= !(CF_BIT | AF_BIT);
    }
}

/// `rep movsb`/`rep movsd`: copies `%ecx` elements from `[%esi]` to
/// `[%edi]`, honoring `%eflags.DF`. Runs against the process's own address space directly since
/// this helper only exists to serve guest code whose memory *is* host
/// memory in this design (flat 32-bit guest segment backed by
/// `dynamo-cpu-core::mem::GuestMemory`, threaded in by the caller through
/// `%esi`/`%edi` already translated to host pointers).
extern "C" fn helper_string_rep_movs(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let count = bb.ecx as usize;
    let step: i64 = if bb.eflags & 0x400 != 0 { -1 } else { 1 };
    let mut src = bb.esi as i64;
    let mut dst = bb.edi as i64;
    for _ in 0..count {
        unsafe {
            let byte = std::ptr::read(src as *const u8);
            std::ptr::write(dst as *mut u8, byte);
        }
        src += step;
        dst += step;
    }
    bb.esi = src as u32;
    bb.edi = dst as u32;
    bb.ecx = 0;
}

extern "C" fn helper_string_rep_stos(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    let count = bb.ecx as usize;
    let step: i64 = if bb.eflags & 0x400 != 0 { -1 } else { 1 };
    let mut dst = bb.edi as i64;
    let value = bb.eax as u8;
    for _ in 0..count {
        unsafe {
            std::ptr::write(dst as *mut u8, value);
        }
        dst += step;
    }
    bb.edi = dst as u32;
    bb.ecx = 0;
}

/// FPU/MMX/SSE state is opaque to UCode: the `fpu_sse` field is a raw
/// FXSAVE-format image, and this helper's only job is getting it in and out
/// of the host FPU around the verbatim opcode bytes codegen re-emits for
/// the `Opaque` uinstr.
extern "C" fn helper_fpu_state_get(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("fxsave [{0}]", in(reg) bb.fpu_sse.0.as_mut_ptr(), options(nostack));
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = bb;
}

extern "C" fn helper_fpu_state_put(bb: *mut BaseBlock) {
    let bb = unsafe { &mut *bb };
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("fxrstor [{0}]", in(reg) bb.fpu_sse.0.as_ptr(), options(nostack));
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = bb;
}

/// `%esp` assignment outside of push/pop/call/ret (e.g. `mov %esp, ...` or
/// prologue `lea`) goes through a helper so the scheduler can assert the
/// new value stays inside the thread's stack mapping before committing it
///.
extern "C" fn helper_esp_assignment(_bb: *mut BaseBlock) {}

extern "C" fn helper_undefined_instruction(_bb: *mut BaseBlock) {}

pub fn address_of(id: HelperId) -> usize {
    let f: HelperFn = match id {
        HelperId::DivU32 => helper_div_u32,
        HelperId::DivS32 => helper_div_s32,
        HelperId::MulWideU32 => helper_mul_wide_u32,
        HelperId::MulWideS32 => helper_mul_wide_s32,
        HelperId::Cpuid => helper_cpuid,
        HelperId::Rdtsc => helper_rdtsc,
        HelperId::BcdAaa => helper_bcd_aaa,
        HelperId::BcdAas => helper_bcd_aas,
        HelperId::StringRepMovs => helper_string_rep_movs,
        HelperId::StringRepStos => helper_string_rep_stos,
        HelperId::FpuStateGet => helper_fpu_state_get,
        HelperId::FpuStatePut => helper_fpu_state_put,
        HelperId::EspAssignment => helper_esp_assignment,
        HelperId::UndefinedInstruction => helper_undefined_instruction,
    };
    f as usize
}
