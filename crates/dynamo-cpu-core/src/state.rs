//! The base block: the simulated CPU's register file. JIT-generated code addresses these fields `%ebp`-relative, so the
//! layout is `#[repr(C)]` and its field offsets are a committed ABI shared
//! with `dynamo-jit-x86`'s codegen.

use dynamo_types::ThreadId;

/// Number of spill slots the register allocator can hand out in one gBB
/// translation.
pub const NUM_SPILL_SLOTS: usize = 64;

/// Core, always-present helper count — one base-block slot per
/// `dynamo_ucode::HelperId` variant, reseated at scheduler start-up.
pub const NUM_CORE_HELPERS: usize = 14;
/// Plugin-registered "compact" helper slots (short call-site encoding).
pub const MAX_COMPACT_HELPERS: usize = 8;
/// Plugin-registered "non-compact" helper slots.
pub const MAX_NONCOMPACT_HELPERS: usize = 50;

/// Opaque FXSAVE/FXRSTOR image. 16-byte aligned because `fxsave`/`fxrstor`
/// fault on a misaligned memory operand; wrapped in its own type so
/// `#[repr(C)]` field layout inserts the padding this needs ahead of it
/// without every other field having to care.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuSseImage(pub [u8; 512]);

impl Default for FpuSseImage {
    fn default() -> Self {
        FpuSseImage([0; 512])
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseBlock {
    // Hot: kept within the first 128 bytes so codegen can address these
    // with an 8-bit %ebp-relative displacement.
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub fs_base: u32,
    pub gs_base: u32,
    /// Owning thread, so a rescue-point handler or a helper can report which
    /// guest thread faulted without a side channel.
    pub owner: u32,

    // Per-thread, cold: segment/TLS plumbing and the plugin "skin"'s shadow
    // copies. Swapped along with the rest of the register file whenever a
    // thread is loaded or saved.
    /// Per-thread LDT, populated by `modify_ldt`/`set_thread_area`
    /// emulation; opaque to codegen, read back by segment-override address
    /// computation.
    pub ldt_ptr: u32,
    /// Per-thread TLS block pointer (the %gs-based TLS area on Linux/x86).
    pub tls_ptr: u32,
    /// Shadow copies of the integer registers and EFLAGS: written and read
    /// only at instrumentation call sites a tool has subscribed to via
    /// `HookSubscriptions`, never by ordinary guest code.
    pub eax_s: u32,
    pub ecx_s: u32,
    pub edx_s: u32,
    pub ebx_s: u32,
    pub esp_s: u32,
    pub ebp_s: u32,
    pub esi_s: u32,
    pub edi_s: u32,
    pub eflags_s: u32,

    pub spill: [u32; NUM_SPILL_SLOTS],

    /// The FPU/SSE state, moved verbatim around the UInstrs that bracket it
    /// with `fxsave`/`fxrstor`.
    pub fpu_sse: FpuSseImage,

    // Process-global: installed once (core helpers at scheduler start-up,
    // plugin helpers at tool registration) and never touched by
    // `save_state`/`load_state`/`poison_fill`, since they aren't part of
    // any one thread's architectural state.
    pub core_helpers: [u32; NUM_CORE_HELPERS],
    pub compact_helpers: [u32; MAX_COMPACT_HELPERS],
    pub noncompact_helpers: [u32; MAX_NONCOMPACT_HELPERS],
}

impl Default for BaseBlock {
    fn default() -> Self {
        BaseBlock {
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            eip: 0,
            eflags: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            fs_base: 0,
            gs_base: 0,
            owner: ThreadId::NONE.raw(),
            ldt_ptr: 0,
            tls_ptr: 0,
            eax_s: 0,
            ecx_s: 0,
            edx_s: 0,
            ebx_s: 0,
            esp_s: 0,
            ebp_s: 0,
            esi_s: 0,
            edi_s: 0,
            eflags_s: 0,
            spill: [0; NUM_SPILL_SLOTS],
            fpu_sse: FpuSseImage::default(),
            core_helpers: [0; NUM_CORE_HELPERS],
            compact_helpers: [0; MAX_COMPACT_HELPERS],
            noncompact_helpers: [0; MAX_NONCOMPACT_HELPERS],
        }
    }
}

impl BaseBlock {
    /// Fills every per-thread field with a recognizable non-zero pattern so
    /// tests can tell "never written" apart from "written to zero". Leaves
    /// the helper-address slots alone: those are process-global, not part
    /// of the thread state this is meant to catch stale reads of.
    pub fn poison_fill(&mut self) {
        let p = 0xdead_beef_u32;
        self.eax = p;
        self.ecx = p;
        self.edx = p;
        self.ebx = p;
        self.esp = p;
        self.ebp = p;
        self.esi = p;
        self.edi = p;
        self.eip = p;
        self.eflags = p;
        self.cs = p;
        self.ss = p;
        self.ds = p;
        self.es = p;
        self.fs = p;
        self.gs = p;
        self.fs_base = p;
        self.gs_base = p;
        self.ldt_ptr = p;
        self.tls_ptr = p;
        self.eax_s = p;
        self.ecx_s = p;
        self.edx_s = p;
        self.ebx_s = p;
        self.esp_s = p;
        self.ebp_s = p;
        self.esi_s = p;
        self.edi_s = p;
        self.eflags_s = p;
        for s in self.spill.iter_mut() {
            *s = p;
        }
        for b in self.fpu_sse.0.iter_mut() {
            *b = 0xef;
        }
    }

    /// Snapshot this base block's per-thread contents into `out`, leaving
    /// `out`'s own helper-address slots untouched.
    pub fn save_state(&self, out: &mut BaseBlock) {
        let core_helpers = out.core_helpers;
        let compact_helpers = out.compact_helpers;
        let noncompact_helpers = out.noncompact_helpers;
        *out = *self;
        out.core_helpers = core_helpers;
        out.compact_helpers = compact_helpers;
        out.noncompact_helpers = noncompact_helpers;
    }

    /// Loads `saved`'s per-thread contents, leaving this base block's own
    /// helper-address slots untouched: the helper table is reseated once at
    /// start-up, not swapped in and out with each thread.
    pub fn load_state(&mut self, saved: &BaseBlock) {
        let core_helpers = self.core_helpers;
        let compact_helpers = self.compact_helpers;
        let noncompact_helpers = self.noncompact_helpers;
        *self = *saved;
        self.core_helpers = core_helpers;
        self.compact_helpers = compact_helpers;
        self.noncompact_helpers = noncompact_helpers;
    }
}

/// Byte offsets of each field, computed once from the `#[repr(C)]` layout so
/// codegen and the scheduler never hand-copy a number that could silently
/// drift out of sync with a field reorder.
pub mod offsets {
    use super::BaseBlock;

    pub const EAX: usize = std::mem::offset_of!(BaseBlock, eax);
    pub const ECX: usize = std::mem::offset_of!(BaseBlock, ecx);
    pub const EDX: usize = std::mem::offset_of!(BaseBlock, edx);
    pub const EBX: usize = std::mem::offset_of!(BaseBlock, ebx);
    pub const ESP: usize = std::mem::offset_of!(BaseBlock, esp);
    pub const EBP: usize = std::mem::offset_of!(BaseBlock, ebp);
    pub const ESI: usize = std::mem::offset_of!(BaseBlock, esi);
    pub const EDI: usize = std::mem::offset_of!(BaseBlock, edi);
    pub const EIP: usize = std::mem::offset_of!(BaseBlock, eip);
    pub const EFLAGS: usize = std::mem::offset_of!(BaseBlock, eflags);
    pub const CS: usize = std::mem::offset_of!(BaseBlock, cs);
    pub const SS: usize = std::mem::offset_of!(BaseBlock, ss);
    pub const DS: usize = std::mem::offset_of!(BaseBlock, ds);
    pub const ES: usize = std::mem::offset_of!(BaseBlock, es);
    pub const FS: usize = std::mem::offset_of!(BaseBlock, fs);
    pub const GS: usize = std::mem::offset_of!(BaseBlock, gs);
    pub const FS_BASE: usize = std::mem::offset_of!(BaseBlock, fs_base);
    pub const GS_BASE: usize = std::mem::offset_of!(BaseBlock, gs_base);
    pub const OWNER: usize = std::mem::offset_of!(BaseBlock, owner);
    pub const LDT_PTR: usize = std::mem::offset_of!(BaseBlock, ldt_ptr);
    pub const TLS_PTR: usize = std::mem::offset_of!(BaseBlock, tls_ptr);
    pub const EAX_S: usize = std::mem::offset_of!(BaseBlock, eax_s);
    pub const ECX_S: usize = std::mem::offset_of!(BaseBlock, ecx_s);
    pub const EDX_S: usize = std::mem::offset_of!(BaseBlock, edx_s);
    pub const EBX_S: usize = std::mem::offset_of!(BaseBlock, ebx_s);
    pub const ESP_S: usize = std::mem::offset_of!(BaseBlock, esp_s);
    pub const EBP_S: usize = std::mem::offset_of!(BaseBlock, ebp_s);
    pub const ESI_S: usize = std::mem::offset_of!(BaseBlock, esi_s);
    pub const EDI_S: usize = std::mem::offset_of!(BaseBlock, edi_s);
    pub const EFLAGS_S: usize = std::mem::offset_of!(BaseBlock, eflags_s);
    pub const SPILL: usize = std::mem::offset_of!(BaseBlock, spill);
    pub const FPU_SSE: usize = std::mem::offset_of!(BaseBlock, fpu_sse);
    pub const CORE_HELPERS: usize = std::mem::offset_of!(BaseBlock, core_helpers);
    pub const COMPACT_HELPERS: usize = std::mem::offset_of!(BaseBlock, compact_helpers);
    pub const NONCOMPACT_HELPERS: usize = std::mem::offset_of!(BaseBlock, noncompact_helpers);

    /// Byte offset of spill slot `n`.
    pub const fn spill_slot(n: usize) -> usize {
        SPILL + n * std::mem::size_of::<u32>()
    }

    /// Byte offset of core helper `id`'s slot.
    pub const fn core_helper_slot(id: usize) -> usize {
        CORE_HELPERS + id * std::mem::size_of::<u32>()
    }

    /// Byte offset of compact plugin-helper slot `n`.
    pub const fn compact_helper_slot(n: usize) -> usize {
        COMPACT_HELPERS + n * std::mem::size_of::<u32>()
    }

    /// Byte offset of non-compact plugin-helper slot `n`.
    pub const fn noncompact_helper_slot(n: usize) -> usize {
        NONCOMPACT_HELPERS + n * std::mem::size_of::<u32>()
    }

    /// Shadow-register offset for the same architectural register `off`
    /// (one of the integer-GPR or EFLAGS offsets above) addresses live at.
    pub const fn shadow_of(primary_off: usize) -> usize {
        match primary_off {
            EAX => EAX_S,
            ECX => ECX_S,
            EDX => EDX_S,
            EBX => EBX_S,
            ESP => ESP_S,
            EBP => EBP_S,
            ESI => ESI_S,
            EDI => EDI_S,
            EFLAGS => EFLAGS_S,
            _ => panic!("no shadow slot for this offset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zeroed_except_owner_sentinel() {
        let bb = BaseBlock::default();
        assert_eq!(bb.eax, 0);
        assert_eq!(bb.owner, ThreadId::NONE.raw());
    }

    #[test]
    fn poison_fill_touches_every_architectural_field_but_not_helper_slots() {
        let mut bb = BaseBlock::default();
        bb.core_helpers[0] = 0x1234;
        bb.poison_fill();
        assert_ne!(bb.eax, 0);
        assert_ne!(bb.ldt_ptr, 0);
        assert_ne!(bb.eax_s, 0);
        assert!(bb.spill.iter().all(|&s| s != 0));
        assert!(bb.fpu_sse.0.iter().all(|&b| b != 0));
        assert_eq!(bb.core_helpers[0], 0x1234);
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut live = BaseBlock::default();
        live.eax = 42;
        live.spill[3] = 7;
        live.eax_s = 99;
        let mut saved = BaseBlock::default();
        live.save_state(&mut saved);

        let mut other = BaseBlock::default();
        other.load_state(&saved);
        assert_eq!(other.eax, 42);
        assert_eq!(other.spill[3], 7);
        assert_eq!(other.eax_s, 99);
    }

    #[test]
    fn load_state_never_clobbers_the_live_helper_table() {
        let mut live = BaseBlock::default();
        live.compact_helpers[0] = 0xcafe;
        let saved = BaseBlock::default();
        live.load_state(&saved);
        assert_eq!(live.compact_helpers[0], 0xcafe);
    }

    #[test]
    fn spill_slots_are_contiguous_and_in_order() {
        for n in 1..NUM_SPILL_SLOTS {
            assert_eq!(
                offsets::spill_slot(n),
                offsets::spill_slot(n - 1) + std::mem::size_of::<u32>()
            );
        }
    }

    #[test]
    fn hot_register_fields_stay_within_the_first_128_bytes() {
        assert!(offsets::OWNER < 128);
    }

    #[test]
    fn fpu_sse_image_is_sixteen_byte_aligned() {
        assert_eq!(offsets::FPU_SSE % 16, 0);
    }
}
