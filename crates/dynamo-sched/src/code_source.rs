//! Where `create_translation_for` gets the guest bytes it decodes.
//!
//! Two implementations exist because "guest memory" means different things
//! depending on what's driving the scheduler: a test harness keeps its guest
//! state in a `GuestMemory` sandbox, while a real x86-32 host runs this
//! framework against its own address space — the guest program's memory
//! *is* the host process's memory, so reading guest code is just reading
//! host bytes.

use dynamo_cpu_core::{GuestMemory, HostIdentityMemory};
use dynamo_types::GuestAddr;

pub trait GuestCodeSource {
    /// Reads up to `max_len` contiguous bytes starting at `pc`. Short reads
    /// (e.g. near the end of a mapped region) are the caller's problem to
    /// detect via the decoder's own bounds — this trait never fails.
    fn read_code(&mut self, pc: GuestAddr, max_len: usize) -> Vec<u8>;
}

impl GuestCodeSource for GuestMemory {
    fn read_code(&mut self, pc: GuestAddr, max_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max_len];
        self.read_bytes(pc, &mut buf);
        buf
    }
}

/// Same-architecture identity mapping: the guest linear address `pc` is
/// read directly as a host pointer. Sound only when this process *is* the
/// guest process's address space (the production deployment this framework
/// targets), never in a cross-process or cross-architecture harness.
impl GuestCodeSource for HostIdentityMemory {
    fn read_code(&mut self, pc: GuestAddr, max_len: usize) -> Vec<u8> {
        // SAFETY: caller guarantees `pc` is a live address in this
        // process's own mapped memory, per this type's whole premise.
        unsafe { std::slice::from_raw_parts(pc as *const u8, max_len) }.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_memory_source_reads_back_what_was_written() {
        let mut mem = GuestMemory::new();
        mem.write_bytes(0x1000, &[0xC3, 0x90, 0x90]);
        let bytes = mem.read_code(0x1000, 3);
        assert_eq!(bytes, vec![0xC3, 0x90, 0x90]);
    }

    #[test]
    #[cfg(target_pointer_width = "32")]
    fn host_identity_source_reads_real_process_memory() {
        let buf = [0x11u8, 0x22, 0x33, 0x44];
        let mut src = HostIdentityMemory;
        let read = src.read_code(buf.as_ptr() as GuestAddr, buf.len());
        assert_eq!(read, vec![0x11, 0x22, 0x33, 0x44]);
    }
}
