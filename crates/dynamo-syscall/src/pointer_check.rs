//! Addressability checks for syscall pointer arguments. Every `int $0x80`
//! that takes a string, buffer, or `iovec` array goes through here before
//! (`pre_syscall`) and after (`post_syscall`) the real kernel call, so a
//! guest that passes a wild pointer gets a memory-error event instead of
//! actually faulting the host process.

use dynamo_cpu_core::{GuestBus, GuestMemory, HostIdentityMemory};
use dynamo_types::GuestAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("syscall pointer argument 0x{addr:08x} (len {len}) is not mapped")]
pub struct UnmappedPointer {
    pub addr: GuestAddr,
    pub len: u32,
}

/// Whether a range of guest addresses is backed by real memory. Implemented
/// separately for the sandboxed test harness and for a genuine x86-32 host
/// process, where "mapped" means the host kernel itself has a page there.
pub trait AddressSpace {
    fn is_mapped(&self, addr: GuestAddr, len: u32) -> bool;
}

impl AddressSpace for GuestMemory {
    fn is_mapped(&self, addr: GuestAddr, len: u32) -> bool {
        len == 0 || self.touches_mapped_page(addr, len)
    }
}

impl AddressSpace for HostIdentityMemory {
    fn is_mapped(&self, addr: GuestAddr, len: u32) -> bool {
        if len == 0 {
            return true;
        }
        mincore_is_mapped(addr, len)
    }
}

/// Queries the host kernel's own page tables via `mincore(2)`: the only way
/// to ask "is this address backed" without risking a SIGSEGV from actually
/// touching it.
fn mincore_is_mapped(addr: GuestAddr, len: u32) -> bool {
    const PAGE_SIZE: u32 = 4096;
    let page_start = addr & !(PAGE_SIZE - 1);
    let span = (addr - page_start) + len;
    let n_pages = (span as usize).div_ceil(PAGE_SIZE as usize);
    let mut vec = vec![0u8; n_pages];
    let ret = unsafe {
        libc::mincore(
            page_start as *mut libc::c_void,
            n_pages * PAGE_SIZE as usize,
            vec.as_mut_ptr(),
        )
    };
    ret == 0
}

/// Validates a flat buffer argument (`read`/`write`-style).
pub fn validate_buffer(space: &impl AddressSpace, addr: GuestAddr, len: u32) -> Result<(), UnmappedPointer> {
    if space.is_mapped(addr, len) {
        Ok(())
    } else {
        Err(UnmappedPointer { addr, len })
    }
}

/// Validates a NUL-terminated string argument (`open`/`stat`-style) without
/// knowing its length up front: walks page by page, checking mappedness
/// before the caller is allowed to actually read each page's bytes.
pub fn validate_cstr_pages(
    space: &impl AddressSpace,
    addr: GuestAddr,
    max_len: u32,
) -> Result<(), UnmappedPointer> {
    const PAGE_SIZE: u32 = 4096;
    let mut checked = addr & !(PAGE_SIZE - 1);
    let end = addr.saturating_add(max_len);
    while checked < end {
        if !space.is_mapped(checked, 1) {
            return Err(UnmappedPointer { addr: checked, len: 1 });
        }
        checked = checked.saturating_add(PAGE_SIZE);
    }
    Ok(())
}

/// Validates an `iovec` array: the array itself, then every buffer it
/// points to. `B` is both the readable bus (to walk the array) and the
/// address space being checked, since on a real host they're the same
/// process memory.
pub fn validate_iovec<B: GuestBus + AddressSpace>(bus: &mut B, iov_addr: GuestAddr, iovcnt: u32) -> Result<(), UnmappedPointer> {
    validate_buffer(bus, iov_addr, iovcnt * 8)?;
    for i in 0..iovcnt {
        let entry = iov_addr + i * 8;
        let base = bus.read_u32(entry);
        let len = bus.read_u32(entry + 4);
        validate_buffer(bus, base, len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an_untouched_address_is_reported_unmapped_in_the_sandbox() {
        let mem = GuestMemory::new();
        assert_eq!(
            validate_buffer(&mem, 0x8000, 16),
            Err(UnmappedPointer { addr: 0x8000, len: 16 })
        );
    }

    #[test]
    fn a_touched_address_validates_in_the_sandbox() {
        let mut mem = GuestMemory::new();
        mem.write_u32(0x8000, 0);
        assert_eq!(validate_buffer(&mem, 0x8000, 16), Ok(()));
    }

    #[test]
    fn zero_length_buffers_are_always_valid() {
        let mem = GuestMemory::new();
        assert_eq!(validate_buffer(&mem, 0, 0), Ok(()));
    }

    #[test]
    fn iovec_validation_rejects_an_unmapped_entry_buffer() {
        let mut mem = GuestMemory::new();
        // iovec array itself is mapped, but the buffer it names is not.
        mem.write_u32(0x9000, 0x8000);
        mem.write_u32(0x9004, 4);
        let result = validate_iovec(&mut mem, 0x9000, 1);
        assert!(result.is_err());
    }

    #[test]
    fn iovec_validation_accepts_a_fully_mapped_array() {
        let mut mem = GuestMemory::new();
        mem.write_u32(0x9000, 0x8000);
        mem.write_u32(0x9004, 4);
        mem.write_u32(0x8000, 0);
        assert_eq!(validate_iovec(&mut mem, 0x9000, 1), Ok(()));
    }
}
