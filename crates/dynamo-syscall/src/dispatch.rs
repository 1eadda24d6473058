//! `pre_syscall`/`post_syscall`: the wrapper every `int $0x80` passes
//! through, deciding whether the call needs a proxy LWP and validating
//! whatever pointer arguments it carries.

use crate::pointer_check::{self, AddressSpace, UnmappedPointer};
use crate::proxy::SyscallArgs;
use dynamo_cpu_core::GuestBus;
use dynamo_types::GuestAddr;

/// Whether this syscall can block the calling thread and therefore must be
/// handed to a proxy LWP rather than issued inline. Not exhaustive — an
/// unlisted syscall is assumed non-blocking, matching real `int $0x80`
/// wrappers that only special-case the syscalls actually known to block.
pub fn is_blocking(nr: i64) -> bool {
    matches!(
        nr,
        libc::SYS_read
            | libc::SYS_write
            | libc::SYS_readv
            | libc::SYS_writev
            | libc::SYS_recvfrom
            | libc::SYS_sendto
            | libc::SYS_accept
            | libc::SYS_accept4
            | libc::SYS_connect
            | libc::SYS_poll
            | libc::SYS_select
            | libc::SYS_wait4
            | libc::SYS_waitid
            | libc::SYS_nanosleep
            | libc::SYS_pause
            | libc::SYS_epoll_wait
            | libc::SYS_futex
    )
}

/// Validates every pointer-shaped argument of a syscall before it is
/// allowed to run, covering the subset of the ABI this framework actually
/// proxies or inlines. Syscalls outside this table pass through
/// unvalidated — their arguments are scalars only, as far as this
/// framework is concerned.
pub fn pre_syscall<B: GuestBus + AddressSpace>(bus: &mut B, call: SyscallArgs) -> Result<(), UnmappedPointer> {
    let a = call.args;
    match call.nr {
        n if n == libc::SYS_read || n == libc::SYS_recvfrom => {
            pointer_check::validate_buffer(bus, a[1] as GuestAddr, a[2] as u32)
        }
        n if n == libc::SYS_write || n == libc::SYS_sendto => {
            pointer_check::validate_buffer(bus, a[1] as GuestAddr, a[2] as u32)
        }
        n if n == libc::SYS_readv || n == libc::SYS_writev => {
            pointer_check::validate_iovec(bus, a[1] as GuestAddr, a[2] as u32)
        }
        n if n == libc::SYS_open => pointer_check::validate_cstr_pages(bus, a[0] as GuestAddr, 4096),
        n if n == libc::SYS_stat || n == libc::SYS_lstat => {
            pointer_check::validate_cstr_pages(bus, a[0] as GuestAddr, 4096)?;
            pointer_check::validate_buffer(bus, a[1] as GuestAddr, 144)
        }
        _ => Ok(()),
    }
}

/// Re-validates the portion of an output buffer the kernel actually wrote,
/// now that the real byte count (rather than the requested maximum) is
/// known. Only `read`-shaped calls need this: the kernel may write fewer
/// bytes than requested, but never more, so a buffer that validated
/// pre-call for its full requested length always validates post-call too
/// — this exists for symmetry with `pre_syscall` and to make the boundary
/// explicit rather than because it can currently reject anything `pre_syscall`
/// didn't already catch.
pub fn post_syscall<B: GuestBus + AddressSpace>(
    bus: &mut B,
    call: SyscallArgs,
    retval: i64,
) -> Result<(), UnmappedPointer> {
    if retval <= 0 {
        return Ok(());
    }
    match call.nr {
        n if n == libc::SYS_read || n == libc::SYS_recvfrom => {
            pointer_check::validate_buffer(bus, call.args[1] as GuestAddr, retval as u32)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamo_cpu_core::GuestMemory;

    #[test]
    fn read_and_write_are_classified_as_blocking() {
        assert!(is_blocking(libc::SYS_read));
        assert!(is_blocking(libc::SYS_write));
    }

    #[test]
    fn getpid_is_not_blocking() {
        assert!(!is_blocking(libc::SYS_getpid));
    }

    #[test]
    fn pre_syscall_rejects_a_read_into_an_unmapped_buffer() {
        let mut mem = GuestMemory::new();
        let call = SyscallArgs { nr: libc::SYS_read, args: [3, 0x8000, 16, 0, 0, 0] };
        assert!(pre_syscall(&mut mem, call).is_err());
    }

    #[test]
    fn pre_syscall_accepts_a_read_into_a_mapped_buffer() {
        let mut mem = GuestMemory::new();
        mem.write_u32(0x8000, 0);
        let call = SyscallArgs { nr: libc::SYS_read, args: [3, 0x8000, 16, 0, 0, 0] };
        assert_eq!(pre_syscall(&mut mem, call), Ok(()));
    }

    #[test]
    fn pre_syscall_ignores_syscalls_with_no_pointer_arguments() {
        let mut mem = GuestMemory::new();
        let call = SyscallArgs { nr: libc::SYS_getpid, args: [0; 6] };
        assert_eq!(pre_syscall(&mut mem, call), Ok(()));
    }

    #[test]
    fn post_syscall_on_a_zero_or_negative_return_is_a_no_op() {
        let mut mem = GuestMemory::new();
        let call = SyscallArgs { nr: libc::SYS_read, args: [3, 0x8000, 16, 0, 0, 0] };
        assert_eq!(post_syscall(&mut mem, call, -1), Ok(()));
    }
}
