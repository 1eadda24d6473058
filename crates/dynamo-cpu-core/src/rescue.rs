//! Synchronous-fault rescue point. Generated host code runs with a
//! `sigsetjmp` buffer live so a SIGSEGV/SIGBUS/SIGILL/SIGFPE taken inside it
//! unwinds back into the scheduler instead of killing the process.

use std::cell::Cell;
use std::os::raw::c_int;
use std::sync::Once;
use thiserror::Error;

// glibc's `sigjmp_buf` is larger than plain `jmp_buf` to also save the
// signal mask; 256 bytes comfortably covers every ABI we target.
#[repr(C, align(16))]
struct SigJmpBuf([u8; 256]);

extern "C" {
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp_raw(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub signal: c_int,
    pub fault_addr: usize,
}

#[derive(Debug, Error)]
pub enum RescueOutcome {
    #[error("synchronous fault (signal {signal}) at guest/host address {fault_addr:#x}")]
    Fault { signal: c_int, fault_addr: usize },
}

thread_local! {
    static RESCUE_BUF: Cell<*mut SigJmpBuf> = Cell::new(std::ptr::null_mut());
    static FAULT_INFO: Cell<Option<FaultInfo>> = Cell::new(None);
}

extern "C" fn handle_fault(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let fault_addr = unsafe { (*info).si_addr() as usize };
    FAULT_INFO.with(|f| f.set(Some(FaultInfo { signal: sig, fault_addr })));
    let buf = RESCUE_BUF.with(|b| b.get());
    if buf.is_null() {
        unsafe { libc::abort() }
    }
    unsafe { siglongjmp(buf, 1) }
}

static INSTALL_ONCE: Once = Once::new();

fn install_handlers() {
    INSTALL_ONCE.call_once(|| unsafe {
        for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE] {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fault as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    });
}

/// Runs `body` (normally: a call into a compiled host basic block) under a
/// rescue point. `Ok(())` means `body` returned normally; `Err` means a
/// synchronous fault unwound out of it first.
pub fn run_rescued<F: FnOnce()>(body: F) -> Result<(), RescueOutcome> {
    install_handlers();
    let mut buf = SigJmpBuf([0u8; 256]);
    let jumped = unsafe { sigsetjmp_raw(&mut buf, 1) };
    if jumped == 0 {
        RESCUE_BUF.with(|b| b.set(&mut buf as *mut SigJmpBuf));
        body();
        RESCUE_BUF.with(|b| b.set(std::ptr::null_mut()));
        Ok(())
    } else {
        RESCUE_BUF.with(|b| b.set(std::ptr::null_mut()));
        let info = FAULT_INFO
            .with(|f| f.take())
            .expect("fault info must be recorded before the handler longjmps");
        Err(RescueOutcome::Fault {
            signal: info.signal,
            fault_addr: info.fault_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_that_returns_normally_yields_ok() {
        let mut ran = false;
        let result = run_rescued(|| ran = true);
        assert!(result.is_ok());
        assert!(ran);
    }

    #[test]
    fn a_real_segfault_is_caught_and_reported() {
        let result = run_rescued(|| unsafe {
            let p = 0x1 as *mut u8;
            std::ptr::write_volatile(p, 0);
        });
        match result {
            Err(RescueOutcome::Fault { signal, .. }) => {
                assert_eq!(signal, libc::SIGSEGV);
            }
            Ok(()) => panic!("expected a fault"),
        }
    }
}
