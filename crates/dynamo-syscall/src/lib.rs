//! The thin but critical syscall/signal boundary: pointer validation
//! around `int $0x80`, the proxy-LWP model for syscalls that can block,
//! and routing of synchronous guest faults into the guest's own handlers.

pub mod dispatch;
pub mod pointer_check;
pub mod proxy;
pub mod signal;

pub use dispatch::{is_blocking, post_syscall, pre_syscall};
pub use pointer_check::{AddressSpace, UnmappedPointer};
pub use proxy::{ProxyLwp, SyscallArgs, SyscallResult};
pub use signal::{FaultOutcome, HandlerTable, SyncFault};
