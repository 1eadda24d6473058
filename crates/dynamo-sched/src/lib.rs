//! Cooperative M:N thread scheduler and dispatcher: the fixed-size thread
//! table, the sorted timeout queue, the raw trampoline into compiled host
//! code, and the main dispatch loop that ties them together.

pub mod code_source;
pub mod dispatch;
pub mod scheduler;
pub mod thread_table;
pub mod timeout;

pub use code_source::GuestCodeSource;
pub use dynamo_cpu_core::HostIdentityMemory;
pub use scheduler::{HostExit, SchedError, Scheduler, TurnOutcome};
pub use thread_table::{CancelKind, PendingCancel, ThreadRecord, ThreadStatus, ThreadTable};
pub use timeout::TimeoutQueue;
