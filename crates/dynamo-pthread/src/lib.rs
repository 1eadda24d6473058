//! Guest-visible `pthread_*` semantics implemented entirely in terms of
//! client requests trapped out of compiled code: there is no real host
//! pthread underneath a guest thread. Mutex and condvar state lives in the
//! guest's own memory (read through a [`dynamo_cpu_core::GuestBus`]);
//! join/cancel/signal-mask state lives on the scheduler's thread table.

pub mod cancel;
pub mod condvar;
pub mod dispatch;
pub mod error;
pub mod join;
pub mod key;
pub mod mutex;
pub mod requests;
pub mod signal;

pub use dispatch::{Outcome, PthreadEngine};
pub use error::PthreadError;
pub use requests::{ClientRequest, RequestCode};
