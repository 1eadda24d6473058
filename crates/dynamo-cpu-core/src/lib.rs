//! Simulated-CPU register file, guest memory bus, translation cache, and the
//! synchronous-fault rescue point.

pub mod mem;
pub mod rescue;
pub mod state;
pub mod time;
pub mod trace_cache;

pub use mem::{GuestBus, GuestMemory, HostIdentityMemory};
pub use state::BaseBlock;
pub use trace_cache::{CompiledBlock, PatchSite, TraceCache, TraceCacheError};
