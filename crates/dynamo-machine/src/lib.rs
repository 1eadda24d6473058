//! Wires the scheduler, the pthread engine, and the syscall/signal boundary
//! into one runnable machine, and gives an embedder (a tool, a test
//! harness, a thin binary front-end) the seam to observe and extend it.

pub mod config;
pub mod helper_table;
pub mod machine;
pub mod plugin;
pub mod tracing_init;

pub use config::{Config, TraceCodegenMask};
pub use helper_table::{HelperSlot, HelperTable, HelperTableError};
pub use machine::{Machine, StepOutcome};
pub use plugin::{HookSubscriptions, NullTool, Tool, ToolEvent};
pub use tracing_init::init_tracing;
