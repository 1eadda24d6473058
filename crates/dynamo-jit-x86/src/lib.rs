//! x86-32 host code generator. Turns one
//! register-allocated `UCodeBlock` into raw host machine code operating
//! directly on a `dynamo_cpu_core::BaseBlock` through `%ebp`.

pub mod abi;
pub mod codegen;
mod emit;
pub mod exit;
pub mod helpers;

pub use codegen::{compile_block, CodegenError, CompiledHostBlock};
pub use emit::encode_chain_jmp;
pub use exit::ExitTag;
