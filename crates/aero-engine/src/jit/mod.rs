//! Tiered JIT compilation pipeline
//!
//! Bytecode and profile feedback go in one end; executable machine code
//! and the machinery to fall back out of it come out the other:
//! - Analysis (decode, CFG, dominators, loops) and SSA lifting
//! - Backend-agnostic optimization passes
//! - Linear-scan register allocation
//! - Per-ISA code generation behind the `Backend` trait
//! - Executable memory and the bounded code cache (W^X throughout)
//! - Inline caches with patchable fast paths
//! - The deoptimizer and on-stack replacement
//! - The tiered dispatcher with its background compile workers

pub mod analysis;
pub mod backend;
pub mod code;
pub mod deopt;
pub mod ic;
pub mod ir;
pub mod opt;
pub mod regalloc;
pub mod runtime;
pub mod tiering;

pub use deopt::{NativeOutcome, ResumeFrame};
pub use runtime::{JitOptions, JitRuntime, SafepointFlags};

/// Why a compile job could not produce code. Never fatal to the script:
/// the dispatcher discards the job and the function keeps its tier.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    /// The function uses a construct this pipeline does not lower
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An invariant broke inside the compiler
    #[error("internal compiler error: {0}")]
    Internal(String),
}
