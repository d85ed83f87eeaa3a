//! Aero JS engine core
//!
//! The execution half of the engine: a bytecode interpreter with an
//! explicit frame stack, an execution profiler, and a tiered JIT pipeline
//! (SSA IR, optimization passes, linear-scan register allocation, per-ISA
//! code generation, inline caches, deoptimization with on-stack
//! replacement, and a background compile-worker pool). Values, objects
//! and the garbage-collected heap live in `aero-core`.
//!
//! Embedders start at [`Engine`]; front ends hand it bytecode modules
//! built with [`bytecode::BytecodeBuilder`] or plug a parser in through
//! [`SourceCompiler`].

pub mod bytecode;
pub mod context;
pub mod engine;
pub mod error;
pub mod functions;
pub mod interpreter;
pub mod jit;
pub mod profiler;

pub use engine::{Engine, EngineConfig, EngineStats, SourceCompiler};
pub use error::EngineError;
pub use functions::{FunctionTable, NativeFunction, Tier};
pub use interpreter::Vm;
pub use profiler::Profiler;

pub use aero_core::{ErrorKind, JsError, Value};
