//! Executable memory and the native code cache

pub mod buffer;
pub mod cache;

pub use buffer::{CodeBuffer, ExecutableCode, PatchGuard, CODE_ALIGN};
pub use cache::{CodeCache, CodeEntry, EntryState};
