//! The C-ABI context passed to compiled code
//!
//! Compiled functions receive `(locals: *mut u64, ctx: *mut JitContext)`
//! and return a NaN-boxed value. Everything else — helper entry points,
//! trap reporting, the safepoint flag, the shape-id side table for inline
//! caches — lives behind the context pointer, which the generated code
//! keeps pinned in a callee-saved register.

use aero_core::Value;

/// Signature of a compiled function's entry point
pub type NativeEntryFn = unsafe extern "C" fn(locals: *mut u64, ctx: *mut JitContext) -> u64;

/// Capacity of the deopt spill area. Deopt states larger than this are
/// rejected at compile time.
pub const DEOPT_SAVE_SLOTS: usize = 64;
/// Maximum argument count the native call path supports
pub const MAX_NATIVE_ARGS: usize = 16;

/// Trap codes written by exit stubs (0 = no trap)
pub mod trap {
    pub const NONE: u32 = 0;
    pub const TYPE_FEEDBACK: u32 = 1;
    pub const NUMERIC_OVERFLOW: u32 = 2;
    pub const BAILOUT_REQUESTED: u32 = 3;
    pub const DEBUGGER_ATTACHED: u32 = 4;
    pub const TYPE_CHECK_FAILED: u32 = 5;
}

/// Opaque bundle of engine pointers for the helper implementations.
/// Never dereferenced by generated code.
#[repr(C)]
pub struct VmRefs {
    pub heap: *mut (),
    pub ctx: *mut (),
    pub funcs: *const (),
    pub profiler: *const (),
    pub jit: *const (),
    /// The function record being executed (for const pools, atoms)
    pub record: *const (),
    /// Synthesized strings of the running code entry
    pub synth: *const (),
}

/// C-ABI function pointer table for runtime services
///
/// All value parameters and returns are NaN-boxed u64 bit patterns.
/// Fallible helpers set `JitContext::error` and return undefined.
#[repr(C)]
pub struct HelperTable {
    pub const_pool: unsafe extern "C" fn(*mut JitContext, u32) -> u64,
    pub binary_op: unsafe extern "C" fn(*mut JitContext, u32, u64, u64, u32) -> u64,
    pub compare_op: unsafe extern "C" fn(*mut JitContext, u32, u64, u64, u32) -> u64,
    pub neg: unsafe extern "C" fn(*mut JitContext, u64) -> u64,
    pub not: unsafe extern "C" fn(*mut JitContext, u64) -> u64,
    pub is_truthy: unsafe extern "C" fn(*mut JitContext, u64) -> u64,
    pub type_of: unsafe extern "C" fn(*mut JitContext, u64) -> u64,
    pub instance_of: unsafe extern "C" fn(*mut JitContext, u64, u64) -> u64,
    pub get_prop: unsafe extern "C" fn(*mut JitContext, u64, u32, u32) -> u64,
    pub get_slot: unsafe extern "C" fn(*mut JitContext, u32, u64) -> u64,
    pub set_prop: unsafe extern "C" fn(*mut JitContext, u64, u32, u64, u32) -> u64,
    pub get_elem: unsafe extern "C" fn(*mut JitContext, u64, u64) -> u64,
    pub set_elem: unsafe extern "C" fn(*mut JitContext, u64, u64, u64) -> u64,
    pub load_global: unsafe extern "C" fn(*mut JitContext, u32) -> u64,
    pub store_global: unsafe extern "C" fn(*mut JitContext, u32, u64) -> u64,
    /// Arguments are staged in `JitContext::call_args`
    pub call: unsafe extern "C" fn(*mut JitContext, u64, u64, u32) -> u64,
    pub new_object: unsafe extern "C" fn(*mut JitContext) -> u64,
    /// Elements are staged in `JitContext::call_args`
    pub new_array: unsafe extern "C" fn(*mut JitContext, u32) -> u64,
    pub make_function: unsafe extern "C" fn(*mut JitContext, u32) -> u64,
    /// Returns nonzero when execution must abort (limit exceeded)
    pub safepoint: unsafe extern "C" fn(*mut JitContext) -> u64,
}

/// Per-invocation context handed to compiled code
#[repr(C)]
pub struct JitContext {
    /// `this` binding of the running call
    pub this_value: u64,
    /// Trap code written by deopt stubs; 0 while running
    pub trap: u32,
    /// Index into the code entry's deopt points when trapped
    pub deopt_index: u32,
    /// Nonzero once a helper recorded an error in the engine context
    pub error: u32,
    /// Safepoint request flag polled at loop back edges
    pub interrupt: u32,
    /// Shape-id side table (parallel to heap cells) for IC fast paths.
    /// Refreshed by every helper that may allocate.
    pub shape_ids_ptr: *const u32,
    pub shape_ids_len: usize,
    /// Exit stubs park live values here for the deoptimizer
    pub deopt_save: [u64; DEOPT_SAVE_SLOTS],
    /// Outgoing arguments staged for `call` / `new_array`
    pub call_args: [u64; MAX_NATIVE_ARGS],
    pub helpers: HelperTable,
    pub vm: VmRefs,
}

impl JitContext {
    /// True when the pointed-to heap cell's shape can be read through the
    /// side table (bounds check for the slow paths that mirror the fast
    /// path logic in Rust)
    pub fn shape_of(&self, object_id: u32) -> Option<u32> {
        if (object_id as usize) < self.shape_ids_len {
            // Safety: ptr/len come from the heap's side table and are
            // refreshed after any allocation
            Some(unsafe { *self.shape_ids_ptr.add(object_id as usize) })
        } else {
            None
        }
    }

    pub fn take_trap(&mut self) -> u32 {
        std::mem::replace(&mut self.trap, trap::NONE)
    }
}

/// Convenience wrapper: read the boxed `this` as a `Value`
pub fn this_of(ctx: &JitContext) -> Value {
    Value::from_bits(ctx.this_value)
}
