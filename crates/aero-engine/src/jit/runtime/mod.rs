//! JIT runtime: tier probing, native invocation, inline-cache patching
//!
//! `JitRuntime` is the executor's window into the compilation world. At
//! function entry it answers "is there native code, and should more be
//! compiled?"; at loop back edges it answers the same for OSR entries; it
//! owns the inline-cache table and the code cache, and it drives a native
//! invocation end to end — building the locals buffer and jit context,
//! making the call, and translating a trap into reconstructed interpreter
//! frames.

pub mod context;
pub mod helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aero_core::{FunctionId, JsError, ShapeId, Value};

use crate::context::Context;
use crate::functions::{FunctionRecord, FunctionTable, Tier};
use crate::jit::backend::traits::{host_backend, Backend};
use crate::jit::code::{CodeCache, CodeEntry};
use crate::jit::deopt::{self, NativeOutcome};
use crate::jit::ic::{IcTable, IcTransition};
use crate::jit::runtime::context::{trap, JitContext, NativeEntryFn, VmRefs};
use crate::jit::tiering::{CompileJob, TieredDispatcher, WorkerContext};
use crate::profiler::Profiler;

/// Flags checked at interpreter safepoints
#[derive(Debug, Default)]
pub struct SafepointFlags {
    gc_requested: AtomicBool,
    interrupt: AtomicBool,
}

impl SafepointFlags {
    pub fn request_gc(&self) {
        self.gc_requested.store(true, Ordering::Release);
    }

    pub fn take_gc_request(&self) -> bool {
        self.gc_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }
}

/// Configuration slice the runtime needs
#[derive(Debug, Clone)]
pub struct JitOptions {
    pub enabled: bool,
    /// Executions before a baseline compile (the optimizing threshold is
    /// ten times this)
    pub threshold: u64,
    pub optimization_level: u8,
    pub compile_workers: usize,
    pub code_cache_bytes: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            enabled: true,
            threshold: crate::profiler::BASELINE_THRESHOLD,
            optimization_level: 2,
            compile_workers: default_worker_count(),
            code_cache_bytes: 16 << 20,
        }
    }
}

/// Half the machine, capped: compilation should never crowd out the
/// executor thread
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}

pub struct JitRuntime {
    enabled: bool,
    baseline_threshold: u64,
    optimizing_threshold: u64,
    pub cache: Arc<CodeCache>,
    ics: IcTable,
    backend: Arc<dyn Backend>,
    dispatcher: Option<TieredDispatcher>,
    safepoint: SafepointFlags,
    funcs: Arc<FunctionTable>,
    profiler: Arc<Profiler>,
}

impl JitRuntime {
    pub fn new(options: JitOptions, funcs: Arc<FunctionTable>, profiler: Arc<Profiler>) -> Self {
        let cache = Arc::new(CodeCache::new(options.code_cache_bytes));
        let backend: Arc<dyn Backend> = Arc::from(host_backend());
        let native_supported = cfg!(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")));
        let enabled = options.enabled && native_supported;
        let dispatcher = enabled.then(|| {
            TieredDispatcher::new(
                WorkerContext {
                    funcs: funcs.clone(),
                    profiler: profiler.clone(),
                    cache: cache.clone(),
                    backend: backend.clone(),
                    optimization_level: options.optimization_level,
                },
                options.compile_workers,
            )
        });
        JitRuntime {
            enabled,
            baseline_threshold: options.threshold.max(1),
            optimizing_threshold: options.threshold.max(1) * 10,
            cache,
            ics: IcTable::new(),
            backend,
            dispatcher,
            safepoint: SafepointFlags::default(),
            funcs,
            profiler,
        }
    }

    /// An inert runtime for interpreter-only configurations
    pub fn disabled(funcs: Arc<FunctionTable>, profiler: Arc<Profiler>) -> Self {
        Self::new(
            JitOptions {
                enabled: false,
                ..Default::default()
            },
            funcs,
            profiler,
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ics(&self) -> &IcTable {
        &self.ics
    }

    pub fn safepoint_flags(&self) -> &SafepointFlags {
        &self.safepoint
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // ===== Tier probing =====

    /// Called at every function entry: returns an installed entry to run,
    /// and enqueues promotions as thresholds are crossed.
    pub fn on_function_entry(
        &self,
        record: &Arc<FunctionRecord>,
        profiler: &Profiler,
    ) -> Option<Arc<CodeEntry>> {
        if !self.enabled {
            return None;
        }
        let count = profiler.execution_count(record.id);
        let polluted = record.polluted.load(Ordering::Acquire);

        // Promotion checks happen before execution so the entry installed
        // by a previous call is picked up opportunistically
        if !polluted && !record.is_compiling() {
            let tier = record.tier();
            if count >= self.optimizing_threshold
                && tier < Tier::Optimizing
                && profiler.is_function_type_stable(record.id)
            {
                self.enqueue(record, Tier::Optimizing, None);
            } else if count >= self.baseline_threshold && tier == Tier::Interpreter {
                self.enqueue(record, Tier::Baseline, None);
            }
        }

        let entry = record.native_entry()?;
        if entry.is_available() {
            Some(entry)
        } else {
            // Evicted behind our back: unlink and fall back
            record.invalidate();
            None
        }
    }

    /// Called at loop back edges with the loop-header offset: OSR probe
    pub fn on_backedge(
        &self,
        record: &Arc<FunctionRecord>,
        header_offset: u32,
        profiler: &Profiler,
    ) -> Option<Arc<CodeEntry>> {
        if !self.enabled {
            return None;
        }
        if let Some(entry) = record.osr_entry(header_offset) {
            if entry.is_available() {
                return Some(entry);
            }
        }
        let backedges = profiler.profile(record.id).backedge_count.load(Ordering::Relaxed);
        if backedges >= self.optimizing_threshold
            && !record.polluted.load(Ordering::Acquire)
            && !record.is_compiling()
            && profiler.is_function_type_stable(record.id)
        {
            self.enqueue(record, Tier::Optimizing, Some(header_offset));
        }
        None
    }

    fn enqueue(&self, record: &Arc<FunctionRecord>, tier: Tier, osr_offset: Option<u32>) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        if !record.try_claim_compile() {
            return;
        }
        let job = CompileJob {
            record: record.clone(),
            tier,
            generation: record.generation.load(Ordering::Acquire),
            osr_offset,
            profile: self.profiler.snapshot(record.id),
        };
        dispatcher.enqueue(job);
    }

    // ===== Inline-cache patching =====

    /// React to an IC transition: patch or disable the compiled fast path
    pub fn patch_ic_site(
        &self,
        function: FunctionId,
        site: u32,
        transition: IcTransition,
        shape: ShapeId,
        slot: u32,
    ) {
        if !self.enabled {
            return;
        }
        let Some(record) = self.funcs.record(function) else {
            return;
        };
        let Some(entry) = record.native_entry() else {
            return;
        };
        match transition {
            IcTransition::BecameMonomorphic => {
                self.cache.patch_ic(&entry, site, shape, slot);
            }
            IcTransition::BecameMegamorphic => {
                self.cache.unpatch_ic(&entry, site);
            }
            _ => {}
        }
    }

    // ===== Native invocation =====

    /// Run a compiled entry for a fresh call
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        entry: &Arc<CodeEntry>,
        heap: &mut aero_core::Heap,
        ctx: &mut Context,
        funcs: &FunctionTable,
        profiler: &Profiler,
        record: &Arc<FunctionRecord>,
        this: Value,
        args: &[Value],
    ) -> Result<NativeOutcome, JsError> {
        let want =
            record.bytecode.param_count as usize + record.bytecode.local_count as usize;
        let mut locals = vec![Value::undefined(); want];
        for (i, a) in args.iter().take(record.bytecode.param_count as usize).enumerate() {
            locals[i] = *a;
        }
        self.invoke(entry, heap, ctx, funcs, profiler, record, this, &mut locals)
    }

    /// Run an OSR entry against a live frame's locals
    #[allow(clippy::too_many_arguments)]
    pub fn execute_osr(
        &self,
        entry: &Arc<CodeEntry>,
        heap: &mut aero_core::Heap,
        ctx: &mut Context,
        funcs: &FunctionTable,
        profiler: &Profiler,
        record: &Arc<FunctionRecord>,
        this: Value,
        locals: &mut Vec<Value>,
    ) -> Result<NativeOutcome, JsError> {
        let want =
            record.bytecode.param_count as usize + record.bytecode.local_count as usize;
        locals.resize(want, Value::undefined());
        self.invoke(entry, heap, ctx, funcs, profiler, record, this, locals)
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        entry: &Arc<CodeEntry>,
        heap: &mut aero_core::Heap,
        ctx: &mut Context,
        funcs: &FunctionTable,
        profiler: &Profiler,
        record: &Arc<FunctionRecord>,
        this: Value,
        locals: &mut [Value],
    ) -> Result<NativeOutcome, JsError> {
        entry.record_execution();

        let (shape_ptr, shape_len) = heap.shape_ids_raw();
        // The execution limit needs periodic accounting: arm the interrupt
        // so back-edge polls call into the safepoint helper
        let interrupt = ctx.config.execution_limit.is_some()
            || self.safepoint.interrupted()
            || heap.should_collect();

        let mut jc = Box::new(JitContext {
            this_value: this.to_bits(),
            trap: trap::NONE,
            deopt_index: 0,
            error: 0,
            interrupt: interrupt as u32,
            shape_ids_ptr: shape_ptr,
            shape_ids_len: shape_len,
            deopt_save: [0; context::DEOPT_SAVE_SLOTS],
            call_args: [0; context::MAX_NATIVE_ARGS],
            helpers: helpers::helper_table(),
            vm: VmRefs {
                heap: heap as *mut aero_core::Heap as *mut (),
                ctx: ctx as *mut Context as *mut (),
                funcs: funcs as *const FunctionTable as *const (),
                profiler: profiler as *const Profiler as *const (),
                jit: self as *const JitRuntime as *const (),
                record: Arc::as_ptr(record) as *const (),
                synth: &entry.synth_strings as *const Vec<Box<str>> as *const (),
            },
        });

        let entry_fn: NativeEntryFn =
            unsafe { std::mem::transmute(entry.entry_address() as *const u8) };
        // Values are transparent over u64, so the locals slice doubles as
        // the native locals buffer
        let locals_ptr = locals.as_mut_ptr() as *mut u64;
        let ret = unsafe { entry_fn(locals_ptr, jc.as_mut() as *mut JitContext) };

        if jc.error != 0 {
            let pending = ctx
                .peek_error()
                .map(|p| p.error.clone())
                .unwrap_or_else(|| JsError::internal("native code reported an unknown error"));
            return Err(pending);
        }

        let trap_code = jc.take_trap();
        if trap_code != trap::NONE {
            let point = entry
                .deopt_point(jc.deopt_index)
                .ok_or_else(|| JsError::internal("trap with unknown deopt point"))?;
            let reason = point.reason;
            deopt::record_deopt(record, reason);
            let frames = deopt::reconstruct_frames(
                entry,
                jc.deopt_index,
                &jc.deopt_save,
                locals,
                this,
                funcs,
            )?;
            return Ok(NativeOutcome::Trap(frames));
        }

        Ok(NativeOutcome::Return(Value::from_bits(ret)))
    }
}
