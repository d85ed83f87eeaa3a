//! Tiered compilation dispatcher
//!
//! The JS thread never compiles and never blocks on compilation: when a
//! function crosses a hotness threshold it is claimed, snapshot, and
//! enqueued on a bounded channel; a pool of background workers builds the
//! IR, optimizes, allocates registers, emits machine code, and installs
//! the entry with a single release store. Jobs carry the function's
//! invalidation generation — a stale job is discarded on dequeue. An
//! internal compile failure discards the job with a warning and leaves
//! the function at its current tier; it is never fatal to the script.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::functions::{FunctionRecord, FunctionTable, Tier};
use crate::jit::backend::traits::Backend;
use crate::jit::code::CodeCache;
use crate::jit::ir::builder::build_ir;
use crate::jit::opt::{OptFlags, Optimizer, PassContext};
use crate::jit::regalloc::allocate;
use crate::jit::CompileError;
use crate::profiler::{Profiler, ProfileSnapshot};

/// Depth of the compile queue; excess requests are dropped (the function
/// stays hot and will be re-enqueued)
pub const QUEUE_DEPTH: usize = 64;

/// A unit of background compilation
pub struct CompileJob {
    pub record: Arc<FunctionRecord>,
    pub tier: Tier,
    /// Generation at enqueue time; mismatches are cancelled
    pub generation: u32,
    /// OSR compilation targets this loop-header offset
    pub osr_offset: Option<u32>,
    pub profile: ProfileSnapshot,
}

/// Shared inputs each worker owns a handle to
pub struct WorkerContext {
    pub funcs: Arc<FunctionTable>,
    pub profiler: Arc<Profiler>,
    pub cache: Arc<CodeCache>,
    pub backend: Arc<dyn Backend>,
    pub optimization_level: u8,
}

/// The dispatcher: owns the queue and the worker pool
pub struct TieredDispatcher {
    sender: Sender<CompileJob>,
    workers: Vec<JoinHandle<()>>,
}

impl TieredDispatcher {
    pub fn new(ctx: WorkerContext, worker_count: usize) -> Self {
        let (sender, receiver) = bounded::<CompileJob>(QUEUE_DEPTH);
        let shared = Arc::new(ctx);
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let rx: Receiver<CompileJob> = receiver.clone();
                let ctx = shared.clone();
                std::thread::Builder::new()
                    .name(format!("aero-compile-{i}"))
                    .spawn(move || worker_loop(rx, ctx))
                    .expect("failed to spawn compile worker")
            })
            .collect();
        TieredDispatcher { sender, workers }
    }

    /// Enqueue without blocking. The claim is released on a full queue so
    /// the function can retry at its next entry.
    pub fn enqueue(&self, job: CompileJob) {
        let record = job.record.clone();
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                job.record.release_compile_claim();
                tracing::debug!(function = record.id.0, "compile queue full, dropped job");
            }
            Err(TrySendError::Disconnected(job)) => {
                job.record.release_compile_claim();
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TieredDispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops
        let (closed, _) = bounded::<CompileJob>(0);
        self.sender = closed;
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_loop(rx: Receiver<CompileJob>, ctx: Arc<WorkerContext>) {
    while let Ok(job) = rx.recv() {
        let record = job.record.clone();
        // Stale generation: the function was invalidated after enqueue
        if record.generation.load(Ordering::Acquire) != job.generation {
            record.release_compile_claim();
            continue;
        }
        let result = compile_job(&job, &ctx);
        match result {
            Ok(()) => {}
            Err(e) => {
                // Internal compile failures are never fatal to the script:
                // the job is discarded and the function keeps its tier
                tracing::warn!(
                    function = record.id.0,
                    tier = ?job.tier,
                    error = %e,
                    "compile job discarded"
                );
                if matches!(e, CompileError::Unsupported(_)) {
                    // No point re-claiming a function we cannot lower
                    record.polluted.store(true, Ordering::Release);
                }
            }
        }
        record.release_compile_claim();
    }
}

/// The full pipeline: bytecode → IR → optimize → allocate → emit →
/// install. Also used synchronously by tests.
pub fn compile_job(job: &CompileJob, ctx: &WorkerContext) -> Result<(), CompileError> {
    let record = &job.record;
    let bc = &record.bytecode;

    let (mut ir, sites) = build_ir(
        record.id,
        &bc.name,
        &bc.code,
        &bc.consts,
        bc.param_count,
        bc.local_count,
        !bc.handlers.is_empty(),
        &job.profile,
        job.osr_offset,
    )?;

    let level = match job.tier {
        Tier::Baseline => 1,
        Tier::Optimizing => ctx.optimization_level.max(2),
        Tier::Interpreter => 0,
    };
    let flags = OptFlags::for_level(level);
    let pass_ctx = PassContext {
        profile: &job.profile,
        sites: &sites,
        funcs: Some(&ctx.funcs),
        profiler: Some(&ctx.profiler),
        flags,
    };
    Optimizer::new().optimize(&mut ir, &pass_ctx);

    let cc = ctx.backend.calling_convention();
    let alloc = allocate(&ir, &cc.allocatable);
    let compiled = ctx.backend.compile(&ir, &alloc)?;

    let entry = ctx
        .cache
        .install(record.id, compiled, ctx.backend.as_ref())
        .map_err(|e| CompileError::Internal(e.to_string()))?;

    // Cancellation check once more before publication
    if record.generation.load(Ordering::Acquire) != job.generation {
        entry.invalidate();
        return Ok(());
    }
    match job.osr_offset {
        Some(offset) => record.install_osr(offset, entry),
        None => record.install(job.tier, entry),
    }
    tracing::debug!(
        function = record.id.0,
        tier = ?job.tier,
        osr = ?job.osr_offset,
        "installed native entry"
    );
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, ModuleBuilder, Opcode};
    use crate::jit::backend::traits::host_backend;
    use aero_core::Heap;

    fn worker_ctx() -> (WorkerContext, Arc<FunctionTable>, Vec<aero_core::FunctionId>) {
        let mut m = ModuleBuilder::new();
        let mut f = BytecodeBuilder::new("add", 2, 0);
        f.load_var(0);
        f.load_var(1);
        f.emit(Opcode::Add);
        f.emit(Opcode::Return);
        m.function(f.finish());

        let funcs = Arc::new(FunctionTable::new());
        let mut heap = Heap::new(0);
        let ids = funcs.load_module(&mut heap, &m.finish());
        let ctx = WorkerContext {
            funcs: funcs.clone(),
            profiler: Arc::new(Profiler::new(true)),
            cache: Arc::new(CodeCache::new(1 << 22)),
            backend: Arc::from(host_backend()),
            optimization_level: 2,
        };
        (ctx, funcs, ids)
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_synchronous_compile_installs_entry() {
        let (ctx, funcs, ids) = worker_ctx();
        let record = funcs.record(ids[0]).unwrap();
        let job = CompileJob {
            record: record.clone(),
            tier: Tier::Baseline,
            generation: 0,
            osr_offset: None,
            profile: ProfileSnapshot::default(),
        };
        compile_job(&job, &ctx).unwrap();
        assert_eq!(record.tier(), Tier::Baseline);
        assert!(record.native_entry().is_some());
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_stale_generation_not_installed() {
        let (ctx, funcs, ids) = worker_ctx();
        let record = funcs.record(ids[0]).unwrap();
        let job = CompileJob {
            record: record.clone(),
            tier: Tier::Baseline,
            generation: 0,
            osr_offset: None,
            profile: ProfileSnapshot::default(),
        };
        record.invalidate(); // bumps the generation
        compile_job(&job, &ctx).unwrap();
        assert!(record.native_entry().is_none());
        assert_eq!(record.tier(), Tier::Interpreter);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_background_workers_compile() {
        let (ctx, funcs, ids) = worker_ctx();
        let cache = ctx.cache.clone();
        let dispatcher = TieredDispatcher::new(ctx, 2);
        let record = funcs.record(ids[0]).unwrap();
        assert!(record.try_claim_compile());
        dispatcher.enqueue(CompileJob {
            record: record.clone(),
            tier: Tier::Baseline,
            generation: 0,
            osr_offset: None,
            profile: ProfileSnapshot::default(),
        });
        // Wait for the background install
        for _ in 0..200 {
            if record.native_entry().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(record.native_entry().is_some());
        assert_eq!(cache.entry_count(), 1);
    }
}
