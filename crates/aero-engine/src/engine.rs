//! The embedding API
//!
//! `Engine` owns every piece of per-instance state — heap, context,
//! function table, profiler, jit runtime — and wires them together for
//! each call. Nothing here is process-global: embedders can run several
//! engines side by side. Source parsing is an external collaborator
//! behind the `SourceCompiler` trait; tests and front ends can also hand
//! the engine pre-built bytecode modules directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use rustc_hash::FxHashMap;
use serde::Serialize;

use aero_core::{
    ErrorKind, FunctionData, FunctionId, FunctionKind, Heap, JsError, PropertyKey, Value,
};

use crate::bytecode::BytecodeModule;
use crate::context::{Context, ContextConfig, LookupResult};
use crate::error::EngineError;
use crate::functions::{FunctionTable, NativeFunction};
use crate::interpreter::Vm;
use crate::jit::{JitOptions, JitRuntime};
use crate::profiler::Profiler;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Heap ceiling in bytes; 0 means unlimited
    pub max_memory: usize,
    /// Executions before baseline compilation (optimizing at ×10)
    pub jit_threshold: u64,
    /// Optimization level 0–3
    pub optimization_level: u8,
    pub enable_jit: bool,
    pub enable_profiling: bool,
    /// Kilobytes allocated between collection cycles
    pub gc_frequency: u32,
    pub strict_mode: bool,
    pub sandboxed: bool,
    /// Abort runaway scripts after this many interpreted instructions
    pub execution_limit: Option<u64>,
    pub compile_workers: usize,
    pub debug_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_memory: 1 << 30,
            jit_threshold: crate::profiler::BASELINE_THRESHOLD,
            optimization_level: 2,
            enable_jit: true,
            enable_profiling: true,
            gc_frequency: 1024,
            strict_mode: false,
            sandboxed: false,
            execution_limit: None,
            compile_workers: crate::jit::runtime::default_worker_count(),
            debug_mode: false,
        }
    }
}

/// Counters exposed to embedders
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub scripts_evaluated: u64,
    pub functions_loaded: usize,
    pub instructions_executed: u64,
    pub gc_collections: u64,
    pub heap_bytes: usize,
    pub heap_cells: usize,
    pub code_cache_bytes: usize,
    pub code_cache_entries: usize,
}

/// External parser collaborator: source text in, bytecode module out
pub trait SourceCompiler: Send + Sync {
    fn compile(&self, source: &str, filename: &str) -> Result<BytecodeModule, JsError>;
}

/// The default collaborator rejects everything: the core consumes
/// bytecode, it does not parse
struct NullCompiler;

impl SourceCompiler for NullCompiler {
    fn compile(&self, _source: &str, filename: &str) -> Result<BytecodeModule, JsError> {
        Err(JsError::syntax(format!(
            "no source compiler registered (evaluating {filename})"
        )))
    }
}

/// Callback invoked on script errors
pub type ErrorHandler = Box<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// A JavaScript engine instance
pub struct Engine {
    heap: Heap,
    ctx: Context,
    funcs: Arc<FunctionTable>,
    profiler: Arc<Profiler>,
    jit: JitRuntime,
    compiler: Box<dyn SourceCompiler>,
    error_handler: Option<ErrorHandler>,
    config: EngineConfig,
    modules: FxHashMap<String, Value>,
    scripts_evaluated: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        Engine::with_compiler(config, Box::new(NullCompiler))
    }

    pub fn with_compiler(config: EngineConfig, compiler: Box<dyn SourceCompiler>) -> Engine {
        let mut heap = Heap::new(config.max_memory);
        heap.set_gc_threshold(config.gc_frequency.max(1) as usize * 1024);
        let ctx = Context::new(
            &mut heap,
            ContextConfig {
                strict_mode: config.strict_mode,
                sandboxed: config.sandboxed,
                execution_limit: config.execution_limit,
                debug_mode: config.debug_mode,
            },
        );
        let funcs = Arc::new(FunctionTable::new());
        let profiler = Arc::new(Profiler::new(config.enable_profiling));
        let jit = JitRuntime::new(
            JitOptions {
                enabled: config.enable_jit,
                threshold: config.jit_threshold,
                optimization_level: config.optimization_level.min(3),
                compile_workers: config.compile_workers.max(1),
                code_cache_bytes: 16 << 20,
            },
            funcs.clone(),
            profiler.clone(),
        );
        Engine {
            heap,
            ctx,
            funcs,
            profiler,
            jit,
            compiler,
            error_handler: None,
            config,
            modules: FxHashMap::default(),
            scripts_evaluated: 0,
        }
    }

    // ===== Evaluation =====

    /// Compile (through the external parser) and run a script. The
    /// module's function 0 is its entry point.
    pub fn evaluate(&mut self, source: &str, filename: &str) -> Result<Value, EngineError> {
        let module = self
            .compiler
            .compile(source, filename)
            .map_err(|e| self.surface(e.into()))?;
        self.run_module(&module)
    }

    /// Eager evaluation behind a future, for async embedders. The engine
    /// executes on its single JS thread; the future is ready immediately.
    pub fn evaluate_async(&mut self, source: &str) -> EvaluateFuture {
        EvaluateFuture {
            result: Some(self.evaluate(source, "<async>")),
        }
    }

    /// Load a pre-built bytecode module and run its entry function
    pub fn run_module(&mut self, module: &BytecodeModule) -> Result<Value, EngineError> {
        let ids = self.load_module(module);
        let Some(&entry) = ids.first() else {
            return Ok(Value::undefined());
        };
        self.scripts_evaluated += 1;
        self.call_function(entry, Value::undefined(), &[])
    }

    /// Register a module's functions without running anything
    pub fn load_module(&mut self, module: &BytecodeModule) -> Vec<FunctionId> {
        self.funcs.load_module(&mut self.heap, module)
    }

    /// Call a loaded function by id
    pub fn call_function(
        &mut self,
        id: FunctionId,
        this: Value,
        args: &[Value],
    ) -> Result<Value, EngineError> {
        let record = match self.funcs.record(id) {
            Some(r) => r,
            None => {
                return Err(self.surface(EngineError::Internal(format!(
                    "function {} does not exist",
                    id.0
                ))))
            }
        };
        self.ctx.reset_limit_window();
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.ctx,
            &self.funcs,
            &self.profiler,
            &self.jit,
        );
        let result = vm.call_record(record, this, args);
        self.ctx.take_error();
        result.map_err(|e| self.surface(e.into()))
    }

    /// Call any callable value
    pub fn call_value(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, EngineError> {
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.ctx,
            &self.funcs,
            &self.profiler,
            &self.jit,
        );
        let result = vm.call_value(callee, this, args);
        self.ctx.take_error();
        result.map_err(|e| self.surface(e.into()))
    }

    fn surface(&self, e: EngineError) -> EngineError {
        if let Some(handler) = &self.error_handler {
            handler(e.kind(), &e.to_string());
        }
        e
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    // ===== Context API (builtins) =====

    /// Read a global property by name
    pub fn global_get(&mut self, name: &str) -> Value {
        let Some(atom) = self.heap.atoms.get(name) else {
            return Value::undefined();
        };
        match self
            .ctx
            .lookup_named(&self.heap, self.ctx.global_object(), atom)
        {
            LookupResult::Data(v) => v,
            _ => Value::undefined(),
        }
    }

    /// Define a global property
    pub fn global_set(&mut self, name: &str, value: Value) {
        let atom = self.heap.atoms.intern(name);
        let global = self.ctx.global_object();
        self.ctx
            .define_data_property(&mut self.heap, global, atom, value);
    }

    pub fn global_has(&mut self, name: &str) -> bool {
        self.heap
            .atoms
            .get(name)
            .map(|atom| {
                !matches!(
                    self.ctx
                        .lookup_named(&self.heap, self.ctx.global_object(), atom),
                    LookupResult::Missing
                )
            })
            .unwrap_or(false)
    }

    pub fn global_delete(&mut self, name: &str) -> bool {
        match self.heap.atoms.get(name) {
            Some(atom) => {
                let global = self.ctx.global_object();
                self.ctx.delete_named(&mut self.heap, global, atom)
            }
            None => true,
        }
    }

    /// Register a host-native function as a global
    pub fn register_native(&mut self, name: &str, f: Arc<NativeFunction>) -> Value {
        let id = self.funcs.register_native(f);
        let data = FunctionData {
            function_id: id,
            param_count: 0,
            kind: FunctionKind::Native,
        };
        let func = self.heap.alloc_function(None, data);
        self.global_set(name, func);
        func
    }

    /// Register a module value by name
    pub fn register_module(&mut self, name: &str, value: Value) {
        self.modules.insert(name.to_string(), value);
    }

    pub fn lookup_module(&self, name: &str) -> Option<Value> {
        self.modules.get(name).copied()
    }

    /// Gate for builtins with host access: sandboxed engines reject
    pub fn check_sandbox(&mut self, operation: &str) -> Result<(), JsError> {
        if self.config.sandboxed {
            let e = JsError::security(format!("{operation} is not permitted in sandboxed mode"));
            self.ctx.set_error(e.clone());
            return Err(e);
        }
        Ok(())
    }

    // ===== Property helpers (tests and embedders) =====

    pub fn get_property(&mut self, receiver: Value, key: &str) -> Result<Value, EngineError> {
        let pk = PropertyKey::from_str(&mut self.heap.atoms, key);
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.ctx,
            &self.funcs,
            &self.profiler,
            &self.jit,
        );
        let r = match pk {
            PropertyKey::Atom(atom) => vm.get_prop_named(FunctionId(u32::MAX), u32::MAX, receiver, atom),
            PropertyKey::Index(i) => vm.get_element(receiver, Value::integer(i as i32)),
            PropertyKey::Symbol(_) => Ok(Value::undefined()),
        };
        self.ctx.take_error();
        r.map_err(|e| self.surface(e.into()))
    }

    pub fn set_property(
        &mut self,
        receiver: Value,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let pk = PropertyKey::from_str(&mut self.heap.atoms, key);
        let mut vm = Vm::new(
            &mut self.heap,
            &mut self.ctx,
            &self.funcs,
            &self.profiler,
            &self.jit,
        );
        let r = match pk {
            PropertyKey::Atom(atom) => {
                vm.set_prop_named(FunctionId(u32::MAX), u32::MAX, receiver, atom, value)
            }
            PropertyKey::Index(i) => vm.set_element(receiver, Value::integer(i as i32), value),
            PropertyKey::Symbol(_) => Ok(()),
        };
        self.ctx.take_error();
        r.map_err(|e| self.surface(e.into()))
    }

    // ===== Memory and stats =====

    /// Run a full stop-the-world collection now
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = self.ctx.scope_roots();
        roots.push(self.heap.value_of(self.ctx.global_object()));
        roots.extend(self.modules.values().copied());
        self.heap.collect(&roots);
        self.ctx.gc_count += 1;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            scripts_evaluated: self.scripts_evaluated,
            functions_loaded: self.funcs.function_count(),
            instructions_executed: self.ctx.instructions_executed,
            gc_collections: self.heap.gc_stats().collections as u64,
            heap_bytes: self.heap.bytes_allocated(),
            heap_cells: self.heap.live_cell_count(),
            code_cache_bytes: self.jit.cache.total_size(),
            code_cache_entries: self.jit.cache.entry_count(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Direct access for builtins and tests
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.funcs
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn jit(&self) -> &JitRuntime {
        &self.jit
    }
}

/// Ready future over the single-threaded executor
pub struct EvaluateFuture {
    result: Option<Result<Value, EngineError>>,
}

impl Future for EvaluateFuture {
    type Output = Result<Value, EngineError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Poll::Ready(
            self.result
                .take()
                .unwrap_or_else(|| Err(EngineError::Internal("future polled twice".into()))),
        )
    }
}
