//! Function table: bytecode, tier state, and native callbacks
//!
//! Every function the engine can call has a `FunctionRecord` here, keyed
//! by `FunctionId`. The record carries the function's bytecode, its
//! current tier, the (at most one each) baseline and optimizing native
//! entries, OSR entries keyed by bytecode offset, and the invalidation
//! generation used to cancel in-flight compile jobs.
//!
//! A compiled entry goes live through `install`: the code entry is
//! published under the state lock first, then the raw entry address is
//! stored with release ordering. Executors read the address with acquire
//! ordering, so they can never observe the pointer before the code bytes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use aero_core::{Atom, FunctionId, Heap, JsError, Value};

use crate::bytecode::{BytecodeFunction, BytecodeModule};
use crate::context::Context;
use crate::jit::code::CodeEntry;

/// Execution tiers. A function is at exactly one tier at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tier {
    Interpreter = 0,
    Baseline = 1,
    Optimizing = 2,
}

impl Tier {
    pub fn from_u8(b: u8) -> Tier {
        match b {
            1 => Tier::Baseline,
            2 => Tier::Optimizing,
            _ => Tier::Interpreter,
        }
    }
}

/// Native entries installed on a function
#[derive(Default)]
pub struct TierState {
    pub baseline: Option<Arc<CodeEntry>>,
    pub optimized: Option<Arc<CodeEntry>>,
    /// OSR entries keyed by loop-header bytecode offset
    pub osr: FxHashMap<u32, Arc<CodeEntry>>,
}

/// Host-native callback: `this`, arguments, access to heap and context.
/// Errors surface through the returned `Result` and the context slot.
pub type NativeFunction =
    dyn Fn(&mut Heap, &mut Context, Value, &[Value]) -> Result<Value, JsError> + Send + Sync;

/// What a `FunctionId` resolves to
pub enum FunctionCode {
    Bytecode(Arc<FunctionRecord>),
    Native(Arc<NativeFunction>),
}

/// Per-function record shared across threads
pub struct FunctionRecord {
    pub id: FunctionId,
    pub bytecode: Arc<BytecodeFunction>,
    /// Module name index → interned atom
    pub atoms: Arc<Vec<Atom>>,
    /// Module function index → engine function id (for `MakeFunction`)
    pub inner: Arc<Vec<FunctionId>>,

    tier: AtomicU8,
    /// Bumped on invalidation; stale compile jobs are discarded
    pub generation: AtomicU32,
    pub deopt_count: AtomicU32,
    /// Set when repeated deopts inhibit further optimizing compiles
    pub polluted: AtomicBool,
    /// Claim flag so only one compile job per function is in flight
    compiling: AtomicBool,

    /// Raw address of the preferred native entry; 0 when none. Written
    /// with release ordering after the entry is published in `state`.
    entry_point: AtomicUsize,
    pub state: RwLock<TierState>,
}

impl FunctionRecord {
    fn new(
        id: FunctionId,
        bytecode: Arc<BytecodeFunction>,
        atoms: Arc<Vec<Atom>>,
        inner: Arc<Vec<FunctionId>>,
    ) -> Self {
        FunctionRecord {
            id,
            bytecode,
            atoms,
            inner,
            tier: AtomicU8::new(Tier::Interpreter as u8),
            generation: AtomicU32::new(0),
            deopt_count: AtomicU32::new(0),
            polluted: AtomicBool::new(false),
            compiling: AtomicBool::new(false),
            entry_point: AtomicUsize::new(0),
            state: RwLock::new(TierState::default()),
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::from_u8(self.tier.load(Ordering::Acquire))
    }

    /// Claim the function for compilation. Only one job may be in flight.
    pub fn try_claim_compile(&self) -> bool {
        self.compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release_compile_claim(&self) {
        self.compiling.store(false, Ordering::Release);
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::Relaxed)
    }

    /// Install a compiled entry for `tier` and make it the preferred
    /// entry. Publication order: state lock first, then the atomic store.
    pub fn install(&self, tier: Tier, entry: Arc<CodeEntry>) {
        let addr = entry.entry_address();
        {
            let mut state = self.state.write();
            match tier {
                Tier::Baseline => state.baseline = Some(entry),
                Tier::Optimizing => state.optimized = Some(entry),
                Tier::Interpreter => return,
            }
        }
        self.tier.store(tier as u8, Ordering::Release);
        self.entry_point.store(addr, Ordering::Release);
    }

    /// Install an OSR entry for a specific loop header
    pub fn install_osr(&self, offset: u32, entry: Arc<CodeEntry>) {
        self.state.write().osr.insert(offset, entry);
    }

    pub fn osr_entry(&self, offset: u32) -> Option<Arc<CodeEntry>> {
        self.state.read().osr.get(&offset).cloned()
    }

    /// Preferred native entry, if one is installed
    pub fn native_entry(&self) -> Option<Arc<CodeEntry>> {
        if self.entry_point.load(Ordering::Acquire) == 0 {
            return None;
        }
        let state = self.state.read();
        state.optimized.clone().or_else(|| state.baseline.clone())
    }

    /// Drop the optimizing entry and fall back to baseline (or the
    /// interpreter). Bumps the generation so queued jobs die.
    pub fn demote(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.write();
        if let Some(old) = state.optimized.take() {
            old.invalidate();
        }
        state.osr.clear();
        let (tier, addr) = match &state.baseline {
            Some(b) => (Tier::Baseline, b.entry_address()),
            None => (Tier::Interpreter, 0),
        };
        drop(state);
        self.tier.store(tier as u8, Ordering::Release);
        self.entry_point.store(addr, Ordering::Release);
    }

    /// Invalidate every native entry (code cache eviction, debugger)
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.write();
        if let Some(e) = state.baseline.take() {
            e.invalidate();
        }
        if let Some(e) = state.optimized.take() {
            e.invalidate();
        }
        for (_, e) in state.osr.drain() {
            e.invalidate();
        }
        drop(state);
        self.tier.store(Tier::Interpreter as u8, Ordering::Release);
        self.entry_point.store(0, Ordering::Release);
    }

    /// Record a deoptimization; returns the new count
    pub fn record_deopt(&self) -> u32 {
        self.deopt_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Engine-wide function table
pub struct FunctionTable {
    records: RwLock<Vec<Option<Arc<FunctionRecord>>>>,
    natives: RwLock<Vec<Arc<NativeFunction>>>,
    /// FunctionId → index into `natives` for native functions
    native_ids: RwLock<FxHashMap<u32, u32>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        FunctionTable {
            records: RwLock::new(Vec::new()),
            natives: RwLock::new(Vec::new()),
            native_ids: RwLock::new(FxHashMap::default()),
        }
    }

    /// Load a module: intern its names, assign function ids, create
    /// records. Returns the ids in module order (index 0 is the entry).
    pub fn load_module(&self, heap: &mut Heap, module: &BytecodeModule) -> Vec<FunctionId> {
        let atoms: Arc<Vec<Atom>> = Arc::new(
            module
                .names
                .iter()
                .map(|n| heap.atoms.intern(n))
                .collect(),
        );

        let mut records = self.records.write();
        let base = records.len() as u32;
        let ids: Vec<FunctionId> = (0..module.functions.len())
            .map(|i| FunctionId(base + i as u32))
            .collect();
        let inner = Arc::new(ids.clone());

        for (i, func) in module.functions.iter().enumerate() {
            records.push(Some(Arc::new(FunctionRecord::new(
                ids[i],
                Arc::new(func.clone()),
                atoms.clone(),
                inner.clone(),
            ))));
        }
        ids
    }

    /// Register a host-native function; returns its id
    pub fn register_native(&self, f: Arc<NativeFunction>) -> FunctionId {
        let mut records = self.records.write();
        let id = FunctionId(records.len() as u32);
        records.push(None); // slot is a placeholder; code lives in `natives`
        let mut natives = self.natives.write();
        let native_index = natives.len() as u32;
        natives.push(f);
        self.native_ids.write().insert(id.0, native_index);
        id
    }

    /// Resolve a function id to its code
    pub fn resolve(&self, id: FunctionId) -> Option<FunctionCode> {
        if let Some(Some(record)) = self.records.read().get(id.0 as usize) {
            return Some(FunctionCode::Bytecode(record.clone()));
        }
        let native_ids = self.native_ids.read();
        let idx = *native_ids.get(&id.0)?;
        let natives = self.natives.read();
        natives
            .get(idx as usize)
            .cloned()
            .map(FunctionCode::Native)
    }

    /// Bytecode record for an id (None for natives)
    pub fn record(&self, id: FunctionId) -> Option<Arc<FunctionRecord>> {
        self.records.read().get(id.0 as usize)?.clone()
    }

    pub fn function_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, ModuleBuilder, Opcode};

    fn tiny_module() -> BytecodeModule {
        let mut m = ModuleBuilder::new();
        let mut f = BytecodeBuilder::new("main", 0, 0);
        f.emit(Opcode::ReturnUndef);
        m.function(f.finish());
        m.finish()
    }

    #[test]
    fn test_load_module_assigns_ids() {
        let table = FunctionTable::new();
        let mut heap = Heap::new(0);
        let ids = table.load_module(&mut heap, &tiny_module());
        assert_eq!(ids.len(), 1);
        let rec = table.record(ids[0]).unwrap();
        assert_eq!(rec.bytecode.name, "main");
        assert_eq!(rec.tier(), Tier::Interpreter);
    }

    #[test]
    fn test_compile_claim_is_exclusive() {
        let table = FunctionTable::new();
        let mut heap = Heap::new(0);
        let ids = table.load_module(&mut heap, &tiny_module());
        let rec = table.record(ids[0]).unwrap();
        assert!(rec.try_claim_compile());
        assert!(!rec.try_claim_compile());
        rec.release_compile_claim();
        assert!(rec.try_claim_compile());
    }

    #[test]
    fn test_native_registration_and_resolution() {
        let table = FunctionTable::new();
        let id = table.register_native(Arc::new(|_h, _c, _t, args: &[Value]| {
            Ok(args.first().copied().unwrap_or(Value::undefined()))
        }));
        match table.resolve(id) {
            Some(FunctionCode::Native(f)) => {
                let mut heap = Heap::new(0);
                let mut ctx = crate::context::Context::new(&mut heap, Default::default());
                let r = f(&mut heap, &mut ctx, Value::undefined(), &[Value::integer(3)]).unwrap();
                assert_eq!(r, Value::integer(3));
            }
            _ => panic!("expected native"),
        }
    }

    #[test]
    fn test_generation_bumps_on_invalidate() {
        let table = FunctionTable::new();
        let mut heap = Heap::new(0);
        let ids = table.load_module(&mut heap, &tiny_module());
        let rec = table.record(ids[0]).unwrap();
        let g0 = rec.generation.load(Ordering::Relaxed);
        rec.invalidate();
        assert_eq!(rec.generation.load(Ordering::Relaxed), g0 + 1);
        assert_eq!(rec.tier(), Tier::Interpreter);
        assert!(rec.native_entry().is_none());
    }
}
