//! Native code cache
//!
//! Owns every compiled entry: finalizes backend output into executable
//! memory, hands out entries by function id, patches inline-cache sites
//! under its single writer mutex, and evicts the lowest-scored entries
//! (score = age × size) when the soft size threshold is crossed.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use aero_core::{FunctionId, JsError, ShapeId};

use crate::jit::backend::traits::{Backend, CompiledCode, CompiledDeoptPoint, IcPatch, PatchPoint, SymbolInfo};
use crate::jit::code::buffer::{CodeBuffer, ExecutableCode, CODE_ALIGN};

/// Entry life-cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    Available = 0,
    Invalidated = 1,
    Relocating = 2,
    Deoptimizing = 3,
}

/// Execution statistics for one entry
#[derive(Debug, Default)]
pub struct EntryStats {
    pub execution_count: AtomicU64,
}

/// One finalized unit of native code
pub struct CodeEntry {
    pub function_id: FunctionId,
    code: ExecutableCode,
    pub entry_offset: u32,
    state: AtomicU8,
    pub patch_points: Vec<PatchPoint>,
    pub ic_sites: FxHashMap<u32, IcPatch>,
    pub deopt_points: Vec<CompiledDeoptPoint>,
    pub symbols: Vec<SymbolInfo>,
    pub synth_strings: Vec<Box<str>>,
    /// Loop-header bytecode offset when this is an OSR entry
    pub osr_offset: Option<u32>,
    pub created_at: Instant,
    pub stats: EntryStats,
}

impl CodeEntry {
    pub fn entry_address(&self) -> usize {
        self.code.address(self.entry_offset)
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn state(&self) -> EntryState {
        match self.state.load(Ordering::Acquire) {
            1 => EntryState::Invalidated,
            2 => EntryState::Relocating,
            3 => EntryState::Deoptimizing,
            _ => EntryState::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state() == EntryState::Available
    }

    pub fn invalidate(&self) {
        self.state
            .store(EntryState::Invalidated as u8, Ordering::Release);
    }

    pub fn set_state(&self, s: EntryState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn record_execution(&self) {
        self.stats.execution_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The deopt point metadata for a trap index
    pub fn deopt_point(&self, index: u32) -> Option<&CompiledDeoptPoint> {
        self.deopt_points.get(index as usize)
    }

    fn eviction_score(&self, now: Instant) -> u128 {
        let age = now.duration_since(self.created_at).as_millis().max(1);
        age * self.code_size() as u128
    }
}

impl std::fmt::Debug for CodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEntry")
            .field("function_id", &self.function_id.0)
            .field("size", &self.code_size())
            .field("state", &self.state())
            .field("osr_offset", &self.osr_offset)
            .finish()
    }
}

/// Bounded cache of executable entries
pub struct CodeCache {
    entries: Mutex<Vec<Arc<CodeEntry>>>,
    total_bytes: AtomicUsize,
    /// Crossing this triggers eviction…
    soft_limit: usize,
    /// …down to this
    high_water: usize,
    guard_pages: bool,
    /// Single writer for every patch operation
    patch_lock: Mutex<()>,
}

impl CodeCache {
    pub fn new(soft_limit: usize) -> Self {
        CodeCache {
            entries: Mutex::new(Vec::new()),
            total_bytes: AtomicUsize::new(0),
            soft_limit,
            high_water: soft_limit - soft_limit / 4,
            guard_pages: true,
            patch_lock: Mutex::new(()),
        }
    }

    /// Copy backend output into executable memory and register the entry
    pub fn install(
        &self,
        function_id: FunctionId,
        compiled: CompiledCode,
        backend: &dyn Backend,
    ) -> Result<Arc<CodeEntry>, JsError> {
        let mut buf = CodeBuffer::allocate(compiled.code.len() + CODE_ALIGN, self.guard_pages)?;
        buf.align_to(CODE_ALIGN);
        buf.write(&compiled.code)?;
        let len = buf.len();
        let exec = buf.freeze()?;
        backend.flush_icache(exec.address(0) as *const u8, len);

        let entry = Arc::new(CodeEntry {
            function_id,
            code: exec,
            entry_offset: compiled.entry_offset,
            state: AtomicU8::new(EntryState::Available as u8),
            patch_points: compiled.patch_points,
            ic_sites: compiled.ic_sites,
            deopt_points: compiled.deopt_points,
            symbols: compiled.symbols,
            synth_strings: compiled.synth_strings,
            osr_offset: compiled.osr_offset,
            created_at: Instant::now(),
            stats: EntryStats::default(),
        });

        let size = entry.code_size();
        let mut entries = self.entries.lock();
        entries.push(entry.clone());
        let total = self.total_bytes.fetch_add(size, Ordering::AcqRel) + size;
        drop(entries);

        if total > self.soft_limit {
            self.evict_to_high_water();
        }
        Ok(entry)
    }

    /// The available main entry for a function, if any
    pub fn lookup(&self, function_id: FunctionId) -> Option<Arc<CodeEntry>> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.function_id == function_id && e.osr_offset.is_none() && e.is_available())
            .cloned()
    }

    /// Invalidate every entry of a function and unlink it from the table
    pub fn invalidate(&self, function_id: FunctionId) {
        let entries = self.entries.lock();
        for e in entries.iter() {
            if e.function_id == function_id {
                e.invalidate();
            }
        }
    }

    /// Evict lowest-value entries (oldest × largest) until under the
    /// high-water mark. Invalidated entries go first.
    pub fn evict_to_high_water(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Drop already invalidated entries that nothing references
        entries.retain(|e| {
            let dead = !e.is_available() && Arc::strong_count(e) == 1;
            if dead {
                self.total_bytes.fetch_sub(e.code_size(), Ordering::AcqRel);
            }
            !dead
        });

        let mut scored: Vec<(u128, usize)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.eviction_score(now), i))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut doomed: Vec<usize> = Vec::new();
        let mut total = self.total_bytes.load(Ordering::Acquire);
        for (_, i) in scored {
            if total <= self.high_water {
                break;
            }
            entries[i].invalidate();
            total = total.saturating_sub(entries[i].code_size());
            doomed.push(i);
        }
        // Unreferenced doomed entries can be reclaimed immediately
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for i in doomed {
            if Arc::strong_count(&entries[i]) == 1 {
                self.total_bytes
                    .fetch_sub(entries[i].code_size(), Ordering::AcqRel);
                entries.remove(i);
            } else {
                tracing::debug!(function = entries[i].function_id.0, "evicted live entry");
            }
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Rewrite an inline-cache site's expected shape and slot. Holds the
    /// patch mutex for the whole W^X transition.
    pub fn patch_ic(&self, entry: &CodeEntry, site: u32, shape: ShapeId, slot: u32) -> bool {
        let Some(patch) = entry.ic_sites.get(&site).copied() else {
            return false;
        };
        let _guard = self.patch_lock.lock();
        // Safety: executor-thread-only patching at an IC miss; execution
        // is outside the patched region (we are in the runtime, not in
        // the compiled code)
        match unsafe { entry.code.begin_patch() } {
            Ok(mut g) => {
                g.write_u32(patch.slot_imm, slot);
                g.write_u32(patch.shape_imm, shape.0);
                true
            }
            Err(_) => false,
        }
    }

    /// Disable an inline-cache fast path (megamorphic transition)
    pub fn unpatch_ic(&self, entry: &CodeEntry, site: u32) -> bool {
        let Some(patch) = entry.ic_sites.get(&site).copied() else {
            return false;
        };
        let _guard = self.patch_lock.lock();
        match unsafe { entry.code.begin_patch() } {
            Ok(mut g) => {
                g.write_u32(patch.shape_imm, u32::MAX);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jit::backend::traits::TargetIsa;
    use crate::jit::regalloc::Allocation;
    use crate::jit::ir::IrFunction;
    use crate::jit::CompileError;

    struct NullBackend;
    impl Backend for NullBackend {
        fn name(&self) -> &'static str {
            "null"
        }
        fn target(&self) -> TargetIsa {
            TargetIsa::X64
        }
        fn calling_convention(&self) -> crate::jit::backend::traits::CallingConvention {
            crate::jit::backend::traits::CallingConvention {
                arg_regs: vec![],
                ret_reg: crate::jit::regalloc::PhysReg(0),
                allocatable: vec![],
            }
        }
        fn compile(
            &self,
            _f: &IrFunction,
            _a: &Allocation,
        ) -> Result<CompiledCode, CompileError> {
            unimplemented!("test backend never compiles")
        }
        fn flush_icache(&self, _p: *const u8, _l: usize) {}
    }

    fn dummy_compiled(size: usize) -> CompiledCode {
        CompiledCode {
            code: vec![0xC3; size],
            entry_offset: 0,
            patch_points: vec![],
            ic_sites: FxHashMap::default(),
            deopt_points: vec![],
            symbols: vec![],
            synth_strings: vec![],
            osr_offset: None,
        }
    }

    #[test]
    fn test_install_and_lookup() {
        let cache = CodeCache::new(1 << 20);
        let entry = cache
            .install(FunctionId(1), dummy_compiled(32), &NullBackend)
            .unwrap();
        assert!(entry.is_available());
        assert_ne!(entry.entry_address(), 0);
        assert_eq!(entry.entry_address() % 16, 0);

        let found = cache.lookup(FunctionId(1)).unwrap();
        assert_eq!(found.entry_address(), entry.entry_address());
        assert!(cache.lookup(FunctionId(2)).is_none());
    }

    #[test]
    fn test_invalidate_hides_entry() {
        let cache = CodeCache::new(1 << 20);
        cache
            .install(FunctionId(1), dummy_compiled(32), &NullBackend)
            .unwrap();
        cache.invalidate(FunctionId(1));
        assert!(cache.lookup(FunctionId(1)).is_none());
    }

    #[test]
    fn test_latest_entry_wins() {
        let cache = CodeCache::new(1 << 20);
        cache
            .install(FunctionId(1), dummy_compiled(32), &NullBackend)
            .unwrap();
        let second = cache
            .install(FunctionId(1), dummy_compiled(64), &NullBackend)
            .unwrap();
        let found = cache.lookup(FunctionId(1)).unwrap();
        assert_eq!(found.entry_address(), second.entry_address());
    }

    #[test]
    fn test_eviction_under_pressure() {
        // Page-sized entries so the limit is meaningful
        let cache = CodeCache::new(16 * 4096);
        let mut entries = Vec::new();
        for i in 0..32 {
            entries.push(
                cache
                    .install(FunctionId(i), dummy_compiled(4096), &NullBackend)
                    .unwrap(),
            );
        }
        // Pressure forced evictions: something is no longer available
        let invalidated = entries.iter().filter(|e| !e.is_available()).count();
        assert!(invalidated > 0);
        assert!(cache.total_size() <= 16 * 4096 * 2);
    }

    #[test]
    fn test_state_transitions() {
        let cache = CodeCache::new(1 << 20);
        let entry = cache
            .install(FunctionId(1), dummy_compiled(16), &NullBackend)
            .unwrap();
        assert_eq!(entry.state(), EntryState::Available);
        entry.set_state(EntryState::Deoptimizing);
        assert_eq!(entry.state(), EntryState::Deoptimizing);
        assert!(!entry.is_available());
        entry.set_state(EntryState::Relocating);
        assert_eq!(entry.state(), EntryState::Relocating);
        entry.invalidate();
        assert_eq!(entry.state(), EntryState::Invalidated);
    }
}
