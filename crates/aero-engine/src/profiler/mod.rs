//! Execution profiler: counters and type feedback for tier-up decisions
//!
//! The interpreter feeds this module at function entry/exit, at arithmetic
//! and property sites, and at branches. Counters are monotonic atomics;
//! stability scores are derived at probe time, never eagerly. The tiered
//! dispatcher probes `is_hot`; the optimizer consumes an immutable
//! `ProfileSnapshot` taken when a compile job is enqueued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;

use aero_core::{FunctionId, HeapKind, ShapeId, Value};

/// Execution count at which a function becomes a baseline candidate
pub const BASELINE_THRESHOLD: u64 = 1_000;
/// Execution count at which a function becomes an optimizing candidate
pub const OPTIMIZING_THRESHOLD: u64 = 10_000;
/// Fraction of samples one type must reach for a site to be stable
pub const TYPE_STABILITY: f64 = 0.95;

/// Runtime type classification recorded at sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObservedType {
    Int,
    Double,
    Boolean,
    String,
    Symbol,
    BigInt,
    Object,
    Array,
    Function,
    Null,
    Undefined,
}

impl ObservedType {
    /// Classify a value by its tag alone (no heap access needed)
    pub fn of(v: Value) -> ObservedType {
        if v.is_integer() {
            ObservedType::Int
        } else if v.is_double() {
            ObservedType::Double
        } else if v.is_boolean() {
            ObservedType::Boolean
        } else if v.is_null() {
            ObservedType::Null
        } else if v.is_undefined() {
            ObservedType::Undefined
        } else {
            match v.heap_kind() {
                Some(HeapKind::String) => ObservedType::String,
                Some(HeapKind::Symbol) => ObservedType::Symbol,
                Some(HeapKind::BigInt) => ObservedType::BigInt,
                Some(HeapKind::Array) => ObservedType::Array,
                Some(HeapKind::Function) => ObservedType::Function,
                _ => ObservedType::Object,
            }
        }
    }
}

/// Per-site feedback: operand types by position, receiver shapes, branch
/// direction counts
#[derive(Debug, Default)]
struct SiteProfile {
    types: FxHashMap<(u8, ObservedType), u32>,
    shapes: FxHashMap<ShapeId, u32>,
    call_targets: FxHashMap<FunctionId, u32>,
    taken: u32,
    not_taken: u32,
}

/// Opaque token pairing a `record_entry` with its `record_exit`
#[derive(Debug, Clone, Copy)]
pub struct EntryToken {
    started: Instant,
}

/// Profiling state for one function
#[derive(Debug, Default)]
pub struct FunctionProfile {
    /// Times this function has been entered. Monotonic.
    pub execution_count: AtomicU64,
    /// Loop back-edges taken inside this function. Monotonic.
    pub backedge_count: AtomicU64,
    /// Nanoseconds spent in completed invocations
    pub total_time_ns: AtomicU64,
    sites: Mutex<FxHashMap<u32, SiteProfile>>,
    return_types: Mutex<FxHashMap<ObservedType, u32>>,
}

impl FunctionProfile {
    fn site_mut<R>(&self, site: u32, f: impl FnOnce(&mut SiteProfile) -> R) -> R {
        let mut sites = self.sites.lock();
        f(sites.entry(site).or_default())
    }
}

/// Engine-wide profiler, indexed by `FunctionId`
pub struct Profiler {
    functions: RwLock<Vec<Arc<FunctionProfile>>>,
    enabled: bool,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Profiler {
            functions: RwLock::new(Vec::new()),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Ensure a profile exists for `function` and return it
    pub fn profile(&self, function: FunctionId) -> Arc<FunctionProfile> {
        {
            let functions = self.functions.read();
            if let Some(p) = functions.get(function.0 as usize) {
                return p.clone();
            }
        }
        let mut functions = self.functions.write();
        while functions.len() <= function.0 as usize {
            functions.push(Arc::new(FunctionProfile::default()));
        }
        functions[function.0 as usize].clone()
    }

    // ===== Recording =====

    /// Record a function entry; the token closes the sample at exit
    pub fn record_entry(&self, function: FunctionId) -> EntryToken {
        let p = self.profile(function);
        p.execution_count.fetch_add(1, Ordering::Relaxed);
        EntryToken {
            started: Instant::now(),
        }
    }

    pub fn record_exit(&self, function: FunctionId, token: EntryToken, return_value: Value) {
        let p = self.profile(function);
        let elapsed: Duration = token.started.elapsed();
        p.total_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if self.enabled {
            *p.return_types
                .lock()
                .entry(ObservedType::of(return_value))
                .or_insert(0) += 1;
        }
    }

    /// Record a loop back-edge (used for OSR hotness)
    pub fn record_backedge(&self, function: FunctionId) -> u64 {
        let p = self.profile(function);
        p.backedge_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record an operand type at a site. `position` is the operand index.
    pub fn record_type(&self, function: FunctionId, site: u32, position: u8, v: Value) {
        if !self.enabled {
            return;
        }
        let p = self.profile(function);
        p.site_mut(site, |s| {
            *s.types.entry((position, ObservedType::of(v))).or_insert(0) += 1;
        });
    }

    /// Record a receiver shape at a property or call site
    pub fn record_shape(&self, function: FunctionId, site: u32, shape: ShapeId) {
        if !self.enabled {
            return;
        }
        let p = self.profile(function);
        p.site_mut(site, |s| {
            *s.shapes.entry(shape).or_insert(0) += 1;
        });
    }

    /// Record the resolved callee at a call site
    pub fn record_call_target(&self, function: FunctionId, site: u32, target: FunctionId) {
        if !self.enabled {
            return;
        }
        let p = self.profile(function);
        p.site_mut(site, |s| {
            *s.call_targets.entry(target).or_insert(0) += 1;
        });
    }

    /// Record a branch direction
    pub fn record_branch(&self, function: FunctionId, site: u32, taken: bool) {
        if !self.enabled {
            return;
        }
        let p = self.profile(function);
        p.site_mut(site, |s| {
            if taken {
                s.taken += 1;
            } else {
                s.not_taken += 1;
            }
        });
    }

    // ===== Probes =====

    pub fn execution_count(&self, function: FunctionId) -> u64 {
        self.profile(function).execution_count.load(Ordering::Relaxed)
    }

    /// Hot enough for the baseline tier
    pub fn is_hot(&self, function: FunctionId) -> bool {
        self.execution_count(function) >= BASELINE_THRESHOLD
    }

    /// Hot enough for the optimizing tier
    pub fn is_optimizing_candidate(&self, function: FunctionId) -> bool {
        self.execution_count(function) >= OPTIMIZING_THRESHOLD
    }

    /// Whole-function stability: every site with meaningful sample volume
    /// has one dominant type per operand position. Functions with no
    /// typed sites count as stable (nothing to specialize, nothing to
    /// get wrong).
    pub fn is_function_type_stable(&self, function: FunctionId) -> bool {
        let p = self.profile(function);
        let sites = p.sites.lock();
        for s in sites.values() {
            let total: u32 = s.types.values().sum();
            if total < 16 {
                continue;
            }
            let positions: rustc_hash::FxHashSet<u8> =
                s.types.keys().map(|&(pos, _)| pos).collect();
            for pos in positions {
                let pos_total: u32 = s
                    .types
                    .iter()
                    .filter(|((p2, _), _)| *p2 == pos)
                    .map(|(_, &c)| c)
                    .sum();
                let max: u32 = s
                    .types
                    .iter()
                    .filter(|((p2, _), _)| *p2 == pos)
                    .map(|(_, &c)| c)
                    .max()
                    .unwrap_or(0);
                if (max as f64) < TYPE_STABILITY * pos_total as f64 {
                    return false;
                }
            }
        }
        true
    }

    /// One operand type accounts for ≥ 95% of samples at the site
    pub fn is_type_stable(&self, function: FunctionId, site: u32) -> bool {
        let p = self.profile(function);
        let sites = p.sites.lock();
        let Some(s) = sites.get(&site) else {
            return false;
        };
        let total: u32 = s.types.values().sum();
        if total == 0 {
            return false;
        }
        let max = s.types.values().copied().max().unwrap_or(0);
        max as f64 / total as f64 >= TYPE_STABILITY
    }

    /// Take an immutable view of one function's feedback for a compile job
    pub fn snapshot(&self, function: FunctionId) -> ProfileSnapshot {
        let p = self.profile(function);
        let sites = p.sites.lock();
        let mut site_snaps = FxHashMap::default();
        for (&site, s) in sites.iter() {
            let total: u32 = s.types.values().sum();
            let mut per_position: FxHashMap<u8, (ObservedType, f64)> = FxHashMap::default();
            for position in s.types.keys().map(|&(pos, _)| pos).collect::<Vec<_>>() {
                let pos_total: u32 = s
                    .types
                    .iter()
                    .filter(|((p2, _), _)| *p2 == position)
                    .map(|(_, &c)| c)
                    .sum();
                if let Some(((_, ty), &count)) = s
                    .types
                    .iter()
                    .filter(|((p2, _), _)| *p2 == position)
                    .max_by_key(|(_, &c)| c)
                {
                    per_position.insert(position, (*ty, count as f64 / pos_total as f64));
                }
            }
            let mut shapes: Vec<(ShapeId, u32)> =
                s.shapes.iter().map(|(&sh, &c)| (sh, c)).collect();
            shapes.sort_by(|a, b| b.1.cmp(&a.1));
            let mut call_targets: Vec<(FunctionId, u32)> =
                s.call_targets.iter().map(|(&t, &c)| (t, c)).collect();
            call_targets.sort_by(|a, b| b.1.cmp(&a.1));
            site_snaps.insert(
                site,
                SiteSnapshot {
                    total_samples: total,
                    dominant: per_position,
                    shapes,
                    call_targets,
                    taken: s.taken,
                    not_taken: s.not_taken,
                },
            );
        }
        ProfileSnapshot {
            execution_count: p.execution_count.load(Ordering::Relaxed),
            backedge_count: p.backedge_count.load(Ordering::Relaxed),
            sites: site_snaps,
        }
    }
}

/// Immutable per-site view used by the optimizer
#[derive(Debug, Clone, Serialize)]
pub struct SiteSnapshot {
    pub total_samples: u32,
    /// Dominant observed type and its frequency, per operand position
    pub dominant: FxHashMap<u8, (ObservedType, f64)>,
    /// Receiver shapes by descending frequency
    pub shapes: Vec<(ShapeId, u32)>,
    /// Observed callees by descending frequency
    pub call_targets: Vec<(FunctionId, u32)>,
    pub taken: u32,
    pub not_taken: u32,
}

impl SiteSnapshot {
    /// Dominant type at `position` if it clears the stability bar
    pub fn stable_type(&self, position: u8) -> Option<ObservedType> {
        self.dominant
            .get(&position)
            .filter(|(_, freq)| *freq >= TYPE_STABILITY)
            .map(|(ty, _)| *ty)
    }

    /// The single receiver shape, if the site is monomorphic
    pub fn monomorphic_shape(&self) -> Option<ShapeId> {
        match self.shapes.as_slice() {
            [(shape, _)] => Some(*shape),
            _ => None,
        }
    }

    /// The single observed callee, if the call site is monomorphic
    pub fn monomorphic_call_target(&self) -> Option<FunctionId> {
        match self.call_targets.as_slice() {
            [(target, _)] => Some(*target),
            _ => None,
        }
    }

    /// Branch bias toward `taken`, when one direction dominates
    pub fn branch_bias(&self) -> Option<bool> {
        let total = self.taken + self.not_taken;
        if total == 0 {
            return None;
        }
        let bias = self.taken.max(self.not_taken) as f64 / total as f64;
        if bias >= TYPE_STABILITY {
            Some(self.taken >= self.not_taken)
        } else {
            None
        }
    }
}

/// Feedback for one function, frozen at enqueue time
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProfileSnapshot {
    pub execution_count: u64,
    pub backedge_count: u64,
    pub sites: FxHashMap<u32, SiteSnapshot>,
}

impl ProfileSnapshot {
    pub fn site(&self, site: u32) -> Option<&SiteSnapshot> {
        self.sites.get(&site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u32) -> FunctionId {
        FunctionId(n)
    }

    #[test]
    fn test_execution_count_monotonic() {
        let p = Profiler::new(true);
        for _ in 0..5 {
            let tok = p.record_entry(fid(0));
            p.record_exit(fid(0), tok, Value::integer(1));
        }
        assert_eq!(p.execution_count(fid(0)), 5);
        assert!(!p.is_hot(fid(0)));
    }

    #[test]
    fn test_hotness_thresholds() {
        let p = Profiler::new(true);
        let prof = p.profile(fid(1));
        prof.execution_count.store(BASELINE_THRESHOLD, Ordering::Relaxed);
        assert!(p.is_hot(fid(1)));
        assert!(!p.is_optimizing_candidate(fid(1)));
        prof.execution_count
            .store(OPTIMIZING_THRESHOLD, Ordering::Relaxed);
        assert!(p.is_optimizing_candidate(fid(1)));
    }

    #[test]
    fn test_type_stability() {
        let p = Profiler::new(true);
        for _ in 0..99 {
            p.record_type(fid(0), 4, 0, Value::integer(1));
        }
        p.record_type(fid(0), 4, 0, Value::number(1.5));
        assert!(p.is_type_stable(fid(0), 4)); // 99% int

        for _ in 0..30 {
            p.record_type(fid(0), 8, 0, Value::number(0.5));
            p.record_type(fid(0), 8, 0, Value::integer(1));
        }
        assert!(!p.is_type_stable(fid(0), 8)); // 50/50
        assert!(!p.is_type_stable(fid(0), 99)); // no samples
    }

    #[test]
    fn test_snapshot_dominant_types() {
        let p = Profiler::new(true);
        for _ in 0..100 {
            p.record_type(fid(0), 2, 0, Value::integer(1));
            p.record_type(fid(0), 2, 1, Value::integer(2));
        }
        let snap = p.snapshot(fid(0));
        let site = snap.site(2).unwrap();
        assert_eq!(site.stable_type(0), Some(ObservedType::Int));
        assert_eq!(site.stable_type(1), Some(ObservedType::Int));
        assert_eq!(site.stable_type(2), None);
    }

    #[test]
    fn test_shapes_and_monomorphism() {
        let p = Profiler::new(true);
        for _ in 0..10 {
            p.record_shape(fid(0), 6, ShapeId(3));
        }
        let snap = p.snapshot(fid(0));
        assert_eq!(snap.site(6).unwrap().monomorphic_shape(), Some(ShapeId(3)));

        p.record_shape(fid(0), 6, ShapeId(4));
        let snap = p.snapshot(fid(0));
        assert_eq!(snap.site(6).unwrap().monomorphic_shape(), None);
        // Most frequent shape sorts first
        assert_eq!(snap.site(6).unwrap().shapes[0].0, ShapeId(3));
    }

    #[test]
    fn test_branch_bias() {
        let p = Profiler::new(true);
        for _ in 0..100 {
            p.record_branch(fid(0), 10, true);
        }
        p.record_branch(fid(0), 10, false);
        let snap = p.snapshot(fid(0));
        assert_eq!(snap.site(10).unwrap().branch_bias(), Some(true));

        for _ in 0..100 {
            p.record_branch(fid(0), 11, true);
            p.record_branch(fid(0), 11, false);
        }
        let snap = p.snapshot(fid(0));
        assert_eq!(snap.site(11).unwrap().branch_bias(), None);
    }

    #[test]
    fn test_disabled_profiler_skips_feedback() {
        let p = Profiler::new(false);
        p.record_type(fid(0), 0, 0, Value::integer(1));
        assert!(!p.is_type_stable(fid(0), 0));
        // Execution counts still tick (tiering depends on them)
        p.record_entry(fid(0));
        assert_eq!(p.execution_count(fid(0)), 1);
    }

    #[test]
    fn test_observed_type_classification() {
        assert_eq!(ObservedType::of(Value::integer(1)), ObservedType::Int);
        assert_eq!(ObservedType::of(Value::number(1.5)), ObservedType::Double);
        assert_eq!(ObservedType::of(Value::boolean(true)), ObservedType::Boolean);
        assert_eq!(ObservedType::of(Value::null()), ObservedType::Null);
        assert_eq!(ObservedType::of(Value::undefined()), ObservedType::Undefined);
    }
}
