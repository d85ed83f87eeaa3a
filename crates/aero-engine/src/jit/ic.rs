//! Inline caches for property access and call sites
//!
//! Every site starts uninitialized. The first hit makes it monomorphic;
//! distinct receiver shapes grow it polymorphic up to four entries; a
//! fifth shape tips it into megamorphic, after which the generic runtime
//! path is always taken. The executor thread is the only writer; compiled
//! code reads through patched immediates and the runtime helpers.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use aero_core::{FunctionId, ShapeId};

/// What a site caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcKind {
    PropertyLoad,
    PropertyStore,
    Call,
    InstanceOf,
    TypeCheck,
}

/// Cache state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// Polymorphic capacity before a site goes megamorphic
pub const MAX_POLYMORPHIC: usize = 4;

/// Miss count past which a site is considered oscillating and becomes a
/// deopt trigger for the next compile
pub const OSCILLATION_LIMIT: u32 = 16;

/// One cached (shape → target) pair. `target` is a slot index for
/// property sites and a function id for call sites.
#[derive(Debug, Clone, Copy)]
pub struct IcEntry {
    pub shape: ShapeId,
    pub target: u32,
}

/// One inline-cache site
#[derive(Debug)]
pub struct IcSite {
    pub kind: IcKind,
    entries: Vec<IcEntry>,
    megamorphic: bool,
    pub miss_count: u32,
    pub hit_count: u64,
}

/// What happened on a record, so callers can patch compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcTransition {
    /// Entry already cached; no change
    Hit,
    /// First shape: patch the monomorphic fast path
    BecameMonomorphic,
    /// Added a shape (2..=4 entries)
    BecamePolymorphic,
    /// Fifth shape: disable the fast path
    BecameMegamorphic,
    /// Already megamorphic; nothing cached
    Megamorphic,
}

impl IcSite {
    pub fn new(kind: IcKind) -> Self {
        IcSite {
            kind,
            entries: Vec::new(),
            megamorphic: false,
            miss_count: 0,
            hit_count: 0,
        }
    }

    pub fn state(&self) -> IcState {
        if self.megamorphic {
            IcState::Megamorphic
        } else {
            match self.entries.len() {
                0 => IcState::Uninitialized,
                1 => IcState::Monomorphic,
                _ => IcState::Polymorphic,
            }
        }
    }

    /// Fast-path probe
    pub fn lookup(&mut self, shape: ShapeId) -> Option<u32> {
        if self.megamorphic {
            return None;
        }
        let hit = self
            .entries
            .iter()
            .find(|e| e.shape == shape)
            .map(|e| e.target);
        if hit.is_some() {
            self.hit_count += 1;
        }
        hit
    }

    /// Record the result of a generic lookup after a miss
    pub fn record(&mut self, shape: ShapeId, target: u32) -> IcTransition {
        if self.megamorphic {
            return IcTransition::Megamorphic;
        }
        if let Some(e) = self.entries.iter_mut().find(|e| e.shape == shape) {
            // Same shape, possibly a new slot (shape reconfigured)
            e.target = target;
            return IcTransition::Hit;
        }
        self.miss_count += 1;
        if self.entries.len() >= MAX_POLYMORPHIC {
            self.entries.clear();
            self.megamorphic = true;
            return IcTransition::BecameMegamorphic;
        }
        self.entries.push(IcEntry { shape, target });
        match self.entries.len() {
            1 => IcTransition::BecameMonomorphic,
            _ => IcTransition::BecamePolymorphic,
        }
    }

    pub fn entries(&self) -> &[IcEntry] {
        &self.entries
    }

    /// The single cached shape when monomorphic
    pub fn monomorphic_entry(&self) -> Option<IcEntry> {
        match self.state() {
            IcState::Monomorphic => Some(self.entries[0]),
            _ => None,
        }
    }

    /// Sites that keep missing are deopt-trigger candidates
    pub fn is_oscillating(&self) -> bool {
        self.miss_count >= OSCILLATION_LIMIT
    }
}

/// All inline-cache sites, keyed by (function, bytecode offset)
pub struct IcTable {
    sites: Mutex<FxHashMap<(FunctionId, u32), IcSite>>,
}

impl IcTable {
    pub fn new() -> Self {
        IcTable {
            sites: Mutex::new(FxHashMap::default()),
        }
    }

    /// Probe the cache for a site; creates the site on first touch
    pub fn lookup(
        &self,
        function: FunctionId,
        pc: u32,
        kind: IcKind,
        shape: ShapeId,
    ) -> Option<u32> {
        let mut sites = self.sites.lock();
        sites
            .entry((function, pc))
            .or_insert_with(|| IcSite::new(kind))
            .lookup(shape)
    }

    /// Record a generic-path result
    pub fn record(
        &self,
        function: FunctionId,
        pc: u32,
        kind: IcKind,
        shape: ShapeId,
        target: u32,
    ) -> IcTransition {
        let mut sites = self.sites.lock();
        sites
            .entry((function, pc))
            .or_insert_with(|| IcSite::new(kind))
            .record(shape, target)
    }

    pub fn state(&self, function: FunctionId, pc: u32) -> IcState {
        self.sites
            .lock()
            .get(&(function, pc))
            .map(|s| s.state())
            .unwrap_or(IcState::Uninitialized)
    }

    pub fn entry_count(&self, function: FunctionId, pc: u32) -> usize {
        self.sites
            .lock()
            .get(&(function, pc))
            .map(|s| s.entries().len())
            .unwrap_or(0)
    }

    /// Sites of a function that oscillate (for compile-time deopt triggers)
    pub fn oscillating_sites(&self, function: FunctionId) -> Vec<u32> {
        self.sites
            .lock()
            .iter()
            .filter(|((f, _), s)| *f == function && s.is_oscillating())
            .map(|((_, pc), _)| *pc)
            .collect()
    }

    /// Drop all sites of a function (on invalidation)
    pub fn clear_function(&self, function: FunctionId) {
        self.sites.lock().retain(|(f, _), _| *f != function);
    }
}

impl Default for IcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_progression() {
        let mut site = IcSite::new(IcKind::PropertyLoad);
        assert_eq!(site.state(), IcState::Uninitialized);

        assert_eq!(site.record(ShapeId(1), 0), IcTransition::BecameMonomorphic);
        assert_eq!(site.state(), IcState::Monomorphic);
        assert_eq!(site.lookup(ShapeId(1)), Some(0));

        assert_eq!(site.record(ShapeId(2), 1), IcTransition::BecamePolymorphic);
        assert_eq!(site.record(ShapeId(3), 2), IcTransition::BecamePolymorphic);
        assert_eq!(site.record(ShapeId(4), 3), IcTransition::BecamePolymorphic);
        assert_eq!(site.state(), IcState::Polymorphic);
        assert_eq!(site.entries().len(), 4);
        // All four shapes hit the fast path
        for (i, s) in [1u32, 2, 3, 4].iter().enumerate() {
            assert_eq!(site.lookup(ShapeId(*s)), Some(i as u32));
        }

        // Fifth shape tips it over; caching stops
        assert_eq!(site.record(ShapeId(5), 4), IcTransition::BecameMegamorphic);
        assert_eq!(site.state(), IcState::Megamorphic);
        assert_eq!(site.lookup(ShapeId(1)), None);
        assert_eq!(site.record(ShapeId(6), 5), IcTransition::Megamorphic);
    }

    #[test]
    fn test_same_shape_updates_target() {
        let mut site = IcSite::new(IcKind::PropertyLoad);
        site.record(ShapeId(1), 0);
        assert_eq!(site.record(ShapeId(1), 7), IcTransition::Hit);
        assert_eq!(site.lookup(ShapeId(1)), Some(7));
        assert_eq!(site.state(), IcState::Monomorphic);
    }

    #[test]
    fn test_miss_count_and_oscillation() {
        let mut site = IcSite::new(IcKind::PropertyLoad);
        site.record(ShapeId(1), 0);
        assert_eq!(site.miss_count, 1);
        assert!(!site.is_oscillating());
    }

    #[test]
    fn test_table_keys_by_function_and_pc() {
        let table = IcTable::new();
        let f0 = FunctionId(0);
        let f1 = FunctionId(1);
        table.record(f0, 10, IcKind::PropertyLoad, ShapeId(1), 0);
        table.record(f1, 10, IcKind::PropertyLoad, ShapeId(2), 1);

        assert_eq!(table.lookup(f0, 10, IcKind::PropertyLoad, ShapeId(1)), Some(0));
        assert_eq!(table.lookup(f0, 10, IcKind::PropertyLoad, ShapeId(2)), None);
        assert_eq!(table.lookup(f1, 10, IcKind::PropertyLoad, ShapeId(2)), Some(1));

        table.clear_function(f0);
        assert_eq!(table.state(f0, 10), IcState::Uninitialized);
        assert_eq!(table.state(f1, 10), IcState::Monomorphic);
    }
}
