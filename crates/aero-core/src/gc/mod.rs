//! Garbage collection for the arena heap
//!
//! Incremental mark-sweep. Collection only starts and steps at engine
//! safepoints; between steps the mutator keeps running, so `Heap`'s
//! barriered write methods shade newly stored references (Dijkstra
//! insertion barrier) and cells allocated mid-cycle are born marked.
//! Handles are arena indices and the arena never compacts, so every live
//! handle stays valid across a collection.

mod collector;

pub use collector::GcCycle;

/// Where the collector currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
}

/// Cumulative collector statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GcStats {
    /// Completed collection cycles
    pub collections: usize,
    /// Total cells freed
    pub objects_freed: usize,
    /// Total bytes reclaimed
    pub bytes_freed: usize,
    /// Total stop-the-world time across cycles
    pub total_pause: std::time::Duration,
    /// Pause of the most recent cycle
    pub last_pause: std::time::Duration,
}
