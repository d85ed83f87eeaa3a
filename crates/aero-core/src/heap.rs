//! Arena heap for JavaScript heap cells
//!
//! Cells are addressed by `ObjectId` — a stable slot index into the arena.
//! The arena never compacts, so handles held across a collection keep
//! referring to the same logical object. Freed slots go on a free list and
//! are reused by later allocations.
//!
//! All writes that store a `Value` into a heap cell go through barriered
//! methods on `Heap` (`set_slot`, `array_set`, `set_prototype`, …) so the
//! incremental collector can shade newly referenced cells during marking.

use rustc_hash::FxHashMap;

use crate::gc::{GcPhase, GcStats};
use crate::object::{ArrayStorage, FunctionData, JsObject, ObjectData, PropertySlot};
use crate::shape::ShapeTable;
use crate::string::{AtomTable, JsBigInt, JsString, JsSymbol};
use crate::value::{HeapKind, Value};

/// Stable identity of a heap cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// One allocated heap cell
#[derive(Debug, Clone)]
pub enum HeapCell {
    Str(JsString),
    Symbol(JsSymbol),
    BigInt(JsBigInt),
    Object(Box<JsObject>),
}

impl HeapCell {
    /// Rough byte cost used for memory accounting and eviction pressure
    pub fn byte_size(&self) -> usize {
        match self {
            HeapCell::Str(s) => std::mem::size_of::<JsString>() + s.byte_size(),
            HeapCell::Symbol(_) => std::mem::size_of::<JsSymbol>(),
            HeapCell::BigInt(_) => std::mem::size_of::<JsBigInt>(),
            HeapCell::Object(o) => {
                let base = std::mem::size_of::<JsObject>();
                let slots = o.slots.len() * std::mem::size_of::<PropertySlot>();
                let elems = match &o.data {
                    ObjectData::Array(a) => match &a.elements {
                        crate::object::Elements::Packed(v) | crate::object::Elements::Holey(v) => {
                            v.len() * 8
                        }
                        crate::object::Elements::Sparse(m) => m.len() * 16,
                    },
                    _ => 0,
                };
                base + slots + elems
            }
        }
    }

    fn value_kind(&self) -> HeapKind {
        match self {
            HeapCell::Str(_) => HeapKind::String,
            HeapCell::Symbol(_) => HeapKind::Symbol,
            HeapCell::BigInt(_) => HeapKind::BigInt,
            HeapCell::Object(o) => match o.data {
                ObjectData::Plain => HeapKind::Object,
                ObjectData::Array(_) => HeapKind::Array,
                ObjectData::Function(_) => HeapKind::Function,
            },
        }
    }
}

/// The engine heap: cell arena, interned atoms, shape tree, GC state
pub struct Heap {
    pub(crate) cells: Vec<Option<HeapCell>>,
    pub(crate) marks: Vec<bool>,
    pub(crate) free: Vec<u32>,
    /// Shape id per cell (u32::MAX for non-objects and free slots).
    /// Compiled code reads this flat array for inline-cache checks.
    pub(crate) shape_ids: Vec<u32>,

    /// Property-key interner
    pub atoms: AtomTable,
    /// Hidden-class transition tree
    pub shapes: ShapeTable,

    pub(crate) bytes_allocated: usize,
    pub(crate) max_memory: usize,
    pub(crate) gc_threshold: usize,
    pub(crate) bytes_since_gc: usize,

    pub(crate) phase: GcPhase,
    pub(crate) gray: Vec<ObjectId>,
    pub(crate) stats: GcStats,

    /// Embedder-registered roots, keyed by handle token
    pub(crate) root_handles: FxHashMap<u64, Value>,
    pub(crate) next_root_token: u64,

    /// Finalizers to run when a cell is swept
    pub(crate) finalizers: FxHashMap<ObjectId, Box<dyn FnMut(ObjectId)>>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("cells", &self.cells.len())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Heap {
    pub fn new(max_memory: usize) -> Self {
        Heap {
            cells: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            shape_ids: Vec::new(),
            atoms: AtomTable::new(),
            shapes: ShapeTable::new(),
            bytes_allocated: 0,
            max_memory,
            gc_threshold: 1024 * 1024,
            bytes_since_gc: 0,
            phase: GcPhase::Idle,
            gray: Vec::new(),
            stats: GcStats::default(),
            root_handles: FxHashMap::default(),
            next_root_token: 1,
            finalizers: FxHashMap::default(),
        }
    }

    // ===== Allocation =====

    fn insert(&mut self, cell: HeapCell) -> ObjectId {
        let size = cell.byte_size();
        self.bytes_allocated += size;
        self.bytes_since_gc += size;
        let shape_id = match &cell {
            HeapCell::Object(o) => o.shape.0,
            _ => u32::MAX,
        };

        let id = if let Some(slot) = self.free.pop() {
            self.cells[slot as usize] = Some(cell);
            self.marks[slot as usize] = false;
            self.shape_ids[slot as usize] = shape_id;
            ObjectId(slot)
        } else {
            let slot = self.cells.len() as u32;
            self.cells.push(Some(cell));
            self.marks.push(false);
            self.shape_ids.push(shape_id);
            ObjectId(slot)
        };
        // Cells born during marking start marked, so a fresh allocation can
        // never be swept by the collection in progress.
        if self.phase != GcPhase::Idle {
            self.marks[id.0 as usize] = true;
        }
        id
    }

    pub fn alloc_string(&mut self, s: &str) -> Value {
        let id = self.insert(HeapCell::Str(JsString::new(s)));
        Value::handle(HeapKind::String, id)
    }

    pub fn alloc_symbol(&mut self, description: Option<&str>) -> Value {
        let id = self.insert(HeapCell::Symbol(JsSymbol {
            description: description.map(Into::into),
        }));
        Value::handle(HeapKind::Symbol, id)
    }

    pub fn alloc_bigint(&mut self, v: i64) -> Value {
        let id = self.insert(HeapCell::BigInt(JsBigInt(v)));
        Value::handle(HeapKind::BigInt, id)
    }

    pub fn alloc_object(&mut self, prototype: Option<ObjectId>) -> Value {
        let id = self.insert(HeapCell::Object(Box::new(JsObject::plain(prototype))));
        Value::handle(HeapKind::Object, id)
    }

    pub fn alloc_array(&mut self, prototype: Option<ObjectId>, storage: ArrayStorage) -> Value {
        let id = self.insert(HeapCell::Object(Box::new(JsObject::array(
            prototype, storage,
        ))));
        Value::handle(HeapKind::Array, id)
    }

    pub fn alloc_function(&mut self, prototype: Option<ObjectId>, data: FunctionData) -> Value {
        let id = self.insert(HeapCell::Object(Box::new(JsObject::function(
            prototype, data,
        ))));
        Value::handle(HeapKind::Function, id)
    }

    // ===== Access =====

    pub fn cell(&self, id: ObjectId) -> &HeapCell {
        self.cells[id.0 as usize]
            .as_ref()
            .expect("access to freed heap cell")
    }

    pub fn try_cell(&self, id: ObjectId) -> Option<&HeapCell> {
        self.cells.get(id.0 as usize).and_then(|c| c.as_ref())
    }

    pub fn object(&self, id: ObjectId) -> &JsObject {
        match self.cell(id) {
            HeapCell::Object(o) => o,
            other => panic!("expected object cell, found {other:?}"),
        }
    }

    /// Mutable object access for non-Value mutations (shape id, lengths,
    /// storage reorganization). Writes that store a `Value` must use the
    /// barriered setters below.
    pub fn object_mut(&mut self, id: ObjectId) -> &mut JsObject {
        match self.cells[id.0 as usize]
            .as_mut()
            .expect("access to freed heap cell")
        {
            HeapCell::Object(o) => o,
            other => panic!("expected object cell, found {other:?}"),
        }
    }

    pub fn string(&self, id: ObjectId) -> &JsString {
        match self.cell(id) {
            HeapCell::Str(s) => s,
            other => panic!("expected string cell, found {other:?}"),
        }
    }

    pub fn bigint(&self, id: ObjectId) -> JsBigInt {
        match self.cell(id) {
            HeapCell::BigInt(b) => *b,
            other => panic!("expected bigint cell, found {other:?}"),
        }
    }

    pub fn symbol(&self, id: ObjectId) -> &JsSymbol {
        match self.cell(id) {
            HeapCell::Symbol(s) => s,
            other => panic!("expected symbol cell, found {other:?}"),
        }
    }

    /// Re-derive a value handle from a cell id
    pub fn value_of(&self, id: ObjectId) -> Value {
        Value::handle(self.cell(id).value_kind(), id)
    }

    // ===== Barriered writes =====

    /// Store a data value into a named-property slot
    pub fn set_slot(&mut self, id: ObjectId, index: u32, value: Value) {
        self.write_barrier(value);
        let obj = self.object_mut(id);
        obj.grow_slots(index);
        obj.slots[index as usize] = PropertySlot::Data(value);
    }

    /// Install an accessor pair into a slot
    pub fn set_accessor_slot(
        &mut self,
        id: ObjectId,
        index: u32,
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
    ) {
        if let Some(g) = getter {
            self.write_barrier(self.value_of(g));
        }
        if let Some(s) = setter {
            self.write_barrier(self.value_of(s));
        }
        let obj = self.object_mut(id);
        obj.grow_slots(index);
        obj.slots[index as usize] = PropertySlot::Accessor { getter, setter };
    }

    /// Store an array element
    pub fn array_set(&mut self, id: ObjectId, index: u32, value: Value) {
        self.write_barrier(value);
        if let Some(storage) = self.object_mut(id).array_storage_mut() {
            storage.set(index, value);
        }
    }

    /// Re-link a prototype
    pub fn set_prototype(&mut self, id: ObjectId, prototype: Option<ObjectId>) {
        if let Some(p) = prototype {
            self.write_barrier(self.value_of(p));
        }
        self.object_mut(id).prototype = prototype;
    }

    /// Change an object's shape, keeping the flat shape-id table (read by
    /// compiled inline caches) in sync
    pub fn set_shape(&mut self, id: ObjectId, shape: crate::shape::ShapeId) {
        self.object_mut(id).shape = shape;
        self.shape_ids[id.0 as usize] = shape.0;
    }

    /// Shape-id side table for compiled code
    pub fn shape_ids_raw(&self) -> (*const u32, usize) {
        (self.shape_ids.as_ptr(), self.shape_ids.len())
    }

    // ===== Roots and finalizers =====

    /// Register a value as a GC root; returns a token for unregistering
    pub fn add_root(&mut self, value: Value) -> u64 {
        let token = self.next_root_token;
        self.next_root_token += 1;
        self.root_handles.insert(token, value);
        token
    }

    pub fn remove_root(&mut self, token: u64) {
        self.root_handles.remove(&token);
    }

    /// Attach a native finalizer run when the cell is collected
    pub fn set_finalizer(&mut self, id: ObjectId, f: Box<dyn FnMut(ObjectId)>) {
        self.finalizers.insert(id, f);
    }

    // ===== Accounting =====

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    pub fn set_gc_threshold(&mut self, bytes: usize) {
        self.gc_threshold = bytes;
    }

    /// Whether allocation pressure warrants starting a collection
    pub fn should_collect(&self) -> bool {
        self.bytes_since_gc >= self.gc_threshold
            || (self.max_memory > 0 && self.bytes_allocated >= self.max_memory)
    }

    pub fn live_cell_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_access() {
        let mut heap = Heap::new(0);
        let s = heap.alloc_string("hello");
        let id = s.object_id().unwrap();
        assert_eq!(heap.string(id).as_str(), "hello");
        assert!(s.is_string());

        let o = heap.alloc_object(None);
        assert!(o.is_object_like());
        assert!(heap.object(o.object_id().unwrap()).slots.is_empty());
    }

    #[test]
    fn test_value_of_round_trip() {
        let mut heap = Heap::new(0);
        let a = heap.alloc_array(None, ArrayStorage::new());
        let id = a.object_id().unwrap();
        assert_eq!(heap.value_of(id), a);
    }

    #[test]
    fn test_bytes_accounting_grows() {
        let mut heap = Heap::new(0);
        let before = heap.bytes_allocated();
        heap.alloc_string("some string data here");
        assert!(heap.bytes_allocated() > before);
    }

    #[test]
    fn test_slot_write_through_barrier() {
        let mut heap = Heap::new(0);
        let o = heap.alloc_object(None).object_id().unwrap();
        heap.set_slot(o, 2, Value::integer(9));
        assert_eq!(heap.object(o).slots.len(), 3);
        match heap.object(o).slots[2] {
            PropertySlot::Data(v) => assert_eq!(v.as_integer(), Some(9)),
            _ => panic!("expected data slot"),
        }
    }
}
