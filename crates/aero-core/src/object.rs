//! Object model: property slots, array element storage, function cells
//!
//! Objects are heap cells addressed by `ObjectId`. Named properties live in
//! shape-indexed slots; integer-indexed elements live in dedicated storage
//! with three monotonic modes (packed → holey → sparse). Prototype links
//! are `Option<ObjectId>`, so cyclic graphs are representable and the GC
//! traces them through the arena.

use rustc_hash::FxHashMap;

use crate::heap::ObjectId;
use crate::shape::{ShapeId, ShapeTable};
use crate::value::Value;

/// A named-property slot: a data value or an accessor pair
#[derive(Debug, Clone, Copy)]
pub enum PropertySlot {
    Data(Value),
    Accessor {
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
    },
}

/// Identifier of a function in the engine's function table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct FunctionId(pub u32);

/// How a function cell is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Bytecode function run by the interpreter / JIT tiers
    Bytecode,
    /// Host-native callback registered through the context API
    Native,
}

/// Function-specific cell payload. Tier state, native entry pointers and
/// the feedback vector live engine-side, keyed by `function_id`.
#[derive(Debug, Clone, Copy)]
pub struct FunctionData {
    pub function_id: FunctionId,
    pub param_count: u32,
    pub kind: FunctionKind,
}

/// Element storage modes. Transitions are monotonic: packed → holey →
/// sparse, never back.
#[derive(Debug, Clone)]
pub enum Elements {
    /// Dense, no holes
    Packed(Vec<Value>),
    /// Dense vector that may contain hole markers
    Holey(Vec<Value>),
    /// Dictionary-backed, for very sparse index sets
    Sparse(FxHashMap<u32, Value>),
}

/// Array storage with its observable `length`
#[derive(Debug, Clone)]
pub struct ArrayStorage {
    pub elements: Elements,
    pub length: u32,
}

/// Storing this far past `length` converts dense storage to sparse
const SPARSE_GAP_LIMIT: u32 = 256;
/// Minimum element count before density is considered for sparse mode
const SPARSE_MIN_LEN: usize = 64;
/// A holey vector under 25% occupancy goes sparse
const SPARSE_DENSITY_NUM: usize = 1;
const SPARSE_DENSITY_DEN: usize = 4;

impl ArrayStorage {
    pub fn new() -> Self {
        ArrayStorage {
            elements: Elements::Packed(Vec::new()),
            length: 0,
        }
    }

    pub fn with_length(length: u32) -> Self {
        if length as usize > SPARSE_MIN_LEN * 4 {
            ArrayStorage {
                elements: Elements::Sparse(FxHashMap::default()),
                length,
            }
        } else {
            ArrayStorage {
                elements: Elements::Holey(vec![Value::hole(); length as usize]),
                length,
            }
        }
    }

    /// Read an element; absent indices read as `None`
    pub fn get(&self, index: u32) -> Option<Value> {
        match &self.elements {
            Elements::Packed(v) => v.get(index as usize).copied(),
            Elements::Holey(v) => v
                .get(index as usize)
                .copied()
                .filter(|val| !val.is_hole()),
            Elements::Sparse(m) => m.get(&index).copied(),
        }
    }

    /// Store an element, growing storage and transitioning mode as needed
    pub fn set(&mut self, index: u32, value: Value) {
        match &mut self.elements {
            Elements::Packed(v) => {
                let len = v.len() as u32;
                if index < len {
                    v[index as usize] = value;
                } else if index == len {
                    v.push(value);
                } else if index > len + SPARSE_GAP_LIMIT {
                    self.to_sparse();
                    self.set(index, value);
                } else {
                    // Introduces holes: packed → holey
                    let mut holey = std::mem::take(v);
                    holey.resize(index as usize + 1, Value::hole());
                    holey[index as usize] = value;
                    self.elements = Elements::Holey(holey);
                }
            }
            Elements::Holey(v) => {
                let len = v.len() as u32;
                if index < len {
                    v[index as usize] = value;
                } else if index > len + SPARSE_GAP_LIMIT {
                    self.to_sparse();
                    self.set(index, value);
                    return;
                } else {
                    v.resize(index as usize + 1, Value::hole());
                    v[index as usize] = value;
                }
            }
            Elements::Sparse(m) => {
                m.insert(index, value);
            }
        }
        if index >= self.length {
            self.length = index + 1;
        }
    }

    /// Delete an element. Any delete on packed storage transitions to
    /// holey; a holey vector that gets too thin transitions to sparse.
    /// `length` is unaffected, matching JS `delete`.
    pub fn delete(&mut self, index: u32) -> bool {
        match &mut self.elements {
            Elements::Packed(v) => {
                if (index as usize) < v.len() {
                    let holey = std::mem::take(v);
                    self.elements = Elements::Holey(holey);
                    self.delete(index)
                } else {
                    true
                }
            }
            Elements::Holey(v) => {
                if (index as usize) < v.len() {
                    v[index as usize] = Value::hole();
                    if v.len() >= SPARSE_MIN_LEN {
                        let occupied = v.iter().filter(|x| !x.is_hole()).count();
                        if occupied * SPARSE_DENSITY_DEN < v.len() * SPARSE_DENSITY_NUM {
                            self.to_sparse();
                        }
                    }
                }
                true
            }
            Elements::Sparse(m) => {
                m.remove(&index);
                true
            }
        }
    }

    /// Shrink or grow the observable length; shrinking drops elements
    pub fn set_length(&mut self, new_length: u32) {
        if new_length < self.length {
            match &mut self.elements {
                Elements::Packed(v) | Elements::Holey(v) => {
                    v.truncate(new_length as usize);
                }
                Elements::Sparse(m) => {
                    m.retain(|&i, _| i < new_length);
                }
            }
        }
        self.length = new_length;
    }

    fn to_sparse(&mut self) {
        let mut map = FxHashMap::default();
        match &self.elements {
            Elements::Packed(v) => {
                for (i, &val) in v.iter().enumerate() {
                    map.insert(i as u32, val);
                }
            }
            Elements::Holey(v) => {
                for (i, &val) in v.iter().enumerate() {
                    if !val.is_hole() {
                        map.insert(i as u32, val);
                    }
                }
            }
            Elements::Sparse(_) => return,
        }
        self.elements = Elements::Sparse(map);
    }

    /// Mode name, used by stats and tests
    pub fn mode(&self) -> &'static str {
        match self.elements {
            Elements::Packed(_) => "packed",
            Elements::Holey(_) => "holey",
            Elements::Sparse(_) => "sparse",
        }
    }

    /// Iterate present (index, value) pairs in ascending index order
    pub fn iter_present(&self) -> Vec<(u32, Value)> {
        match &self.elements {
            Elements::Packed(v) => v
                .iter()
                .enumerate()
                .map(|(i, &val)| (i as u32, val))
                .collect(),
            Elements::Holey(v) => v
                .iter()
                .enumerate()
                .filter(|(_, val)| !val.is_hole())
                .map(|(i, &val)| (i as u32, val))
                .collect(),
            Elements::Sparse(m) => {
                let mut pairs: Vec<(u32, Value)> = m.iter().map(|(&i, &v)| (i, v)).collect();
                pairs.sort_by_key(|&(i, _)| i);
                pairs
            }
        }
    }
}

impl Default for ArrayStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind-specific payload of an object cell
#[derive(Debug, Clone)]
pub enum ObjectData {
    Plain,
    Array(ArrayStorage),
    Function(FunctionData),
}

/// A heap object: shape-indexed named slots, a prototype link, and
/// kind-specific data
#[derive(Debug, Clone)]
pub struct JsObject {
    pub shape: ShapeId,
    pub slots: Vec<PropertySlot>,
    pub prototype: Option<ObjectId>,
    pub data: ObjectData,
}

impl JsObject {
    pub fn plain(prototype: Option<ObjectId>) -> Self {
        JsObject {
            shape: ShapeTable::EMPTY,
            slots: Vec::new(),
            prototype,
            data: ObjectData::Plain,
        }
    }

    pub fn array(prototype: Option<ObjectId>, storage: ArrayStorage) -> Self {
        JsObject {
            shape: ShapeTable::EMPTY,
            slots: Vec::new(),
            prototype,
            data: ObjectData::Array(storage),
        }
    }

    pub fn function(prototype: Option<ObjectId>, data: FunctionData) -> Self {
        JsObject {
            shape: ShapeTable::EMPTY,
            slots: Vec::new(),
            prototype,
            data: ObjectData::Function(data),
        }
    }

    pub fn array_storage(&self) -> Option<&ArrayStorage> {
        match &self.data {
            ObjectData::Array(s) => Some(s),
            _ => None,
        }
    }

    pub fn array_storage_mut(&mut self) -> Option<&mut ArrayStorage> {
        match &mut self.data {
            ObjectData::Array(s) => Some(s),
            _ => None,
        }
    }

    pub fn function_data(&self) -> Option<&FunctionData> {
        match &self.data {
            ObjectData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Ensure the slot vector can hold `index`
    pub fn grow_slots(&mut self, index: u32) {
        if self.slots.len() <= index as usize {
            self.slots
                .resize(index as usize + 1, PropertySlot::Data(Value::undefined()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_stays_packed() {
        let mut a = ArrayStorage::new();
        for i in 0..10 {
            a.set(i, Value::integer(i as i32));
        }
        assert_eq!(a.mode(), "packed");
        assert_eq!(a.length, 10);
        assert_eq!(a.get(3), Some(Value::integer(3)));
    }

    #[test]
    fn test_gap_write_goes_holey() {
        let mut a = ArrayStorage::new();
        a.set(0, Value::integer(1));
        a.set(5, Value::integer(2));
        assert_eq!(a.mode(), "holey");
        assert_eq!(a.length, 6);
        assert_eq!(a.get(3), None);
        assert_eq!(a.get(5), Some(Value::integer(2)));
    }

    #[test]
    fn test_far_write_goes_sparse() {
        let mut a = ArrayStorage::new();
        a.set(0, Value::integer(1));
        a.set(100_000, Value::integer(2));
        assert_eq!(a.mode(), "sparse");
        assert_eq!(a.length, 100_001);
        assert_eq!(a.get(100_000), Some(Value::integer(2)));
        assert_eq!(a.get(50_000), None);
    }

    #[test]
    fn test_delete_transitions_monotonic() {
        let mut a = ArrayStorage::new();
        for i in 0..100 {
            a.set(i, Value::integer(i as i32));
        }
        assert_eq!(a.mode(), "packed");
        a.delete(50);
        assert_eq!(a.mode(), "holey");
        assert_eq!(a.get(50), None);
        assert_eq!(a.length, 100);

        // Thin it out below the density threshold: goes sparse, never back
        for i in 0..90 {
            a.delete(i);
        }
        assert_eq!(a.mode(), "sparse");
        assert_eq!(a.get(95), Some(Value::integer(95)));
        a.set(1, Value::integer(7));
        assert_eq!(a.mode(), "sparse");
    }

    #[test]
    fn test_set_length_truncates() {
        let mut a = ArrayStorage::new();
        for i in 0..10 {
            a.set(i, Value::integer(i as i32));
        }
        a.set_length(4);
        assert_eq!(a.length, 4);
        assert_eq!(a.get(7), None);
        a.set_length(20);
        assert_eq!(a.length, 20);
        assert_eq!(a.get(10), None);
    }

    #[test]
    fn test_iter_present_sorted() {
        let mut a = ArrayStorage::new();
        a.set(0, Value::integer(1));
        a.set(100_000, Value::integer(3));
        a.set(500, Value::integer(2));
        let pairs = a.iter_present();
        assert_eq!(
            pairs.iter().map(|&(i, _)| i).collect::<Vec<_>>(),
            vec![0, 500, 100_000]
        );
    }
}
