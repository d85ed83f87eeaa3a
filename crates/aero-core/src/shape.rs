//! Hidden classes (shapes) and the shape transition tree
//!
//! Every object carries a `ShapeId`. Two objects share a shape id exactly
//! when their named-property key set and insertion history match, which is
//! what lets inline caches key on a single u32 compare. Adding a property
//! walks (or extends) the transition tree; deleting a property moves the
//! object to a private dictionary-mode shape that is never shared.

use rustc_hash::FxHashMap;

use crate::string::Atom;

/// Hidden-class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ShapeId(pub u32);

/// Property attribute bits stored per slot in the shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAttributes {
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
    /// Slot holds an accessor pair instead of a data value
    pub accessor: bool,
}

impl PropertyAttributes {
    /// Default attributes for plain assignment: all true, data property
    pub const fn data() -> Self {
        PropertyAttributes {
            writable: true,
            enumerable: true,
            configurable: true,
            accessor: false,
        }
    }

    pub const fn read_only() -> Self {
        PropertyAttributes {
            writable: false,
            enumerable: true,
            configurable: true,
            accessor: false,
        }
    }

    pub const fn accessor() -> Self {
        PropertyAttributes {
            writable: true,
            enumerable: true,
            configurable: true,
            accessor: true,
        }
    }

    fn pack(self) -> u8 {
        (self.writable as u8)
            | (self.enumerable as u8) << 1
            | (self.configurable as u8) << 2
            | (self.accessor as u8) << 3
    }
}

/// Location and attributes of one named property
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    /// Index into the object's slot vector
    pub index: u32,
    pub attrs: PropertyAttributes,
}

/// One node in the transition tree
#[derive(Debug)]
struct Shape {
    /// Full name → slot table for this shape (owned per node so lookup
    /// never walks parents)
    table: FxHashMap<Atom, SlotInfo>,
    /// Child transitions keyed by (added name, packed attributes)
    transitions: FxHashMap<(Atom, u8), ShapeId>,
    /// Property names in insertion order (drives enumeration)
    keys: Vec<Atom>,
    /// Dictionary-mode shapes are unshared and mutated in place
    dictionary: bool,
}

/// Arena of shapes, rooted at the empty shape
#[derive(Debug)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
}

impl ShapeTable {
    /// Shape id of the empty object
    pub const EMPTY: ShapeId = ShapeId(0);

    pub fn new() -> Self {
        ShapeTable {
            shapes: vec![Shape {
                table: FxHashMap::default(),
                transitions: FxHashMap::default(),
                keys: Vec::new(),
                dictionary: false,
            }],
        }
    }

    /// Look up a named property's slot in a shape
    pub fn lookup(&self, shape: ShapeId, name: Atom) -> Option<SlotInfo> {
        self.shapes[shape.0 as usize].table.get(&name).copied()
    }

    /// Number of slots objects with this shape carry
    pub fn slot_count(&self, shape: ShapeId) -> u32 {
        self.shapes[shape.0 as usize].table.len() as u32
    }

    /// Property names in insertion order
    pub fn keys(&self, shape: ShapeId) -> &[Atom] {
        &self.shapes[shape.0 as usize].keys
    }

    pub fn is_dictionary(&self, shape: ShapeId) -> bool {
        self.shapes[shape.0 as usize].dictionary
    }

    /// Transition to the shape that has `name` appended with `attrs`.
    /// Reuses an existing child when the same transition was taken before,
    /// so objects built in the same order converge on the same shape id.
    /// Returns the new shape and the slot index assigned to the property.
    pub fn transition_add(
        &mut self,
        shape: ShapeId,
        name: Atom,
        attrs: PropertyAttributes,
    ) -> (ShapeId, u32) {
        let key = (name, attrs.pack());
        if let Some(&child) = self.shapes[shape.0 as usize].transitions.get(&key) {
            let index = self.shapes[child.0 as usize].table[&name].index;
            return (child, index);
        }

        let parent = &self.shapes[shape.0 as usize];
        let index = parent.table.len() as u32;
        let mut table = parent.table.clone();
        let mut keys = parent.keys.clone();
        table.insert(name, SlotInfo { index, attrs });
        keys.push(name);

        let child = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            table,
            transitions: FxHashMap::default(),
            keys,
            dictionary: false,
        });
        self.shapes[shape.0 as usize].transitions.insert(key, child);
        (child, index)
    }

    /// Move to a private dictionary-mode shape with `name` removed.
    /// Dictionary shapes are never shared and never re-enter the tree.
    /// Slot indices of the remaining properties are preserved, so the
    /// caller only needs to clear the removed slot.
    pub fn transition_remove(&mut self, shape: ShapeId, name: Atom) -> ShapeId {
        let parent = &self.shapes[shape.0 as usize];
        let mut table = parent.table.clone();
        let mut keys = parent.keys.clone();
        table.remove(&name);
        keys.retain(|&k| k != name);

        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            table,
            transitions: FxHashMap::default(),
            keys,
            dictionary: true,
        });
        id
    }

    /// Change the attributes of an existing property. Shared shapes fork
    /// into dictionary mode; dictionary shapes mutate in place.
    pub fn transition_reconfigure(
        &mut self,
        shape: ShapeId,
        name: Atom,
        attrs: PropertyAttributes,
    ) -> ShapeId {
        if self.shapes[shape.0 as usize].dictionary {
            if let Some(info) = self.shapes[shape.0 as usize].table.get_mut(&name) {
                info.attrs = attrs;
            }
            return shape;
        }
        let parent = &self.shapes[shape.0 as usize];
        let mut table = parent.table.clone();
        let keys = parent.keys.clone();
        if let Some(info) = table.get_mut(&name) {
            info.attrs = attrs;
        }
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            table,
            transitions: FxHashMap::default(),
            keys,
            dictionary: true,
        });
        id
    }

    /// In dictionary mode, add a property in place
    pub fn dictionary_add(
        &mut self,
        shape: ShapeId,
        name: Atom,
        attrs: PropertyAttributes,
    ) -> u32 {
        debug_assert!(self.shapes[shape.0 as usize].dictionary);
        let node = &mut self.shapes[shape.0 as usize];
        // Reuse the next dense index; removed slots stay allocated
        let index = node
            .table
            .values()
            .map(|s| s.index + 1)
            .max()
            .unwrap_or(0);
        node.table.insert(name, SlotInfo { index, attrs });
        node.keys.push(name);
        index
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms() -> (Atom, Atom, Atom) {
        (Atom(0), Atom(1), Atom(2))
    }

    #[test]
    fn test_same_history_same_shape() {
        let (x, y, _) = atoms();
        let mut shapes = ShapeTable::new();

        let (s1, i1) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());
        let (s2, i2) = shapes.transition_add(s1, y, PropertyAttributes::data());

        // Second object built in the same order lands on the same ids
        let (t1, _) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());
        let (t2, _) = shapes.transition_add(t1, y, PropertyAttributes::data());
        assert_eq!(s1, t1);
        assert_eq!(s2, t2);
        assert_eq!(i1, 0);
        assert_eq!(i2, 1);
    }

    #[test]
    fn test_different_order_different_shape() {
        let (x, y, _) = atoms();
        let mut shapes = ShapeTable::new();

        let (s1, _) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());
        let (s_xy, _) = shapes.transition_add(s1, y, PropertyAttributes::data());

        let (t1, _) = shapes.transition_add(ShapeTable::EMPTY, y, PropertyAttributes::data());
        let (t_yx, _) = shapes.transition_add(t1, x, PropertyAttributes::data());

        assert_ne!(s_xy, t_yx);
    }

    #[test]
    fn test_lookup_and_keys() {
        let (x, y, _) = atoms();
        let mut shapes = ShapeTable::new();
        let (s1, _) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());
        let (s2, _) = shapes.transition_add(s1, y, PropertyAttributes::read_only());

        let info = shapes.lookup(s2, y).unwrap();
        assert_eq!(info.index, 1);
        assert!(!info.attrs.writable);
        assert_eq!(shapes.keys(s2), &[x, y]);
        assert!(shapes.lookup(ShapeTable::EMPTY, x).is_none());
    }

    #[test]
    fn test_delete_goes_dictionary() {
        let (x, y, _) = atoms();
        let mut shapes = ShapeTable::new();
        let (s1, _) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());
        let (s2, _) = shapes.transition_add(s1, y, PropertyAttributes::data());

        let d = shapes.transition_remove(s2, x);
        assert!(shapes.is_dictionary(d));
        assert!(shapes.lookup(d, x).is_none());
        // y keeps its original slot index
        assert_eq!(shapes.lookup(d, y).unwrap().index, 1);

        // Dictionary shapes are never shared
        let d2 = shapes.transition_remove(s2, x);
        assert_ne!(d, d2);
    }

    #[test]
    fn test_attribute_changes_fork() {
        let (x, _, _) = atoms();
        let mut shapes = ShapeTable::new();
        let (s1, _) = shapes.transition_add(ShapeTable::EMPTY, x, PropertyAttributes::data());

        let frozen = shapes.transition_reconfigure(
            s1,
            x,
            PropertyAttributes {
                writable: false,
                ..PropertyAttributes::data()
            },
        );
        assert_ne!(frozen, s1);
        // Original shape unchanged
        assert!(shapes.lookup(s1, x).unwrap().attrs.writable);
        assert!(!shapes.lookup(frozen, x).unwrap().attrs.writable);
    }
}
