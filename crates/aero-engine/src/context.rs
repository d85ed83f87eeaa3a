//! Execution context: scopes, globals, the property model, error state
//!
//! The context owns everything the interpreter needs besides the heap
//! itself: the lexical scope stack, the global object, the single current-
//! error slot, execution counters and the configuration flags. Property
//! lookup and assignment walk the prototype graph here; accessor
//! invocation is delegated to the caller through `LookupResult`, because
//! running a getter means running bytecode.

use rustc_hash::FxHashMap;

use aero_core::{
    Atom, Heap, JsError, ObjectData, ObjectId, PropertyAttributes, PropertyKey, PropertySlot,
    Value,
};

use crate::bytecode::DeclKind;

/// How a variable was declared, which controls reassignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Let,
    Const,
}

impl From<DeclKind> for BindingKind {
    fn from(d: DeclKind) -> Self {
        match d {
            DeclKind::Var => BindingKind::Var,
            DeclKind::Let => BindingKind::Let,
            DeclKind::Const => BindingKind::Const,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    value: Value,
    kind: BindingKind,
}

/// One lexical scope
#[derive(Debug, Default)]
struct Scope {
    bindings: FxHashMap<Atom, Binding>,
}

/// Outcome of a prototype-chain walk
#[derive(Debug, Clone, Copy)]
pub enum LookupResult {
    /// Found a data property
    Data(Value),
    /// Found an accessor; the caller invokes the getter with `this` bound
    /// to the original receiver
    Accessor { getter: Option<ObjectId> },
    /// Chain exhausted
    Missing,
}

/// Outcome of preparing a property store
#[derive(Debug, Clone, Copy)]
pub enum StoreResult {
    /// Stored as a data property
    Done,
    /// Found an accessor with a setter; caller invokes it
    Setter { setter: ObjectId },
    /// Rejected by a non-writable property or a setter-less accessor.
    /// Strict mode turns this into a TypeError; sloppy mode ignores it.
    Rejected,
}

/// Engine configuration honored by the context
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub strict_mode: bool,
    pub sandboxed: bool,
    pub execution_limit: Option<u64>,
    pub debug_mode: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            strict_mode: false,
            sandboxed: false,
            execution_limit: None,
            debug_mode: false,
        }
    }
}

/// A pending error: the structured kind plus the thrown script value
/// (which for `throw expr` can be any value, not just an Error object)
#[derive(Debug, Clone)]
pub struct PendingError {
    pub error: JsError,
    pub value: Option<Value>,
}

/// The execution context
pub struct Context {
    scopes: Vec<Scope>,
    global: ObjectId,
    error: Option<PendingError>,

    /// Instructions executed, incremented at safepoint granularity
    pub instructions_executed: u64,
    /// Counter value when the current top-level call began; the execution
    /// limit applies per call chain, so a limit abort leaves the engine
    /// usable for the next evaluate
    limit_base: u64,
    /// Completed GC cycles observed by this context
    pub gc_count: u64,

    pub config: ContextConfig,

    atom_length: Atom,
}

impl Context {
    pub fn new(heap: &mut Heap, config: ContextConfig) -> Self {
        let global = heap.alloc_object(None).object_id().unwrap();
        let atom_length = heap.atoms.intern("length");
        Context {
            scopes: vec![Scope::default()],
            global,
            error: None,
            instructions_executed: 0,
            limit_base: 0,
            gc_count: 0,
            config,
            atom_length,
        }
    }

    pub fn global_object(&self) -> ObjectId {
        self.global
    }

    // ===== Scopes =====

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popping the outermost scope");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Pop scopes down to `depth` (exception unwinding)
    pub fn truncate_scopes(&mut self, depth: usize) {
        while self.scopes.len() > depth.max(1) {
            self.scopes.pop();
        }
    }

    /// Declare a variable in the innermost scope
    pub fn declare_variable(&mut self, name: Atom, kind: BindingKind, value: Value) {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        scope.bindings.insert(name, Binding { value, kind });
    }

    /// Walk the scope chain, then the global object
    pub fn get_variable(&self, heap: &Heap, name: Atom) -> Result<Value, JsError> {
        for scope in self.scopes.iter().rev() {
            if let Some(b) = scope.bindings.get(&name) {
                return Ok(b.value);
            }
        }
        match self.lookup_named(heap, self.global, name) {
            LookupResult::Data(v) => Ok(v),
            LookupResult::Accessor { .. } => Ok(Value::undefined()),
            LookupResult::Missing => Err(JsError::reference(format!(
                "{} is not defined",
                heap.atoms.name(name)
            ))),
        }
    }

    /// Assign to an existing binding, or fall through to the global object.
    /// Missing targets create a global in sloppy mode and raise a
    /// ReferenceError in strict mode.
    pub fn set_variable(&mut self, heap: &mut Heap, name: Atom, value: Value) -> Result<(), JsError> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(b) = scope.bindings.get_mut(&name) {
                if b.kind == BindingKind::Const {
                    return Err(JsError::type_error(format!(
                        "assignment to constant variable {}",
                        heap.atoms.name(name)
                    )));
                }
                b.value = value;
                return Ok(());
            }
        }
        let exists = matches!(
            self.lookup_named(heap, self.global, name),
            LookupResult::Data(_) | LookupResult::Accessor { .. }
        );
        if !exists && self.config.strict_mode {
            return Err(JsError::reference(format!(
                "{} is not defined",
                heap.atoms.name(name)
            )));
        }
        self.define_data_property(heap, self.global, name, value);
        Ok(())
    }

    /// Whether a binding (or global property) exists
    pub fn has_variable(&self, heap: &Heap, name: Atom) -> bool {
        self.scopes
            .iter()
            .rev()
            .any(|s| s.bindings.contains_key(&name))
            || !matches!(
                self.lookup_named(heap, self.global, name),
                LookupResult::Missing
            )
    }

    /// Every value reachable from the scope stack, for GC rooting
    pub fn scope_roots(&self) -> Vec<Value> {
        self.scopes
            .iter()
            .flat_map(|s| s.bindings.values().map(|b| b.value))
            .collect()
    }

    // ===== Property model =====

    /// Walk `start`'s prototype chain for a named property
    pub fn lookup_named(&self, heap: &Heap, start: ObjectId, name: Atom) -> LookupResult {
        let mut current = Some(start);
        let mut hops = 0;
        while let Some(id) = current {
            let obj = heap.object(id);
            // Array `length` is virtual
            if name == self.atom_length {
                if let ObjectData::Array(storage) = &obj.data {
                    return LookupResult::Data(Value::from_f64_normalized(storage.length as f64));
                }
            }
            if let Some(info) = heap.shapes.lookup(obj.shape, name) {
                return match obj.slots.get(info.index as usize) {
                    Some(PropertySlot::Data(v)) => LookupResult::Data(*v),
                    Some(PropertySlot::Accessor { getter, .. }) => {
                        LookupResult::Accessor { getter: *getter }
                    }
                    None => LookupResult::Data(Value::undefined()),
                };
            }
            current = obj.prototype;
            hops += 1;
            if hops > 10_000 {
                // Prototype cycles are representable in the arena; stop
                // walking rather than hang
                break;
            }
        }
        LookupResult::Missing
    }

    /// Look up a property by key on a value receiver. Primitive receivers
    /// support `length` on strings and element reads; everything else
    /// resolves through the object graph.
    pub fn lookup_property(
        &self,
        heap: &Heap,
        receiver: Value,
        key: PropertyKey,
    ) -> Result<LookupResult, JsError> {
        if receiver.is_nullish() {
            return Err(JsError::type_error(format!(
                "cannot read properties of {}",
                heap.to_display(receiver)
            )));
        }
        let Some(id) = receiver.object_id() else {
            // Primitive receiver: only string length / index reads
            if receiver.is_number() || receiver.is_boolean() {
                return Ok(LookupResult::Missing);
            }
            return Ok(LookupResult::Missing);
        };

        if receiver.is_string() {
            let s = heap.string(id);
            match key {
                PropertyKey::Atom(a) if a == self.atom_length => {
                    return Ok(LookupResult::Data(Value::integer(s.utf16_len() as i32)));
                }
                PropertyKey::Index(i) => {
                    let unit = s.as_str().encode_utf16().nth(i as usize);
                    return Ok(match unit {
                        Some(_) => LookupResult::Data(Value::undefined()), // char values need allocation; handled by caller
                        None => LookupResult::Missing,
                    });
                }
                _ => return Ok(LookupResult::Missing),
            }
        }
        if !receiver.is_object_like() {
            return Ok(LookupResult::Missing);
        }

        match key {
            PropertyKey::Index(index) => {
                // Element storage on arrays; dense keys on plain objects
                // fall back to named slots via their decimal atom
                let obj = heap.object(id);
                if let ObjectData::Array(storage) = &obj.data {
                    return Ok(match storage.get(index) {
                        Some(v) => LookupResult::Data(v),
                        None => {
                            // Holes consult the prototype chain
                            match obj.prototype {
                                Some(p) => self.lookup_index_on_chain(heap, p, index),
                                None => LookupResult::Missing,
                            }
                        }
                    });
                }
                Ok(LookupResult::Missing)
            }
            PropertyKey::Atom(name) => Ok(self.lookup_named(heap, id, name)),
            PropertyKey::Symbol(_) => Ok(LookupResult::Missing),
        }
    }

    fn lookup_index_on_chain(&self, heap: &Heap, start: ObjectId, index: u32) -> LookupResult {
        let mut current = Some(start);
        while let Some(id) = current {
            let obj = heap.object(id);
            if let ObjectData::Array(storage) = &obj.data {
                if let Some(v) = storage.get(index) {
                    return LookupResult::Data(v);
                }
            }
            current = obj.prototype;
        }
        LookupResult::Missing
    }

    /// Prepare a named-property store with full chain semantics: an
    /// accessor anywhere on the chain wins; a non-writable data property
    /// anywhere on the chain rejects; otherwise the receiver gets an own
    /// data property.
    pub fn store_named(
        &self,
        heap: &mut Heap,
        receiver: ObjectId,
        name: Atom,
        value: Value,
    ) -> StoreResult {
        // Own property first
        let own = heap.shapes.lookup(heap.object(receiver).shape, name);
        if let Some(info) = own {
            match heap.object(receiver).slots.get(info.index as usize) {
                Some(PropertySlot::Accessor { setter, .. }) => {
                    return match setter {
                        Some(s) => StoreResult::Setter { setter: *s },
                        None => StoreResult::Rejected,
                    };
                }
                _ => {
                    if !info.attrs.writable {
                        return StoreResult::Rejected;
                    }
                    heap.set_slot(receiver, info.index, value);
                    return StoreResult::Done;
                }
            }
        }

        // Walk the prototype chain for accessors / read-only properties
        let mut current = heap.object(receiver).prototype;
        let mut hops = 0;
        while let Some(id) = current {
            let obj = heap.object(id);
            if let Some(info) = heap.shapes.lookup(obj.shape, name) {
                match obj.slots.get(info.index as usize) {
                    Some(PropertySlot::Accessor { setter, .. }) => {
                        return match setter {
                            Some(s) => StoreResult::Setter { setter: *s },
                            None => StoreResult::Rejected,
                        };
                    }
                    _ => {
                        if !info.attrs.writable {
                            return StoreResult::Rejected;
                        }
                        break; // writable data on the chain: shadow it
                    }
                }
            }
            current = obj.prototype;
            hops += 1;
            if hops > 10_000 {
                break;
            }
        }

        self.define_data_property(heap, receiver, name, value);
        StoreResult::Done
    }

    /// Define (or overwrite) an own data property with default attributes
    pub fn define_data_property(&self, heap: &mut Heap, id: ObjectId, name: Atom, value: Value) {
        let shape = heap.object(id).shape;
        if let Some(info) = heap.shapes.lookup(shape, name) {
            heap.set_slot(id, info.index, value);
            return;
        }
        let (new_shape, index) = if heap.shapes.is_dictionary(shape) {
            let index = heap.shapes.dictionary_add(shape, name, PropertyAttributes::data());
            (shape, index)
        } else {
            heap.shapes
                .transition_add(shape, name, PropertyAttributes::data())
        };
        heap.set_shape(id, new_shape);
        heap.set_slot(id, index, value);
    }

    /// Define an own property with explicit attributes
    pub fn define_property_with_attrs(
        &self,
        heap: &mut Heap,
        id: ObjectId,
        name: Atom,
        value: Value,
        attrs: PropertyAttributes,
    ) {
        let shape = heap.object(id).shape;
        if heap.shapes.lookup(shape, name).is_some() {
            let new_shape = heap.shapes.transition_reconfigure(shape, name, attrs);
            heap.set_shape(id, new_shape);
            let info = heap.shapes.lookup(new_shape, name).unwrap();
            heap.set_slot(id, info.index, value);
            return;
        }
        let (new_shape, index) = if heap.shapes.is_dictionary(shape) {
            let index = heap.shapes.dictionary_add(shape, name, attrs);
            (shape, index)
        } else {
            heap.shapes.transition_add(shape, name, attrs)
        };
        heap.set_shape(id, new_shape);
        heap.set_slot(id, index, value);
    }

    /// Define an accessor property
    pub fn define_accessor(
        &self,
        heap: &mut Heap,
        id: ObjectId,
        name: Atom,
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
    ) {
        let shape = heap.object(id).shape;
        let attrs = PropertyAttributes::accessor();
        let (new_shape, index) = if let Some(info) = heap.shapes.lookup(shape, name) {
            let s = heap.shapes.transition_reconfigure(shape, name, attrs);
            (s, info.index)
        } else if heap.shapes.is_dictionary(shape) {
            let index = heap.shapes.dictionary_add(shape, name, attrs);
            (shape, index)
        } else {
            heap.shapes.transition_add(shape, name, attrs)
        };
        heap.set_shape(id, new_shape);
        heap.set_accessor_slot(id, index, getter, setter);
    }

    /// Delete an own property. Non-configurable properties reject.
    pub fn delete_named(&self, heap: &mut Heap, id: ObjectId, name: Atom) -> bool {
        let shape = heap.object(id).shape;
        let Some(info) = heap.shapes.lookup(shape, name) else {
            return true; // deleting a missing property succeeds
        };
        if !info.attrs.configurable {
            return false;
        }
        let new_shape = heap.shapes.transition_remove(shape, name);
        heap.set_shape(id, new_shape);
        if let Some(slot) = heap.object_mut(id).slots.get_mut(info.index as usize) {
            *slot = PropertySlot::Data(Value::undefined());
        }
        true
    }

    // ===== Error slot =====

    /// Record a failure. Operations that fail set the slot and return a
    /// sentinel `Undefined`; callers check and propagate.
    pub fn set_error(&mut self, error: JsError) {
        if self.error.is_none() || !matches!(self.error, Some(ref p) if !p.error.kind.is_catchable())
        {
            self.error = Some(PendingError { error, value: None });
        }
    }

    /// Record a script-level `throw` with its value
    pub fn set_thrown(&mut self, error: JsError, value: Value) {
        self.error = Some(PendingError {
            error,
            value: Some(value),
        });
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<PendingError> {
        self.error.take()
    }

    pub fn peek_error(&self) -> Option<&PendingError> {
        self.error.as_ref()
    }

    // ===== Execution limit =====

    /// Bump the instruction counter and enforce the execution limit.
    /// Called at safepoint granularity with the number of instructions
    /// retired since the last check.
    pub fn tick(&mut self, instructions: u64) -> Result<(), JsError> {
        self.instructions_executed += instructions;
        if let Some(limit) = self.config.execution_limit {
            if self.instructions_executed - self.limit_base > limit {
                return Err(JsError::new(
                    aero_core::ErrorKind::ExecutionLimit,
                    format!("execution limit of {limit} instructions exceeded"),
                ));
            }
        }
        Ok(())
    }

    /// Start a fresh execution-limit window (top-level call entry)
    pub fn reset_limit_window(&mut self) {
        self.limit_base = self.instructions_executed;
    }
}
