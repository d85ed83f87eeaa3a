//! Core runtime for the Aero JavaScript engine
//!
//! This crate owns the pieces every tier of the engine shares:
//! - NaN-boxed 64-bit `Value` with ECMAScript conversion semantics
//! - The object model: shapes (hidden classes), property slots, array
//!   element storage, function cells
//! - The arena heap and its incremental mark-sweep collector
//! - The error taxonomy surfaced to script code
//!
//! Execution (bytecode, interpreter, profiler, JIT tiers) lives in
//! `aero-engine`, which addresses functions here through opaque
//! `FunctionId`s.

pub mod convert;
pub mod error;
pub mod gc;
pub mod heap;
pub mod object;
pub mod shape;
pub mod string;
pub mod value;

pub use error::{ErrorKind, JsError};
pub use heap::{Heap, HeapCell, ObjectId};
pub use object::{
    ArrayStorage, Elements, FunctionData, FunctionId, FunctionKind, JsObject, ObjectData,
    PropertySlot,
};
pub use shape::{PropertyAttributes, ShapeId, ShapeTable, SlotInfo};
pub use string::{Atom, AtomTable, JsBigInt, JsString, JsSymbol, PropertyKey};
pub use value::{HeapKind, Value};
