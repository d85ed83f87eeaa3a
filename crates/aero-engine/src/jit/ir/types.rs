//! JIT type lattice
//!
//! Every IR value carries a conservative over-approximation of its runtime
//! type, refined by profile feedback and guards. The lattice:
//!
//! ```text
//! Unknown ⊃ Number ⊃ {Int, Double}
//!         ⊃ Boolean, String, Symbol, BigInt
//!         ⊃ Object ⊃ {Array, Function}
//!         ⊃ Null, Undefined
//! ```

use aero_core::ShapeId;

use crate::profiler::ObservedType;

/// A point in the type lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsType {
    Unknown,
    Number,
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

impl JsType {
    /// Direct parent in the lattice
    pub fn parent(self) -> Option<JsType> {
        match self {
            JsType::Unknown => None,
            JsType::Int | JsType::Double => Some(JsType::Number),
            JsType::Array | JsType::Function => Some(JsType::Object),
            _ => Some(JsType::Unknown),
        }
    }

    /// `self ⊆ other`
    pub fn is_subtype(self, other: JsType) -> bool {
        if self == other || other == JsType::Unknown {
            return true;
        }
        match self.parent() {
            Some(p) => p.is_subtype(other),
            None => false,
        }
    }

    /// Least upper bound
    pub fn join(self, other: JsType) -> JsType {
        if self.is_subtype(other) {
            return other;
        }
        if other.is_subtype(self) {
            return self;
        }
        match (self.parent(), other.parent()) {
            (Some(p), _) if other.is_subtype(p) => p,
            (_, Some(q)) if self.is_subtype(q) => q,
            _ => JsType::Unknown,
        }
    }

    /// Is this type definitely numeric
    pub fn is_numeric(self) -> bool {
        matches!(self, JsType::Number | JsType::Int | JsType::Double)
    }

    pub fn from_observed(o: ObservedType) -> JsType {
        match o {
            ObservedType::Int => JsType::Int,
            ObservedType::Double => JsType::Double,
            ObservedType::Boolean => JsType::Boolean,
            ObservedType::String => JsType::String,
            ObservedType::Symbol => JsType::Symbol,
            ObservedType::BigInt => JsType::BigInt,
            ObservedType::Object => JsType::Object,
            ObservedType::Array => JsType::Array,
            ObservedType::Function => JsType::Function,
            ObservedType::Null => JsType::Null,
            ObservedType::Undefined => JsType::Undefined,
        }
    }
}

/// Inclusive integer range attached to numeric values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumRange {
    pub lo: i64,
    pub hi: i64,
}

impl NumRange {
    pub fn exact(v: i64) -> NumRange {
        NumRange { lo: v, hi: v }
    }

    pub fn i32_full() -> NumRange {
        NumRange {
            lo: i32::MIN as i64,
            hi: i32::MAX as i64,
        }
    }

    pub fn union(self, other: NumRange) -> NumRange {
        NumRange {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn fits_i32(self) -> bool {
        self.lo >= i32::MIN as i64 && self.hi <= i32::MAX as i64
    }
}

/// Full annotation on an IR value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TypeInfo {
    pub ty: JsType,
    /// Known numeric range (for Int/Number values)
    pub range: Option<NumRange>,
    /// Known shape constraint (for object values behind a shape guard)
    pub shape: Option<ShapeId>,
}

impl TypeInfo {
    pub fn unknown() -> TypeInfo {
        TypeInfo {
            ty: JsType::Unknown,
            range: None,
            shape: None,
        }
    }

    pub fn of(ty: JsType) -> TypeInfo {
        TypeInfo {
            ty,
            range: None,
            shape: None,
        }
    }

    pub fn int_range(range: NumRange) -> TypeInfo {
        TypeInfo {
            ty: JsType::Int,
            range: Some(range),
            shape: None,
        }
    }

    /// Join two annotations (merge points)
    pub fn join(self, other: TypeInfo) -> TypeInfo {
        TypeInfo {
            ty: self.ty.join(other.ty),
            range: match (self.range, other.range) {
                (Some(a), Some(b)) => Some(a.union(b)),
                _ => None,
            },
            shape: if self.shape == other.shape {
                self.shape
            } else {
                None
            },
        }
    }
}

impl Default for TypeInfo {
    fn default() -> Self {
        TypeInfo::unknown()
    }
}
