//! ECMAScript conversion and comparison semantics
//!
//! These are the operations every opcode and builtin funnels through:
//! ToNumber, ToString, ToBoolean, ToInt32, the three equality relations and
//! the abstract relational comparison. String-to-number follows the
//! ECMAScript ToNumber grammar on the trimmed body: invalid input is NaN,
//! never an error. Symbols and BigInts reject numeric coercion with a
//! TypeError, matching the language.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::error::{ErrorKind, JsError};
use crate::heap::{Heap, ObjectId};
use crate::object::{ObjectData, PropertySlot};
use crate::value::{HeapKind, Value};

impl Heap {
    /// `typeof` string for a value
    pub fn type_of(&self, v: Value) -> &'static str {
        if v.is_undefined() {
            "undefined"
        } else if v.is_null() {
            "object"
        } else if v.is_boolean() {
            "boolean"
        } else if v.is_number() {
            "number"
        } else {
            match v.heap_kind() {
                Some(HeapKind::String) => "string",
                Some(HeapKind::Symbol) => "symbol",
                Some(HeapKind::BigInt) => "bigint",
                Some(HeapKind::Function) => "function",
                _ => "object",
            }
        }
    }

    /// ToBoolean
    pub fn to_boolean(&self, v: Value) -> bool {
        if let Some(b) = v.as_boolean() {
            return b;
        }
        if v.is_nullish() || v.is_hole() {
            return false;
        }
        if let Some(n) = v.as_number() {
            return n != 0.0 && !n.is_nan();
        }
        if let Some(id) = v.object_id() {
            if v.is_string() {
                return !self.string(id).as_str().is_empty();
            }
            if v.is_bigint() {
                return self.bigint(id).0 != 0;
            }
        }
        true
    }

    /// Alias used by branch opcodes
    #[inline]
    pub fn is_truthy(&self, v: Value) -> bool {
        self.to_boolean(v)
    }

    /// ToNumber. Symbols and BigInts raise TypeError.
    pub fn to_number(&self, v: Value) -> Result<f64, JsError> {
        if let Some(n) = v.as_number() {
            return Ok(n);
        }
        if v.is_undefined() {
            return Ok(f64::NAN);
        }
        if v.is_null() {
            return Ok(0.0);
        }
        if let Some(b) = v.as_boolean() {
            return Ok(if b { 1.0 } else { 0.0 });
        }
        match v.heap_kind() {
            Some(HeapKind::String) => Ok(string_to_number(
                self.string(v.object_id().unwrap()).as_str(),
            )),
            Some(HeapKind::Symbol) => Err(JsError::new(
                ErrorKind::Type,
                "cannot convert a Symbol value to a number",
            )),
            Some(HeapKind::BigInt) => Err(JsError::new(
                ErrorKind::Type,
                "cannot convert a BigInt value to a number",
            )),
            _ => {
                let prim = self.object_to_primitive(v, PrimitiveHint::Number);
                self.to_number(prim)
            }
        }
    }

    /// ToInt32: modulo-2³² wrap of the numeric value
    pub fn to_int32(&self, v: Value) -> Result<i32, JsError> {
        if let Some(i) = v.as_integer() {
            return Ok(i);
        }
        let n = self.to_number(v)?;
        Ok(f64_to_int32(n))
    }

    /// ToString, allocating a heap string. Symbols raise TypeError.
    pub fn to_string_value(&mut self, v: Value) -> Result<Value, JsError> {
        if v.is_string() {
            return Ok(v);
        }
        if v.is_symbol() {
            return Err(JsError::new(
                ErrorKind::Type,
                "cannot convert a Symbol value to a string",
            ));
        }
        let s = self.to_display(v);
        Ok(self.alloc_string(&s))
    }

    /// The string form of a value without allocating. Symbols render their
    /// diagnostic form; script-level ToString(Symbol) goes through
    /// `to_string_value` which rejects.
    pub fn to_display(&self, v: Value) -> String {
        if v.is_undefined() {
            return "undefined".to_string();
        }
        if v.is_null() {
            return "null".to_string();
        }
        if let Some(b) = v.as_boolean() {
            return b.to_string();
        }
        if let Some(i) = v.as_integer() {
            return i.to_string();
        }
        if let Some(d) = v.as_double() {
            return number_to_string(d);
        }
        let Some((kind, id)) = v.as_handle() else {
            return "undefined".to_string();
        };
        match kind {
            HeapKind::String => self.string(id).as_str().to_string(),
            HeapKind::Symbol => {
                let desc = self
                    .symbol(id)
                    .description
                    .as_deref()
                    .unwrap_or("");
                format!("Symbol({desc})")
            }
            HeapKind::BigInt => self.bigint(id).0.to_string(),
            HeapKind::Function => "function () { [native code] }".to_string(),
            HeapKind::Array => {
                let obj = self.object(id);
                match &obj.data {
                    ObjectData::Array(storage) => {
                        let mut parts: Vec<String> = Vec::new();
                        for i in 0..storage.length {
                            match storage.get(i) {
                                Some(el) if !el.is_nullish() => parts.push(self.to_display(el)),
                                _ => parts.push(String::new()),
                            }
                        }
                        parts.join(",")
                    }
                    _ => String::new(),
                }
            }
            HeapKind::Object => "[object Object]".to_string(),
        }
    }

    fn object_to_primitive(&self, v: Value, hint: PrimitiveHint) -> Value {
        // Without user-defined valueOf/toString hooks, objects convert
        // through their default string form; the number hint then parses it.
        let _ = hint;
        match v.heap_kind() {
            Some(HeapKind::Array) | Some(HeapKind::Object) | Some(HeapKind::Function) => {
                // Conversion result is primitive; representing it as a
                // number directly avoids allocation in the const heap path.
                let s = self.to_display(v);
                Value::number(string_to_number(&s))
            }
            _ => v,
        }
    }

    // ===== Equality =====

    /// `===`
    pub fn strict_equals(&self, a: Value, b: Value) -> bool {
        // Numbers compare numerically across SMI/double representations
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return x == y; // NaN != NaN falls out of IEEE compare
        }
        if a.is_number() || b.is_number() {
            return false;
        }
        if a.to_bits() == b.to_bits() {
            return true;
        }
        match (a.as_handle(), b.as_handle()) {
            (Some((HeapKind::String, ia)), Some((HeapKind::String, ib))) => {
                self.string(ia).as_str() == self.string(ib).as_str()
            }
            (Some((HeapKind::BigInt, ia)), Some((HeapKind::BigInt, ib))) => {
                self.bigint(ia) == self.bigint(ib)
            }
            _ => false,
        }
    }

    /// SameValue: like `===` but NaN equals NaN and +0 differs from -0
    pub fn same_value(&self, a: Value, b: Value) -> bool {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            if x.is_nan() && y.is_nan() {
                return true;
            }
            if x == 0.0 && y == 0.0 {
                return x.is_sign_positive() == y.is_sign_positive();
            }
            return x == y;
        }
        self.strict_equals(a, b)
    }

    /// `==` with the ECMAScript coercion ladder
    pub fn loose_equals(&self, a: Value, b: Value) -> Result<bool, JsError> {
        // Fast path: same type
        if self.same_type(a, b) {
            return Ok(self.strict_equals(a, b));
        }
        // null == undefined
        if a.is_nullish() && b.is_nullish() {
            return Ok(true);
        }
        if a.is_nullish() || b.is_nullish() {
            return Ok(false);
        }
        // Number vs string / bool vs anything: coerce to numbers
        if a.is_number() && b.is_string() {
            return Ok(self.to_number(a)? == self.to_number(b)?);
        }
        if a.is_string() && b.is_number() {
            return Ok(self.to_number(a)? == self.to_number(b)?);
        }
        if a.is_boolean() {
            return self.loose_equals(Value::number(self.to_number(a)?), b);
        }
        if b.is_boolean() {
            return self.loose_equals(a, Value::number(self.to_number(b)?));
        }
        // Object vs primitive: object converts to primitive
        if a.is_object_like() && (b.is_number() || b.is_string()) {
            let prim = self.object_to_primitive(a, PrimitiveHint::Default);
            return self.loose_equals(prim, b);
        }
        if b.is_object_like() && (a.is_number() || a.is_string()) {
            let prim = self.object_to_primitive(b, PrimitiveHint::Default);
            return self.loose_equals(a, prim);
        }
        Ok(false)
    }

    fn same_type(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return true;
        }
        match (a.as_handle(), b.as_handle()) {
            (Some((ka, _)), Some((kb, _))) => {
                let obj = |k: HeapKind| {
                    matches!(k, HeapKind::Object | HeapKind::Array | HeapKind::Function)
                };
                ka == kb || (obj(ka) && obj(kb))
            }
            (None, None) => {
                (a.is_boolean() && b.is_boolean())
                    || (a.is_undefined() && b.is_undefined())
                    || (a.is_null() && b.is_null())
            }
            _ => false,
        }
    }

    /// Abstract relational comparison for `<` `<=` `>` `>=`.
    /// `None` means an incomparable pair (a NaN operand).
    pub fn compare(&self, a: Value, b: Value) -> Result<Option<Ordering>, JsError> {
        // Two strings compare lexicographically by code unit
        if let (Some((HeapKind::String, ia)), Some((HeapKind::String, ib))) =
            (a.as_handle(), b.as_handle())
        {
            return Ok(Some(self.string(ia).as_str().cmp(self.string(ib).as_str())));
        }
        let x = self.to_number(a)?;
        let y = self.to_number(b)?;
        Ok(x.partial_cmp(&y))
    }

    // ===== Hashing and cloning =====

    /// Hash consistent with `strict_equals`: equal values hash equally.
    /// Numbers hash their canonical double bits (SMI and double forms of
    /// the same number agree, -0 folds into +0); strings hash content.
    pub fn hash_value(&self, v: Value) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        if let Some(n) = v.as_number() {
            let bits = if n == 0.0 { 0u64 } else { n.to_bits() };
            (0u8, bits).hash(&mut hasher);
        } else if let Some((kind, id)) = v.as_handle() {
            match kind {
                HeapKind::String => (1u8, self.string(id).as_str()).hash(&mut hasher),
                HeapKind::BigInt => (2u8, self.bigint(id).0).hash(&mut hasher),
                _ => (3u8, v.to_bits()).hash(&mut hasher),
            }
        } else {
            (4u8, v.to_bits()).hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Clone a value: primitives are copied, strings and objects get a
    /// fresh cell (shallow for objects — slot values are shared).
    pub fn clone_value(&mut self, v: Value) -> Value {
        let Some((kind, id)) = v.as_handle() else {
            return v;
        };
        match kind {
            HeapKind::String => {
                let s = self.string(id).as_str().to_string();
                self.alloc_string(&s)
            }
            HeapKind::Symbol | HeapKind::BigInt | HeapKind::Function => v,
            HeapKind::Object | HeapKind::Array => {
                let copy = self.object(id).clone();
                let new_id = self.clone_insert(copy);
                // Shallow copy shares referents; shade them for the barrier
                let referents: Vec<Value> = self
                    .object(new_id)
                    .slots
                    .iter()
                    .filter_map(|s| match s {
                        PropertySlot::Data(val) => Some(*val),
                        _ => None,
                    })
                    .collect();
                for r in referents {
                    self.write_barrier(r);
                }
                self.value_of(new_id)
            }
        }
    }

    fn clone_insert(&mut self, obj: crate::object::JsObject) -> ObjectId {
        let v = match obj.data {
            ObjectData::Array(_) => {
                self.alloc_array(obj.prototype, crate::object::ArrayStorage::new())
            }
            ObjectData::Function(data) => self.alloc_function(obj.prototype, data),
            ObjectData::Plain => self.alloc_object(obj.prototype),
        };
        let id = v.object_id().unwrap();
        let shape = obj.shape;
        *self.object_mut(id) = obj;
        self.set_shape(id, shape);
        id
    }
}

#[derive(Debug, Clone, Copy)]
enum PrimitiveHint {
    Default,
    Number,
}

/// ECMAScript ToInt32 on a double
pub fn f64_to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let m = n.trunc();
    let modulus = m.rem_euclid(4294967296.0);
    if modulus >= 2147483648.0 {
        (modulus - 4294967296.0) as i32
    } else {
        modulus as i32
    }
}

/// ECMAScript ToNumber applied to a string body
pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim_matches(|c: char| {
        c.is_whitespace() || c == '\u{FEFF}' || c == '\u{000B}' || c == '\u{000C}'
    });
    if t.is_empty() {
        return 0.0;
    }

    // Radix-prefixed integer literals (no sign permitted)
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return parse_radix(hex, 16);
    }
    if let Some(oct) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        return parse_radix(oct, 8);
    }
    if let Some(bin) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        return parse_radix(bin, 2);
    }

    let (sign, body) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    // Decimal literal: digits, optional fraction, optional exponent.
    // Rust's f64 parser accepts a superset ("inf", "nan", leading dots are
    // fine in both); reject the forms it allows that JS does not,
    // including a second sign after the one already consumed.
    if body.is_empty()
        || body == "."
        || body.starts_with('+')
        || body.starts_with('-')
        || !body
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return f64::NAN;
    }
    match body.parse::<f64>() {
        Ok(v) => sign * v,
        Err(_) => f64::NAN,
    }
}

fn parse_radix(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() {
        return f64::NAN;
    }
    let mut acc = 0.0f64;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => acc = acc * radix as f64 + d as f64,
            None => return f64::NAN,
        }
    }
    acc
}

/// JS Number-to-string: "NaN", signed "Infinity", "-0" renders as "0",
/// integers without a decimal point, otherwise the shortest round-trip
/// decimal form.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    format!("{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(0)
    }

    #[test]
    fn test_type_of() {
        let mut h = heap();
        let s = h.alloc_string("x");
        let o = h.alloc_object(None);
        assert_eq!(h.type_of(Value::undefined()), "undefined");
        assert_eq!(h.type_of(Value::null()), "object");
        assert_eq!(h.type_of(Value::boolean(true)), "boolean");
        assert_eq!(h.type_of(Value::integer(1)), "number");
        assert_eq!(h.type_of(Value::number(1.5)), "number");
        assert_eq!(h.type_of(s), "string");
        assert_eq!(h.type_of(o), "object");
    }

    #[test]
    fn test_to_boolean() {
        let mut h = heap();
        let empty = h.alloc_string("");
        let full = h.alloc_string("a");
        let obj = h.alloc_object(None);
        assert!(!h.to_boolean(Value::undefined()));
        assert!(!h.to_boolean(Value::null()));
        assert!(!h.to_boolean(Value::integer(0)));
        assert!(!h.to_boolean(Value::number(-0.0)));
        assert!(!h.to_boolean(Value::number(f64::NAN)));
        assert!(!h.to_boolean(empty));
        assert!(h.to_boolean(full));
        assert!(h.to_boolean(obj));
        assert!(h.to_boolean(Value::integer(-1)));
    }

    #[test]
    fn test_string_to_number_grammar() {
        assert_eq!(string_to_number("42"), 42.0);
        assert_eq!(string_to_number("  42  "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("   "), 0.0);
        assert_eq!(string_to_number("3.5e2"), 350.0);
        assert_eq!(string_to_number("-7"), -7.0);
        assert_eq!(string_to_number("+7"), 7.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("0XFF"), 255.0);
        assert_eq!(string_to_number("0o17"), 15.0);
        assert_eq!(string_to_number("0b101"), 5.0);
        assert_eq!(string_to_number("Infinity"), f64::INFINITY);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(string_to_number("abc").is_nan());
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("0xZZ").is_nan());
        assert!(string_to_number("-0x10").is_nan()); // sign + hex is invalid
        assert!(string_to_number("+-1").is_nan());
        assert!(string_to_number("--1").is_nan());
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("nan").is_nan());
    }

    #[test]
    fn test_to_number_values() {
        let mut h = heap();
        let s = h.alloc_string("5");
        assert!(h.to_number(Value::undefined()).unwrap().is_nan());
        assert_eq!(h.to_number(Value::null()).unwrap(), 0.0);
        assert_eq!(h.to_number(Value::boolean(true)).unwrap(), 1.0);
        assert_eq!(h.to_number(s).unwrap(), 5.0);
        let sym = h.alloc_symbol(None);
        assert_eq!(h.to_number(sym).unwrap_err().kind, ErrorKind::Type);
    }

    #[test]
    fn test_to_int32_wrapping() {
        assert_eq!(f64_to_int32(0.0), 0);
        assert_eq!(f64_to_int32(-1.0), -1);
        assert_eq!(f64_to_int32(2147483648.0), i32::MIN);
        assert_eq!(f64_to_int32(4294967296.0), 0);
        assert_eq!(f64_to_int32(4294967297.0), 1);
        assert_eq!(f64_to_int32(f64::NAN), 0);
        assert_eq!(f64_to_int32(f64::INFINITY), 0);
        assert_eq!(f64_to_int32(-2147483649.0), i32::MAX);
    }

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(1.5), "1.5");
    }

    #[test]
    fn test_to_string_to_number_round_trip() {
        let mut h = heap();
        for n in [0.5, 1.0, -3.25, 1e10, 123456.789, -0.001] {
            let v = Value::number(n);
            let s = h.to_string_value(v).unwrap();
            assert_eq!(h.to_number(s).unwrap(), h.to_number(v).unwrap());
        }
    }

    #[test]
    fn test_strict_equals() {
        let mut h = heap();
        let s1 = h.alloc_string("abc");
        let s2 = h.alloc_string("abc");
        let s3 = h.alloc_string("xyz");
        let o1 = h.alloc_object(None);
        let o2 = h.alloc_object(None);

        assert!(h.strict_equals(Value::integer(1), Value::number(1.0)));
        assert!(!h.strict_equals(Value::number(f64::NAN), Value::number(f64::NAN)));
        assert!(h.strict_equals(Value::number(0.0), Value::number(-0.0)));
        assert!(h.strict_equals(s1, s2)); // content equality
        assert!(!h.strict_equals(s1, s3));
        assert!(h.strict_equals(o1, o1)); // identity
        assert!(!h.strict_equals(o1, o2));
        assert!(!h.strict_equals(Value::integer(0), Value::boolean(false)));
        assert!(!h.strict_equals(Value::undefined(), Value::null()));
    }

    #[test]
    fn test_same_value_edges() {
        let h = heap();
        assert!(h.same_value(Value::number(f64::NAN), Value::number(f64::NAN)));
        assert!(!h.same_value(Value::number(0.0), Value::number(-0.0)));
        assert!(h.same_value(Value::integer(3), Value::number(3.0)));
    }

    #[test]
    fn test_loose_equals() {
        let mut h = heap();
        let five = h.alloc_string("5");
        let empty = h.alloc_string("");
        assert!(h.loose_equals(Value::null(), Value::undefined()).unwrap());
        assert!(!h.loose_equals(Value::null(), Value::integer(0)).unwrap());
        assert!(h.loose_equals(Value::integer(5), five).unwrap());
        assert!(h.loose_equals(Value::boolean(false), empty).unwrap());
        assert!(h
            .loose_equals(Value::boolean(true), Value::integer(1))
            .unwrap());
        assert!(!h
            .loose_equals(Value::number(f64::NAN), Value::number(f64::NAN))
            .unwrap());
    }

    #[test]
    fn test_compare() {
        let mut h = heap();
        let a = h.alloc_string("apple");
        let b = h.alloc_string("banana");
        let ten = h.alloc_string("10");
        assert_eq!(
            h.compare(Value::integer(1), Value::integer(2)).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(h.compare(a, b).unwrap(), Some(Ordering::Less));
        // String/number pairs compare numerically: "10" < 9 is false
        assert_eq!(
            h.compare(ten, Value::integer(9)).unwrap(),
            Some(Ordering::Greater)
        );
        assert_eq!(
            h.compare(Value::number(f64::NAN), Value::integer(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_hash_consistent_with_strict_equals() {
        let mut h = heap();
        let s1 = h.alloc_string("k");
        let s2 = h.alloc_string("k");
        assert_eq!(
            h.hash_value(Value::integer(7)),
            h.hash_value(Value::number(7.0))
        );
        assert_eq!(
            h.hash_value(Value::number(0.0)),
            h.hash_value(Value::number(-0.0))
        );
        assert_eq!(h.hash_value(s1), h.hash_value(s2));
    }

    #[test]
    fn test_clone_primitives_strict_equal() {
        let mut h = heap();
        let vals = [
            Value::undefined(),
            Value::null(),
            Value::boolean(true),
            Value::integer(-5),
            Value::number(2.5),
        ];
        for v in vals {
            let c = h.clone_value(v);
            assert!(h.strict_equals(c, v) || (v.is_undefined() && c.is_undefined()) || v.is_null());
        }
        let s = h.alloc_string("dup");
        let c = h.clone_value(s);
        assert_ne!(c.object_id(), s.object_id());
        assert!(h.strict_equals(c, s));
    }

    #[test]
    fn test_integer_overflow_promotes() {
        // i32 add that overflows must widen to double, silently
        let a = i32::MAX;
        let sum = a as i64 + 1;
        let v = Value::from_f64_normalized(sum as f64);
        assert!(v.is_double());
        assert_eq!(v.as_double(), Some(2147483648.0));
    }
}
