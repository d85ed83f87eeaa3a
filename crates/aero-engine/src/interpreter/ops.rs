//! Generic operation semantics shared by the interpreter and the JIT's
//! runtime helpers
//!
//! Every slow path funnels through these functions, so deoptimized code
//! and interpreted code observe identical results by construction.

use std::cmp::Ordering;

use aero_core::{Heap, JsError, Value};

use crate::bytecode::Opcode;

/// `+` with full ECMAScript semantics: string concatenation when either
/// side converts to a string, numeric addition otherwise. Integer
/// arithmetic that overflows i32 silently widens to a double.
pub fn add(heap: &mut Heap, a: Value, b: Value) -> Result<Value, JsError> {
    // SMI fast path
    if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
        return Ok(match x.checked_add(y) {
            Some(sum) => Value::integer(sum),
            None => Value::number(x as f64 + y as f64),
        });
    }
    if a.is_string() || b.is_string() {
        let sa = heap.to_display(a);
        let sb = heap.to_display(b);
        return Ok(heap.alloc_string(&format!("{sa}{sb}")));
    }
    // Objects convert to primitives; a string-ish primitive concatenates
    if a.is_object_like() || b.is_object_like() {
        let sa = heap.to_display(a);
        let sb = heap.to_display(b);
        return Ok(heap.alloc_string(&format!("{sa}{sb}")));
    }
    let x = heap.to_number(a)?;
    let y = heap.to_number(b)?;
    Ok(Value::from_f64_normalized(x + y))
}

/// `-` `*` `/` `%` numeric binary operators
pub fn arith(heap: &Heap, op: Opcode, a: Value, b: Value) -> Result<Value, JsError> {
    if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
        // Integer fast paths that cannot produce fractions; division and
        // modulo fall through to doubles
        match op {
            Opcode::Sub => {
                if let Some(d) = x.checked_sub(y) {
                    return Ok(Value::integer(d));
                }
            }
            Opcode::Mul => {
                if let Some(p) = x.checked_mul(y) {
                    return Ok(Value::integer(p));
                }
            }
            _ => {}
        }
    }
    let x = heap.to_number(a)?;
    let y = heap.to_number(b)?;
    let r = match op {
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        Opcode::Div => x / y,
        Opcode::Mod => {
            // JS % is the remainder with the dividend's sign, like Rust's %
            x % y
        }
        other => return Err(JsError::internal(format!("not an arith opcode: {other:?}"))),
    };
    Ok(Value::from_f64_normalized(r))
}

/// Unary `-`
pub fn negate(heap: &Heap, a: Value) -> Result<Value, JsError> {
    if let Some(i) = a.as_integer() {
        if i != 0 {
            if let Some(n) = i.checked_neg() {
                return Ok(Value::integer(n));
            }
        }
        // -0 and -i32::MIN need the double representation
        return Ok(Value::number(-(i as f64)));
    }
    let n = heap.to_number(a)?;
    Ok(Value::number(-n))
}

/// Relational operators `<` `<=` `>` `>=`
pub fn relational(heap: &Heap, op: Opcode, a: Value, b: Value) -> Result<Value, JsError> {
    let ord = heap.compare(a, b)?;
    let result = match (op, ord) {
        (_, None) => false, // NaN operand: every relation is false
        (Opcode::Lt, Some(o)) => o == Ordering::Less,
        (Opcode::Le, Some(o)) => o != Ordering::Greater,
        (Opcode::Gt, Some(o)) => o == Ordering::Greater,
        (Opcode::Ge, Some(o)) => o != Ordering::Less,
        (other, _) => {
            return Err(JsError::internal(format!(
                "not a relational opcode: {other:?}"
            )))
        }
    };
    Ok(Value::boolean(result))
}

/// Equality operators
pub fn equality(heap: &Heap, op: Opcode, a: Value, b: Value) -> Result<Value, JsError> {
    let result = match op {
        Opcode::Eq => heap.loose_equals(a, b)?,
        Opcode::Ne => !heap.loose_equals(a, b)?,
        Opcode::StrictEq => heap.strict_equals(a, b),
        Opcode::StrictNe => !heap.strict_equals(a, b),
        other => {
            return Err(JsError::internal(format!(
                "not an equality opcode: {other:?}"
            )))
        }
    };
    Ok(Value::boolean(result))
}

/// `typeof`
pub fn type_of(heap: &mut Heap, a: Value) -> Value {
    let name = heap.type_of(a);
    heap.alloc_string(name)
}

/// `instanceof`: walk the receiver's prototype chain looking for the
/// constructor's `prototype` object
pub fn instance_of(
    heap: &Heap,
    ctx: &crate::context::Context,
    value: Value,
    constructor: Value,
) -> Result<Value, JsError> {
    if !constructor.is_function() {
        return Err(JsError::type_error(
            "right-hand side of instanceof is not callable",
        ));
    }
    let ctor_id = constructor.object_id().unwrap();
    let proto_atom = match heap.atoms.get("prototype") {
        Some(a) => a,
        None => return Ok(Value::boolean(false)),
    };
    let target = match ctx.lookup_named(heap, ctor_id, proto_atom) {
        crate::context::LookupResult::Data(v) => v.object_id(),
        _ => None,
    };
    let Some(target) = target else {
        return Ok(Value::boolean(false));
    };
    let Some(mut current) = value.object_id().and_then(|id| {
        if value.is_object_like() {
            heap.object(id).prototype
        } else {
            None
        }
    }) else {
        return Ok(Value::boolean(false));
    };
    let mut hops = 0;
    loop {
        if current == target {
            return Ok(Value::boolean(true));
        }
        match heap.object(current).prototype {
            Some(next) => current = next,
            None => return Ok(Value::boolean(false)),
        }
        hops += 1;
        if hops > 10_000 {
            return Ok(Value::boolean(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_int_fast_path() {
        let mut h = Heap::new(0);
        assert_eq!(
            add(&mut h, Value::integer(2), Value::integer(3)).unwrap(),
            Value::integer(5)
        );
    }

    #[test]
    fn test_add_overflow_promotes_to_double() {
        let mut h = Heap::new(0);
        let r = add(&mut h, Value::integer(i32::MAX), Value::integer(1)).unwrap();
        assert!(r.is_double());
        assert_eq!(r.as_double(), Some(2147483648.0));
    }

    #[test]
    fn test_add_string_concat() {
        let mut h = Heap::new(0);
        let s = h.alloc_string("5");
        let r = add(&mut h, s, Value::integer(1)).unwrap();
        assert_eq!(h.to_display(r), "51");

        let r2 = add(&mut h, Value::integer(1), s).unwrap();
        assert_eq!(h.to_display(r2), "15");
    }

    #[test]
    fn test_add_mixed_numeric() {
        let mut h = Heap::new(0);
        let r = add(&mut h, Value::integer(1), Value::number(0.5)).unwrap();
        assert_eq!(r.as_double(), Some(1.5));
        // undefined + 1 = NaN
        let r = add(&mut h, Value::undefined(), Value::integer(1)).unwrap();
        assert!(r.as_double().unwrap().is_nan());
        // null + 1 = 1
        let r = add(&mut h, Value::null(), Value::integer(1)).unwrap();
        assert_eq!(r.as_integer(), Some(1));
    }

    #[test]
    fn test_div_produces_double() {
        let h = Heap::new(0);
        let r = arith(&h, Opcode::Div, Value::integer(1), Value::integer(2)).unwrap();
        assert_eq!(r.as_double(), Some(0.5));
        let r = arith(&h, Opcode::Div, Value::integer(1), Value::integer(0)).unwrap();
        assert_eq!(r.as_double(), Some(f64::INFINITY));
    }

    #[test]
    fn test_mod_sign_follows_dividend() {
        let h = Heap::new(0);
        let r = arith(&h, Opcode::Mod, Value::integer(-7), Value::integer(3)).unwrap();
        assert_eq!(h.to_number(r).unwrap(), -1.0);
    }

    #[test]
    fn test_negate_zero_is_negative_zero() {
        let h = Heap::new(0);
        let r = negate(&h, Value::integer(0)).unwrap();
        assert!(r.is_double());
        assert!(r.as_double().unwrap().is_sign_negative());
    }

    #[test]
    fn test_relational_nan_always_false() {
        let h = Heap::new(0);
        let nan = Value::number(f64::NAN);
        for op in [Opcode::Lt, Opcode::Le, Opcode::Gt, Opcode::Ge] {
            assert_eq!(
                relational(&h, op, nan, Value::integer(1)).unwrap(),
                Value::boolean(false)
            );
        }
    }

    #[test]
    fn test_string_relational() {
        let mut h = Heap::new(0);
        let a = h.alloc_string("a");
        let b = h.alloc_string("b");
        assert_eq!(
            relational(&h, Opcode::Lt, a, b).unwrap(),
            Value::boolean(true)
        );
    }
}
