//! Value operations shared by the interpreter and compiled code
//!
//! Both execution tiers call into these so a bailout can never observe a
//! different result than interpretation would have produced.

use super::value::{format_number, Value};
use crate::bytecode::BinOp;
use crate::error::{Error, Result};

/// Numeric view of a value
pub fn to_number(v: &Value) -> f64 {
    match v {
        Value::Undefined => f64::NAN,
        Value::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                0.0
            } else {
                t.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Object(_) | Value::Array(_) | Value::Function(_) => f64::NAN,
    }
}

/// Int32 fast path. `None` means the result does not fit in an i32 and
/// the caller must take the generic path.
pub fn int_binary(op: BinOp, a: i32, b: i32) -> Option<Value> {
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int),
        BinOp::Sub => a.checked_sub(b).map(Value::Int),
        BinOp::Mul => a.checked_mul(b).map(Value::Int),
        BinOp::Lt => Some(Value::Boolean(a < b)),
        BinOp::Le => Some(Value::Boolean(a <= b)),
        BinOp::Eq => Some(Value::Boolean(a == b)),
    }
}

/// Float64 path
pub fn float_binary(op: BinOp, a: f64, b: f64) -> Value {
    match op {
        BinOp::Add => Value::Float(a + b),
        BinOp::Sub => Value::Float(a - b),
        BinOp::Mul => Value::Float(a * b),
        BinOp::Lt => Value::Boolean(a < b),
        BinOp::Le => Value::Boolean(a <= b),
        BinOp::Eq => Value::Boolean(a == b),
    }
}

/// Arithmetic on operands already known to be numbers. Two integers stay
/// on the integer path unless it overflows, matching [`binary`].
pub fn number_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if let Some(v) = int_binary(op, *a, *b) {
            return v;
        }
    }
    float_binary(op, to_number(lhs), to_number(rhs))
}

fn concat_operand(v: &Value) -> String {
    match v {
        Value::Float(f) => format_number(*f),
        other => other.to_string(),
    }
}

/// Generic binary operation
pub fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if let Some(v) = int_binary(op, *a, *b) {
            return v;
        }
    }
    match op {
        BinOp::Eq => Value::Boolean(lhs.strict_equals(rhs)),
        BinOp::Add if matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)) => {
            let mut s = concat_operand(lhs);
            s.push_str(&concat_operand(rhs));
            Value::string(&s)
        }
        BinOp::Lt | BinOp::Le => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => {
                Value::Boolean(if op == BinOp::Lt { a < b } else { a <= b })
            }
            _ => float_binary(op, to_number(lhs), to_number(rhs)),
        },
        _ => float_binary(op, to_number(lhs), to_number(rhs)),
    }
}

/// Array index from a value; only non-negative integers qualify
pub fn array_index(v: &Value) -> Option<usize> {
    match v {
        Value::Int(i) if *i >= 0 => Some(*i as usize),
        Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 && *f < u32::MAX as f64 => Some(*f as usize),
        _ => None,
    }
}

/// `arr[idx]`; out-of-bounds and non-index keys read as undefined
pub fn get_elem(arr: &Value, idx: &Value) -> Result<Value> {
    match arr {
        Value::Array(elements) => Ok(array_index(idx)
            .and_then(|i| elements.borrow().get(i).cloned())
            .unwrap_or(Value::Undefined)),
        Value::String(s) => Ok(array_index(idx)
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::string(&c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Err(Error::type_error(format!(
            "cannot index into {}",
            other.type_name()
        ))),
    }
}

/// Largest index a store may grow an array to
pub const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// `arr[idx] = value`; grows the array, filling holes with undefined
pub fn set_elem(arr: &Value, idx: &Value, value: Value) -> Result<()> {
    let Value::Array(elements) = arr else {
        return Err(Error::type_error(format!("cannot index into {}", arr.type_name())));
    };
    let i = array_index(idx).ok_or_else(|| Error::range_error(format!("invalid array index {}", idx)))?;
    if i >= MAX_ARRAY_LENGTH {
        return Err(Error::range_error(format!("array index {} too large", i)));
    }
    let mut elements = elements.borrow_mut();
    if i >= elements.len() {
        elements.resize(i + 1, Value::Undefined);
    }
    elements[i] = value;
    Ok(())
}

/// `arr.length`
pub fn array_len(arr: &Value) -> Result<Value> {
    match arr {
        Value::Array(elements) => Ok(Value::Int(elements.borrow().len() as i32)),
        Value::String(s) => Ok(Value::Int(s.chars().count() as i32)),
        other => Err(Error::type_error(format!("{} has no length", other.type_name()))),
    }
}

/// `new Array(len)`
pub fn new_array(len: &Value) -> Result<Value> {
    let n = array_index(len).ok_or_else(|| Error::range_error(format!("invalid array length {}", len)))?;
    if n > MAX_ARRAY_LENGTH {
        return Err(Error::range_error(format!("invalid array length {}", n)));
    }
    Ok(Value::new_array(vec![Value::Undefined; n]))
}

/// Result of `new`: the constructor's return value when it is an object,
/// otherwise the freshly created `this`
pub fn construct_result(returned: Value, this: Value) -> Value {
    match returned {
        Value::Object(_) | Value::Array(_) => returned,
        _ => this,
    }
}
