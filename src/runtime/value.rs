//! Runtime values
//!
//! Objects and arrays are reference-counted and single-threaded; they never
//! cross into the compiler, which only ever sees snapshot views.

use crate::bytecode::Constant;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Global function number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// Interned property name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

/// Object shape ("type")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Identifies one fixed-field property guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyGuardId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Object storage: a shape plus slots laid out in the shape's order
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub type_id: TypeId,
    pub slots: Vec<Value>,
}

pub type ObjectRef = Rc<RefCell<ObjectData>>;
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// A VM value
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Boolean(bool),
    Int(i32),
    Float(f64),
    String(Rc<str>),
    Object(ObjectRef),
    Array(ArrayRef),
    Function(FunctionId),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Rc::from(s))
    }

    pub fn new_object(type_id: TypeId, capacity: usize) -> Self {
        Value::Object(Rc::new(RefCell::new(ObjectData {
            type_id,
            slots: Vec::with_capacity(capacity),
        })))
    }

    pub fn new_array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Boolean(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) | Value::Array(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Boolean(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Object(_) | Value::Array(_) | Value::Function(_) => true,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Values stored in heap slots that need a write barrier
    pub fn is_heap_reference(&self) -> bool {
        matches!(self, Value::String(_) | Value::Object(_) | Value::Array(_))
    }

    pub fn as_function(&self) -> Option<FunctionId> {
        match self {
            Value::Function(id) => Some(*id),
            _ => None,
        }
    }

    /// Shape of an object value
    pub fn object_type(&self) -> Option<TypeId> {
        match self {
            Value::Object(obj) => Some(obj.borrow().type_id),
            _ => None,
        }
    }

    /// Strict equality; objects compare by identity
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }

    /// Observed type used by interpreter type feedback
    pub fn observed_type(&self) -> ObservedType {
        match self {
            Value::Undefined => ObservedType::Undefined,
            Value::Boolean(_) => ObservedType::Boolean,
            Value::Int(_) => ObservedType::Int32,
            Value::Float(_) => ObservedType::Float64,
            Value::String(_) => ObservedType::String,
            Value::Object(_) => ObservedType::Object,
            Value::Array(_) => ObservedType::Array,
            Value::Function(_) => ObservedType::Function,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl From<&Constant> for Value {
    fn from(c: &Constant) -> Self {
        match c {
            Constant::Undefined => Value::Undefined,
            Constant::Bool(b) => Value::Boolean(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::string(s),
        }
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(_) => write!(f, "[object Object]"),
            Value::Array(arr) => {
                let items: Vec<String> = arr.borrow().iter().map(|v| v.to_string()).collect();
                write!(f, "{}", items.join(","))
            }
            Value::Function(id) => write!(f, "function {}", id),
        }
    }
}

/// Type feedback collected during interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedType {
    Undefined,
    Boolean,
    Int32,
    Float64,
    String,
    Object,
    Array,
    Function,
    Mixed,
}

impl ObservedType {
    /// Merge two observations. Int32 and Float64 widen to Float64; any
    /// other disagreement becomes Mixed.
    pub fn merge(self, other: ObservedType) -> ObservedType {
        match (self, other) {
            (a, b) if a == b => a,
            (ObservedType::Int32, ObservedType::Float64) | (ObservedType::Float64, ObservedType::Int32) => {
                ObservedType::Float64
            }
            _ => ObservedType::Mixed,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ObservedType::Int32 | ObservedType::Float64)
    }
}

/// Who owns the memory a field lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwnership {
    /// Plain data in the frame or instruction stream
    Inline,
    /// Lives in a GC-managed heap cell; stores of references need a barrier
    GcHeap,
}

/// Store destinations the code generator can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTarget {
    Register,
    ObjectSlot,
    ArrayElement,
}

/// Ownership attribute of every store target
pub const GC_FIELDS: &[(StoreTarget, FieldOwnership)] = &[
    (StoreTarget::Register, FieldOwnership::Inline),
    (StoreTarget::ObjectSlot, FieldOwnership::GcHeap),
    (StoreTarget::ArrayElement, FieldOwnership::GcHeap),
];

/// Whether stores into `target` need a write barrier
pub fn needs_write_barrier(target: StoreTarget) -> bool {
    GC_FIELDS
        .iter()
        .any(|(t, owner)| *t == target && *owner == FieldOwnership::GcHeap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::string("1"));
        let a = Value::new_array(vec![]);
        let b = Value::new_array(vec![]);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(f64::NAN).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::Function(FunctionId(0)).is_truthy());
    }

    #[test]
    fn test_display_numbers() {
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Int(-7).to_string(), "-7");
    }

    #[test]
    fn test_observed_type_merge() {
        assert_eq!(ObservedType::Int32.merge(ObservedType::Int32), ObservedType::Int32);
        assert_eq!(ObservedType::Int32.merge(ObservedType::Float64), ObservedType::Float64);
        assert_eq!(ObservedType::Int32.merge(ObservedType::String), ObservedType::Mixed);
    }

    #[test]
    fn test_write_barrier_targets() {
        assert!(needs_write_barrier(StoreTarget::ObjectSlot));
        assert!(needs_write_barrier(StoreTarget::ArrayElement));
        assert!(!needs_write_barrier(StoreTarget::Register));
    }
}
