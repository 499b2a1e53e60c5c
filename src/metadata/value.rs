//! Dynamically typed values passed through hooks and lifecycle callbacks.
//!
//! Host methods and mod callbacks are invoked through uniform `&[Value] -> Value` entry
//! points. [`ValueKind`] is the shape used to check signatures at hook install time and to
//! key lifecycle callback lookups.

use std::{any::Any, fmt, sync::Arc};

use strum::Display;

/// The kind of a [`Value`], the granularity at which signatures are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[allow(missing_docs)]
pub enum ValueKind {
    #[strum(serialize = "void")]
    Void,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "i32")]
    I32,
    #[strum(serialize = "i64")]
    I64,
    #[strum(serialize = "f64")]
    F64,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "object")]
    Object,
}

/// A value crossing the host/mod boundary.
#[derive(Clone, Default)]
#[allow(missing_docs)]
pub enum Value {
    #[default]
    Void,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    /// Opaque host or mod object
    Object(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Returns the kind of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Void => ValueKind::Void,
            Value::Bool(_) => ValueKind::Bool,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F64(_) => ValueKind::F64,
            Value::Str(_) => ValueKind::Str,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Returns the integer payload of an `I32`.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload of a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the payload of a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Downcasts an `Object` payload.
    #[must_use]
    pub fn downcast_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Object(obj) => Arc::clone(obj).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("Void"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::I32(v) => write!(f, "I32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Kinds of a slice of values, for signature matching.
#[must_use]
pub fn kinds_of(values: &[Value]) -> Vec<ValueKind> {
    values.iter().map(Value::kind).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_accessors() {
        let values = vec![Value::from(3), Value::from("x"), Value::from(true)];
        assert_eq!(
            kinds_of(&values),
            vec![ValueKind::I32, ValueKind::Str, ValueKind::Bool]
        );
        assert_eq!(values[0].as_i32(), Some(3));
        assert_eq!(values[1].as_str(), Some("x"));
        assert_eq!(values[2].as_bool(), Some(true));
        assert_eq!(values[0].as_str(), None);
    }

    #[test]
    fn test_object_identity() {
        let obj: Arc<dyn Any + Send + Sync> = Arc::new(42_u64);
        let a = Value::Object(obj.clone());
        let b = Value::Object(obj);
        let c = Value::Object(Arc::new(42_u64));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_object::<u64>().as_deref(), Some(&42));
        assert!(a.downcast_object::<String>().is_none());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ValueKind::I32.to_string(), "i32");
        assert_eq!(ValueKind::Object.to_string(), "object");
    }
}
