//! Host-side value model
//!
//! [`Value`] is what crosses the boundary: primitives convert by value,
//! Lua tables/functions/threads arrive as [`LuaObject`] handles, and host
//! objects travel as `Arc<dyn HostObject>` so their identity survives a
//! round trip through the VM.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::host::{ops, HostObject};
use crate::host::types::HostFunction;
use crate::object::LuaObject;
use crate::runtime::Runtime;

/// How Lua-side indexing on a wrapped host value is resolved
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexStrategy {
    /// `obj.name` reads the host attribute `name`
    Attribute = 0,
    /// `obj[key]` reads the host item `key`
    Item = 1,
    /// The value is pushed as a real Lua function
    Callable = 2,
}

impl IndexStrategy {
    /// Decode a tag stored in a userdata handle
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(IndexStrategy::Attribute),
            1 => Some(IndexStrategy::Item),
            2 => Some(IndexStrategy::Callable),
            _ => None,
        }
    }

    /// Tag stored in a userdata handle
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A host value paired with an explicit indexing strategy.
///
/// Pushing a protocol wrapper always produces a host handle, even for
/// primitives, so `as_is(10)` reaches Lua as userdata rather than a number.
#[derive(Clone, PartialEq)]
pub struct Protocol {
    value: Box<Value>,
    strategy: IndexStrategy,
}

impl Protocol {
    /// Wrap `value` with a fixed strategy
    pub fn new(value: Value, strategy: IndexStrategy) -> Self {
        Protocol {
            value: Box::new(value.unwrap_protocol()),
            strategy,
        }
    }

    /// Wrap `value` with the strategy inferred from its capabilities
    pub fn inferred(value: Value) -> Self {
        let value = value.unwrap_protocol();
        let strategy = ops::infer_strategy(&value);
        Protocol {
            value: Box::new(value),
            strategy,
        }
    }

    /// The wrapped value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The indexing strategy
    pub fn strategy(&self) -> IndexStrategy {
        self.strategy
    }

    /// Split into value and strategy
    pub fn into_parts(self) -> (Value, IndexStrategy) {
        (*self.value, self.strategy)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.strategy, self.value)
    }
}

/// Index the wrapped value by attribute from Lua
pub fn as_attrgetter(value: impl Into<Value>) -> Protocol {
    Protocol::new(value.into(), IndexStrategy::Attribute)
}

/// Index the wrapped value by item from Lua
pub fn as_itemgetter(value: impl Into<Value>) -> Protocol {
    Protocol::new(value.into(), IndexStrategy::Item)
}

/// Push the wrapped callable as a real Lua function
pub fn as_function(value: impl Into<Value>) -> Protocol {
    Protocol::new(value.into(), IndexStrategy::Callable)
}

/// Keep the value wrapped instead of converting it to a Lua primitive
pub fn as_is(value: impl Into<Value>) -> Protocol {
    Protocol::inferred(value.into())
}

/// A value that can cross the boundary
#[derive(Clone, Default)]
pub enum Value {
    /// Lua `nil`
    #[default]
    Nil,
    /// Boolean
    Boolean(bool),
    /// Integer (Lua integer subtype)
    Integer(i64),
    /// Float (Lua float subtype)
    Number(f64),
    /// Host text, encoded with the runtime encoding when pushed
    String(String),
    /// Raw bytes, pushed as a Lua string as-is
    Bytes(Vec<u8>),
    /// Several values; expands to multiple results when returned from a callback
    Tuple(Vec<Value>),
    /// Host object, pushed as a userdata handle
    Object(Arc<dyn HostObject>),
    /// Handle to a Lua value
    Lua(LuaObject),
    /// Host value with an explicit indexing strategy
    Protocol(Protocol),
}

impl Value {
    /// Wrap a host closure
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Object(Arc::new(HostFunction::new("anonymous", f)))
    }

    /// Wrap a host object
    pub fn object<T: HostObject>(object: T) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(_) => "bool".to_string(),
            Value::Integer(_) => "int".to_string(),
            Value::Number(_) => "float".to_string(),
            Value::String(_) => "str".to_string(),
            Value::Bytes(_) => "bytes".to_string(),
            Value::Tuple(_) => "tuple".to_string(),
            Value::Object(obj) => obj.type_name().to_string(),
            Value::Lua(obj) => format!("Lua {}", obj.type_name().unwrap_or("value")),
            Value::Protocol(p) => p.value().type_name(),
        }
    }

    /// Whether this is `Nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truthiness: only `nil` and `false` are false
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload; integral floats are accepted
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && *n >= -(2f64.powi(63)) && *n < 2f64.powi(63) => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    /// Numeric payload as a float
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Text payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte payload of `Bytes` or `String`
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Host object payload
    pub fn as_object(&self) -> Option<&Arc<dyn HostObject>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Lua handle payload
    pub fn as_lua(&self) -> Option<&LuaObject> {
        match self {
            Value::Lua(obj) => Some(obj),
            _ => None,
        }
    }

    /// Downcast a host object payload
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.as_object().and_then(|obj| obj.downcast_ref::<T>())
    }

    /// Strip any protocol wrapper
    pub fn unwrap_protocol(self) -> Value {
        match self {
            Value::Protocol(p) => p.into_parts().0,
            other => other,
        }
    }

    /// Identity comparison: host objects by pointer, everything else by value
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => self == other,
        }
    }

    /// Convert the results of a multi-value operation into the collapsed form:
    /// nothing for zero results, the value itself for one, a tuple otherwise.
    pub fn collapse(mut values: Vec<Value>) -> Value {
        match values.len() {
            0 => Value::Nil,
            1 => values.pop().unwrap_or_default(),
            _ => Value::Tuple(values),
        }
    }

    /// Expand a callback result into the values to return to Lua
    pub fn into_results(self) -> Vec<Value> {
        match self {
            Value::Tuple(values) => values,
            other => vec![other],
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Lua(a), Value::Lua(b)) => a == b,
            (Value::Protocol(a), Value::Protocol(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Bytes(b) => write!(f, "Bytes({:?})", String::from_utf8_lossy(b)),
            Value::Tuple(values) => f.debug_tuple("Tuple").field(values).finish(),
            Value::Object(obj) => write!(f, "Object(<{} at {:p}>)", obj.type_name(), Arc::as_ptr(obj)),
            Value::Lua(obj) => write!(f, "{:?}", obj),
            Value::Protocol(p) => write!(f, "Protocol({:?})", p),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Integer(i64::from(v))
            }
        })*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! impl_from_wide_integer {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                match i64::try_from(v) {
                    Ok(i) => Value::Integer(i),
                    Err(_) => Value::Number(v as f64),
                }
            }
        })*
    };
}

impl_from_wide_integer!(u64, usize, isize, i128, u128);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<LuaObject> for Value {
    fn from(v: LuaObject) -> Self {
        Value::Lua(v)
    }
}

impl From<Protocol> for Value {
    fn from(v: Protocol) -> Self {
        Value::Protocol(v)
    }
}

impl From<Arc<dyn HostObject>> for Value {
    fn from(v: Arc<dyn HostObject>) -> Self {
        Value::Object(v)
    }
}

impl<T: HostObject> From<Arc<T>> for Value {
    fn from(v: Arc<T>) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}
