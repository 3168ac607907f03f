//! Host object capabilities
//!
//! A [`HostObject`] is any Rust value that Lua code can hold, index, call,
//! iterate or do arithmetic with. Every capability is opt-in: the defaults
//! report the operation as unsupported, which Lua sees as a catchable
//! error and the host sees as [`Error::Type`].

use std::any::Any;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::value::Value;

pub mod ops;
pub mod types;

/// Binary arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`, float division
    Div,
    /// `%`
    Mod,
    /// `^`
    Pow,
    /// `//`, floor division
    IDiv,
    /// `&`
    BAnd,
    /// `|`
    BOr,
    /// `~`
    BXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
}

impl ArithOp {
    /// All binary operators
    pub const ALL: [ArithOp; 12] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::Mod,
        ArithOp::Pow,
        ArithOp::IDiv,
        ArithOp::BAnd,
        ArithOp::BOr,
        ArithOp::BXor,
        ArithOp::Shl,
        ArithOp::Shr,
    ];

    /// Lua source token
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Pow => "^",
            ArithOp::IDiv => "//",
            ArithOp::BAnd => "&",
            ArithOp::BOr => "|",
            ArithOp::BXor => "~",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        }
    }

    /// Metamethod name
    pub fn metamethod(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::IDiv => "__idiv",
            ArithOp::BAnd => "__band",
            ArithOp::BOr => "__bor",
            ArithOp::BXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
        }
    }

    /// Whether the operator only exists from Lua 5.3 on
    pub fn requires_53(self) -> bool {
        !matches!(
            self,
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::Mod | ArithOp::Pow
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Bitwise not
    BNot,
}

impl UnaryOp {
    /// Lua source token
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::BNot => "~",
        }
    }

    /// Metamethod name
    pub fn metamethod(self) -> &'static str {
        match self {
            UnaryOp::Neg => "__unm",
            UnaryOp::BNot => "__bnot",
        }
    }
}

/// Comparison operators with a Lua metamethod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    /// Lua source token
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    /// Metamethod name
    pub fn metamethod(self) -> &'static str {
        match self {
            CompareOp::Eq => "__eq",
            CompareOp::Lt => "__lt",
            CompareOp::Le => "__le",
        }
    }
}

/// Pair iterator produced by a host object
pub type PairIter = Box<dyn Iterator<Item = (Value, Value)> + Send>;

/// Iteration protocol of a host object, as seen by `pairs`
pub enum HostIter {
    /// Key/value mapping: `pairs` yields each key with its value
    Mapping(PairIter),
    /// A view of `(key, value)` pairs, yielded as is
    Items(PairIter),
    /// Plain sequence: `pairs` yields 0-based positions with each element
    Sequence(Box<dyn Iterator<Item = Value> + Send>),
}

impl HostIter {
    /// Flatten into key/value pairs, enumerating sequences from 0
    pub fn into_pairs(self) -> PairIter {
        match self {
            HostIter::Mapping(iter) | HostIter::Items(iter) => iter,
            HostIter::Sequence(iter) => Box::new(
                iter.enumerate()
                    .map(|(i, v)| (Value::from(i), v)),
            ),
        }
    }

    /// Values only; mappings yield their keys
    pub fn into_values(self) -> Box<dyn Iterator<Item = Value> + Send> {
        match self {
            HostIter::Mapping(iter) => Box::new(iter.map(|(k, _)| k)),
            HostIter::Items(iter) => Box::new(iter.map(|(k, v)| Value::Tuple(vec![k, v]))),
            HostIter::Sequence(iter) => iter,
        }
    }
}

/// A Rust value that Lua code can reach through a userdata handle.
///
/// Methods receive the [`Runtime`] that dispatched the operation so an
/// implementation can call back into Lua without capturing the runtime.
///
/// A callable value returned from [`get_attr`](HostObject::get_attr) under
/// a non-dunder name is treated as a method: Lua receives a bound method
/// that passes the receiver as the first argument. Return
/// [`as_function`](crate::as_function) to hand out a plain function.
pub trait HostObject: Any + Send + Sync {
    /// Type name used in error messages and by `builtins.type`
    fn type_name(&self) -> &str {
        "object"
    }

    /// Read an attribute; `Ok(None)` means the attribute does not exist
    fn get_attr(&self, _rt: &Runtime, _name: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Write an attribute
    fn set_attr(&self, _rt: &Runtime, name: &str, _value: Value) -> Result<()> {
        Err(Error::Attribute(format!(
            "'{}' object has no attribute '{}'",
            self.type_name(),
            name
        )))
    }

    /// Whether the object supports `obj[key]`
    fn has_item_access(&self) -> bool {
        false
    }

    /// Read an item; `Ok(None)` means the key is absent
    fn get_item(&self, _rt: &Runtime, _key: &Value) -> Result<Option<Value>> {
        Err(Error::Type(format!("'{}' object is not subscriptable", self.type_name())))
    }

    /// Write an item
    fn set_item(&self, _rt: &Runtime, _key: Value, _value: Value) -> Result<()> {
        Err(Error::Type(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    /// Whether the object is a key/value mapping
    fn is_mapping(&self) -> bool {
        false
    }

    /// Whether the object can be called
    fn is_callable(&self) -> bool {
        false
    }

    /// Call the object; a [`Value::Tuple`] result becomes multiple Lua results
    fn call(&self, _rt: &Runtime, _args: Vec<Value>) -> Result<Value> {
        Err(Error::Type(format!("'{}' object is not callable", self.type_name())))
    }

    /// Length, for `#obj`
    fn len(&self, _rt: &Runtime) -> Result<usize> {
        Err(Error::Type(format!("object of type '{}' has no len()", self.type_name())))
    }

    /// Iteration, for `pairs(obj)`
    fn iter(&self, _rt: &Runtime) -> Result<HostIter> {
        Err(Error::Type(format!("'{}' object is not iterable", self.type_name())))
    }

    /// Binary operator with `self` on the left (or on the right when
    /// `reflected`). `Ok(None)` defers to the other operand.
    fn arith(&self, _rt: &Runtime, _op: ArithOp, _other: &Value, _reflected: bool) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Unary operator. `Ok(None)` means unsupported.
    fn unary(&self, _rt: &Runtime, _op: UnaryOp) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Comparison with `self` on the left. `Ok(None)` falls back to
    /// identity for `==` and fails for ordering.
    fn compare(&self, _rt: &Runtime, _op: CompareOp, _other: &Value) -> Result<Option<bool>> {
        Ok(None)
    }

    /// String conversion, for `tostring(obj)`
    fn display(&self, _rt: &Runtime) -> Result<String> {
        Ok(format!("<{} object at {:p}>", self.type_name(), self as *const Self))
    }
}

impl dyn HostObject {
    /// Downcast to a concrete host type
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// Whether the concrete type is `T`
    pub fn is<T: HostObject>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }
}
