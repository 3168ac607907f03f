//! Capability dispatch over any [`Value`]
//!
//! Metamethod handlers and builtins go through these functions rather than
//! the [`HostObject`](super::HostObject) trait directly, so that primitives,
//! tuples and Lua handles wrapped with `as_is` behave sensibly too.

use crate::encoding::decode_with;
use crate::error::{Error, Result};
use crate::host::{ArithOp, CompareOp, HostIter, UnaryOp};
use crate::runtime::Runtime;
use crate::value::{IndexStrategy, Value};

/// Default strategy: item access if supported, else attribute access
pub fn infer_strategy(value: &Value) -> IndexStrategy {
    if has_item_access(value) {
        IndexStrategy::Item
    } else {
        IndexStrategy::Attribute
    }
}

/// Whether `value[key]` is meaningful
pub fn has_item_access(value: &Value) -> bool {
    match value {
        Value::Object(obj) => obj.has_item_access(),
        Value::Tuple(_) | Value::Lua(_) => true,
        Value::Protocol(p) => has_item_access(p.value()),
        _ => false,
    }
}

/// Whether `value` can be called
pub fn is_callable(value: &Value) -> bool {
    match value {
        Value::Object(obj) => obj.is_callable(),
        Value::Lua(obj) => obj.is_callable(),
        _ => false,
    }
}

/// Whether `value` iterates as a key/value mapping
pub fn is_mapping(value: &Value) -> bool {
    match value {
        Value::Object(obj) => obj.is_mapping(),
        Value::Lua(obj) => obj.type_name().map(|t| t == "table").unwrap_or(false),
        _ => false,
    }
}

/// Read an attribute; `None` when missing
pub fn get_attr(rt: &Runtime, value: &Value, name: &str) -> Result<Option<Value>> {
    match value {
        Value::Object(obj) => obj.get_attr(rt, name),
        Value::Lua(obj) => obj.get(name).map(|v| if v.is_nil() { None } else { Some(v) }),
        Value::Protocol(p) => get_attr(rt, p.value(), name),
        _ => Ok(None),
    }
}

/// Write an attribute
pub fn set_attr(rt: &Runtime, value: &Value, name: &str, new: Value) -> Result<()> {
    match value {
        Value::Object(obj) => obj.set_attr(rt, name, new),
        Value::Lua(obj) => obj.set(name, new),
        Value::Protocol(p) => set_attr(rt, p.value(), name, new),
        other => Err(Error::Attribute(format!(
            "'{}' object attribute '{}' is read-only",
            other.type_name(),
            name
        ))),
    }
}

/// Read an item; `None` when the key is absent
pub fn get_item(rt: &Runtime, value: &Value, key: &Value) -> Result<Option<Value>> {
    match value {
        Value::Object(obj) => obj.get_item(rt, key),
        Value::Tuple(items) => {
            let index = key
                .as_integer()
                .ok_or_else(|| Error::Type("tuple indices must be integers".to_string()))?;
            Ok(resolve_index(index, items.len()).map(|i| items[i].clone()))
        }
        Value::Lua(obj) => obj.get(key.clone()).map(|v| if v.is_nil() { None } else { Some(v) }),
        Value::Protocol(p) => get_item(rt, p.value(), key),
        other => Err(Error::Type(format!("'{}' object is not subscriptable", other.type_name()))),
    }
}

/// Write an item
pub fn set_item(rt: &Runtime, value: &Value, key: Value, new: Value) -> Result<()> {
    match value {
        Value::Object(obj) => obj.set_item(rt, key, new),
        Value::Lua(obj) => obj.set(key, new),
        Value::Protocol(p) => set_item(rt, p.value(), key, new),
        other => Err(Error::Type(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Call a value
pub fn call(rt: &Runtime, value: &Value, args: Vec<Value>) -> Result<Value> {
    match value {
        Value::Object(obj) => obj.call(rt, args),
        Value::Lua(obj) => obj.call(&args),
        Value::Protocol(p) => call(rt, p.value(), args),
        other => Err(Error::Type(format!("'{}' object is not callable", other.type_name()))),
    }
}

/// Length of a value
pub fn len(rt: &Runtime, value: &Value) -> Result<usize> {
    match value {
        Value::Object(obj) => obj.len(rt),
        Value::Tuple(items) => Ok(items.len()),
        Value::String(s) => Ok(s.chars().count()),
        Value::Bytes(b) => Ok(b.len()),
        Value::Lua(obj) => obj.len().map(|n| n.max(0) as usize),
        Value::Protocol(p) => len(rt, p.value()),
        other => Err(Error::Type(format!("object of type '{}' has no len()", other.type_name()))),
    }
}

/// Iterate a value
pub fn iter(rt: &Runtime, value: &Value) -> Result<HostIter> {
    match value {
        Value::Object(obj) => obj.iter(rt),
        Value::Tuple(items) => Ok(HostIter::Sequence(Box::new(items.clone().into_iter()))),
        Value::Lua(obj) => {
            let items = obj.items()?.collect::<Result<Vec<_>>>()?;
            Ok(HostIter::Mapping(Box::new(items.into_iter())))
        }
        Value::Protocol(p) => iter(rt, p.value()),
        other => Err(Error::Type(format!("'{}' object is not iterable", other.type_name()))),
    }
}

/// String conversion
pub fn display(rt: &Runtime, value: &Value) -> Result<String> {
    Ok(match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format_float(*n),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => match decode_with(rt.encoding(), b) {
            Ok(s) => s,
            Err(_) => String::from_utf8_lossy(b).into_owned(),
        },
        Value::Tuple(items) => {
            let parts = items.iter().map(|v| display(rt, v)).collect::<Result<Vec<_>>>()?;
            format!("({})", parts.join(", "))
        }
        Value::Object(obj) => obj.display(rt)?,
        Value::Lua(obj) => String::from_utf8_lossy(&obj.to_bytes()?).into_owned(),
        Value::Protocol(p) => display(rt, p.value())?,
    })
}

/// Float formatting matching Lua's `%.14g` closely enough for display
pub fn format_float(n: f64) -> String {
    if n.is_nan() {
        if n.is_sign_negative() { "-nan".to_string() } else { "nan".to_string() }
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

/// Binary operator dispatch: left operand first, then the reflected right
/// operand, then native numeric arithmetic
pub fn arith(rt: &Runtime, op: ArithOp, left: &Value, right: &Value) -> Result<Value> {
    arith_with(rt, op, left, right, true)
}

/// Binary operator dispatch for metamethod handlers. Lua operands are
/// never handed back to the VM, which would land in the same handler.
pub(crate) fn arith_host(rt: &Runtime, op: ArithOp, left: &Value, right: &Value) -> Result<Value> {
    arith_with(rt, op, left, right, false)
}

fn arith_with(rt: &Runtime, op: ArithOp, left: &Value, right: &Value, via_vm: bool) -> Result<Value> {
    let left = strip(left);
    let right = strip(right);
    if let Value::Object(obj) = left {
        if let Some(result) = obj.arith(rt, op, right, false)? {
            return Ok(result);
        }
    }
    if let Value::Object(obj) = right {
        if let Some(result) = obj.arith(rt, op, left, true)? {
            return Ok(result);
        }
    }
    if via_vm {
        if let Value::Lua(obj) = left {
            return obj.arith(op, right);
        }
        if let Value::Lua(obj) = right {
            return obj.arith_reflected(op, left);
        }
    }
    match numeric::binary(op, left, right) {
        Some(result) => result,
        None => Err(unsupported_operand(op.symbol(), left, right)),
    }
}

/// Unary operator dispatch
pub fn unary(rt: &Runtime, op: UnaryOp, value: &Value) -> Result<Value> {
    let value = strip(value);
    match value {
        Value::Object(obj) => {
            if let Some(result) = obj.unary(rt, op)? {
                return Ok(result);
            }
        }
        Value::Lua(obj) => return obj.unary(op),
        _ => {}
    }
    match numeric::unary(op, value) {
        Some(result) => result,
        None => Err(Error::Type(format!(
            "bad operand type for unary {}: '{}'",
            op.symbol(),
            value.type_name()
        ))),
    }
}

/// Comparison dispatch
pub fn compare(rt: &Runtime, op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    compare_with(rt, op, left, right, true)
}

/// Comparison dispatch for metamethod handlers
pub(crate) fn compare_host(rt: &Runtime, op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    compare_with(rt, op, left, right, false)
}

fn compare_with(rt: &Runtime, op: CompareOp, left: &Value, right: &Value, via_vm: bool) -> Result<bool> {
    let left = strip(left);
    let right = strip(right);
    if op == CompareOp::Eq && left.same(right) {
        return Ok(true);
    }
    if let Value::Object(obj) = left {
        if let Some(result) = obj.compare(rt, op, right)? {
            return Ok(result);
        }
    }
    if op == CompareOp::Eq {
        if let Value::Object(obj) = right {
            if let Some(result) = obj.compare(rt, op, left)? {
                return Ok(result);
            }
        }
    }
    if via_vm {
        if let Value::Lua(obj) = left {
            return obj.compare(op, right);
        }
    }
    if let Some(ordering) = native_order(rt, left, right) {
        return Ok(match op {
            CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
            CompareOp::Lt => ordering == std::cmp::Ordering::Less,
            CompareOp::Le => ordering != std::cmp::Ordering::Greater,
        });
    }
    match op {
        CompareOp::Eq => Ok(loose_eq(rt, left, right)),
        _ => Err(Error::Type(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Concatenation: both operands converted to text
pub fn concat(rt: &Runtime, left: &Value, right: &Value) -> Result<Value> {
    let mut text = display(rt, left)?;
    text.push_str(&display(rt, right)?);
    Ok(Value::String(text))
}

/// Key equality across representations: integers equal integral floats,
/// and text equals its encoded bytes
pub fn loose_eq(rt: &Runtime, a: &Value, b: &Value) -> bool {
    match (strip(a), strip(b)) {
        (Value::Integer(i), Value::Number(n)) | (Value::Number(n), Value::Integer(i)) => {
            (*i as f64) == *n && n.fract() == 0.0
        }
        (Value::String(s), Value::Bytes(bytes)) | (Value::Bytes(bytes), Value::String(s)) => {
            match rt.encoding() {
                Some(encoding) => encoding.encode(s).map(|e| e == *bytes).unwrap_or(false),
                None => false,
            }
        }
        (a, b) => a.same(b),
    }
}

/// Host type name as seen from Lua through `builtins.type`
pub fn type_name(value: &Value) -> String {
    strip(value).type_name()
}

/// Resolve a possibly negative 0-based index
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        Some(index as usize)
    } else {
        None
    }
}

pub(crate) fn unsupported_operand(symbol: &str, left: &Value, right: &Value) -> Error {
    Error::Type(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        symbol,
        left.type_name(),
        right.type_name()
    ))
}

fn strip(value: &Value) -> &Value {
    match value {
        Value::Protocol(p) => p.value(),
        other => other,
    }
}

fn native_order(rt: &Runtime, left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (a, b) if a.as_number().is_some() && b.as_number().is_some() => {
            a.as_number()?.partial_cmp(&b.as_number()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::String(_), Value::Bytes(_)) | (Value::Bytes(_), Value::String(_)) => {
            if loose_eq(rt, left, right) {
                Some(std::cmp::Ordering::Equal)
            } else {
                None
            }
        }
        _ => None,
    }
}

// ============================================================================
// Native numeric arithmetic
// ============================================================================

mod numeric {
    use super::*;

    /// Integers stay integers while the result fits; bitwise operators
    /// follow Lua integer semantics
    pub(super) fn binary(op: ArithOp, left: &Value, right: &Value) -> Option<Result<Value>> {
        match (left, right) {
            (Value::Integer(a), Value::Integer(b)) => Some(integer(op, *a, *b)),
            (a, b) => {
                let x = a.as_number()?;
                let y = b.as_number()?;
                Some(float(op, x, y, a, b))
            }
        }
    }

    pub(super) fn unary(op: UnaryOp, value: &Value) -> Option<Result<Value>> {
        match (op, value) {
            (UnaryOp::Neg, Value::Integer(i)) => Some(Ok(match i.checked_neg() {
                Some(n) => Value::Integer(n),
                None => Value::Number(-(*i as f64)),
            })),
            (UnaryOp::Neg, Value::Number(n)) => Some(Ok(Value::Number(-n))),
            (UnaryOp::BNot, v) => v.as_integer().map(|i| Ok(Value::Integer(!i))),
            _ => None,
        }
    }

    fn integer(op: ArithOp, a: i64, b: i64) -> Result<Value> {
        let overflow = |checked: Option<i64>, fallback: f64| match checked {
            Some(v) => Value::Integer(v),
            None => Value::Number(fallback),
        };
        Ok(match op {
            ArithOp::Add => overflow(a.checked_add(b), a as f64 + b as f64),
            ArithOp::Sub => overflow(a.checked_sub(b), a as f64 - b as f64),
            ArithOp::Mul => overflow(a.checked_mul(b), a as f64 * b as f64),
            ArithOp::Div => {
                if b == 0 {
                    return Err(zero_division());
                }
                Value::Number(a as f64 / b as f64)
            }
            ArithOp::Mod => {
                if b == 0 {
                    return Err(zero_division());
                }
                let r = a.wrapping_rem(b);
                Value::Integer(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
            }
            ArithOp::IDiv => {
                if b == 0 {
                    return Err(zero_division());
                }
                match a.checked_div(b) {
                    Some(q) if a % b != 0 && (a < 0) != (b < 0) => Value::Integer(q - 1),
                    Some(q) => Value::Integer(q),
                    None => Value::Number((a as f64 / b as f64).floor()),
                }
            }
            ArithOp::Pow => match u32::try_from(b) {
                Ok(exp) => overflow(a.checked_pow(exp), (a as f64).powf(b as f64)),
                Err(_) => Value::Number((a as f64).powf(b as f64)),
            },
            ArithOp::BAnd => Value::Integer(a & b),
            ArithOp::BOr => Value::Integer(a | b),
            ArithOp::BXor => Value::Integer(a ^ b),
            ArithOp::Shl => Value::Integer(shift_left(a, b)),
            ArithOp::Shr => Value::Integer(shift_left(a, b.wrapping_neg())),
        })
    }

    fn float(op: ArithOp, x: f64, y: f64, left: &Value, right: &Value) -> Result<Value> {
        Ok(Value::Number(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => {
                if y == 0.0 {
                    return Err(zero_division());
                }
                x / y
            }
            ArithOp::Mod => {
                if y == 0.0 {
                    return Err(zero_division());
                }
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
            }
            ArithOp::IDiv => {
                if y == 0.0 {
                    return Err(zero_division());
                }
                (x / y).floor()
            }
            ArithOp::Pow => x.powf(y),
            _ => {
                let (a, b) = match (left.as_integer(), right.as_integer()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(unsupported_operand(op.symbol(), left, right)),
                };
                return integer(op, a, b);
            }
        }))
    }

    /// Logical shift as in Lua: negative counts shift right, counts of 64
    /// or more produce zero
    fn shift_left(a: i64, b: i64) -> i64 {
        if b <= -64 || b >= 64 {
            0
        } else if b >= 0 {
            ((a as u64) << b) as i64
        } else {
            ((a as u64) >> (-b)) as i64
        }
    }

    fn zero_division() -> Error {
        Error::Value("division by zero".to_string())
    }

}
