//! Built-in metamethod handlers
//!
//! Every handler receives its arguments in wrapped form: the host handle
//! the metamethod fired on arrives as a [`Protocol`] so the indexing
//! strategy it was pushed with is known. Other host handles are unwrapped
//! before they reach host code.

use crate::encoding::decode_with;
use crate::error::{Error, Result};
use crate::host::types::BoundMethod;
use crate::host::{ops, ArithOp, CompareOp, UnaryOp};
use crate::metatable::pairs::PairsStepper;
use crate::metatable::Metatable;
use crate::runtime::Runtime;
use crate::value::{as_function, IndexStrategy, Value};

pub(super) fn register_all(metatable: &mut Metatable) {
    metatable.register("__index", index);
    metatable.register("__newindex", newindex);
    metatable.register("__call", call);
    metatable.register("__tostring", tostring);
    metatable.register("__len", len);
    metatable.register("__pairs", pairs);
    metatable.register("__concat", concat);
    metatable.register("__eq", |rt, args| compare(rt, CompareOp::Eq, args));
    metatable.register("__lt", |rt, args| compare(rt, CompareOp::Lt, args));
    metatable.register("__le", |rt, args| compare(rt, CompareOp::Le, args));
    metatable.register("__unm", |rt, args| unary(rt, UnaryOp::Neg, args));
    metatable.register("__bnot", |rt, args| unary(rt, UnaryOp::BNot, args));
    for op in ArithOp::ALL {
        metatable.register(op.metamethod(), move |rt, args| arith(rt, op, args));
    }
}

/// The handle the metamethod fired on, with its strategy, and the
/// remaining arguments unwrapped
fn split_receiver(args: Vec<Value>) -> Result<(Value, IndexStrategy, Vec<Value>)> {
    let mut args = args.into_iter();
    let (receiver, strategy) = match args.next() {
        Some(Value::Protocol(p)) => p.into_parts(),
        Some(other) => {
            let strategy = ops::infer_strategy(&other);
            (other, strategy)
        }
        None => return Err(Error::Type("metamethod called without an operand".to_string())),
    };
    Ok((receiver, strategy, args.map(Value::unwrap_protocol).collect()))
}

/// Both operands of a binary metamethod
fn operands(args: Vec<Value>) -> (Value, Value) {
    let mut args = args.into_iter().map(Value::unwrap_protocol);
    let left = args.next().unwrap_or_default();
    let right = args.next().unwrap_or_default();
    (left, right)
}

/// Attribute name from an index key
fn attr_name(rt: &Runtime, key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Bytes(b) => decode_with(rt.encoding(), b),
        other => Err(Error::Type(format!(
            "attribute name must be string, not '{}'",
            other.type_name()
        ))),
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Wrap a callable attribute so it receives its receiver. Protocol values
/// pass through untouched.
fn bind(value: Value, receiver: &Value, name: &str) -> Value {
    if is_dunder(name) {
        return value;
    }
    match &value {
        Value::Object(obj) if obj.is_callable() && !obj.is::<BoundMethod>() => {
            Value::object(BoundMethod::new(value, receiver.clone()))
        }
        _ => value,
    }
}

fn index(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (receiver, strategy, rest) = split_receiver(args)?;
    let key = rest.into_iter().next().unwrap_or_default();
    if strategy == IndexStrategy::Item {
        return Ok(ops::get_item(rt, &receiver, &key)?.unwrap_or_default());
    }
    let name = attr_name(rt, &key)?;
    if let Some(value) = ops::get_attr(rt, &receiver, &name)? {
        return Ok(bind(value, &receiver, &name));
    }
    if ops::has_item_access(&receiver) {
        if let Ok(Some(value)) = ops::get_item(rt, &receiver, &key) {
            return Ok(value);
        }
    }
    // Missing attributes read as nil so `if obj.opt then` works
    Ok(Value::Nil)
}

fn newindex(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (receiver, strategy, rest) = split_receiver(args)?;
    let mut rest = rest.into_iter();
    let key = rest.next().unwrap_or_default();
    let value = rest.next().unwrap_or_default();
    if strategy == IndexStrategy::Item {
        ops::set_item(rt, &receiver, key, value)?;
    } else {
        let name = attr_name(rt, &key)?;
        ops::set_attr(rt, &receiver, &name, value)?;
    }
    Ok(Value::Nil)
}

fn call(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (receiver, _, rest) = split_receiver(args)?;
    ops::call(rt, &receiver, rest)
}

fn tostring(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (receiver, _, _) = split_receiver(args)?;
    let text = ops::display(rt, &receiver)?;
    Ok(match rt.encoding() {
        Some(_) => Value::String(text),
        None => Value::Bytes(text.into_bytes()),
    })
}

fn len(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (receiver, _, _) = split_receiver(args)?;
    Ok(Value::from(ops::len(rt, &receiver)?))
}

fn pairs(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let handle = args.first().cloned().unwrap_or_default();
    let (receiver, _, _) = split_receiver(args)?;
    let source = ops::iter(rt, &receiver)?.into_pairs();
    let step = Value::object(PairsStepper::new(source));
    Ok(Value::Tuple(vec![Value::Protocol(as_function(step)), handle, Value::Nil]))
}

fn concat(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let (left, right) = operands(args);
    ops::concat(rt, &left, &right)
}

fn compare(rt: &Runtime, op: CompareOp, args: Vec<Value>) -> Result<Value> {
    let (left, right) = operands(args);
    ops::compare_host(rt, op, &left, &right).map(Value::Boolean)
}

fn unary(rt: &Runtime, op: UnaryOp, args: Vec<Value>) -> Result<Value> {
    let (operand, _) = operands(args);
    ops::unary(rt, op, &operand)
}

fn arith(rt: &Runtime, op: ArithOp, args: Vec<Value>) -> Result<Value> {
    let (left, right) = operands(args);
    ops::arith_host(rt, op, &left, &right)
}
