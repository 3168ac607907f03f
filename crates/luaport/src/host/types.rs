//! Built-in host object types

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::host::{ops, ArithOp, HostIter, HostObject};
use crate::runtime::Runtime;
use crate::value::{as_function, Value};

/// Signature of a host function callable from Lua
pub type HostFn = dyn Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync;

// ============================================================================
// Functions
// ============================================================================

/// A named host closure
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    func: Arc<HostFn>,
}

impl HostFunction {
    /// Wrap a closure
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        HostFunction {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Wrap an already shared closure
    pub fn from_arc(name: impl Into<String>, func: Arc<HostFn>) -> Self {
        HostFunction {
            name: name.into(),
            func,
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke directly
    pub fn invoke(&self, rt: &Runtime, args: Vec<Value>) -> Result<Value> {
        (self.func)(rt, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

impl HostObject for HostFunction {
    fn type_name(&self) -> &str {
        "function"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, rt: &Runtime, args: Vec<Value>) -> Result<Value> {
        self.invoke(rt, args)
    }

    fn display(&self, _rt: &Runtime) -> Result<String> {
        Ok(format!("<function {}>", self.name))
    }
}

/// A method looked up on a receiver.
///
/// Calling it passes the receiver as the first argument. When Lua already
/// passed the receiver itself (`obj:method()`), the duplicate is dropped so
/// both call styles work.
pub struct BoundMethod {
    function: Value,
    receiver: Value,
}

impl BoundMethod {
    /// Bind `function` to `receiver`
    pub fn new(function: Value, receiver: Value) -> Self {
        BoundMethod { function, receiver }
    }

    /// The receiver
    pub fn receiver(&self) -> &Value {
        &self.receiver
    }
}

impl HostObject for BoundMethod {
    fn type_name(&self) -> &str {
        "method"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, rt: &Runtime, mut args: Vec<Value>) -> Result<Value> {
        if args.first().is_some_and(|first| first.same(&self.receiver)) {
            args.remove(0);
        }
        args.insert(0, self.receiver.clone());
        ops::call(rt, &self.function, args)
    }

    fn display(&self, rt: &Runtime) -> Result<String> {
        Ok(format!(
            "<bound method of {}>",
            ops::display(rt, &self.receiver)?
        ))
    }
}

/// Build a method value: a function whose first argument is the receiver
pub fn method<F>(name: &str, func: F) -> Value
where
    F: Fn(&Runtime, &Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    Value::object(HostFunction::new(name, move |rt, mut args| {
        if args.is_empty() {
            return Err(Error::Type("method called without a receiver".to_string()));
        }
        let receiver = args.remove(0);
        func(rt, &receiver, args)
    }))
}

fn receiver<'a, T: HostObject>(value: &'a Value, name: &str) -> Result<&'a T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Type(format!("descriptor '{}' requires a different receiver", name)))
}

// ============================================================================
// Containers
// ============================================================================

/// Mutable host sequence, indexed from 0
#[derive(Default)]
pub struct HostList {
    items: Mutex<Vec<Value>>,
}

impl HostList {
    /// Create a list
    pub fn new(items: Vec<Value>) -> Self {
        HostList {
            items: Mutex::new(items),
        }
    }

    /// Append an element
    pub fn push(&self, value: Value) {
        self.items.lock().push(value);
    }

    /// Copy of the elements
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    /// Number of elements
    pub fn count(&self) -> usize {
        self.items.lock().len()
    }
}

impl HostObject for HostList {
    fn type_name(&self) -> &str {
        "list"
    }

    fn get_attr(&self, _rt: &Runtime, name: &str) -> Result<Option<Value>> {
        Ok(match name {
            "append" => Some(method("append", |_, this, args| {
                let list = receiver::<HostList>(this, "append")?;
                list.push(args.into_iter().next().unwrap_or_default());
                Ok(Value::Nil)
            })),
            "pop" => Some(method("pop", |_, this, _| {
                let list = receiver::<HostList>(this, "pop")?;
                list.items
                    .lock()
                    .pop()
                    .ok_or_else(|| Error::Index("pop from empty list".to_string()))
            })),
            _ => None,
        })
    }

    fn has_item_access(&self) -> bool {
        true
    }

    fn get_item(&self, _rt: &Runtime, key: &Value) -> Result<Option<Value>> {
        let index = key
            .as_integer()
            .ok_or_else(|| Error::Type("list indices must be integers".to_string()))?;
        let items = self.items.lock();
        Ok(ops::resolve_index(index, items.len()).map(|i| items[i].clone()))
    }

    fn set_item(&self, _rt: &Runtime, key: Value, value: Value) -> Result<()> {
        let index = key
            .as_integer()
            .ok_or_else(|| Error::Type("list indices must be integers".to_string()))?;
        let mut items = self.items.lock();
        let len = items.len();
        match ops::resolve_index(index, len) {
            Some(i) => items[i] = value,
            None if index == len as i64 => items.push(value),
            None => return Err(Error::Index("list assignment index out of range".to_string())),
        }
        Ok(())
    }

    fn len(&self, _rt: &Runtime) -> Result<usize> {
        Ok(self.count())
    }

    fn iter(&self, _rt: &Runtime) -> Result<HostIter> {
        Ok(HostIter::Sequence(Box::new(self.to_vec().into_iter())))
    }

    fn arith(&self, _rt: &Runtime, op: ArithOp, other: &Value, reflected: bool) -> Result<Option<Value>> {
        let other = match (op, other.downcast_ref::<HostList>()) {
            (ArithOp::Add, Some(other)) => other.to_vec(),
            _ => return Ok(None),
        };
        let mut items = self.to_vec();
        if reflected {
            let mut joined = other;
            joined.extend(items);
            items = joined;
        } else {
            items.extend(other);
        }
        Ok(Some(Value::object(HostList::new(items))))
    }

    fn display(&self, rt: &Runtime) -> Result<String> {
        let parts = self
            .to_vec()
            .iter()
            .map(|v| ops::display(rt, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("[{}]", parts.join(", ")))
    }
}

/// Insertion-ordered host mapping
#[derive(Default)]
pub struct HostMap {
    entries: Mutex<Vec<(Value, Value)>>,
}

impl HostMap {
    /// Create a mapping; later duplicates of a key are kept as written
    pub fn new(entries: Vec<(Value, Value)>) -> Self {
        HostMap {
            entries: Mutex::new(entries),
        }
    }

    /// Insert or replace by exact key
    pub fn insert(&self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(k, _)| k.same(&key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    /// Look up by exact key
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries
            .lock()
            .iter()
            .find(|(k, _)| k.same(key))
            .map(|(_, v)| v.clone())
    }

    /// Copy of the entries
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.entries.lock().clone()
    }
}

impl HostObject for HostMap {
    fn type_name(&self) -> &str {
        "dict"
    }

    fn get_attr(&self, _rt: &Runtime, name: &str) -> Result<Option<Value>> {
        Ok(match name {
            "items" => Some(method("items", |_, this, _| {
                let map = receiver::<HostMap>(this, "items")?;
                Ok(Value::object(HostItemsView::new(map.entries())))
            })),
            _ => None,
        })
    }

    fn has_item_access(&self) -> bool {
        true
    }

    fn get_item(&self, rt: &Runtime, key: &Value) -> Result<Option<Value>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|(k, _)| ops::loose_eq(rt, k, key))
            .map(|(_, v)| v.clone()))
    }

    fn set_item(&self, rt: &Runtime, key: Value, value: Value) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock();
            let position = entries.iter().position(|(k, _)| ops::loose_eq(rt, k, &key));
            match (position, value.is_nil()) {
                (Some(i), true) => Some(entries.remove(i)),
                (Some(i), false) => Some(std::mem::replace(&mut entries[i], (key, value))),
                (None, true) => None,
                (None, false) => {
                    entries.push((key, value));
                    None
                }
            }
        };
        drop(removed);
        Ok(())
    }

    fn is_mapping(&self) -> bool {
        true
    }

    fn len(&self, _rt: &Runtime) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    fn iter(&self, _rt: &Runtime) -> Result<HostIter> {
        Ok(HostIter::Mapping(Box::new(self.entries().into_iter())))
    }

    fn display(&self, rt: &Runtime) -> Result<String> {
        let parts = self
            .entries()
            .iter()
            .map(|(k, v)| Ok(format!("{}: {}", ops::display(rt, k)?, ops::display(rt, v)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("{{{}}}", parts.join(", ")))
    }
}

/// Snapshot of a mapping's `(key, value)` pairs
pub struct HostItemsView {
    entries: Vec<(Value, Value)>,
}

impl HostItemsView {
    /// Create a view
    pub fn new(entries: Vec<(Value, Value)>) -> Self {
        HostItemsView { entries }
    }
}

impl HostObject for HostItemsView {
    fn type_name(&self) -> &str {
        "dict_items"
    }

    fn len(&self, _rt: &Runtime) -> Result<usize> {
        Ok(self.entries.len())
    }

    fn iter(&self, _rt: &Runtime) -> Result<HostIter> {
        Ok(HostIter::Items(Box::new(self.entries.clone().into_iter())))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A host error travelling through Lua as an error value
pub struct HostException {
    error: Error,
}

impl HostException {
    /// Wrap an error
    pub fn new(error: Error) -> Self {
        HostException { error }
    }

    /// The wrapped error
    pub fn error(&self) -> &Error {
        &self.error
    }
}

impl HostObject for HostException {
    fn type_name(&self) -> &str {
        "exception"
    }

    fn get_attr(&self, _rt: &Runtime, name: &str) -> Result<Option<Value>> {
        Ok(match name {
            "message" => Some(Value::String(self.error.to_string())),
            _ => None,
        })
    }

    fn display(&self, _rt: &Runtime) -> Result<String> {
        Ok(self.error.to_string())
    }
}

// ============================================================================
// Builtins
// ============================================================================

/// Registry of host functions exposed to Lua as `host.builtins`
#[derive(Clone, Default)]
pub struct Builtins {
    functions: FxHashMap<String, Arc<HostFn>>,
}

impl Builtins {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `len`, `str`, `type`, `list` and `dict`
    pub fn standard() -> Self {
        let mut builtins = Self::new();
        builtins.register("len", |rt, args| {
            let value = single_arg("len", args)?;
            Ok(Value::from(ops::len(rt, &value)?))
        });
        builtins.register("str", |rt, args| {
            let value = single_arg("str", args)?;
            Ok(Value::String(ops::display(rt, &value)?))
        });
        builtins.register("type", |_, args| {
            let value = single_arg("type", args)?;
            Ok(Value::String(ops::type_name(&value)))
        });
        builtins.register("list", |rt, args| {
            let items = match args.into_iter().next() {
                Some(source) => ops::iter(rt, &source)?.into_values().collect(),
                None => Vec::new(),
            };
            Ok(Value::object(HostList::new(items)))
        });
        builtins.register("dict", |rt, args| {
            let entries = match args.into_iter().next() {
                Some(source) => ops::iter(rt, &source)?.into_pairs().collect(),
                None => Vec::new(),
            };
            Ok(Value::object(HostMap::new(entries)))
        });
        builtins
    }

    /// Register a function under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(handler));
    }

    /// Look up a function
    pub fn get(&self, name: &str) -> Option<Arc<HostFn>> {
        self.functions.get(name).cloned()
    }

    /// Check whether a function is registered
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Builtins").field("functions", &names).finish()
    }
}

impl HostObject for Builtins {
    fn type_name(&self) -> &str {
        "builtins"
    }

    fn get_attr(&self, _rt: &Runtime, name: &str) -> Result<Option<Value>> {
        Ok(self.get(name).map(|func| {
            Value::Protocol(as_function(Value::object(HostFunction::from_arc(name, func))))
        }))
    }
}

fn single_arg(name: &str, args: Vec<Value>) -> Result<Value> {
    let count = args.len();
    match <[Value; 1]>::try_from(args) {
        Ok([value]) => Ok(value),
        Err(_) => Err(Error::Type(format!(
            "{}() takes exactly one argument ({} given)",
            name, count
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registry() {
        let mut builtins = Builtins::standard();
        assert!(builtins.contains("len"));
        assert!(builtins.contains("dict"));
        assert!(!builtins.contains("eval"));
        let before = builtins.len();
        builtins.register("answer", |_, _| Ok(Value::Integer(42)));
        assert_eq!(builtins.len(), before + 1);
        assert!(!builtins.is_empty());
    }

    #[test]
    fn test_single_arg() {
        assert_eq!(single_arg("len", vec![Value::Integer(1)]).unwrap(), Value::Integer(1));
        assert!(matches!(single_arg("len", vec![]), Err(Error::Type(_))));
    }

    #[test]
    fn test_host_map_insert_replaces() {
        let map = HostMap::default();
        map.insert("a", 1);
        map.insert("a", 2);
        assert_eq!(map.entries().len(), 1);
        assert_eq!(map.get(&Value::from("a")), Some(Value::Integer(2)));
    }

    #[test]
    fn test_host_exception_message() {
        let exc = HostException::new(Error::Type("bad".to_string()));
        assert!(matches!(exc.error(), Error::Type(_)));
    }
}
