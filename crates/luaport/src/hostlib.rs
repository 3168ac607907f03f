//! The library table Lua code uses to talk to the host
//!
//! Installed as a global (`host` by default):
//!
//! ```lua
//! local getter = host.as_attrgetter(obj)
//! local n = host.builtins.len(obj)
//! local x = host.eval("1 + 2")
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::host::types::HostFunction;
use crate::runtime::{Runtime, Source};
use crate::value::{as_attrgetter, as_function, as_is, as_itemgetter, Value};

fn key(name: &str) -> Value {
    Value::Bytes(name.as_bytes().to_vec())
}

fn function<F>(name: &'static str, func: F) -> (Value, Value)
where
    F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
{
    let value = Value::Protocol(as_function(Value::object(HostFunction::new(name, func))));
    (key(name), value)
}

fn only_arg(name: &str, args: Vec<Value>) -> Result<Value> {
    let count = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(Error::Type(format!("{}() takes exactly one argument ({} given)", name, count))),
    }
}

fn eval(rt: &Runtime, args: Vec<Value>) -> Result<Value> {
    let mut args = args.into_iter();
    let code = args.next().unwrap_or_default();
    let rest: Vec<Value> = args.collect();
    let result = match &code {
        Value::Bytes(bytes) => rt.eval(Source::Bytes(bytes), &rest)?,
        Value::String(text) => rt.eval(Source::Text(text), &rest)?,
        other => {
            return Err(Error::Type(format!(
                "eval() argument must be a string, not '{}'",
                other.type_name()
            )))
        }
    };
    Ok(result)
}

/// Build the library table and bind it to the global `name`
pub(crate) fn install(rt: &Runtime, name: &str) -> Result<()> {
    let builtins: Arc<dyn crate::host::HostObject> = Arc::new(rt.options().builtins.clone());
    let entries = vec![
        function("as_attrgetter", |_, args| {
            Ok(Value::Protocol(as_attrgetter(only_arg("as_attrgetter", args)?)))
        }),
        function("as_itemgetter", |_, args| {
            Ok(Value::Protocol(as_itemgetter(only_arg("as_itemgetter", args)?)))
        }),
        function("as_function", |_, args| {
            Ok(Value::Protocol(as_function(only_arg("as_function", args)?)))
        }),
        function("as_is", |_, args| Ok(Value::Protocol(as_is(only_arg("as_is", args)?)))),
        function("eval", eval),
        (key("none"), Value::Protocol(as_is(Value::Nil))),
        (key("builtins"), Value::Object(builtins)),
    ];
    let table = rt.table(&[], &entries)?;
    rt.set_global(name, table)?;
    debug!(runtime = rt.id(), name, "installed host library");
    Ok(())
}
