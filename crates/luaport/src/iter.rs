//! Iteration over Lua values
//!
//! `pairs` runs once to obtain the step function, its state and the first
//! control value; each step then calls the step function again. The cursor
//! values are kept as registry handles, so iterators never share state and
//! any number of them may be live on the same table.

use crate::error::{Error, Result};
use crate::marshal::PullMode;
use crate::object::LuaObject;
use crate::runtime::Arg;
use crate::value::Value;
use crate::vm::shim::Shim;

/// Cursor of a `pairs` traversal
pub struct LuaIter {
    step: LuaObject,
    state: Value,
    control: Value,
    done: bool,
}

impl LuaIter {
    pub(crate) fn new(obj: &LuaObject) -> Result<Self> {
        let guard = obj.runtime().lock();
        let mut results = guard
            .call_shim(Shim::Pairs, &[Arg::Object(obj)], 3, PullMode::Keep)?
            .into_iter();
        let step = match results.next() {
            Some(Value::Lua(step)) => step,
            _ => return Err(Error::Type("'pairs' did not return a step function".to_string())),
        };
        Ok(LuaIter {
            step,
            state: results.next().unwrap_or_default(),
            control: results.next().unwrap_or_default(),
            done: false,
        })
    }

    /// Advance to the next pair; `None` once the traversal ended. An error
    /// also ends the traversal.
    pub fn next_pair(&mut self) -> Result<Option<(Value, Value)>> {
        if self.done {
            return Ok(None);
        }
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<(Value, Value)>> {
        let mut results = self
            .step
            .call_keep(&[self.state.clone(), self.control.clone()])?
            .into_iter();
        let key = results.next().unwrap_or_default();
        let value = results.next().unwrap_or_default();
        let host_key = match &key {
            Value::Lua(obj) if obj.is_nil() => return Ok(None),
            Value::Lua(obj) => obj.to_value()?,
            Value::Nil => return Ok(None),
            other => other.clone(),
        };
        let host_value = match &value {
            Value::Lua(obj) => obj.to_value()?,
            other => other.clone(),
        };
        self.control = key;
        Ok(Some((host_key, host_value)))
    }
}

/// Keys of a table
pub struct Keys(LuaIter);

impl Keys {
    pub(crate) fn new(iter: LuaIter) -> Self {
        Keys(iter)
    }
}

impl Iterator for Keys {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_pair().transpose().map(|pair| pair.map(|(k, _)| k))
    }
}

/// Values of a table
pub struct Values(LuaIter);

impl Values {
    pub(crate) fn new(iter: LuaIter) -> Self {
        Values(iter)
    }
}

impl Iterator for Values {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_pair().transpose().map(|pair| pair.map(|(_, v)| v))
    }
}

/// `(key, value)` pairs of a table
pub struct Items(LuaIter);

impl Items {
    pub(crate) fn new(iter: LuaIter) -> Self {
        Items(iter)
    }
}

impl Iterator for Items {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_pair().transpose()
    }
}
