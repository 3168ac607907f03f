//! 0-based sequence view of a Lua table

use crate::error::{Error, Result};
use crate::host::ops::resolve_index;
use crate::marshal::PullMode;
use crate::object::LuaObject;
use crate::runtime::Arg;
use crate::value::Value;
use crate::vm::shim::Shim;

/// Sequence view of a table. Index 0 is Lua index 1; negative indices
/// count from the end.
#[derive(Debug, Clone)]
pub struct ListProxy {
    table: LuaObject,
}

impl ListProxy {
    pub(crate) fn new(table: LuaObject) -> Self {
        ListProxy { table }
    }

    /// The underlying table
    pub fn table(&self) -> &LuaObject {
        &self.table
    }

    /// `#table`
    pub fn len(&self) -> Result<usize> {
        Ok(self.table.len()?.max(0) as usize)
    }

    /// Whether the sequence is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Lua position of a 0-based index
    fn position(&self, index: i64) -> Result<i64> {
        resolve_index(index, self.len()?)
            .map(|i| i as i64 + 1)
            .ok_or_else(|| Error::Index(format!("list index {} out of range", index)))
    }

    /// Element at `index`
    pub fn get(&self, index: i64) -> Result<Value> {
        self.table.get(self.position(index)?)
    }

    /// Replace the element at `index`
    pub fn set(&self, index: i64, value: impl Into<Value>) -> Result<()> {
        self.table.set(self.position(index)?, value)
    }

    /// Remove the element at `index`, shifting later elements down
    pub fn delete(&self, index: i64) -> Result<()> {
        let position = self.position(index)?;
        self.table.delete(position)
    }

    /// Insert before `index`; indices past either end are clamped
    pub fn insert(&self, index: i64, value: impl Into<Value>) -> Result<()> {
        let len = self.len()? as i64;
        let index = if index < 0 { index + len } else { index };
        let position = Value::Integer(index.clamp(0, len) + 1);
        let value = value.into();
        let guard = self.table.runtime().lock();
        guard.call_shim(
            Shim::TableInsert,
            &[Arg::Object(&self.table), Arg::Value(&position), Arg::Value(&value)],
            0,
            PullMode::Unwrap,
        )?;
        Ok(())
    }

    /// Append at the end
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.insert(self.len()? as i64, value)
    }

    /// Elements in order. The length is read once, up front.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<Value>> + '_> {
        let len = self.len()? as i64;
        Ok((1..=len).map(move |position| self.table.get(position)))
    }

    /// Copy of the elements
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.iter()?.collect()
    }
}
