//! Host-side handle to a Lua value
//!
//! A [`LuaObject`] pins its value with a registry reference, never a stack
//! slot, so it stays valid across calls and threads. Operators run through
//! the runtime's protected shims: a failing operator or metamethod comes
//! back as an [`Error`], never as a non-local exit.

use std::collections::hash_map::Entry;
use std::ffi::{c_int, CString};
use std::fmt;
use std::ops;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use mlua_sys as ffi;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::encoding::decode_with;
use crate::error::{Error, Result};
use crate::host::{ArithOp, CompareOp, UnaryOp};
use crate::iter::{Items, Keys, LuaIter, Values};
use crate::list::ListProxy;
use crate::marshal::{self, PullMode};
use crate::runtime::{Arg, Runtime};
use crate::thread::LuaThread;
use crate::value::Value;
use crate::vm::shim::Shim;
use crate::vm::{self, StackGuard};

/// Basic type of a Lua value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// `nil`
    Nil,
    /// `true` or `false`
    Boolean,
    /// Raw pointer
    LightUserData,
    /// Integer or float
    Number,
    /// Byte string
    String,
    /// Table
    Table,
    /// Lua or C function
    Function,
    /// Full userdata, including host handles
    UserData,
    /// Coroutine
    Thread,
}

impl LuaType {
    pub(crate) fn from_tag(tag: c_int) -> Option<Self> {
        Some(match tag {
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserData,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::UserData,
            ffi::LUA_TTHREAD => LuaType::Thread,
            _ => return None,
        })
    }

    /// Whether values of this type pull as [`LuaObject`] handles
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            LuaType::LightUserData | LuaType::Table | LuaType::Function | LuaType::UserData | LuaType::Thread
        )
    }
}

/// Handle to a value living in a Lua state
pub struct LuaObject {
    runtime: Runtime,
    key: c_int,
    edit_mode: AtomicBool,
    attrs: Mutex<FxHashMap<String, Value>>,
}

impl LuaObject {
    fn from_key(rt: &Runtime, key: c_int) -> Self {
        LuaObject {
            runtime: rt.share(),
            key,
            edit_mode: AtomicBool::new(false),
            attrs: Mutex::new(FxHashMap::default()),
        }
    }

    /// Reference the value at `index` (0 slots)
    pub(crate) unsafe fn from_stack(rt: &Runtime, state: *mut ffi::lua_State, index: c_int) -> Result<Self> {
        vm::check_stack(state, 1)?;
        ffi::lua_pushvalue(state, index);
        Ok(Self::from_key(rt, vm::make_ref(state)))
    }

    /// Handle holding `nil`
    pub(crate) fn nil(rt: &Runtime) -> Self {
        Self::from_key(rt, ffi::LUA_REFNIL)
    }

    /// Push the referenced value (+1 slot)
    pub(crate) unsafe fn push_onto(&self, rt: &Runtime, state: *mut ffi::lua_State) -> Result<()> {
        if !self.runtime.ptr_eq(rt) {
            return Err(Error::ForeignRuntime);
        }
        if rt.is_closed() {
            return Err(Error::Closed);
        }
        vm::push_ref(state, self.key);
        Ok(())
    }

    /// Run `f` with the value pushed on the current state
    fn with_pushed<R>(&self, f: impl FnOnce(*mut ffi::lua_State) -> Result<R>) -> Result<R> {
        let guard = self.runtime.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 3)?;
            self.push_onto(&self.runtime, state)?;
            f(state)
        }
    }

    fn shim(&self, shim: Shim, args: &[Arg<'_>]) -> Result<Value> {
        let guard = self.runtime.lock();
        let mut results = guard.call_shim(shim, args, 1, PullMode::Unwrap)?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Runtime the value lives in. The handle is borrowed: it does not keep
    /// the state open.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Whether this handles `nil`
    pub fn is_nil(&self) -> bool {
        self.key == ffi::LUA_REFNIL
    }

    /// Lua type of the value
    pub fn kind(&self) -> Result<LuaType> {
        self.with_pushed(|state| {
            let tag = unsafe { ffi::lua_type(state, -1) };
            LuaType::from_tag(tag).ok_or_else(|| Error::Value(format!("unknown Lua type tag {}", tag)))
        })
    }

    /// Lua type name, as returned by `type()`
    pub fn type_name(&self) -> Result<&'static str> {
        self.with_pushed(|state| Ok(vm::type_name(unsafe { ffi::lua_type(state, -1) })))
    }

    /// Whether calling the value can succeed
    pub fn is_callable(&self) -> bool {
        self.with_pushed(|state| Ok(unsafe { vm::is_callable(state, -1) }))
            .unwrap_or(false)
    }

    /// Convert to a host value; primitives by value
    pub fn to_value(&self) -> Result<Value> {
        self.with_pushed(|state| unsafe { marshal::pull(&self.runtime, state, -1, PullMode::Unwrap) })
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// `self[key]`
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.shim(Shim::Index, &[Arg::Object(self), Arg::Value(&key)])
    }

    /// `self[key] = value`
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let guard = self.runtime.lock();
        guard.call_shim(
            Shim::NewIndex,
            &[Arg::Object(self), Arg::Value(&key), Arg::Value(&value)],
            0,
            PullMode::Unwrap,
        )?;
        Ok(())
    }

    /// Remove `key`. Integer keys go through `table.remove`, shifting the
    /// elements above; other keys are set to `nil`.
    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        let key = key.into();
        match key {
            Value::Integer(_) => {
                let guard = self.runtime.lock();
                guard.call_shim(Shim::TableRemove, &[Arg::Object(self), Arg::Value(&key)], 0, PullMode::Unwrap)?;
                Ok(())
            }
            key => self.set(key, Value::Nil),
        }
    }

    /// Whether `self[key]` is not `nil`
    pub fn contains_key(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(!self.get(key)?.is_nil())
    }

    // ========================================================================
    // Attribute-style access
    // ========================================================================

    /// Whether attribute access is redirected to the local store
    pub fn edit_mode(&self) -> bool {
        self.edit_mode.load(Ordering::Relaxed)
    }

    /// Switch attribute access between the table and the local store
    pub fn set_edit_mode(&self, enabled: bool) {
        self.edit_mode.store(enabled, Ordering::Relaxed);
    }

    fn uses_table(&self, name: &str) -> bool {
        !self.edit_mode() && !is_dunder(name) && !self.attrs.lock().contains_key(name)
    }

    /// Read an attribute: the table entry, or a local attribute in edit
    /// mode and for dunder names
    pub fn attr(&self, name: &str) -> Result<Value> {
        if self.uses_table(name) {
            return self.get(self.runtime.name_key(name)?);
        }
        self.attrs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Attribute(format!("'LuaObject' has no attribute '{}'", name)))
    }

    /// Write an attribute
    pub fn set_attr(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if self.uses_table(name) {
            return self.set(self.runtime.name_key(name)?, value);
        }
        let previous = self.attrs.lock().insert(name.to_string(), value);
        drop(previous);
        Ok(())
    }

    /// Delete an attribute
    pub fn del_attr(&self, name: &str) -> Result<()> {
        if self.uses_table(name) {
            return self.set(self.runtime.name_key(name)?, Value::Nil);
        }
        let removed = match self.attrs.lock().entry(name.to_string()) {
            Entry::Occupied(entry) => entry.remove(),
            Entry::Vacant(_) => {
                return Err(Error::Attribute(format!("'LuaObject' has no attribute '{}'", name)))
            }
        };
        drop(removed);
        Ok(())
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// `#self`
    pub fn len(&self) -> Result<i64> {
        match self.shim(Shim::Len, &[Arg::Object(self)])? {
            Value::Integer(n) => Ok(n),
            other => other
                .as_integer()
                .ok_or_else(|| Error::Type(format!("object length is not an integer ({})", other.type_name()))),
        }
    }

    /// `tostring(self)` as bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.shim(Shim::ToString, &[Arg::Object(self)])? {
            Value::Bytes(bytes) => Ok(bytes),
            Value::String(text) => Ok(text.into_bytes()),
            other => Err(Error::Type(format!("'__tostring' returned '{}'", other.type_name()))),
        }
    }

    /// `tostring(self)` decoded with the runtime encoding
    pub fn to_str(&self) -> Result<String> {
        decode_with(self.runtime.encoding(), &self.to_bytes()?)
    }

    /// Integer conversion following Lua's string and float coercions
    pub fn to_integer(&self) -> Result<i64> {
        self.with_pushed(|state| {
            let mut isnum: c_int = 0;
            let n = unsafe { ffi::lua_tointegerx(state, -1, &mut isnum) };
            if isnum == 0 {
                let name = vm::type_name(unsafe { ffi::lua_type(state, -1) });
                return Err(Error::Type(format!("Lua {} is not convertible to an integer", name)));
            }
            Ok(n as i64)
        })
    }

    /// Float conversion following Lua's string coercion
    pub fn to_number(&self) -> Result<f64> {
        self.with_pushed(|state| {
            let mut isnum: c_int = 0;
            let n = unsafe { ffi::lua_tonumberx(state, -1, &mut isnum) };
            if isnum == 0 {
                let name = vm::type_name(unsafe { ffi::lua_type(state, -1) });
                return Err(Error::Type(format!("Lua {} is not convertible to a number", name)));
            }
            Ok(n as f64)
        })
    }

    /// Lua truthiness
    pub fn to_bool(&self) -> Result<bool> {
        self.with_pushed(|state| Ok(unsafe { ffi::lua_toboolean(state, -1) } != 0))
    }

    /// Raw field `name` of the value's metatable, `Nil` when absent
    pub fn metafield(&self, name: &str) -> Result<Value> {
        let cname = CString::new(name).map_err(|_| Error::Value("metafield name contains a NUL byte".to_string()))?;
        self.with_pushed(|state| unsafe {
            if ffi::luaL_getmetafield(state, -1, cname.as_ptr()) == ffi::LUA_TNIL {
                return Ok(Value::Nil);
            }
            marshal::pull(&self.runtime, state, -1, PullMode::Unwrap)
        })
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the value. No result gives `Nil`, one gives that value, more
    /// give a [`Value::Tuple`].
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.call_multi(args).map(Value::collapse)
    }

    /// Call the value, returning every result
    pub fn call_multi(&self, args: &[Value]) -> Result<Vec<Value>> {
        self.runtime.lock().call_object(self, args, PullMode::Unwrap)
    }

    /// Call the value, keeping every result as a handle
    pub(crate) fn call_keep(&self, args: &[Value]) -> Result<Vec<Value>> {
        self.runtime.lock().call_object(self, args, PullMode::Keep)
    }

    // ========================================================================
    // Operators
    // ========================================================================

    /// `self <op> other`
    pub fn arith(&self, op: ArithOp, other: &Value) -> Result<Value> {
        self.shim(Shim::Arith(op), &[Arg::Object(self), Arg::Value(other)])
    }

    /// `other <op> self`
    pub fn arith_reflected(&self, op: ArithOp, other: &Value) -> Result<Value> {
        self.shim(Shim::Arith(op), &[Arg::Value(other), Arg::Object(self)])
    }

    /// `-self` or `~self`
    pub fn unary(&self, op: UnaryOp) -> Result<Value> {
        self.shim(Shim::Unary(op), &[Arg::Object(self)])
    }

    /// `self <op> other`
    pub fn compare(&self, op: CompareOp, other: &Value) -> Result<bool> {
        self.shim(Shim::Compare(op), &[Arg::Object(self), Arg::Value(other)])
            .map(|v| v.truthy())
    }

    fn compare_reflected(&self, op: CompareOp, other: &Value) -> Result<bool> {
        self.shim(Shim::Compare(op), &[Arg::Value(other), Arg::Object(self)])
            .map(|v| v.truthy())
    }

    /// `self == other` in Lua, honoring `__eq`
    pub fn equals(&self, other: impl Into<Value>) -> Result<bool> {
        self.compare(CompareOp::Eq, &other.into())
    }

    /// `self < other`
    pub fn lt(&self, other: impl Into<Value>) -> Result<bool> {
        self.compare(CompareOp::Lt, &other.into())
    }

    /// `self <= other`
    pub fn le(&self, other: impl Into<Value>) -> Result<bool> {
        self.compare(CompareOp::Le, &other.into())
    }

    /// `self > other`, evaluated as `other < self`
    pub fn gt(&self, other: impl Into<Value>) -> Result<bool> {
        self.compare_reflected(CompareOp::Lt, &other.into())
    }

    /// `self >= other`, evaluated as `other <= self`
    pub fn ge(&self, other: impl Into<Value>) -> Result<bool> {
        self.compare_reflected(CompareOp::Le, &other.into())
    }

    // ========================================================================
    // Iteration and views
    // ========================================================================

    /// Keys in `pairs` order
    pub fn keys(&self) -> Result<Keys> {
        LuaIter::new(self).map(Keys::new)
    }

    /// Values in `pairs` order
    pub fn values(&self) -> Result<Values> {
        LuaIter::new(self).map(Values::new)
    }

    /// `(key, value)` pairs in `pairs` order
    pub fn items(&self) -> Result<Items> {
        LuaIter::new(self).map(Items::new)
    }

    /// New coroutine running this function; `args` are passed on the
    /// first resume, ahead of the resume arguments
    pub fn coroutine(&self, args: &[Value]) -> Result<LuaThread> {
        LuaThread::spawn(self, args)
    }

    /// 0-based sequence view of a table
    pub fn as_list(&self) -> Result<ListProxy> {
        match self.kind()? {
            LuaType::Table => Ok(ListProxy::new(self.clone())),
            other => Err(Error::Type(format!("cannot view a Lua {:?} as a list", other).to_lowercase())),
        }
    }

    fn duplicate_key(&self) -> Result<c_int> {
        self.with_pushed(|state| Ok(unsafe { vm::make_ref(state) }))
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

impl Clone for LuaObject {
    fn clone(&self) -> Self {
        let key = match self.key {
            ffi::LUA_REFNIL | ffi::LUA_NOREF => self.key,
            _ => self.duplicate_key().unwrap_or(ffi::LUA_NOREF),
        };
        LuaObject {
            runtime: self.runtime.clone(),
            key,
            edit_mode: AtomicBool::new(self.edit_mode()),
            attrs: Mutex::new(self.attrs.lock().clone()),
        }
    }
}

impl PartialEq for LuaObject {
    /// Raw identity in the VM; `__eq` is not consulted
    fn eq(&self, other: &Self) -> bool {
        if !self.runtime.ptr_eq(&other.runtime) {
            return false;
        }
        self.with_pushed(|state| unsafe {
            other.push_onto(&self.runtime, state)?;
            Ok(ffi::lua_rawequal(state, -1, -2) != 0)
        })
        .unwrap_or(false)
    }
}

impl fmt::Debug for LuaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.type_name().unwrap_or("closed");
        let address = self
            .with_pushed(|state| Ok(unsafe { ffi::lua_topointer(state, -1) }))
            .unwrap_or(ptr::null());
        f.debug_struct("LuaObject")
            .field("runtime", &self.runtime.id())
            .field("type", &kind)
            .field("address", &address)
            .finish()
    }
}

impl Drop for LuaObject {
    fn drop(&mut self) {
        if matches!(self.key, ffi::LUA_REFNIL | ffi::LUA_NOREF) || self.runtime.is_closed() {
            return;
        }
        let guard = self.runtime.lock();
        if let Ok(state) = guard.state() {
            unsafe { vm::release_ref(state, self.key) };
        }
    }
}

macro_rules! binary_operators {
    ($($trait:ident :: $method:ident => $op:expr),* $(,)?) => {
        $(
            impl<V: Into<Value>> ops::$trait<V> for &LuaObject {
                type Output = Result<Value>;

                fn $method(self, rhs: V) -> Result<Value> {
                    self.arith($op, &rhs.into())
                }
            }
        )*
    };
}

binary_operators! {
    Add::add => ArithOp::Add,
    Sub::sub => ArithOp::Sub,
    Mul::mul => ArithOp::Mul,
    Div::div => ArithOp::Div,
    Rem::rem => ArithOp::Mod,
    BitAnd::bitand => ArithOp::BAnd,
    BitOr::bitor => ArithOp::BOr,
    BitXor::bitxor => ArithOp::BXor,
    Shl::shl => ArithOp::Shl,
    Shr::shr => ArithOp::Shr,
}

impl ops::Neg for &LuaObject {
    type Output = Result<Value>;

    fn neg(self) -> Result<Value> {
        self.unary(UnaryOp::Neg)
    }
}

impl ops::Not for &LuaObject {
    type Output = Result<Value>;

    /// Bitwise not (`~self`)
    fn not(self) -> Result<Value> {
        self.unary(UnaryOp::BNot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_handle() {
        let rt = Runtime::new().unwrap();
        let nil = rt.nil();
        assert!(nil.is_nil());
        assert_eq!(nil.kind().unwrap(), LuaType::Nil);
        assert_eq!(nil.to_value().unwrap(), Value::Nil);
        assert_eq!(nil.clone(), nil);
    }

    #[test]
    fn test_conversions() {
        let rt = Runtime::new().unwrap();
        let text = rt.to_lua(&Value::from("42")).unwrap();
        assert_eq!(text.to_integer().unwrap(), 42);
        assert_eq!(text.to_number().unwrap(), 42.0);
        assert!(text.to_bool().unwrap());
        assert_eq!(text.type_name().unwrap(), "string");
        let table = rt.table(&[], &[]).unwrap();
        assert!(matches!(table.to_integer(), Err(Error::Type(_))));
    }

    #[test]
    fn test_identity_and_clone() {
        let rt = Runtime::new().unwrap();
        let table = rt.table(&[Value::Integer(1)], &[]).unwrap();
        let copy = table.clone();
        assert_eq!(table, copy);
        assert_ne!(table, rt.table(&[], &[]).unwrap());
        drop(copy);
        assert_eq!(table.get(1).unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_edit_mode_routes_attributes() {
        let rt = Runtime::new().unwrap();
        let table = rt.table(&[], &[]).unwrap();
        table.set_attr("name", "lua").unwrap();
        assert_eq!(table.get("name").unwrap(), Value::Bytes(b"lua".to_vec()));
        table.set_attr("__meta__", 1).unwrap();
        assert!(table.get("__meta__").unwrap().is_nil());
        assert_eq!(table.attr("__meta__").unwrap(), Value::Integer(1));

        table.set_edit_mode(true);
        table.set_attr("local", 2).unwrap();
        assert!(table.get("local").unwrap().is_nil());
        table.set_edit_mode(false);
        assert_eq!(table.attr("local").unwrap(), Value::Integer(2));
        table.del_attr("local").unwrap();
        assert!(table.attr("local").unwrap().is_nil());
        assert!(matches!(table.del_attr("__gone__"), Err(Error::Attribute(_))));
    }

    #[test]
    fn test_is_dunder() {
        assert!(is_dunder("__index__"));
        assert!(!is_dunder("__index"));
    }
}
