//! Push and pull between host values and the Lua stack
//!
//! Both directions assume the caller holds the runtime lock and passes the
//! state it is currently operating on.

use std::cell::Cell;
use std::ffi::c_int;
use std::mem;
use std::ptr;

use mlua_sys as ffi;

use crate::arena::EntryId;
use crate::callback;
use crate::encoding::{decode_with, encode_with};
use crate::error::{Error, Result};
use crate::host::ops;
use crate::object::{LuaObject, LuaType};
use crate::runtime::Runtime;
use crate::value::{IndexStrategy, Protocol, Value};
use crate::vm::{self, HOST_SIGNATURE};

/// How VM values are converted on pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Primitives by value, host handles as the stored host value
    Unwrap,
    /// Like `Unwrap`, but host handles come back as [`Protocol`] values
    /// carrying their indexing strategy
    Wrapped,
    /// Everything as a [`LuaObject`], primitives included
    Keep,
}

/// Layout of a host handle userdata
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostHandle {
    pub(crate) runtime: u64,
    pub(crate) entry: u64,
    pub(crate) strategy: u8,
}

/// Push `value` onto `state` (+1 slot)
pub(crate) unsafe fn push(rt: &Runtime, state: *mut ffi::lua_State, value: &Value) -> Result<()> {
    vm::check_stack(state, 1)?;
    if let Value::Object(obj) = value {
        if let Some(converted) = rt.options().pushers.convert(rt, obj)? {
            return push(rt, state, &converted);
        }
    }
    match value {
        Value::Lua(obj) => obj.push_onto(rt, state)?,
        Value::Boolean(b) => ffi::lua_pushboolean(state, c_int::from(*b)),
        Value::Integer(i) => ffi::lua_pushinteger(state, *i as ffi::lua_Integer),
        Value::Number(n) => ffi::lua_pushnumber(state, *n as ffi::lua_Number),
        Value::String(s) => {
            let bytes = encode_with(rt.encoding(), s)?;
            vm::push_bytes(state, &bytes);
        }
        Value::Bytes(b) => vm::push_bytes(state, b),
        Value::Nil => ffi::lua_pushnil(state),
        Value::Protocol(p) => push_handle(rt, state, p.value().clone(), p.strategy())?,
        Value::Object(_) | Value::Tuple(_) => {
            push_handle(rt, state, value.clone(), ops::infer_strategy(value))?
        }
    }
    Ok(())
}

/// Wrap a host value in a new handle userdata (+1 slot). A callable
/// strategy pushes a C closure holding the handle instead.
pub(crate) unsafe fn push_handle(
    rt: &Runtime,
    state: *mut ffi::lua_State,
    value: Value,
    strategy: IndexStrategy,
) -> Result<()> {
    vm::check_stack(state, 3)?;
    let entry = rt.inner().arena.lock().insert(value);
    let handle = ffi::lua_newuserdatauv(state, mem::size_of::<HostHandle>(), 0) as *mut HostHandle;
    ptr::write(
        handle,
        HostHandle {
            runtime: rt.id(),
            entry: entry.as_u64(),
            strategy: strategy.tag(),
        },
    );
    ffi::luaL_setmetatable(state, HOST_SIGNATURE.as_ptr());
    if strategy == IndexStrategy::Callable {
        ffi::lua_pushlightuserdata(state, rt.inner().weak_ptr());
        ffi::lua_insert(state, -2);
        ffi::lua_pushcclosure(state, callback::function_trampoline, 2);
    }
    Ok(())
}

/// The host handle at `index`, if the value carries the host signature
pub(crate) unsafe fn handle_at(state: *mut ffi::lua_State, index: c_int) -> Option<*mut HostHandle> {
    let ptr = ffi::luaL_testudata(state, index, HOST_SIGNATURE.as_ptr()) as *mut HostHandle;
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Resolve a handle to its host value and strategy
pub(crate) unsafe fn resolve_handle(rt: &Runtime, handle: *const HostHandle) -> Result<(Value, IndexStrategy)> {
    let HostHandle {
        runtime,
        entry,
        strategy,
    } = *handle;
    if runtime != rt.id() {
        return Err(Error::ForeignRuntime);
    }
    let strategy = IndexStrategy::from_tag(strategy)
        .ok_or_else(|| Error::Value(format!("corrupt host handle strategy tag {}", strategy)))?;
    let value = rt
        .inner()
        .arena
        .lock()
        .get(EntryId::from_u64(entry))
        .ok_or_else(|| Error::Value("host object has already been released".to_string()))?;
    Ok((value, strategy))
}

/// Convert the value at `index` (0 slots)
pub(crate) unsafe fn pull(
    rt: &Runtime,
    state: *mut ffi::lua_State,
    index: c_int,
    mode: PullMode,
) -> Result<Value> {
    let index = ffi::lua_absindex(state, index);
    if mode == PullMode::Keep {
        return LuaObject::from_stack(rt, state, index).map(Value::Lua);
    }
    let tag = ffi::lua_type(state, index);
    if let Some(value) = pull_hook(rt, state, index, tag)? {
        return Ok(value);
    }
    match tag {
        ffi::LUA_TNONE | ffi::LUA_TNIL => Ok(Value::Nil),
        ffi::LUA_TBOOLEAN => Ok(Value::Boolean(ffi::lua_toboolean(state, index) != 0)),
        ffi::LUA_TNUMBER => {
            if ffi::lua_isinteger(state, index) != 0 {
                Ok(Value::Integer(ffi::lua_tointegerx(state, index, ptr::null_mut()) as i64))
            } else {
                Ok(Value::Number(ffi::lua_tonumberx(state, index, ptr::null_mut()) as f64))
            }
        }
        ffi::LUA_TSTRING => {
            let bytes = vm::string_bytes(state, index);
            if rt.autodecode() {
                if let Ok(text) = decode_with(rt.encoding(), &bytes) {
                    return Ok(Value::String(text));
                }
            }
            Ok(Value::Bytes(bytes))
        }
        ffi::LUA_TUSERDATA => match handle_at(state, index) {
            Some(handle) => {
                let (value, strategy) = resolve_handle(rt, handle)?;
                Ok(match mode {
                    PullMode::Wrapped => Value::Protocol(Protocol::new(value, strategy)),
                    _ => value,
                })
            }
            None => LuaObject::from_stack(rt, state, index).map(Value::Lua),
        },
        _ => LuaObject::from_stack(rt, state, index).map(Value::Lua),
    }
}

/// Clears the hook flag when the hook returns or unwinds
struct HookScope<'a>(&'a Cell<bool>);

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Run the pull hook registered for the value at `index`, if any. Host
/// handles and pulls nested inside a hook skip the hooks.
unsafe fn pull_hook(rt: &Runtime, state: *mut ffi::lua_State, index: c_int, tag: c_int) -> Result<Option<Value>> {
    let pullers = &rt.options().pullers;
    if pullers.is_empty() {
        return Ok(None);
    }
    let Some(hook) = LuaType::from_tag(tag).and_then(|kind| pullers.find(kind)) else {
        return Ok(None);
    };
    if tag == ffi::LUA_TUSERDATA && handle_at(state, index).is_some() {
        return Ok(None);
    }
    let guard = rt.lock();
    let flag = &guard.vm().in_pull_hook;
    if flag.replace(true) {
        return Ok(None);
    }
    let _scope = HookScope(flag);
    let obj = LuaObject::from_stack(rt, state, index)?;
    hook(rt, &obj).map(Some)
}
