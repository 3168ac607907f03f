//! Raw VM helpers
//!
//! Thin wrappers over the Lua C API shared by the rest of the crate. None of
//! these acquire the runtime lock; callers must hold it.

use std::ffi::{c_char, c_int};
use std::ptr;

use mlua_sys as ffi;

use crate::error::{Error, Result};

pub(crate) mod shim;

/// Metatable name identifying host handle userdata
pub(crate) const HOST_SIGNATURE: &std::ffi::CStr = c"luaport.HostObject";

/// A Lua state pointer that may move between threads with its runtime.
/// Access is serialized by the runtime lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatePtr(pub *mut ffi::lua_State);

unsafe impl Send for StatePtr {}
unsafe impl Sync for StatePtr {}

impl StatePtr {
    pub(crate) fn null() -> Self {
        StatePtr(ptr::null_mut())
    }

    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }
}

// ============================================================================
// Stack guards
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Balance {
    /// Restore the entry top on exit
    Ensure,
    /// The exit top must equal the entry top
    Assert,
}

/// Scoped stack-balance check
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
    mode: Balance,
}

impl StackGuard {
    /// Restore the current top when the guard is dropped
    pub(crate) unsafe fn ensure(state: *mut ffi::lua_State) -> Self {
        StackGuard {
            state,
            top: ffi::lua_gettop(state),
            mode: Balance::Ensure,
        }
    }

    /// Check that the top is unchanged when the guard is dropped
    pub(crate) unsafe fn assert(state: *mut ffi::lua_State) -> Self {
        StackGuard {
            state,
            top: ffi::lua_gettop(state),
            mode: Balance::Assert,
        }
    }

    /// Top recorded on entry
    pub(crate) fn entry_top(&self) -> c_int {
        self.top
    }

    /// Finish explicitly, reporting an imbalance as an error
    pub(crate) fn finish(self) -> Result<()> {
        let (state, expected, mode) = (self.state, self.top, self.mode);
        std::mem::forget(self);
        let actual = unsafe { ffi::lua_gettop(state) };
        match mode {
            Balance::Ensure if actual >= expected => {
                unsafe { ffi::lua_settop(state, expected) };
                Ok(())
            }
            _ if actual == expected => Ok(()),
            _ => Err(Error::StackImbalance { expected, actual }),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        let actual = unsafe { ffi::lua_gettop(self.state) };
        match self.mode {
            Balance::Ensure if actual >= self.top => unsafe { ffi::lua_settop(self.state, self.top) },
            _ if actual == self.top => {}
            _ => {
                tracing::error!(expected = self.top, actual, "Lua stack imbalance");
                if !std::thread::panicking() {
                    debug_assert_eq!(actual, self.top, "Lua stack imbalance");
                }
            }
        }
    }
}

// ============================================================================
// Stack helpers
// ============================================================================

/// Make room for `extra` more slots
pub(crate) unsafe fn check_stack(state: *mut ffi::lua_State, extra: usize) -> Result<()> {
    let extra = c_int::try_from(extra).map_err(|_| Error::Value("too many values".to_string()))?;
    if ffi::lua_checkstack(state, extra) == 0 {
        return Err(Error::Value("Lua stack overflow".to_string()));
    }
    Ok(())
}

/// Push a byte string
pub(crate) unsafe fn push_bytes(state: *mut ffi::lua_State, bytes: &[u8]) {
    ffi::lua_pushlstring(state, bytes.as_ptr() as *const c_char, bytes.len());
}

/// Bytes of the string at `index`. Must only be called on actual strings,
/// since `lua_tolstring` converts numbers in place.
pub(crate) unsafe fn string_bytes(state: *mut ffi::lua_State, index: c_int) -> Vec<u8> {
    let mut len = 0usize;
    let data = ffi::lua_tolstring(state, index, &mut len);
    if data.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(data as *const u8, len).to_vec()
}

/// Lua type name for a type tag
pub(crate) fn type_name(tag: c_int) -> &'static str {
    match tag {
        ffi::LUA_TNONE => "no value",
        ffi::LUA_TNIL => "nil",
        ffi::LUA_TBOOLEAN => "boolean",
        ffi::LUA_TLIGHTUSERDATA | ffi::LUA_TUSERDATA => "userdata",
        ffi::LUA_TNUMBER => "number",
        ffi::LUA_TSTRING => "string",
        ffi::LUA_TTABLE => "table",
        ffi::LUA_TFUNCTION => "function",
        ffi::LUA_TTHREAD => "thread",
        _ => "unknown",
    }
}

/// Push `registry[key]`
pub(crate) unsafe fn push_ref(state: *mut ffi::lua_State, key: c_int) {
    ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, key as ffi::lua_Integer);
}

/// Pop the top value into a new registry reference
pub(crate) unsafe fn make_ref(state: *mut ffi::lua_State) -> c_int {
    ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX)
}

/// Release a registry reference
pub(crate) unsafe fn release_ref(state: *mut ffi::lua_State, key: c_int) {
    if key != ffi::LUA_NOREF && key != ffi::LUA_REFNIL {
        ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, key);
    }
}

/// Push the globals table
pub(crate) unsafe fn push_globals(state: *mut ffi::lua_State) {
    ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
}

/// Push `t[name]` without invoking metamethods, where `t` is at `index`
pub(crate) unsafe fn raw_get_field(state: *mut ffi::lua_State, index: c_int, name: &str) -> c_int {
    let index = ffi::lua_absindex(state, index);
    push_bytes(state, name.as_bytes());
    ffi::lua_rawget(state, index)
}

/// Whether the value at `index` can be called: a function, or a value
/// whose metatable has `__call`
pub(crate) unsafe fn is_callable(state: *mut ffi::lua_State, index: c_int) -> bool {
    if ffi::lua_type(state, index) == ffi::LUA_TFUNCTION {
        return true;
    }
    if ffi::luaL_getmetafield(state, index, c"__call".as_ptr()) != ffi::LUA_TNIL {
        ffi::lua_pop(state, 1);
        return true;
    }
    false
}

/// Move the top `n` values of `from` onto `to`. Both states must belong to
/// the same VM and the runtime lock must be held.
pub(crate) unsafe fn transfer(from: *mut ffi::lua_State, to: *mut ffi::lua_State, n: c_int) -> Result<()> {
    if n <= 0 || from == to {
        return Ok(());
    }
    check_stack(to, n as usize)?;
    ffi::lua_xmove(from, to, n);
    Ok(())
}
