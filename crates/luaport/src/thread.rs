//! Coroutines
//!
//! A coroutine has its own stack. Arguments and results move between the
//! calling state and the coroutine with [`vm::transfer`] while the runtime
//! lock is held.

use std::ffi::c_int;
use std::fmt;
use std::str::FromStr;

use mlua_sys as ffi;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::host::types::HostFunction;
use crate::marshal::{self, PullMode};
use crate::object::{LuaObject, LuaType};
use crate::runtime::Arg;
use crate::value::{as_function, Value};
use crate::vm::shim::Shim;
use crate::vm::{self, StackGuard};

/// Status reported by `coroutine.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Not started, or yielded
    Suspended,
    /// Currently executing
    Running,
    /// Active, but resumed another coroutine
    Normal,
    /// Finished or failed
    Dead,
}

impl FromStr for CoroutineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "suspended" => Ok(CoroutineStatus::Suspended),
            "running" => Ok(CoroutineStatus::Running),
            "normal" => Ok(CoroutineStatus::Normal),
            "dead" => Ok(CoroutineStatus::Dead),
            other => Err(Error::Value(format!("unknown coroutine status '{}'", other))),
        }
    }
}

/// Handle to a Lua coroutine
pub struct LuaThread {
    thread: LuaObject,
    initial: Mutex<Option<Vec<Value>>>,
    // Body of the coroutine, when known, for `restart`
    function: Option<LuaObject>,
}

impl LuaThread {
    /// New coroutine running `function`
    pub(crate) fn spawn(function: &LuaObject, args: &[Value]) -> Result<Self> {
        let rt = function.runtime();
        let guard = rt.lock();
        let state = guard.state()?;
        let thread = unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 2)?;
            let co = ffi::lua_newthread(state);
            function.push_onto(rt, state)?;
            vm::transfer(state, co, 1)?;
            LuaObject::from_stack(rt, state, -1)?
        };
        Ok(LuaThread {
            thread,
            initial: Mutex::new(Some(args.to_vec())),
            function: Some(function.clone()),
        })
    }

    /// A fresh coroutine over the same function, started with `args`
    ///
    /// Fails for an adopted coroutine that had already started when it was
    /// wrapped, since its body is no longer reachable.
    pub fn restart(&self, args: &[Value]) -> Result<LuaThread> {
        match &self.function {
            Some(function) => LuaThread::spawn(function, args),
            None => Err(Error::Value("coroutine function not found".to_string())),
        }
    }

    /// Raise `error` inside the coroutine and resume it
    ///
    /// The error is thrown at the next function call the coroutine makes.
    /// Unless Lua code catches it, it comes back out of this call unchanged
    /// and the coroutine is dead.
    pub fn throw(&self, error: Error) -> Result<Value> {
        let rt = self.thread.runtime();
        let guard = rt.lock();
        let raise = Value::Protocol(as_function(Value::object(HostFunction::new(
            "throw",
            move |_, _| Err(error.clone()),
        ))));
        guard.call_shim(
            Shim::SetHook,
            &[Arg::Object(&self.thread), Arg::Value(&raise)],
            0,
            PullMode::Unwrap,
        )?;
        let result = self.resume(&[]);
        let cleared = guard.call_shim(Shim::SetHook, &[Arg::Object(&self.thread)], 0, PullMode::Unwrap);
        let value = result?;
        cleared?;
        Ok(value)
    }

    /// The coroutine object
    pub fn object(&self) -> &LuaObject {
        &self.thread
    }

    /// Resume, collapsing the yielded or returned values
    pub fn resume(&self, args: &[Value]) -> Result<Value> {
        self.resume_multi(args).map(Value::collapse)
    }

    /// Resume, returning every yielded or returned value
    pub fn resume_multi(&self, args: &[Value]) -> Result<Vec<Value>> {
        let rt = self.thread.runtime();
        let mut all = self.initial.lock().take().unwrap_or_default();
        all.extend_from_slice(args);
        let nargs = c_int::try_from(all.len()).map_err(|_| Error::Value("too many arguments".to_string()))?;

        let guard = rt.lock();
        let state = guard.state()?;
        unsafe {
            let stack = StackGuard::ensure(state);
            vm::check_stack(state, all.len() + 1)?;
            self.thread.push_onto(rt, state)?;
            let co = ffi::lua_tothread(state, -1);
            if co.is_null() {
                return Err(Error::Type("object is not a coroutine".to_string()));
            }
            for arg in &all {
                marshal::push(rt, state, arg)?;
            }
            vm::transfer(state, co, nargs)?;

            let mut nresults: c_int = 0;
            let status = ffi::lua_resume(co, state, nargs, &mut nresults);
            if status != ffi::LUA_OK && status != ffi::LUA_YIELD {
                vm::transfer(co, state, 1)?;
                return Err(guard.error_from_stack(state, status));
            }
            vm::transfer(co, state, nresults)?;
            let top = ffi::lua_gettop(state);
            let first = stack.entry_top() + 2;
            (first..=top)
                .map(|i| marshal::pull(rt, state, i, PullMode::Unwrap))
                .collect()
        }
    }

    /// Current status
    pub fn status(&self) -> Result<CoroutineStatus> {
        let guard = self.thread.runtime().lock();
        let status = guard
            .call_shim(Shim::CoroutineStatus, &[Arg::Object(&self.thread)], 1, PullMode::Unwrap)?
            .pop()
            .unwrap_or_default();
        match status.as_bytes().map(String::from_utf8_lossy) {
            Some(name) => name.parse(),
            None => Err(Error::Value("coroutine.status returned a non-string".to_string())),
        }
    }

    /// Whether the coroutine can still be resumed or is running
    pub fn is_alive(&self) -> Result<bool> {
        Ok(self.status()? != CoroutineStatus::Dead)
    }

    /// Resume without arguments until the coroutine finishes, yielding
    /// each result
    pub fn iter(&self) -> impl Iterator<Item = Result<Value>> + '_ {
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match self.status() {
                Ok(CoroutineStatus::Suspended) => {}
                Ok(_) => return None,
                Err(err) => {
                    failed = true;
                    return Some(Err(err));
                }
            }
            let result = self.resume(&[]);
            failed = result.is_err();
            Some(result)
        })
    }
}

impl TryFrom<LuaObject> for LuaThread {
    type Error = Error;

    fn try_from(obj: LuaObject) -> Result<Self> {
        match obj.kind()? {
            LuaType::Thread => {
                let function = entry_function(&obj)?;
                Ok(LuaThread {
                    thread: obj,
                    initial: Mutex::new(None),
                    function,
                })
            }
            other => Err(Error::Type(format!("expected a Lua thread, got {:?}", other))),
        }
    }
}

/// The body of a coroutine that has not been resumed yet
fn entry_function(thread: &LuaObject) -> Result<Option<LuaObject>> {
    let rt = thread.runtime();
    let guard = rt.lock();
    let state = guard.state()?;
    unsafe {
        let _stack = StackGuard::ensure(state);
        vm::check_stack(state, 2)?;
        thread.push_onto(rt, state)?;
        let co = ffi::lua_tothread(state, -1);
        if co.is_null() || co == state || ffi::lua_status(co) != ffi::LUA_OK || ffi::lua_gettop(co) != 1 {
            return Ok(None);
        }
        ffi::lua_pushvalue(co, 1);
        vm::transfer(co, state, 1)?;
        LuaObject::from_stack(rt, state, -1).map(Some)
    }
}

impl fmt::Debug for LuaThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaThread").field("thread", &self.thread).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_status_parse() {
        assert_eq!("dead".parse::<CoroutineStatus>().unwrap(), CoroutineStatus::Dead);
        assert!("zombie".parse::<CoroutineStatus>().is_err());
    }

    #[test]
    fn test_yield_and_return() {
        let rt = Runtime::new().unwrap();
        let function = rt
            .eval("function(a, b) local c = coroutine.yield(a + b) return c * 2 end", &[])
            .unwrap();
        let function = function.as_lua().unwrap().clone();
        let thread = function.coroutine(&[Value::Integer(1)]).unwrap();
        assert_eq!(thread.status().unwrap(), CoroutineStatus::Suspended);
        assert_eq!(thread.resume(&[Value::Integer(2)]).unwrap(), Value::Integer(3));
        assert_eq!(thread.resume(&[Value::Integer(5)]).unwrap(), Value::Integer(10));
        assert!(!thread.is_alive().unwrap());
        assert!(thread.resume(&[]).is_err());
    }
}
