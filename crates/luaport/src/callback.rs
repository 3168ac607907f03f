//! Calls from Lua into host code
//!
//! Every entry point (metamethods, host functions, pooled slots) runs the
//! same protocol through [`invoke`]: lock the runtime, make the calling
//! state current, pull the arguments, run host code with panics caught and
//! push the results. A failure is stored on the runtime and a Lua error is
//! raised only after every Rust frame of the callback has returned, so the
//! VM's non-local exit never crosses a live Rust destructor.
//!
//! Each `extern "C-unwind"` entry point is split in two: a body that owns
//! all Rust state and returns a negative count to request an error, and
//! the thin outer function that calls `lua_error`.

use std::any::Any;
use std::ffi::c_int;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use mlua_sys as ffi;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::arena::EntryId;
use crate::error::{Error, Result};
use crate::host::ops;
use crate::host::types::HostFn;
use crate::marshal::{self, HostHandle, PullMode};
use crate::object::LuaObject;
use crate::runtime::{runtime_from_upvalue, with_current, Runtime};
use crate::value::Value;
use crate::vm::{self, StackGuard};

/// Number of statically compiled trampolines in the callback pool
pub const CALLBACK_SLOTS: usize = 32;

/// Body return value asking the outer entry point to raise
const RAISE: c_int = -1;

// ============================================================================
// Invocation protocol
// ============================================================================

/// Run `f` as a callback on `state` and push its results. Returns the
/// number of results, or [`RAISE`] with the error value on the stack.
unsafe fn invoke<F>(state: *mut ffi::lua_State, rt: &Runtime, mode: PullMode, expand: bool, f: F) -> c_int
where
    F: FnOnce(&Runtime, Vec<Value>) -> Result<Value>,
{
    let guard = rt.lock();
    with_current(&guard, state, || {
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Value> {
            let args = pull_args(rt, state, mode)?;
            f(rt, args)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(Error::Panic(panic_message(payload.as_ref()))),
        };
        let pushed = result.and_then(|value| {
            let values = if expand { value.into_results() } else { vec![value] };
            push_results(rt, state, &values)
        });
        match pushed {
            Ok(count) => count,
            Err(error) => {
                guard.raise_prepare(state, error);
                RAISE
            }
        }
    })
}

unsafe fn pull_args(rt: &Runtime, state: *mut ffi::lua_State, mode: PullMode) -> Result<Vec<Value>> {
    let stack = StackGuard::assert(state);
    let top = ffi::lua_gettop(state);
    let args = (1..=top)
        .map(|i| marshal::pull(rt, state, i, mode))
        .collect::<Result<Vec<_>>>()?;
    stack.finish()?;
    Ok(args)
}

unsafe fn push_results(rt: &Runtime, state: *mut ffi::lua_State, values: &[Value]) -> Result<c_int> {
    let count = c_int::try_from(values.len()).map_err(|_| Error::Value("too many results".to_string()))?;
    ffi::lua_settop(state, 0);
    vm::check_stack(state, values.len())?;
    for value in values {
        marshal::push(rt, state, value)?;
    }
    Ok(count)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Error for a trampoline whose runtime is gone
unsafe fn push_closed(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_settop(state, 0);
    vm::push_bytes(state, Error::Closed.to_string().as_bytes());
    RAISE
}

// ============================================================================
// Trampolines
// ============================================================================

/// Metamethod entry. Upvalues: the runtime pointer, the handler index.
pub(crate) unsafe extern "C-unwind" fn meta_trampoline(state: *mut ffi::lua_State) -> c_int {
    let count = meta_body(state);
    if count < 0 {
        ffi::lua_error(state)
    } else {
        count
    }
}

unsafe fn meta_body(state: *mut ffi::lua_State) -> c_int {
    let Some(rt) = runtime_from_upvalue(state) else {
        return push_closed(state);
    };
    let index = ffi::lua_tointegerx(state, ffi::lua_upvalueindex(2), ptr::null_mut()) as usize;
    let Some((name, handler)) = rt.inner().handlers.entry(index) else {
        ffi::lua_settop(state, 0);
        vm::push_bytes(state, format!("no metamethod handler at index {}", index).as_bytes());
        return RAISE;
    };
    let expand = matches!(name, "__call" | "__pairs");
    let handler = handler.clone();
    invoke(state, &rt, PullMode::Wrapped, expand, |rt, args| handler(rt, args))
}

/// Entry of a host value pushed with the callable strategy. Upvalues: the
/// runtime pointer, the host handle.
pub(crate) unsafe extern "C-unwind" fn function_trampoline(state: *mut ffi::lua_State) -> c_int {
    let count = function_body(state);
    if count < 0 {
        ffi::lua_error(state)
    } else {
        count
    }
}

unsafe fn function_body(state: *mut ffi::lua_State) -> c_int {
    let Some(rt) = runtime_from_upvalue(state) else {
        return push_closed(state);
    };
    let handle = marshal::handle_at(state, ffi::lua_upvalueindex(2));
    invoke(state, &rt, PullMode::Unwrap, true, |rt, args| {
        let handle = handle.ok_or_else(|| Error::Value("function lost its host handle".to_string()))?;
        let (function, _) = marshal::resolve_handle(rt, handle)?;
        ops::call(rt, &function, args)
    })
}

/// `__gc` of host handles: drop the arena entry. Upvalue: the runtime
/// pointer.
pub(crate) unsafe extern "C-unwind" fn gc_trampoline(state: *mut ffi::lua_State) -> c_int {
    let Some(rt) = runtime_from_upvalue(state) else {
        return 0;
    };
    if rt.is_closed() {
        return 0;
    }
    let Some(handle) = marshal::handle_at(state, 1) else {
        return 0;
    };
    let HostHandle { runtime, entry, .. } = *handle;
    (*handle).entry = 0;
    if runtime != rt.id() || entry == 0 {
        return 0;
    }
    let released = rt.inner().arena.lock().remove(EntryId::from_u64(entry));
    if catch_unwind(AssertUnwindSafe(move || drop(released))).is_err() {
        warn!(runtime = rt.id(), "host value panicked while being released");
    }
    0
}

// ============================================================================
// Slot pool
// ============================================================================

/// A bound pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackSlot {
    index: usize,
    generation: u64,
}

impl CallbackSlot {
    /// Position in the pool
    pub fn index(self) -> usize {
        self.index
    }
}

struct Binding {
    runtime: u64,
    generation: u64,
    func: Arc<HostFn>,
}

struct CallbackPool {
    slots: Vec<Option<Binding>>,
    generation: u64,
}

static POOL: Lazy<Mutex<CallbackPool>> = Lazy::new(|| {
    Mutex::new(CallbackPool {
        slots: (0..CALLBACK_SLOTS).map(|_| None).collect(),
        generation: 0,
    })
});

/// Bind `func` to a free slot for `rt`
pub fn alloc_callback(rt: &Runtime, func: Arc<HostFn>) -> Result<CallbackSlot> {
    let mut pool = POOL.lock();
    let Some(index) = pool.slots.iter().position(Option::is_none) else {
        warn!(runtime = rt.id(), capacity = CALLBACK_SLOTS, "callback pool exhausted");
        return Err(Error::CallbackPoolExhausted {
            capacity: CALLBACK_SLOTS,
        });
    };
    pool.generation += 1;
    let generation = pool.generation;
    pool.slots[index] = Some(Binding {
        runtime: rt.id(),
        generation,
        func,
    });
    trace!(runtime = rt.id(), slot = index, "bound callback slot");
    Ok(CallbackSlot { index, generation })
}

/// Unbind a slot. Lua functions still referring to it raise
/// [`Error::CallbackReleased`] when called.
pub fn release_callback(slot: CallbackSlot) -> Result<()> {
    let released = {
        let mut pool = POOL.lock();
        match pool.slots.get_mut(slot.index) {
            Some(entry) if entry.as_ref().is_some_and(|b| b.generation == slot.generation) => entry.take(),
            _ => return Err(Error::CallbackReleased),
        }
    };
    trace!(slot = slot.index, "released callback slot");
    drop(released);
    Ok(())
}

/// Number of unbound slots
pub fn available_slots() -> usize {
    POOL.lock().slots.iter().filter(|slot| slot.is_none()).count()
}

/// Binding for a slot invocation, if it is still the one the calling
/// closure was created for
fn lookup(index: usize, runtime: u64, generation: u64) -> Option<Arc<HostFn>> {
    let pool = POOL.lock();
    match pool.slots.get(index)? {
        Some(binding) if binding.runtime == runtime && binding.generation == generation => {
            Some(binding.func.clone())
        }
        _ => None,
    }
}

unsafe fn slot_trampoline(index: usize, state: *mut ffi::lua_State) -> c_int {
    let count = slot_body(index, state);
    if count < 0 {
        ffi::lua_error(state)
    } else {
        count
    }
}

unsafe fn slot_body(index: usize, state: *mut ffi::lua_State) -> c_int {
    let Some(rt) = runtime_from_upvalue(state) else {
        return push_closed(state);
    };
    let generation = ffi::lua_tointegerx(state, ffi::lua_upvalueindex(2), ptr::null_mut()) as u64;
    match lookup(index, rt.id(), generation) {
        Some(func) => invoke(state, &rt, PullMode::Unwrap, true, |rt, args| func(rt, args)),
        None => {
            warn!(runtime = rt.id(), slot = index, "released callback invoked");
            invoke(state, &rt, PullMode::Unwrap, true, |_, _| Err(Error::CallbackReleased))
        }
    }
}

macro_rules! slot_trampolines {
    ($($index:literal => $name:ident),* $(,)?) => {
        $(
            unsafe extern "C-unwind" fn $name(state: *mut ffi::lua_State) -> c_int {
                slot_trampoline($index, state)
            }
        )*

        static SLOT_FUNCTIONS: [ffi::lua_CFunction; CALLBACK_SLOTS] = [$($name),*];
    };
}

slot_trampolines! {
    0 => slot_0, 1 => slot_1, 2 => slot_2, 3 => slot_3,
    4 => slot_4, 5 => slot_5, 6 => slot_6, 7 => slot_7,
    8 => slot_8, 9 => slot_9, 10 => slot_10, 11 => slot_11,
    12 => slot_12, 13 => slot_13, 14 => slot_14, 15 => slot_15,
    16 => slot_16, 17 => slot_17, 18 => slot_18, 19 => slot_19,
    20 => slot_20, 21 => slot_21, 22 => slot_22, 23 => slot_23,
    24 => slot_24, 25 => slot_25, 26 => slot_26, 27 => slot_27,
    28 => slot_28, 29 => slot_29, 30 => slot_30, 31 => slot_31,
}

/// Lua function calling the slot's trampoline
fn slot_function(rt: &Runtime, slot: CallbackSlot) -> Result<LuaObject> {
    let guard = rt.lock();
    let state = guard.state()?;
    unsafe {
        let _stack = StackGuard::ensure(state);
        vm::check_stack(state, 3)?;
        ffi::lua_pushlightuserdata(state, rt.inner().weak_ptr());
        ffi::lua_pushinteger(state, slot.generation as ffi::lua_Integer);
        ffi::lua_pushcclosure(state, SLOT_FUNCTIONS[slot.index], 2);
        LuaObject::from_stack(rt, state, -1)
    }
}

/// A host closure bound to a pool slot, exposed as a Lua function. The
/// slot is released when this value is dropped.
pub struct PooledFunction {
    slot: CallbackSlot,
    function: LuaObject,
}

impl PooledFunction {
    pub(crate) fn new(rt: &Runtime, func: Arc<HostFn>) -> Result<Self> {
        let slot = alloc_callback(rt, func)?;
        match slot_function(rt, slot) {
            Ok(function) => Ok(PooledFunction { slot, function }),
            Err(err) => {
                let _ = release_callback(slot);
                Err(err)
            }
        }
    }

    /// The Lua function
    pub fn function(&self) -> &LuaObject {
        &self.function
    }

    /// The bound slot
    pub fn slot(&self) -> CallbackSlot {
        self.slot
    }

    /// Call through Lua
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.function.call(args)
    }
}

impl fmt::Debug for PooledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledFunction").field("slot", &self.slot.index).finish()
    }
}

impl Drop for PooledFunction {
    fn drop(&mut self) {
        let _ = release_callback(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_slot_table_is_complete() {
        assert_eq!(SLOT_FUNCTIONS.len(), CALLBACK_SLOTS);
    }
}
