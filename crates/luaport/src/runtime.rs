//! The runtime: one Lua state plus everything needed to exchange values
//! with it
//!
//! A [`Runtime`] is a cheap handle (`Arc`) to the shared state. Every VM
//! stack operation happens under its re-entrant lock, which callbacks
//! re-acquire on the same thread while Lua is running. The Lua state is
//! closed exactly once, by [`Runtime::close`] or when the last owning
//! `Runtime` goes away. [`LuaObject`]s and the runtime handed to callbacks
//! do not own the state: a host closure reachable from Lua may hold
//! handles without keeping the VM open.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_int, c_void, CString};
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use mlua_sys as ffi;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::arena::RefArena;
use crate::callback::PooledFunction;
use crate::encoding::{decode_with, Encoding};
use crate::error::{Error, LuaError, Result};
use crate::host::types::{HostException, HostFunction};
use crate::host::{ops, HostObject};
use crate::hostlib;
use crate::marshal::{self, PullMode};
use crate::metatable::{self, LinkedMetatable};
use crate::object::LuaObject;
use crate::options::{RuntimeBuilder, RuntimeOptions};
use crate::value::{as_function, Value};
use crate::vm::shim::Shim;
use crate::vm::{self, StackGuard, StatePtr};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Garbage collector operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOp {
    /// Stop the collector
    Stop,
    /// Restart the collector
    Restart,
    /// Perform a full cycle
    Collect,
    /// Memory in use, in kilobytes
    Count,
    /// Remainder of the memory in use, in bytes
    CountBytes,
    /// Perform an incremental step of the given size
    Step(i32),
    /// Whether the collector is running
    IsRunning,
}

/// Source code for [`Runtime::compile`]
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// Text, encoded with the runtime's source encoding
    Text(&'a str),
    /// Raw chunk bytes
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for Source<'a> {
    fn from(s: &'a str) -> Self {
        Source::Text(s)
    }
}

impl<'a> From<&'a String> for Source<'a> {
    fn from(s: &'a String) -> Self {
        Source::Text(s)
    }
}

impl<'a> From<&'a [u8]> for Source<'a> {
    fn from(b: &'a [u8]) -> Self {
        Source::Bytes(b)
    }
}

impl<'a> From<&'a Vec<u8>> for Source<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        Source::Bytes(b)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Source<'a> {
    fn from(b: &'a [u8; N]) -> Self {
        Source::Bytes(b)
    }
}

/// Host error waiting to be replayed at the host frame that entered Lua
pub(crate) struct StoredException {
    pub(crate) error: Error,
    pub(crate) token: Arc<dyn HostObject>,
}

/// State guarded by the runtime lock
pub(crate) struct VmCell {
    pub(crate) main: Cell<StatePtr>,
    pub(crate) current: Cell<StatePtr>,
    pub(crate) depth: Cell<u32>,
    pub(crate) exception: RefCell<Option<StoredException>>,
    pub(crate) shims: RefCell<FxHashMap<Shim, c_int>>,
    /// Set while a pull hook runs
    pub(crate) in_pull_hook: Cell<bool>,
}

pub(crate) struct RuntimeInner {
    id: u64,
    version: i32,
    pub(crate) vm: ReentrantMutex<VmCell>,
    pub(crate) arena: Mutex<RefArena>,
    pub(crate) handlers: LinkedMetatable,
    closed: AtomicBool,
    owners: AtomicUsize,
    options: RuntimeOptions,
    self_ref: Box<Weak<RuntimeInner>>,
}

impl RuntimeInner {
    /// Pointer stored as the first upvalue of every trampoline
    pub(crate) fn weak_ptr(&self) -> *mut c_void {
        &*self.self_ref as *const Weak<RuntimeInner> as *mut c_void
    }

    fn close(&self) {
        let vm = self.vm.lock();
        if vm.depth.get() > 0 {
            warn!(runtime = self.id, "close() called from inside a callback, ignored");
            return;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let main = vm.main.replace(StatePtr::null());
        vm.current.set(StatePtr::null());
        vm.shims.borrow_mut().clear();
        let exception = vm.exception.borrow_mut().take();
        unsafe { ffi::lua_close(main.0) };
        let released = self.arena.lock().drain();
        drop(vm);
        debug!(runtime = self.id, released = released.len(), "closed Lua state");
        drop(released);
        drop(exception);
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to an embedded Lua VM
///
/// Handles returned by [`Runtime::new`] and their clones own the state;
/// dropping the last of them closes it. Handles reached through
/// [`LuaObject::runtime`] or passed to host callbacks are borrowed views:
/// they work while an owner is alive and fail with [`Error::Closed`]
/// afterwards.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    owner: bool,
}

impl Runtime {
    /// Create a runtime with default options
    pub fn new() -> Result<Self> {
        Self::with_options(RuntimeOptions::default())
    }

    /// Start building a runtime
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Create a runtime with explicit options
    pub fn with_options(options: RuntimeOptions) -> Result<Self> {
        let state = unsafe { ffi::luaL_newstate() };
        if state.is_null() {
            return Err(Error::Init);
        }
        unsafe { ffi::luaL_openlibs(state) };
        let version = unsafe { ffi::lua_version(state) } as i32;
        let handlers = LinkedMetatable::link(&options.metatable, version);
        let inner = Arc::new_cyclic(|weak| RuntimeInner {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            version,
            vm: ReentrantMutex::new(VmCell {
                main: Cell::new(StatePtr(state)),
                current: Cell::new(StatePtr(state)),
                depth: Cell::new(0),
                exception: RefCell::new(None),
                shims: RefCell::new(FxHashMap::default()),
                in_pull_hook: Cell::new(false),
            }),
            arena: Mutex::new(RefArena::new()),
            handlers,
            closed: AtomicBool::new(false),
            owners: AtomicUsize::new(1),
            options,
            self_ref: Box::new(weak.clone()),
        });
        let runtime = Runtime { inner, owner: true };
        runtime.install()?;
        debug!(runtime = runtime.id(), version, "opened Lua state");
        Ok(runtime)
    }

    fn install(&self) -> Result<()> {
        {
            let guard = self.lock();
            let state = guard.state()?;
            unsafe {
                let stack = StackGuard::assert(state);
                metatable::install(self, state)?;
                stack.finish()?;
            }
        }
        if let Some(name) = &self.inner.options.lib_name {
            hostlib::install(self, name)?;
        }
        Ok(())
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Runtime { inner, owner: false }
    }

    /// Borrowed handle that does not keep the state open
    pub(crate) fn share(&self) -> Self {
        Runtime::from_inner(self.inner.clone())
    }

    /// Whether this handle keeps the state open
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub(crate) fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Whether two handles refer to the same runtime
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Unique id of this runtime
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Engine version as reported by `lua_version` (e.g. 504)
    pub fn version(&self) -> i32 {
        self.inner.version
    }

    /// Encoding for host text
    pub fn encoding(&self) -> Option<Encoding> {
        self.inner.options.encoding
    }

    /// Encoding for source text
    pub fn source_encoding(&self) -> Encoding {
        self.inner.options.effective_source_encoding()
    }

    /// Whether pulled strings are decoded to text
    pub fn autodecode(&self) -> bool {
        self.inner.options.autodecode
    }

    /// Whether the Lua state has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the Lua state. Later calls are no-ops; derived handles become
    /// invalid. Ignored when called from inside a callback.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Number of host values currently reachable from Lua
    pub fn live_handles(&self) -> usize {
        self.inner.arena.lock().len()
    }

    /// Acquire the runtime lock. Re-entrant on the same thread.
    pub fn lock(&self) -> RuntimeGuard<'_> {
        RuntimeGuard {
            runtime: self,
            vm: self.inner.vm.lock(),
        }
    }

    // ========================================================================
    // Loading and running code
    // ========================================================================

    /// Compile a chunk into a function
    pub fn compile<'a>(&self, code: impl Into<Source<'a>>, chunkname: &str) -> Result<LuaObject> {
        let bytes = match code.into() {
            Source::Text(text) => self.source_encoding().encode(text)?,
            Source::Bytes(bytes) => bytes.to_vec(),
        };
        let name = CString::new(chunkname).unwrap_or_else(|_| CString::from(c"=(load)"));
        let guard = self.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 1)?;
            let status = ffi::luaL_loadbufferx(
                state,
                bytes.as_ptr() as *const c_char,
                bytes.len(),
                name.as_ptr(),
                ptr::null(),
            );
            if status != ffi::LUA_OK {
                return Err(guard.error_from_stack(state, status));
            }
            LuaObject::from_stack(self, state, -1)
        }
    }

    /// Compile a file into a function
    pub fn compile_path(&self, path: impl AsRef<Path>) -> Result<LuaObject> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| Error::Encoding(format!("path is not valid UTF-8: {}", path.display())))?;
        let path = CString::new(path).map_err(|_| Error::Value("path contains a NUL byte".to_string()))?;
        let guard = self.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 1)?;
            let status = ffi::luaL_loadfilex(state, path.as_ptr(), ptr::null());
            if status != ffi::LUA_OK {
                return Err(guard.error_from_stack(state, status));
            }
            LuaObject::from_stack(self, state, -1)
        }
    }

    /// Compile and run a chunk, collapsing its results
    pub fn execute<'a>(&self, code: impl Into<Source<'a>>, args: &[Value]) -> Result<Value> {
        let code = code.into();
        let function = self.compile(code, &chunkname_for(code))?;
        function.call(args)
    }

    /// Evaluate an expression list, collapsing its results
    pub fn eval<'a>(&self, code: impl Into<Source<'a>>, args: &[Value]) -> Result<Value> {
        let code = code.into();
        let chunkname = chunkname_for(code);
        let function = match code {
            Source::Text(text) => self.compile(format!("return {}", text).as_str(), &chunkname)?,
            Source::Bytes(bytes) => {
                let mut source = b"return ".to_vec();
                source.extend_from_slice(bytes);
                self.compile(&source, &chunkname)?
            }
        };
        function.call(args)
    }

    // ========================================================================
    // Globals and tables
    // ========================================================================

    /// The globals table
    pub fn globals(&self) -> Result<LuaObject> {
        let guard = self.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 1)?;
            vm::push_globals(state);
            LuaObject::from_stack(self, state, -1)
        }
    }

    /// Read a global variable
    pub fn get_global(&self, name: &str) -> Result<Value> {
        self.globals()?.get(self.name_key(name)?)
    }

    /// Assign a global variable
    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.globals()?.set(self.name_key(name)?, value)
    }

    /// Identifier as a Lua string key. Names follow the source encoding,
    /// so they work without a text encoding configured.
    pub(crate) fn name_key(&self, name: &str) -> Result<Value> {
        self.source_encoding().encode(name).map(Value::Bytes)
    }

    /// Create a table with sequence items at 1.. followed by keyed entries
    pub fn table(&self, positional: &[Value], named: &[(Value, Value)]) -> Result<LuaObject> {
        for (key, _) in named {
            check_table_key(key)?;
        }
        let narr = c_int::try_from(positional.len()).unwrap_or(c_int::MAX);
        let nrec = c_int::try_from(named.len()).unwrap_or(c_int::MAX);
        let guard = self.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            vm::check_stack(state, 3)?;
            ffi::lua_createtable(state, narr, nrec);
            for (i, value) in positional.iter().enumerate() {
                marshal::push(self, state, value)?;
                ffi::lua_rawseti(state, -2, i as ffi::lua_Integer + 1);
            }
            for (key, value) in named {
                marshal::push(self, state, key)?;
                marshal::push(self, state, value)?;
                ffi::lua_rawset(state, -3);
            }
            LuaObject::from_stack(self, state, -1)
        }
    }

    /// Create a table from several sources: mappings (host maps and Lua
    /// tables) are merged, other iterables are appended from index 1.
    /// Later keys override earlier ones.
    pub fn table_from(&self, sources: &[Value]) -> Result<LuaObject> {
        let mut entries = Vec::new();
        let mut next_index = 1i64;
        for source in sources {
            if ops::is_mapping(source) {
                entries.extend(ops::iter(self, source)?.into_pairs());
            } else {
                for value in ops::iter(self, source)?.into_values() {
                    entries.push((Value::Integer(next_index), value));
                    next_index += 1;
                }
            }
        }
        self.table(&[], &entries)
    }

    /// Wrap a host closure as a real Lua function
    pub fn create_function<F>(&self, name: &str, func: F) -> Result<LuaObject>
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.to_lua(&Value::Protocol(as_function(Value::object(HostFunction::new(name, func)))))
    }

    /// Bind a host closure to a pooled trampoline slot
    pub fn create_pooled_function<F>(&self, func: F) -> Result<PooledFunction>
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        PooledFunction::new(self, Arc::new(func))
    }

    /// Push a value and return a handle to the resulting Lua value
    pub fn to_lua(&self, value: &Value) -> Result<LuaObject> {
        let guard = self.lock();
        let state = guard.state()?;
        unsafe {
            let _stack = StackGuard::ensure(state);
            marshal::push(self, state, value)?;
            LuaObject::from_stack(self, state, -1)
        }
    }

    /// Handle holding Lua `nil`, valid for this runtime only
    pub fn nil(&self) -> LuaObject {
        LuaObject::nil(self)
    }

    /// Control the garbage collector
    pub fn gc(&self, op: GcOp) -> Result<i32> {
        let guard = self.lock();
        let state = guard.state()?;
        let result = unsafe {
            match op {
                GcOp::Stop => ffi::lua_gc(state, ffi::LUA_GCSTOP, 0),
                GcOp::Restart => ffi::lua_gc(state, ffi::LUA_GCRESTART, 0),
                GcOp::Collect => ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0),
                GcOp::Count => ffi::lua_gc(state, ffi::LUA_GCCOUNT, 0),
                GcOp::CountBytes => ffi::lua_gc(state, ffi::LUA_GCCOUNTB, 0),
                GcOp::Step(size) => ffi::lua_gc(state, ffi::LUA_GCSTEP, size as c_int),
                GcOp::IsRunning => ffi::lua_gc(state, ffi::LUA_GCISRUNNING, 0),
            }
        };
        Ok(result as i32)
    }
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        if self.owner {
            self.inner.owners.fetch_add(1, Ordering::Relaxed);
        }
        Runtime {
            inner: self.inner.clone(),
            owner: self.owner,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.owner && self.inner.owners.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!(runtime = self.inner.id, "last owner dropped");
            self.inner.close();
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version)
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn chunkname_for(code: Source<'_>) -> String {
    let text = match code {
        Source::Text(text) => text.to_string(),
        Source::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    };
    if text.contains('\0') {
        "=(load)".to_string()
    } else {
        text
    }
}

fn check_table_key(key: &Value) -> Result<()> {
    match key {
        Value::Nil => Err(Error::Value("table index is nil".to_string())),
        Value::Number(n) if n.is_nan() => Err(Error::Value("table index is NaN".to_string())),
        _ => Ok(()),
    }
}

// ============================================================================
// Lock guard
// ============================================================================

/// Re-entrant lock token for a runtime. Raw stack access goes through it.
pub struct RuntimeGuard<'a> {
    runtime: &'a Runtime,
    vm: ReentrantMutexGuard<'a, VmCell>,
}

/// Argument to a shim call
pub(crate) enum Arg<'a> {
    Object(&'a LuaObject),
    Value(&'a Value),
}

impl Arg<'_> {
    fn type_name(&self) -> String {
        match self {
            Arg::Object(obj) => format!("Lua {}", obj.type_name().unwrap_or("value")),
            Arg::Value(value) => value.type_name(),
        }
    }
}

impl<'a> RuntimeGuard<'a> {
    /// The runtime this guard locks
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub(crate) fn vm(&self) -> &VmCell {
        &self.vm
    }

    /// The state currently operated on: the main state, or the coroutine
    /// that invoked the running callback
    pub(crate) fn state(&self) -> Result<*mut ffi::lua_State> {
        let state = self.vm.current.get();
        if state.is_null() {
            Err(Error::Closed)
        } else {
            Ok(state.0)
        }
    }

    /// Current stack top
    pub fn top(&self) -> Result<i32> {
        let state = self.state()?;
        Ok(unsafe { ffi::lua_gettop(state) })
    }

    /// Set the stack top
    pub fn set_top(&self, top: i32) -> Result<()> {
        let state = self.state()?;
        let current = unsafe { ffi::lua_gettop(state) };
        if top < 0 || top > current {
            return Err(Error::Value(format!("invalid stack top {} (current {})", top, current)));
        }
        unsafe { ffi::lua_settop(state, top) };
        Ok(())
    }

    /// Pop `n` values
    pub fn pop(&self, n: i32) -> Result<()> {
        let top = self.top()?;
        self.set_top(top - n)
    }

    /// Push a value (+1)
    pub fn push(&self, value: &Value) -> Result<()> {
        let state = self.state()?;
        unsafe { marshal::push(self.runtime, state, value) }
    }

    /// Convert the value at `index` (0)
    pub fn pull(&self, index: i32) -> Result<Value> {
        self.pull_with(index, PullMode::Unwrap)
    }

    /// Convert the value at `index` with an explicit mode (0)
    pub fn pull_with(&self, index: i32, mode: PullMode) -> Result<Value> {
        let state = self.state()?;
        unsafe {
            let top = ffi::lua_gettop(state);
            let absolute = if index < 0 { top + index + 1 } else { index };
            if absolute < 1 || absolute > top {
                return Err(Error::Index(format!("stack index {} out of range", index)));
            }
            marshal::pull(self.runtime, state, absolute, mode)
        }
    }

    // ========================================================================
    // Protected calls
    // ========================================================================

    /// `lua_pcall`, converting failures
    pub(crate) unsafe fn pcall(
        &self,
        state: *mut ffi::lua_State,
        nargs: c_int,
        nresults: c_int,
        msgh: c_int,
    ) -> Result<()> {
        let status = ffi::lua_pcall(state, nargs, nresults, msgh);
        if status == ffi::LUA_OK {
            Ok(())
        } else {
            Err(self.error_from_stack(state, status))
        }
    }

    /// Pop the error value and turn it into an [`Error`]. A value that is
    /// the stored host exception replays the original host error.
    pub(crate) unsafe fn error_from_stack(&self, state: *mut ffi::lua_State, status: c_int) -> Error {
        let value = marshal::pull(self.runtime, state, -1, PullMode::Unwrap).unwrap_or_default();
        ffi::lua_pop(state, 1);
        let stored = self.vm.exception.borrow_mut().take();
        if let (Some(stored), Value::Object(obj)) = (stored, &value) {
            if Arc::ptr_eq(&stored.token, obj) {
                trace!(runtime = self.runtime.id(), "replaying host error");
                return stored.error;
            }
        }
        let message = match &value {
            Value::Bytes(bytes) => decode_with(self.runtime.encoding(), bytes)
                .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned()),
            Value::Lua(obj) => format!("(error object is a {} value)", obj.type_name().unwrap_or("unknown")),
            Value::Nil => "nil".to_string(),
            other => ops::display(self.runtime, other).unwrap_or_else(|e| e.to_string()),
        };
        Error::Lua(LuaError::new(status, self.runtime.version(), message))
    }

    /// Record a host error and push the error object Lua will propagate
    pub(crate) unsafe fn raise_prepare(&self, state: *mut ffi::lua_State, error: Error) {
        ffi::lua_settop(state, 0);
        trace!(runtime = self.runtime.id(), error = %error, "storing host error");
        let token: Arc<dyn HostObject> = Arc::new(HostException::new(error.clone()));
        let pushed = marshal::push_handle(
            self.runtime,
            state,
            Value::Object(token.clone()),
            crate::value::IndexStrategy::Attribute,
        );
        match pushed {
            Ok(()) => {
                *self.vm.exception.borrow_mut() = Some(StoredException { error, token });
            }
            Err(_) => {
                ffi::lua_settop(state, 0);
                vm::push_bytes(state, error.to_string().as_bytes());
            }
        }
    }

    /// Push `debug.traceback` if it exists and is callable. Only attached
    /// when the callee itself is callable, so calling a non-function
    /// reports a plain error.
    unsafe fn push_traceback(&self, state: *mut ffi::lua_State) -> bool {
        vm::push_globals(state);
        if vm::raw_get_field(state, -1, "debug") != ffi::LUA_TTABLE {
            ffi::lua_pop(state, 2);
            return false;
        }
        vm::raw_get_field(state, -1, "traceback");
        if !vm::is_callable(state, -1) {
            ffi::lua_pop(state, 3);
            return false;
        }
        ffi::lua_insert(state, -3);
        ffi::lua_pop(state, 2);
        true
    }

    /// Call `func` with `args`, returning every result
    pub(crate) fn call_object(&self, func: &LuaObject, args: &[Value], mode: PullMode) -> Result<Vec<Value>> {
        let state = self.state()?;
        let nargs = c_int::try_from(args.len()).map_err(|_| Error::Value("too many arguments".to_string()))?;
        unsafe {
            let stack = StackGuard::ensure(state);
            vm::check_stack(state, args.len() + 4)?;
            let base = stack.entry_top();
            func.push_onto(self.runtime, state)?;
            let has_handler = vm::is_callable(state, -1) && self.push_traceback(state);
            if has_handler {
                ffi::lua_insert(state, -2);
            }
            for arg in args {
                marshal::push(self.runtime, state, arg)?;
            }
            let msgh = if has_handler { base + 1 } else { 0 };
            self.pcall(state, nargs, ffi::LUA_MULTRET, msgh)?;
            let first = base + 1 + c_int::from(has_handler);
            let top = ffi::lua_gettop(state);
            (first..=top)
                .map(|i| marshal::pull(self.runtime, state, i, mode))
                .collect()
        }
    }

    // ========================================================================
    // Shims
    // ========================================================================

    unsafe fn push_shim(&self, state: *mut ffi::lua_State, shim: Shim) -> Result<()> {
        let cached = self.vm.shims.borrow().get(&shim).copied();
        if let Some(key) = cached {
            vm::push_ref(state, key);
            return Ok(());
        }
        if self.runtime.version() < shim.min_version() {
            return Err(Error::Unsupported(format!(
                "operator '{}' requires Lua 5.3 or later (running {})",
                shim.name(),
                self.runtime.version()
            )));
        }
        let source = shim.source();
        let name = CString::new(shim.chunk_name()).map_err(|_| Error::Value("invalid shim name".to_string()))?;
        let status = ffi::luaL_loadbufferx(
            state,
            source.as_ptr() as *const c_char,
            source.len(),
            name.as_ptr(),
            ptr::null(),
        );
        if status != ffi::LUA_OK {
            let err = self.error_from_stack(state, status);
            return Err(Error::Unsupported(format!("cannot compile '{}': {}", shim.name(), err)));
        }
        self.pcall(state, 0, 1, 0)?;
        ffi::lua_pushvalue(state, -1);
        let key = vm::make_ref(state);
        self.vm.shims.borrow_mut().insert(shim, key);
        trace!(runtime = self.runtime.id(), shim = shim.name(), "compiled shim");
        Ok(())
    }

    /// Call a shim under `lua_pcall`. An error raised by the operator itself
    /// becomes [`Error::Type`]; errors from metamethods propagate unchanged.
    pub(crate) fn call_shim(
        &self,
        shim: Shim,
        args: &[Arg<'_>],
        nresults: c_int,
        mode: PullMode,
    ) -> Result<Vec<Value>> {
        let state = self.state()?;
        unsafe {
            let stack = StackGuard::ensure(state);
            vm::check_stack(state, args.len() + 2)?;
            self.push_shim(state, shim)?;
            for arg in args {
                match arg {
                    Arg::Object(obj) => obj.push_onto(self.runtime, state)?,
                    Arg::Value(value) => marshal::push(self.runtime, state, value)?,
                }
            }
            let nargs = args.len() as c_int;
            if let Err(err) = self.pcall(state, nargs, nresults, 0) {
                return Err(self.shim_error(shim, err, args));
            }
            let base = stack.entry_top();
            let top = ffi::lua_gettop(state);
            (base + 1..=top)
                .map(|i| marshal::pull(self.runtime, state, i, mode))
                .collect()
        }
    }

    fn shim_error(&self, shim: Shim, err: Error, args: &[Arg<'_>]) -> Error {
        let raised_here = err.as_lua().is_some_and(|lua| shim.raised_here(&lua.message));
        if !raised_here {
            return err;
        }
        let name = |i: usize| args.get(i).map(Arg::type_name).unwrap_or_else(|| "nil".to_string());
        match shim {
            Shim::Arith(op) => Error::Type(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                name(0),
                name(1)
            )),
            Shim::Concat => Error::Type(format!(
                "unsupported operand type(s) for ..: '{}' and '{}'",
                name(0),
                name(1)
            )),
            Shim::Unary(op) => Error::Type(format!(
                "bad operand type for unary {}: '{}'",
                op.symbol(),
                name(0)
            )),
            Shim::Compare(op) => Error::Type(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                name(0),
                name(1)
            )),
            _ => {
                let message = err.as_lua().map(|lua| lua.message.clone()).unwrap_or_default();
                let message = match message.split_once(": ") {
                    Some((_, rest)) => rest.to_string(),
                    None => message,
                };
                Error::Type(message)
            }
        }
    }
}

/// Resolve the runtime from a trampoline's first upvalue. `None` once the
/// runtime is being dropped.
pub(crate) unsafe fn runtime_from_upvalue(state: *mut ffi::lua_State) -> Option<Runtime> {
    let ptr = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const Weak<RuntimeInner>;
    if ptr.is_null() {
        return None;
    }
    (*ptr).upgrade().map(Runtime::from_inner)
}

/// Enter a callback on `state`: make it current for the duration of `f`
pub(crate) fn with_current<R>(guard: &RuntimeGuard<'_>, state: *mut ffi::lua_State, f: impl FnOnce() -> R) -> R {
    let vm = guard.vm();
    let previous = vm.current.replace(StatePtr(state));
    vm.depth.set(vm.depth.get() + 1);
    let result = f();
    vm.depth.set(vm.depth.get() - 1);
    vm.current.set(previous);
    result
}
