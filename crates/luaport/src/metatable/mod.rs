//! Metatable of host handles
//!
//! [`Metatable`] maps metamethod names to handlers. It is plain
//! configuration: copy [`Metatable::standard`], override entries, and pass
//! it to the runtime builder. At runtime construction the table is linked
//! into a [`LinkedMetatable`] and installed once; each installed metamethod
//! is a C closure that carries the handler's index.
//!
//! `__gc` is owned by the runtime and cannot be overridden.

use std::ffi::c_int;
use std::fmt;
use std::sync::Arc;

use mlua_sys as ffi;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::callback;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::value::Value;
use crate::vm::{self, HOST_SIGNATURE};

mod handlers;
mod pairs;

pub use pairs::PairsStepper;

/// Metamethod handler. Arguments are pulled in
/// [`PullMode::Wrapped`](crate::PullMode::Wrapped), so host handles arrive
/// as [`Protocol`](crate::Protocol) values carrying their strategy.
pub type MetaHandler = Arc<dyn Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync>;

/// Metamethods only meaningful from Lua 5.3 on
const LUA53_METAMETHODS: [&str; 7] = ["__idiv", "__band", "__bor", "__bxor", "__shl", "__shr", "__bnot"];

/// Registry of metamethod handlers
#[derive(Clone, Default)]
pub struct Metatable {
    handlers: FxHashMap<String, MetaHandler>,
}

impl Metatable {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers for every supported metamethod
    pub fn standard() -> Self {
        let mut metatable = Self::new();
        handlers::register_all(&mut metatable);
        metatable
    }

    /// Register a handler, replacing any previous one
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    /// Remove a handler
    pub fn remove(&mut self, name: &str) -> Option<MetaHandler> {
        self.handlers.remove(name)
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<MetaHandler> {
        self.handlers.get(name).cloned()
    }

    /// Check whether a handler is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Metatable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metatable").field("handlers", &self.names()).finish()
    }
}

/// Handlers resolved for one runtime, dispatched by index
pub(crate) struct LinkedMetatable {
    handlers: Vec<(String, MetaHandler)>,
}

impl LinkedMetatable {
    /// Resolve the handlers usable on engine `version`
    pub(crate) fn link(metatable: &Metatable, version: i32) -> Self {
        let mut handlers: Vec<(String, MetaHandler)> = metatable
            .handlers
            .iter()
            .filter(|(name, _)| name.as_str() != "__gc")
            .filter(|(name, _)| version >= 503 || !LUA53_METAMETHODS.contains(&name.as_str()))
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect();
        handlers.sort_by(|a, b| a.0.cmp(&b.0));
        LinkedMetatable { handlers }
    }

    /// Name and handler at `index`
    pub(crate) fn entry(&self, index: usize) -> Option<(&str, &MetaHandler)> {
        self.handlers
            .get(index)
            .map(|(name, handler)| (name.as_str(), handler))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(name, _)| name.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Create the host metatable in the registry (stack neutral)
pub(crate) unsafe fn install(rt: &Runtime, state: *mut ffi::lua_State) -> Result<()> {
    vm::check_stack(state, 4)?;
    ffi::luaL_newmetatable(state, HOST_SIGNATURE.as_ptr());
    for (index, name) in rt.inner().handlers.iter().enumerate() {
        vm::push_bytes(state, name.as_bytes());
        ffi::lua_pushlightuserdata(state, rt.inner().weak_ptr());
        ffi::lua_pushinteger(state, index as ffi::lua_Integer);
        ffi::lua_pushcclosure(state, callback::meta_trampoline, 2);
        ffi::lua_rawset(state, -3);
    }
    vm::push_bytes(state, b"__gc");
    ffi::lua_pushlightuserdata(state, rt.inner().weak_ptr());
    ffi::lua_pushcclosure(state, callback::gc_trampoline, 1);
    ffi::lua_rawset(state, -3);
    ffi::lua_pop(state, 1 as c_int);
    debug!(
        runtime = rt.id(),
        handlers = rt.inner().handlers.len(),
        "installed host metatable"
    );
    Ok(())
}
