//! Runtime configuration

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::encoding::Encoding;
use crate::error::Result;
use crate::host::types::Builtins;
use crate::host::HostObject;
use crate::metatable::Metatable;
use crate::object::{LuaObject, LuaType};
use crate::runtime::Runtime;
use crate::value::Value;

/// Conversion applied to a host object before it is pushed
pub type PushHook = Arc<dyn Fn(&Runtime, &Arc<dyn HostObject>) -> Result<Value> + Send + Sync>;

/// Per-type push hooks, consulted before the built-in push chain
#[derive(Clone, Default)]
pub struct Pushers {
    hooks: FxHashMap<TypeId, PushHook>,
}

impl Pushers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert every pushed `T` with `hook`. The hook must not return
    /// another `T`, or pushing would recurse forever.
    pub fn register<T, F>(&mut self, hook: F)
    where
        T: HostObject,
        F: Fn(&Runtime, &T) -> Result<Value> + Send + Sync + 'static,
    {
        let hook: PushHook = Arc::new(move |rt, obj| match obj.downcast_ref::<T>() {
            Some(value) => hook(rt, value),
            None => Ok(Value::Object(obj.clone())),
        });
        self.hooks.insert(TypeId::of::<T>(), hook);
    }

    /// Apply the hook registered for the object's concrete type, if any
    pub(crate) fn convert(&self, rt: &Runtime, obj: &Arc<dyn HostObject>) -> Result<Option<Value>> {
        if self.hooks.is_empty() {
            return Ok(None);
        }
        let any: &dyn Any = &**obj;
        match self.hooks.get(&any.type_id()) {
            Some(hook) => hook(rt, obj).map(Some),
            None => Ok(None),
        }
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for Pushers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pushers").field("count", &self.hooks.len()).finish()
    }
}

/// Conversion applied to a Lua value when it is pulled
pub type PullHook = Arc<dyn Fn(&Runtime, &LuaObject) -> Result<Value> + Send + Sync>;

/// Per-Lua-type pull hooks, consulted before the built-in pull chain.
///
/// Host handles always pull as their host value. Pulls made while a hook
/// is running use the built-in chain, so a hook may convert its handle
/// with [`LuaObject::to_str`] or [`LuaObject::to_value`] freely.
#[derive(Clone, Default)]
pub struct Pullers {
    hooks: FxHashMap<LuaType, PullHook>,
    fallback: Option<PullHook>,
}

impl Pullers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert every pulled value of type `kind` with `hook`
    pub fn register<F>(&mut self, kind: LuaType, hook: F)
    where
        F: Fn(&Runtime, &LuaObject) -> Result<Value> + Send + Sync + 'static,
    {
        self.hooks.insert(kind, Arc::new(hook));
    }

    /// Hook for reference types (tables, functions, userdata, threads)
    /// that have no hook of their own. Replaces the plain [`LuaObject`]
    /// result.
    pub fn register_default<F>(&mut self, hook: F)
    where
        F: Fn(&Runtime, &LuaObject) -> Result<Value> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(hook));
    }

    /// Hook applying to values of type `kind`
    pub(crate) fn find(&self, kind: LuaType) -> Option<&PullHook> {
        match self.hooks.get(&kind) {
            Some(hook) => Some(hook),
            None if kind.is_reference() => self.fallback.as_ref(),
            None => None,
        }
    }

    /// Number of registered hooks, the default included
    pub fn len(&self) -> usize {
        self.hooks.len() + usize::from(self.fallback.is_some())
    }

    /// Whether no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty() && self.fallback.is_none()
    }
}

impl fmt::Debug for Pullers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.hooks.keys().map(|kind| format!("{:?}", kind)).collect();
        kinds.sort();
        f.debug_struct("Pullers")
            .field("types", &kinds)
            .field("default", &self.fallback.is_some())
            .finish()
    }
}

/// Options for a new [`Runtime`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Encoding for host text crossing into Lua; `None` rejects text
    pub encoding: Option<Encoding>,
    /// Encoding of source code passed as text; defaults to `encoding`,
    /// then UTF-8
    pub source_encoding: Option<Encoding>,
    /// Decode Lua strings to host text on pull, keeping bytes when
    /// decoding fails
    pub autodecode: bool,
    /// Metamethod handlers for host handles
    pub metatable: Metatable,
    /// Per-type push hooks
    pub pushers: Pushers,
    /// Per-Lua-type pull hooks
    pub pullers: Pullers,
    /// Functions exposed as `host.builtins`
    pub builtins: Builtins,
    /// Global name of the host library table; `None` skips installing it
    pub lib_name: Option<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            encoding: Some(Encoding::Utf8),
            source_encoding: None,
            autodecode: false,
            metatable: Metatable::standard(),
            pushers: Pushers::new(),
            pullers: Pullers::new(),
            builtins: Builtins::standard(),
            lib_name: Some("host".to_string()),
        }
    }
}

impl RuntimeOptions {
    /// Encoding applied to source text
    pub fn effective_source_encoding(&self) -> Encoding {
        self.source_encoding.or(self.encoding).unwrap_or_default()
    }
}

/// Fluent construction of a [`Runtime`]
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    options: RuntimeOptions,
}

impl RuntimeBuilder {
    /// Start from the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Text encoding; `None` makes pushing host text an error
    pub fn encoding(mut self, encoding: Option<Encoding>) -> Self {
        self.options.encoding = encoding;
        self
    }

    /// Source code encoding
    pub fn source_encoding(mut self, encoding: Encoding) -> Self {
        self.options.source_encoding = Some(encoding);
        self
    }

    /// Decode pulled strings to text
    pub fn autodecode(mut self, autodecode: bool) -> Self {
        self.options.autodecode = autodecode;
        self
    }

    /// Replace the metamethod handler table
    pub fn metatable(mut self, metatable: Metatable) -> Self {
        self.options.metatable = metatable;
        self
    }

    /// Register a push hook for host type `T`
    pub fn push_hook<T, F>(mut self, hook: F) -> Self
    where
        T: HostObject,
        F: Fn(&Runtime, &T) -> Result<Value> + Send + Sync + 'static,
    {
        self.options.pushers.register::<T, F>(hook);
        self
    }

    /// Register a pull hook for Lua values of type `kind`
    pub fn pull_hook<F>(mut self, kind: LuaType, hook: F) -> Self
    where
        F: Fn(&Runtime, &LuaObject) -> Result<Value> + Send + Sync + 'static,
    {
        self.options.pullers.register(kind, hook);
        self
    }

    /// Register the pull hook for reference types without their own hook
    pub fn pull_default<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Runtime, &LuaObject) -> Result<Value> + Send + Sync + 'static,
    {
        self.options.pullers.register_default(hook);
        self
    }

    /// Add a function to `host.builtins`
    pub fn builtin<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&Runtime, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.options.builtins.register(name, handler);
        self
    }

    /// Global name of the host library; `None` disables it
    pub fn lib_name(mut self, name: Option<&str>) -> Self {
        self.options.lib_name = name.map(str::to_string);
        self
    }

    /// The collected options
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Create the runtime
    pub fn build(self) -> Result<Runtime> {
        Runtime::with_options(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.encoding, Some(Encoding::Utf8));
        assert!(!options.autodecode);
        assert_eq!(options.lib_name.as_deref(), Some("host"));
        assert_eq!(options.effective_source_encoding(), Encoding::Utf8);
    }

    #[test]
    fn test_source_encoding_follows_encoding() {
        let builder = RuntimeBuilder::new().encoding(Some(Encoding::Latin1));
        assert_eq!(builder.options().effective_source_encoding(), Encoding::Latin1);
        let builder = RuntimeBuilder::new().encoding(None);
        assert_eq!(builder.options().effective_source_encoding(), Encoding::Utf8);
        let builder = builder.source_encoding(Encoding::Ascii);
        assert_eq!(builder.options().effective_source_encoding(), Encoding::Ascii);
    }

    #[test]
    fn test_builder_registrations() {
        let builder = RuntimeBuilder::new()
            .builtin("answer", |_, _| Ok(Value::Integer(42)))
            .push_hook::<crate::host::types::HostList, _>(|_, list| Ok(Value::from(list.count())))
            .lib_name(None);
        assert!(builder.options().builtins.contains("answer"));
        assert_eq!(builder.options().pushers.len(), 1);
        assert!(builder.options().lib_name.is_none());
    }

    #[test]
    fn test_pullers_lookup() {
        let mut pullers = Pullers::new();
        assert!(pullers.is_empty());
        pullers.register(LuaType::String, |_, _| Ok(Value::Nil));
        assert!(pullers.find(LuaType::String).is_some());
        assert!(pullers.find(LuaType::Table).is_none());

        pullers.register_default(|_, _| Ok(Value::Nil));
        assert_eq!(pullers.len(), 2);
        assert!(pullers.find(LuaType::Table).is_some());
        assert!(pullers.find(LuaType::Thread).is_some());
        assert!(pullers.find(LuaType::Number).is_none());
    }
}
