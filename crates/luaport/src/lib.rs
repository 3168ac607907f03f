//! luaport: Rust host values in an embedded Lua VM, and back
//!
//! This crate bridges the Rust host and a Lua 5.4 state:
//! - **Marshaling**: primitives convert by value; host objects travel as
//!   userdata handles and come back with their identity intact
//! - **Lua handles**: [`LuaObject`] pins a Lua value and exposes indexing,
//!   calls, operators and iteration from Rust
//! - **Host dispatch**: a metatable makes [`HostObject`] implementors
//!   indexable, callable, iterable and usable with Lua operators
//! - **Callbacks**: host errors raised inside Lua come back to the host
//!   unchanged, and a fixed pool of trampolines backs pooled functions
//!
//! # Example
//!
//! ```rust,ignore
//! use luaport::{Runtime, Value};
//!
//! let rt = Runtime::new()?;
//! let add = rt.create_function("add", |_, args| {
//!     let a = args[0].as_integer().unwrap_or(0);
//!     let b = args[1].as_integer().unwrap_or(0);
//!     Ok(Value::Integer(a + b))
//! })?;
//! rt.set_global("add", add)?;
//! assert_eq!(rt.eval("add(1, 2)", &[])?, Value::Integer(3));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::len_without_is_empty)]

// ============================================================================
// Value model
// ============================================================================

/// Error types
pub mod error;

/// Text encoding policy
pub mod encoding;

/// Host-side values
pub mod value;

/// Host object capabilities and built-in host types
pub mod host;

// ============================================================================
// VM plumbing
// ============================================================================

mod arena;
mod marshal;
mod vm;

/// Runtime configuration
pub mod options;

/// The runtime
pub mod runtime;

/// Metamethods of host handles
pub mod metatable;

/// Calls from Lua into host code
pub mod callback;

// ============================================================================
// Lua handles
// ============================================================================

/// Handles to Lua values
pub mod object;

/// Iteration over Lua values
pub mod iter;

/// Sequence view of Lua tables
pub mod list;

/// Coroutines
pub mod thread;

mod hostlib;

// ============================================================================
// Re-exports
// ============================================================================

pub use callback::{alloc_callback, available_slots, release_callback, CallbackSlot, PooledFunction, CALLBACK_SLOTS};
pub use encoding::Encoding;
pub use error::{Error, LuaError, LuaErrorKind, Result};
pub use host::types::{BoundMethod, Builtins, HostException, HostFn, HostFunction, HostList, HostMap};
pub use host::{ArithOp, CompareOp, HostIter, HostObject, PairIter, UnaryOp};
pub use iter::{Items, Keys, LuaIter, Values};
pub use list::ListProxy;
pub use marshal::PullMode;
pub use metatable::{MetaHandler, Metatable, PairsStepper};
pub use object::{LuaObject, LuaType};
pub use options::{PullHook, Pullers, PushHook, Pushers, RuntimeBuilder, RuntimeOptions};
pub use runtime::{GcOp, Runtime, RuntimeGuard, Source};
pub use thread::{CoroutineStatus, LuaThread};
pub use value::{as_attrgetter, as_function, as_is, as_itemgetter, IndexStrategy, Protocol, Value};
