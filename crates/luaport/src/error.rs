//! Error types for the Lua bridge
//!
//! Every failure crossing the boundary ends up as an [`Error`]. Lua-side
//! failures are reported as [`Error::Lua`] carrying a [`LuaError`] whose
//! [`LuaErrorKind`] is derived from the VM status code. Errors raised by
//! host callbacks are replayed verbatim once control returns to the host
//! frame that entered the VM.

use std::fmt;
use std::sync::Arc;

use mlua_sys as ffi;
use once_cell::sync::Lazy;
use regex::Regex;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The Lua state could not be allocated
    #[error("Init error: cannot allocate a Lua state")]
    Init,

    /// Text could not be encoded or decoded, or no encoding is configured
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The VM reported a failure
    #[error("{0}")]
    Lua(#[from] LuaError),

    /// A scoped stack check found a different top than expected
    #[error("Stack imbalance: expected top {expected}, found {actual}")]
    StackImbalance {
        /// Top recorded on entry
        expected: i32,
        /// Top found on exit
        actual: i32,
    },

    /// Operation not supported for the operand types
    #[error("Type error: {0}")]
    Type(String),

    /// Right type, inappropriate value
    #[error("Value error: {0}")]
    Value(String),

    /// Sequence index out of range
    #[error("Index error: {0}")]
    Index(String),

    /// Missing or read-only attribute
    #[error("Attribute error: {0}")]
    Attribute(String),

    /// The runtime was closed
    #[error("Runtime is closed")]
    Closed,

    /// A handle was used with a runtime other than its owner
    #[error("Value belongs to a different runtime")]
    ForeignRuntime,

    /// No free trampoline slot
    #[error("Callback pool exhausted: all {capacity} slots are bound")]
    CallbackPoolExhausted {
        /// Number of slots in the pool
        capacity: usize,
    },

    /// A released pooled callback was invoked
    #[error("Callback has been released")]
    CallbackReleased,

    /// The engine version lacks the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Host code panicked inside a callback
    #[error("Callback panicked: {0}")]
    Panic(String),

    /// Error raised by embedder code
    #[error("{0}")]
    External(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error raised by embedder code
    pub fn external<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::External(Arc::new(err))
    }

    /// Shorthand for [`Error::Type`]
    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::Type(msg.into())
    }

    /// Downcast an [`Error::External`] to the embedder's error type
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Error::External(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// The VM error, if this is one
    pub fn as_lua(&self) -> Option<&LuaError> {
        match self {
            Error::Lua(err) => Some(err),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Value(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Value(s.to_string())
    }
}

// ============================================================================
// VM errors
// ============================================================================

/// Classification of a VM status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaErrorKind {
    /// A coroutine yielded where a result was expected
    Yield,
    /// Runtime error (`LUA_ERRRUN`)
    RuntimeFault,
    /// Compilation error (`LUA_ERRSYNTAX`)
    SyntaxFault,
    /// Allocation failure (`LUA_ERRMEM`)
    MemoryFault,
    /// Error in a `__gc` metamethod (`LUA_ERRGCMM`, Lua 5.2/5.3)
    FinalizerFault,
    /// Error while running the message handler (`LUA_ERRERR`)
    ErrorInErrorHandling,
    /// A chunk file could not be opened or read (`LUA_ERRFILE`)
    FileFault,
}

impl LuaErrorKind {
    /// Map a status code to its kind. `version` is the engine version as
    /// returned by `lua_version` (e.g. 504); 5.4 dropped `LUA_ERRGCMM` and
    /// shifted the codes after it down by one.
    pub fn from_status(status: i32, version: i32) -> Option<Self> {
        let kind = match status {
            ffi::LUA_YIELD => LuaErrorKind::Yield,
            ffi::LUA_ERRRUN => LuaErrorKind::RuntimeFault,
            ffi::LUA_ERRSYNTAX => LuaErrorKind::SyntaxFault,
            ffi::LUA_ERRMEM => LuaErrorKind::MemoryFault,
            5 if version < 504 => LuaErrorKind::FinalizerFault,
            5 => LuaErrorKind::ErrorInErrorHandling,
            6 if version < 504 => LuaErrorKind::ErrorInErrorHandling,
            6 => LuaErrorKind::FileFault,
            7 if version < 504 => LuaErrorKind::FileFault,
            _ => return None,
        };
        Some(kind)
    }

    /// Conventional name of the status constant
    pub fn status_name(self) -> &'static str {
        match self {
            LuaErrorKind::Yield => "LUA_YIELD",
            LuaErrorKind::RuntimeFault => "LUA_ERRRUN",
            LuaErrorKind::SyntaxFault => "LUA_ERRSYNTAX",
            LuaErrorKind::MemoryFault => "LUA_ERRMEM",
            LuaErrorKind::FinalizerFault => "LUA_ERRGCMM",
            LuaErrorKind::ErrorInErrorHandling => "LUA_ERRERR",
            LuaErrorKind::FileFault => "LUA_ERRFILE",
        }
    }
}

/// A failure reported by the VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaError {
    /// Status classification
    pub kind: LuaErrorKind,
    /// Raw status code
    pub status: i32,
    /// Decoded error message, without the traceback
    pub message: String,
    /// Traceback appended by the message handler, if any
    pub traceback: Option<String>,
    /// Chunk name parsed from the message position prefix
    pub chunk: Option<String>,
    /// Line parsed from the message position prefix
    pub line: Option<u32>,
}

static POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?):(\d+): ").expect("position pattern is valid"));

const TRACEBACK_MARKER: &str = "\nstack traceback:";

impl LuaError {
    /// Build an error from a status code and the decoded error value.
    /// Unknown status codes are treated as runtime faults.
    pub fn new(status: i32, version: i32, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let kind = LuaErrorKind::from_status(status, version).unwrap_or(LuaErrorKind::RuntimeFault);
        let (message, traceback) = match raw.find(TRACEBACK_MARKER) {
            Some(at) => (raw[..at].to_string(), Some(raw[at + 1..].to_string())),
            None => (raw, None),
        };
        let (chunk, line) = match POSITION.captures(&message) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().to_string()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (None, None),
        };
        LuaError {
            kind,
            status,
            message,
            traceback,
            chunk,
            line,
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.status_name(), self.status, self.message)
    }
}

impl std::error::Error for LuaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_54() {
        assert_eq!(LuaErrorKind::from_status(2, 504), Some(LuaErrorKind::RuntimeFault));
        assert_eq!(LuaErrorKind::from_status(3, 504), Some(LuaErrorKind::SyntaxFault));
        assert_eq!(LuaErrorKind::from_status(4, 504), Some(LuaErrorKind::MemoryFault));
        assert_eq!(LuaErrorKind::from_status(5, 504), Some(LuaErrorKind::ErrorInErrorHandling));
        assert_eq!(LuaErrorKind::from_status(6, 504), Some(LuaErrorKind::FileFault));
        assert_eq!(LuaErrorKind::from_status(7, 504), None);
    }

    #[test]
    fn test_status_mapping_53() {
        assert_eq!(LuaErrorKind::from_status(5, 503), Some(LuaErrorKind::FinalizerFault));
        assert_eq!(LuaErrorKind::from_status(6, 503), Some(LuaErrorKind::ErrorInErrorHandling));
        assert_eq!(LuaErrorKind::from_status(7, 503), Some(LuaErrorKind::FileFault));
    }

    #[test]
    fn test_traceback_split() {
        let err = LuaError::new(
            2,
            504,
            "[string \"main\"]:3: boom\nstack traceback:\n\t[C]: in ?",
        );
        assert_eq!(err.kind, LuaErrorKind::RuntimeFault);
        assert_eq!(err.message, "[string \"main\"]:3: boom");
        assert_eq!(err.traceback.as_deref(), Some("stack traceback:\n\t[C]: in ?"));
        assert_eq!(err.chunk.as_deref(), Some("[string \"main\"]"));
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_message_without_position() {
        let err = LuaError::new(2, 504, "plain");
        assert_eq!(err.chunk, None);
        assert_eq!(err.line, None);
        assert_eq!(err.to_string(), "LUA_ERRRUN (2): plain");
    }

    #[test]
    fn test_external_downcast() {
        #[derive(Debug, thiserror::Error)]
        #[error("custom failure")]
        struct Custom;

        let err = Error::external(Custom);
        assert!(err.downcast_ref::<Custom>().is_some());
        assert_eq!(err.to_string(), "custom failure");
        assert!(Error::Closed.downcast_ref::<Custom>().is_none());
    }
}
