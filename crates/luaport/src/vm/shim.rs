//! VM-side shims
//!
//! Operators that may run metamethods are never performed through the raw
//! C API, where a Lua error would unwind through Rust frames. Each one is a
//! tiny Lua function compiled once per runtime, cached in the registry and
//! invoked under `lua_pcall`.

use crate::host::{ArithOp, CompareOp, UnaryOp};

/// Chunk-name prefix shared by all shims. Errors whose position carries this
/// prefix were raised by the operator itself rather than by a metamethod.
pub(crate) const CHUNK_PREFIX: &str = "luaport.";

/// A cached VM function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Shim {
    Arith(ArithOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    Concat,
    Len,
    Index,
    NewIndex,
    ToString,
    TableRemove,
    TableInsert,
    Pairs,
    CoroutineStatus,
    SetHook,
}

impl Shim {
    /// Name used for the chunk and the cache key
    pub(crate) fn name(self) -> &'static str {
        match self {
            Shim::Arith(op) => &op.metamethod()[2..],
            Shim::Unary(op) => &op.metamethod()[2..],
            Shim::Compare(op) => &op.metamethod()[2..],
            Shim::Concat => "concat",
            Shim::Len => "len",
            Shim::Index => "index",
            Shim::NewIndex => "newindex",
            Shim::ToString => "tostring",
            Shim::TableRemove => "remove",
            Shim::TableInsert => "insert",
            Shim::Pairs => "pairs",
            Shim::CoroutineStatus => "status",
            Shim::SetHook => "sethook",
        }
    }

    /// Minimum engine version (as reported by `lua_version`)
    pub(crate) fn min_version(self) -> i32 {
        match self {
            Shim::Arith(op) if op.requires_53() => 503,
            Shim::Unary(UnaryOp::BNot) => 503,
            _ => 0,
        }
    }

    /// Source of a chunk returning the shim function
    pub(crate) fn source(self) -> String {
        match self {
            Shim::Arith(op) => format!("return function(a, b) return a {} b end", op.symbol()),
            Shim::Unary(op) => format!("return function(a) return {}a end", op.symbol()),
            Shim::Compare(op) => format!("return function(a, b) return a {} b end", op.symbol()),
            Shim::Concat => "return function(a, b) return a .. b end".to_string(),
            Shim::Len => "return function(a) return #a end".to_string(),
            Shim::Index => "return function(t, k) return t[k] end".to_string(),
            Shim::NewIndex => "return function(t, k, v) t[k] = v end".to_string(),
            Shim::ToString => {
                "local tostring = tostring\nreturn function(o) return tostring(o) end".to_string()
            }
            Shim::TableRemove => {
                "local remove = table.remove\nreturn function(t, i) return remove(t, i) end".to_string()
            }
            Shim::TableInsert => {
                "local insert = table.insert\nreturn function(t, i, v) insert(t, i, v) end".to_string()
            }
            Shim::Pairs => "local pairs = pairs\nreturn function(t) return pairs(t) end".to_string(),
            Shim::CoroutineStatus => {
                "local status = coroutine.status\nreturn function(co) return status(co) end".to_string()
            }
            // One-shot call hook: clears itself, then raises inside the coroutine
            Shim::SetHook => "local sethook = debug.sethook\n\
                 return function(co, raise)\n\
                 if raise then sethook(co, function() sethook() raise() end, 'c') else sethook(co) end\n\
                 end"
                .to_string(),
        }
    }

    /// Chunk name, displayed verbatim in error positions
    pub(crate) fn chunk_name(self) -> String {
        format!("={}{}", CHUNK_PREFIX, self.name())
    }

    /// Whether an error message was raised directly by this shim's operator
    pub(crate) fn raised_here(self, message: &str) -> bool {
        message
            .strip_prefix(CHUNK_PREFIX)
            .and_then(|rest| rest.strip_prefix(self.name()))
            .is_some_and(|rest| rest.starts_with(':'))
    }
}
