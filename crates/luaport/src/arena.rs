//! Strong references to host values reachable from Lua
//!
//! Each host handle userdata stores an [`EntryId`] into its runtime's
//! arena. The arena entry is what keeps the host value alive; it is
//! removed by the userdata's `__gc` or when the runtime closes.

use rustc_hash::FxHashMap;

use crate::value::Value;

/// Identifier of an arena entry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

impl EntryId {
    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create an EntryId from a value read back from a handle
    pub fn from_u64(id: u64) -> Self {
        EntryId(id)
    }
}

/// Arena of host values owned on behalf of the VM
#[derive(Default)]
pub struct RefArena {
    next: u64,
    entries: FxHashMap<EntryId, Value>,
}

impl RefArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value and return its id
    pub fn insert(&mut self, value: Value) -> EntryId {
        self.next += 1;
        let id = EntryId(self.next);
        self.entries.insert(id, value);
        id
    }

    /// Clone of the stored value
    pub fn get(&self, id: EntryId) -> Option<Value> {
        self.entries.get(&id).cloned()
    }

    /// Remove an entry. The caller drops the returned value after releasing
    /// the arena lock, since dropping may re-enter the runtime.
    #[must_use]
    pub fn remove(&mut self, id: EntryId) -> Option<Value> {
        self.entries.remove(&id)
    }

    /// Whether the entry exists
    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning the values for dropping outside the lock
    #[must_use]
    pub fn drain(&mut self) -> Vec<Value> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut arena = RefArena::new();
        let a = arena.insert(Value::Integer(1));
        let b = arena.insert(Value::Integer(1));
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_remove_and_get() {
        let mut arena = RefArena::new();
        let id = arena.insert(Value::from("x"));
        assert_eq!(arena.get(id), Some(Value::from("x")));
        assert_eq!(arena.remove(id), Some(Value::from("x")));
        assert!(!arena.contains(id));
        assert_eq!(arena.remove(id), None);
        assert_eq!(EntryId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_drain() {
        let mut arena = RefArena::new();
        arena.insert(Value::Nil);
        arena.insert(Value::Boolean(true));
        assert_eq!(arena.drain().len(), 2);
        assert!(arena.is_empty());
    }
}
