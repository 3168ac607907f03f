//! `__pairs` step function
//!
//! Lua drives a generic `for` by calling the step function with the
//! previous key. Host iterators are forward-only, so the stepper buffers
//! every pair it has produced and resumes after an arbitrary key by a
//! linear scan of that buffer. Sequential iteration never scans.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::host::{ops, HostObject, PairIter};
use crate::runtime::Runtime;
use crate::value::Value;

struct StepState {
    source: Option<PairIter>,
    seen: Vec<(Value, Value)>,
    cursor: usize,
}

impl StepState {
    /// Buffered pair at `position`, pulling from the source as needed
    fn fetch(&mut self, position: usize) -> Option<(Value, Value)> {
        while self.seen.len() <= position {
            let next = self.source.as_mut()?.next();
            match next {
                Some(pair) => self.seen.push(pair),
                None => {
                    self.source = None;
                    return None;
                }
            }
        }
        self.seen.get(position).cloned()
    }

    /// Position following `key`
    fn resume_after(&mut self, rt: &Runtime, key: &Value) -> Option<usize> {
        if self.cursor > 0 {
            if let Some((last, _)) = self.seen.get(self.cursor - 1) {
                if ops::loose_eq(rt, last, key) {
                    return Some(self.cursor);
                }
            }
        }
        if let Some(i) = self.seen.iter().position(|(k, _)| ops::loose_eq(rt, k, key)) {
            return Some(i + 1);
        }
        loop {
            let position = self.seen.len();
            let (k, _) = self.fetch(position)?;
            if ops::loose_eq(rt, &k, key) {
                return Some(position + 1);
            }
        }
    }
}

/// Step function returned by `__pairs` on a host handle
pub struct PairsStepper {
    state: Mutex<StepState>,
}

impl PairsStepper {
    /// Step over `source`
    pub fn new(source: PairIter) -> Self {
        PairsStepper {
            state: Mutex::new(StepState {
                source: Some(source),
                seen: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// The pair following `key` (`Nil` starts over), or `None` at the end
    pub fn step(&self, rt: &Runtime, key: &Value) -> Result<Option<(Value, Value)>> {
        let mut state = self.state.lock();
        let position = if key.is_nil() {
            0
        } else {
            state
                .resume_after(rt, key)
                .ok_or_else(|| Error::Value("invalid key to 'next'".to_string()))?
        };
        let pair = state.fetch(position);
        state.cursor = position + 1;
        Ok(pair)
    }
}

impl fmt::Debug for PairsStepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PairsStepper")
            .field("buffered", &state.seen.len())
            .field("cursor", &state.cursor)
            .finish()
    }
}

impl HostObject for PairsStepper {
    fn type_name(&self) -> &str {
        "pairs_iterator"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, rt: &Runtime, args: Vec<Value>) -> Result<Value> {
        let key = args.into_iter().nth(1).unwrap_or_default();
        Ok(match self.step(rt, &key)? {
            Some((k, v)) => Value::Tuple(vec![k, v]),
            None => Value::Nil,
        })
    }
}
