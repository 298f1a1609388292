//! Positional and named arguments carried by notifications
//!
//! Both bus observers and plugin handlers receive a [`CallArgs`]. Observers
//! may also carry bound arguments that are replayed in front of the
//! call-time ones.

use serde::Serialize;
use serde_json::{Map, Value};

/// Positional + named arguments of one call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallArgs {
    /// Positional arguments, in order
    pub positional: Vec<Value>,
    /// Named arguments
    pub named: Map<String, Value>,
}

impl CallArgs {
    /// Empty argument list
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from positional values only
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: Map::new(),
        }
    }

    /// Append a positional argument (builder style)
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument (builder style)
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Append a positional argument in place
    pub fn push(&mut self, value: impl Into<Value>) {
        self.positional.push(value.into());
    }

    /// Insert a positional argument in front of the existing ones
    pub fn prepend(mut self, value: impl Into<Value>) -> Self {
        self.positional.insert(0, value.into());
        self
    }

    /// Positional argument at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Named argument `key`
    pub fn named(&self, key: &str) -> Option<&Value> {
        self.named.get(key)
    }

    /// Number of positional arguments
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// True when there are neither positional nor named arguments
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Combine bound arguments (`self`) with call-time arguments
    ///
    /// Bound positionals come first. Call-time named arguments act as
    /// defaults; bound named arguments override them on collision.
    pub fn merged_with(&self, call: &CallArgs) -> CallArgs {
        let mut positional = Vec::with_capacity(self.positional.len() + call.positional.len());
        positional.extend(self.positional.iter().cloned());
        positional.extend(call.positional.iter().cloned());

        let mut named = call.named.clone();
        for (key, value) in &self.named {
            named.insert(key.clone(), value.clone());
        }

        CallArgs { positional, named }
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(values: Vec<Value>) -> Self {
        Self::from_values(values)
    }
}
