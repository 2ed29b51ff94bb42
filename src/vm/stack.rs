//! LIFO stacks used by the VM for operands and handler contexts.

use std::fmt;

use tracing::trace;

use crate::value::Value;

/// A named LIFO stack.
///
/// With debug enabled every push and pop is logged at trace level with the
/// stack's name and the value's string form.
#[derive(Debug, Clone)]
pub struct DataStack<T = Value> {
    name: String,
    items: Vec<T>,
    debug: bool,
}

impl<T: fmt::Display> DataStack<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, value: T) {
        if self.debug {
            trace!(stack = %self.name, value = %value, depth = self.items.len() + 1, "push");
        }
        self.items.push(value);
    }

    /// Remove the top entry. `None` on an empty stack.
    pub fn pop(&mut self) -> Option<T> {
        let value = self.items.pop();
        if self.debug {
            match &value {
                Some(v) => trace!(stack = %self.name, value = %v, depth = self.items.len(), "pop"),
                None => trace!(stack = %self.name, "pop on empty stack"),
            }
        }
        value
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Entries from bottom to top.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: fmt::Display> fmt::Display for DataStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- {} ({}) --", self.name, self.items.len())?;
        for (ix, item) in self.items.iter().enumerate().rev() {
            writeln!(f, "{:3}. {}", ix, item)?;
        }
        Ok(())
    }
}
