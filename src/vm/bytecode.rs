//! Bytecode and its builder.
//!
//! [`BytecodeBuilder`] is used while generating code: it tracks the current
//! source line, collects labels for the next instruction, and supports
//! emitting blocks out of order through deferred blocks and bookmarks.
//! [`BytecodeBuilder::finish`] produces an immutable [`Bytecode`] whose label
//! index the VM uses to resolve jumps.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::instruction::{Instruction, ListingEntry};
use crate::error::BuildError;

/// A finished, label-indexed instruction sequence.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    name: String,
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
}

/// JSON form of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub name: String,
    pub instructions: Vec<ListingEntry>,
}

impl Bytecode {
    /// Index the labels carried by `instructions`. Later duplicates are ignored;
    /// use [`BytecodeBuilder`] to have them rejected.
    pub fn from_instructions(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        let mut labels = HashMap::new();
        for (ix, instr) in instructions.iter().enumerate() {
            for label in &instr.labels {
                labels.entry(label.clone()).or_insert(ix);
            }
        }
        Self {
            name: name.into(),
            instructions,
            labels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Position of the instruction carrying `label`.
    pub fn resolve(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    /// Check that every jump target is indexed.
    pub fn check_labels(&self) -> Result<(), BuildError> {
        match self
            .instructions
            .iter()
            .filter_map(|i| i.op.target())
            .find(|target| !self.labels.contains_key(*target))
        {
            Some(missing) => Err(BuildError::UndefinedLabel(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn listing(&self) -> Listing {
        Listing {
            name: self.name.clone(),
            instructions: self
                .instructions
                .iter()
                .enumerate()
                .map(|(ix, i)| i.listing_entry(ix))
                .collect(),
        }
    }
}

const RULE: &str = "// ---------------------------------------------------------------";

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "// ===============================================================")?;
        writeln!(f, "// Bytecode Listing - {}", self.name)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "// {:<6} {:<11}{:<15}", "Line", "Label", "Instruction")?;
        writeln!(f, "{}", RULE)?;
        for instr in &self.instructions {
            writeln!(f, "{}", instr)?;
        }
        writeln!(f, "{}", RULE)
    }
}

/// Incrementally builds a [`Bytecode`].
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    name: String,
    main: Vec<Instruction>,
    /// Blocks currently receiving instructions, innermost last.
    open: Vec<Vec<Instruction>>,
    /// Finished deferred blocks waiting to be spliced in.
    deferred: Vec<Vec<Instruction>>,
    bookmarks: Vec<usize>,
    pending_labels: Vec<String>,
    current_line: Option<u32>,
}

impl BytecodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn block(&mut self) -> &mut Vec<Instruction> {
        match self.open.last_mut() {
            Some(block) => block,
            None => &mut self.main,
        }
    }

    /// Set the source line for the instructions pushed next.
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.current_line = Some(line);
        self
    }

    /// Attach `label` to the next instruction pushed.
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.pending_labels.push(label.into());
        self
    }

    /// Append to the active block.
    ///
    /// The instruction is stamped with the current line if that is past the
    /// last line seen in the block, and receives any pending labels.
    pub fn push_instruction(&mut self, mut instr: Instruction) -> &mut Self {
        let current = self.current_line;
        let labels = std::mem::take(&mut self.pending_labels);
        let block = self.block();
        let last_line = block.iter().rev().find_map(|i| i.line);
        if let Some(line) = current {
            if last_line.is_none_or(|last| line > last) {
                instr.line = Some(line);
            }
        }
        instr.labels.extend(labels);
        block.push(instr);
        self
    }

    /// Redirect instructions into a new side block.
    pub fn start_deferred_block(&mut self) -> &mut Self {
        debug!(bytecode = %self.name, "start deferred block");
        self.open.push(Vec::new());
        self
    }

    /// Park the side block for later splicing and resume the enclosing block.
    pub fn end_deferred_block(&mut self) -> Result<&mut Self, BuildError> {
        let block = self.open.pop().ok_or(BuildError::NoOpenBlock)?;
        debug!(bytecode = %self.name, len = block.len(), "end deferred block");
        self.deferred.push(block);
        Ok(self)
    }

    /// Append the most recently parked block to the active block.
    pub fn pop_deferred_block(&mut self) -> Result<&mut Self, BuildError> {
        let block = self.deferred.pop().ok_or(BuildError::NoDeferredBlock)?;
        debug!(bytecode = %self.name, len = block.len(), "pop deferred block");
        self.block().extend(block);
        Ok(self)
    }

    /// Remember the current end of the active block.
    pub fn bookmark(&mut self) -> &mut Self {
        let at = self.block().len();
        self.bookmarks.push(at);
        self
    }

    pub fn discard_bookmark(&mut self) -> Result<&mut Self, BuildError> {
        self.bookmarks.pop().ok_or(BuildError::NoBookmark)?;
        Ok(self)
    }

    /// Move everything pushed since the last bookmark into a parked block.
    pub fn defer_bookmarked_block(&mut self) -> Result<&mut Self, BuildError> {
        let at = self.bookmarks.pop().ok_or(BuildError::NoBookmark)?;
        let block = self.block();
        if at > block.len() {
            return Err(BuildError::StaleBookmark {
                bookmark: at,
                len: block.len(),
            });
        }
        let tail = block.split_off(at);
        debug!(bytecode = %self.name, len = tail.len(), "defer bookmarked block");
        self.deferred.push(tail);
        Ok(self)
    }

    /// Number of instructions in the main block.
    pub fn len(&self) -> usize {
        self.main.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    /// Index labels and check that every jump target exists.
    pub fn finish(self) -> Result<Bytecode, BuildError> {
        if !self.open.is_empty() {
            return Err(BuildError::UnclosedBlocks(self.open.len()));
        }
        if !self.deferred.is_empty() {
            return Err(BuildError::UnsplicedBlocks(self.deferred.len()));
        }
        if !self.pending_labels.is_empty() {
            return Err(BuildError::UnresolvedLabels(self.pending_labels));
        }
        let mut seen = HashSet::new();
        for instr in &self.main {
            for label in &instr.labels {
                if !seen.insert(label.as_str()) {
                    return Err(BuildError::DuplicateLabel(label.clone()));
                }
            }
        }
        let bytecode = Bytecode::from_instructions(self.name, self.main);
        bytecode.check_labels()?;
        Ok(bytecode)
    }
}
