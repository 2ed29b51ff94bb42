//! Debugging support: the step hook and per-thread call frames.

use std::cell::RefCell;

use super::bytecode::Bytecode;
use super::instruction::Instruction;
use super::stack::DataStack;
use super::vm::{Context, VmStatus};
use crate::value::exception::{StackTrace, TraceFrame};
use crate::value::{ErrorCode, Value};

/// What a debugger wants the VM to do with the next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    Proceed,
    /// Stop the run; the VM raises an `ErrorExit` exception.
    Halt,
}

/// Read-only view of the VM around one instruction.
pub struct DebugState<'a> {
    pub bytecode: &'a Bytecode,
    pub pc: usize,
    pub instruction: &'a Instruction,
    pub stack: &'a DataStack,
    pub contexts: &'a DataStack<Context>,
    pub status: VmStatus,
    pub scope: &'a Value,
}

/// Hook consulted before and after every instruction that actually runs.
pub trait Debugger: Send {
    fn step_before(&mut self, state: &DebugState<'_>) -> DebugCommand;

    fn step_after(&mut self, _state: &DebugState<'_>) {}
}

thread_local! {
    static FRAMES: RefCell<Vec<TraceFrame>> = const { RefCell::new(Vec::new()) };
}

/// An active VM execution on this thread. Dropping it pops the frame.
#[must_use]
#[derive(Debug)]
pub struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|f| f.borrow_mut().truncate(self.depth - 1));
    }
}

/// Push a frame for `function`. Fails with `ErrorMaxStackDepthExceeded`
/// once `max_depth` frames are active.
pub fn push_frame(function: &str, max_depth: usize) -> Result<FrameGuard, Value> {
    FRAMES.with(|f| {
        let mut frames = f.borrow_mut();
        if frames.len() >= max_depth {
            return Err(Value::exception(
                ErrorCode::MaxStackDepthExceeded,
                format!("Maximum stack depth ({}) exceeded calling '{}'", max_depth, function),
            ));
        }
        frames.push(TraceFrame {
            function: function.to_string(),
            line: None,
        });
        Ok(FrameGuard { depth: frames.len() })
    })
}

/// Record the line the innermost frame is executing.
pub fn set_line(line: Option<u32>) {
    if line.is_none() {
        return;
    }
    FRAMES.with(|f| {
        if let Some(top) = f.borrow_mut().last_mut() {
            top.line = line;
        }
    });
}

/// Snapshot of the active frames, outermost first.
pub fn current_trace() -> StackTrace {
    FRAMES.with(|f| StackTrace {
        frames: f.borrow().clone(),
    })
}

pub fn depth() -> usize {
    FRAMES.with(|f| f.borrow().len())
}

/// Debugger that runs until halted after a fixed number of steps.
#[derive(Debug, Clone)]
pub struct StepLimit {
    remaining: usize,
}

impl StepLimit {
    pub fn new(steps: usize) -> Self {
        Self { remaining: steps }
    }
}

impl Debugger for StepLimit {
    fn step_before(&mut self, _state: &DebugState<'_>) -> DebugCommand {
        if self.remaining == 0 {
            return DebugCommand::Halt;
        }
        self.remaining -= 1;
        DebugCommand::Proceed
    }
}
