mod bytecode;
mod instruction;
mod stack;
mod vm;
pub mod debug;
pub mod threads;

pub use bytecode::{Bytecode, BytecodeBuilder, Listing};
pub use debug::{DebugCommand, DebugState, Debugger, StepLimit};
pub use instruction::{CallSpec, Instruction, ListingEntry, Op, StepOutcome};
pub use stack::DataStack;
pub use threads::{ExitSignal, ThreadHandle, ThreadSpawner};
pub use vm::{Context, DEFAULT_MAX_DEPTH, RunOutcome, RunState, STASH_SIZE, VM, VmOptions, VmStatus, report_fatal};
