use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::bytecode::Bytecode;
use super::debug::{self as frames, DebugCommand, DebugState, Debugger};
use super::instruction::{Instruction, StepOutcome};
use super::stack::DataStack;
use super::threads::{ExitSignal, LeavingGuard, is_leaving};
use crate::error::FatalError;
use crate::value::{ErrorCode, Interface, Value};

/// Number of stash registers.
pub const STASH_SIZE: usize = 8;

/// Default limit on nested VM executions per thread.
pub const DEFAULT_MAX_DEPTH: usize = 200;

thread_local! {
    static NESTED_FATAL: RefCell<Option<FatalError>> = const { RefCell::new(None) };
}

/// Record a fatal error raised by a run nested inside a call, so that the
/// VM which made the call stops with it too. Only the first one is kept.
pub fn report_fatal(err: FatalError) {
    NESTED_FATAL.with(|f| {
        f.borrow_mut().get_or_insert(err);
    });
}

fn take_nested_fatal() -> Option<FatalError> {
    NESTED_FATAL.with(|f| f.borrow_mut().take())
}

/// Loop and unwind status consulted before every instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmStatus {
    #[default]
    None,
    Break,
    Continue,
    Return,
    Exit,
    Yield,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::None => "none",
            VmStatus::Break => "break",
            VmStatus::Continue => "continue",
            VmStatus::Return => "return",
            VmStatus::Exit => "exit",
            VmStatus::Yield => "yield",
        };
        f.write_str(s)
    }
}

impl FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(VmStatus::None),
            "break" => Ok(VmStatus::Break),
            "continue" => Ok(VmStatus::Continue),
            "return" => Ok(VmStatus::Return),
            "exit" => Ok(VmStatus::Exit),
            "yield" => Ok(VmStatus::Yield),
            _ => Err(format!("unknown VM status '{}'", s)),
        }
    }
}

/// Lifecycle of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Running,
    /// Yielded; the next `execute` resumes where it stopped.
    Suspended,
    Returned,
    Exited,
    Faulted,
}

/// An active handler context.
#[derive(Debug, Clone)]
pub struct Context {
    /// Where exceptions raised inside the context are routed.
    pub label: String,
    pub value: Option<Value>,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}: {}", self.label, v),
            None => f.write_str(&self.label),
        }
    }
}

/// Knobs shared by a VM and the VMs started from it.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Log every executed instruction at debug level.
    pub trace: bool,
    /// Log every stack push and pop at trace level.
    pub debug_stacks: bool,
    pub max_depth: usize,
    pub exit_signal: ExitSignal,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            trace: false,
            debug_stacks: false,
            max_depth: DEFAULT_MAX_DEPTH,
            exit_signal: ExitSignal::global(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Yielded(Value),
    Finished(Value),
}

impl RunOutcome {
    pub fn into_value(self) -> Value {
        match self {
            RunOutcome::Yielded(v) | RunOutcome::Finished(v) => v,
        }
    }
}

/// Operand stack, contexts and cursor of a prepared run.
#[derive(Debug)]
struct Frame {
    stack: DataStack,
    contexts: DataStack<Context>,
    pc: usize,
}

impl Frame {
    fn new(debug: bool) -> Self {
        Self {
            stack: DataStack::new("stack").with_debug(debug),
            contexts: DataStack::new("contexts").with_debug(debug),
            pc: 0,
        }
    }
}

/// The kestrel virtual machine.
pub struct VM {
    bytecode: Arc<Bytecode>,
    options: VmOptions,
    status: VmStatus,
    state: RunState,
    stash: [Option<Value>; STASH_SIZE],
    frame: Option<Frame>,
    /// Exception being routed to a handler context.
    exception: Option<Value>,
    debugger: Option<Box<dyn Debugger>>,
}

impl VM {
    pub fn new(bytecode: Arc<Bytecode>) -> Self {
        Self::with_options(bytecode, VmOptions::default())
    }

    pub fn with_options(bytecode: Arc<Bytecode>, options: VmOptions) -> Self {
        Self {
            bytecode,
            options,
            status: VmStatus::None,
            state: RunState::Ready,
            stash: Default::default(),
            frame: None,
            exception: None,
            debugger: None,
        }
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = Some(debugger);
    }

    pub fn take_debugger(&mut self) -> Option<Box<dyn Debugger>> {
        self.debugger.take()
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Name of the bytecode's owner.
    pub fn owner(&self) -> &str {
        self.bytecode.name()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn set_status(&mut self, status: VmStatus) {
        self.status = status;
    }

    pub fn exception(&self) -> Option<&Value> {
        self.exception.as_ref()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let debug = self.options.debug_stacks;
        self.frame.get_or_insert_with(|| Frame::new(debug))
    }

    pub fn push(&mut self, value: Value) {
        self.frame_mut().stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.frame.as_mut().and_then(|f| f.stack.pop())
    }

    pub fn peek(&self) -> Option<Value> {
        self.frame.as_ref().and_then(|f| f.stack.peek().cloned())
    }

    /// Push a second handle to the top value. False on an empty stack.
    pub fn dup(&mut self) -> bool {
        match self.peek() {
            Some(top) => {
                self.push(top);
                true
            }
            None => false,
        }
    }

    pub fn depth(&self) -> usize {
        self.frame.as_ref().map_or(0, |f| f.stack.depth())
    }

    /// Operand stack contents, bottom first.
    pub fn stack_values(&self) -> Vec<Value> {
        self.frame
            .as_ref()
            .map(|f| f.stack.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Store into a stash register. Out-of-range indices are ignored.
    pub fn stash(&mut self, ix: usize, value: Value) {
        if let Some(slot) = self.stash.get_mut(ix) {
            *slot = Some(value);
        }
    }

    /// Take a stash register's value; null when empty or out of range.
    pub fn unstash(&mut self, ix: usize) -> Value {
        self.stash
            .get_mut(ix)
            .and_then(Option::take)
            .unwrap_or_else(Value::null)
    }

    pub fn push_context(&mut self, context: Context) {
        self.frame_mut().contexts.push(context);
    }

    pub fn pop_context(&mut self) -> Option<Context> {
        self.frame.as_mut().and_then(|f| f.contexts.pop())
    }

    pub fn peek_context(&self) -> Option<&Context> {
        self.frame.as_ref().and_then(|f| f.contexts.peek())
    }

    pub fn context_depth(&self) -> usize {
        self.frame.as_ref().map_or(0, |f| f.contexts.depth())
    }

    /// Run until the bytecode completes, returns, yields or fails.
    ///
    /// Script errors come back as exception values. `Err` means the bytecode
    /// itself is broken.
    pub fn execute(&mut self, scope: &Value) -> Result<Value, FatalError> {
        self.resume(scope).map(RunOutcome::into_value)
    }

    /// Like [`VM::execute`], but tells a yield apart from completion.
    pub fn resume(&mut self, scope: &Value) -> Result<RunOutcome, FatalError> {
        let frame = match frames::push_frame(self.owner(), self.options.max_depth) {
            Ok(guard) => guard,
            Err(exception) => return Ok(RunOutcome::Finished(exception)),
        };
        if frame.depth() == 1 {
            take_nested_fatal();
        }
        if self.state == RunState::Suspended {
            self.exception = None;
        } else {
            self.prepare();
        }
        self.state = RunState::Running;
        match self.run(scope) {
            Ok(Some(yielded)) => {
                self.state = RunState::Suspended;
                Ok(RunOutcome::Yielded(yielded))
            }
            Ok(None) => Ok(RunOutcome::Finished(self.finish())),
            Err(fatal) => {
                error!(bytecode = %self.owner(), error = %fatal, "fatal VM error");
                self.state = RunState::Faulted;
                self.cleanup();
                Err(fatal)
            }
        }
    }

    fn prepare(&mut self) {
        let frame = self.frame_mut();
        frame.pc = 0;
        self.status = VmStatus::None;
        self.exception = None;
    }

    fn cleanup(&mut self) {
        self.frame = None;
        self.exception = None;
    }

    /// Whether `instr` runs under the current status.
    fn call_me(&self, instr: &Instruction) -> bool {
        match self.status {
            VmStatus::Exit => is_leaving() || instr.is_leave_context(),
            VmStatus::Break | VmStatus::Continue => instr.is_end_loop() || instr.is_leave_context(),
            _ => true,
        }
    }

    /// The instruction loop. `Some` is a yielded value.
    fn run(&mut self, scope: &Value) -> Result<Option<Value>, FatalError> {
        let bytecode = Arc::clone(&self.bytecode);
        loop {
            let pc = self.frame_mut().pc;
            let Some(instr) = bytecode.get(pc) else {
                return Ok(None);
            };
            frames::set_line(instr.line);

            let exit_before = self.options.exit_signal.is_requested();
            if exit_before && self.status != VmStatus::Exit {
                debug!(bytecode = %bytecode.name(), pc, "exit requested, unwinding");
                self.status = VmStatus::Exit;
            }
            self.frame_mut().pc = pc + 1;
            if !self.call_me(instr) {
                trace!(bytecode = %bytecode.name(), pc, status = %self.status, "skip {}", instr.op.mnemonic());
                continue;
            }

            let mut outcome = match self.consult_debugger(instr, pc, scope, true) {
                DebugCommand::Halt => {
                    debug!(bytecode = %bytecode.name(), pc, "halted by debugger");
                    StepOutcome::Fail(Value::exception(ErrorCode::Exit, "Cancelled by debugger"))
                }
                DebugCommand::Proceed => {
                    if self.options.trace {
                        debug!(bytecode = %bytecode.name(), scope = %scope, "{}", instr);
                    }
                    let outcome = instr.execute(self, scope)?;
                    if let Some(fatal) = take_nested_fatal() {
                        return Err(fatal);
                    }
                    self.consult_debugger(instr, pc, scope, false);
                    outcome
                }
            };
            if !exit_before && self.options.exit_signal.is_requested() {
                outcome = StepOutcome::Continue;
            }

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::JumpTo(label) => self.jump(&label)?,
                StepOutcome::Suspend(value) => return Ok(Some(value)),
                StepOutcome::Complete(value) => {
                    let ret = Value::exception_with(ErrorCode::Return, "Return Value", value);
                    if !self.raise(ret)? {
                        return Ok(None);
                    }
                }
                StepOutcome::Fail(exception) => {
                    if !self.raise(exception)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn jump(&mut self, label: &str) -> Result<(), FatalError> {
        match self.bytecode.resolve(label) {
            Some(pc) => {
                self.frame_mut().pc = pc;
                Ok(())
            }
            None => Err(FatalError::LabelNotFound {
                owner: self.owner().to_string(),
                label: label.to_string(),
            }),
        }
    }

    /// Route an exception to the innermost context. False when there is none
    /// and the run ends with it.
    fn raise(&mut self, exception: Value) -> Result<bool, FatalError> {
        let code = exception.error_code();
        if let Some(e) = exception.as_exception() {
            if !e.code.is_control() {
                e.set_trace(frames::current_trace());
            }
        }
        if code == Some(ErrorCode::Exit) {
            self.status = VmStatus::Exit;
        }
        trace!(bytecode = %self.owner(), exception = %exception, "raise");
        self.exception = Some(exception);
        match self.peek_context().map(|c| c.label.clone()) {
            Some(label) => {
                self.jump(&label)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Leave every context still active, innermost first.
    fn unwind_contexts(&mut self) {
        while let Some(ctx) = self.pop_context() {
            debug!(bytecode = %self.owner(), context = %ctx, "leaving context on exit");
            let Some(handler) = ctx.value.filter(|v| v.has_interface(Interface::CtxHandler)) else {
                continue;
            };
            let param = match &self.exception {
                Some(e) if e.error_code() != Some(ErrorCode::Return) => e.clone(),
                _ => Value::bool(false),
            };
            let _leaving = LeavingGuard::set();
            handler.leave(&param);
        }
    }

    fn finish(&mut self) -> Value {
        if self.status == VmStatus::Exit {
            self.unwind_contexts();
        }
        let result = match self.exception.take() {
            Some(e) if e.error_code() == Some(ErrorCode::Return) => e
                .as_exception()
                .and_then(|ex| ex.throwable.clone())
                .unwrap_or_else(|| Value::int(0)),
            Some(e) => e,
            None if self.status == VmStatus::Exit => self
                .options
                .exit_signal
                .code()
                .unwrap_or_else(|| Value::int(0)),
            None => self.pop().unwrap_or_else(Value::null),
        };
        self.state = if self.status == VmStatus::Exit {
            RunState::Exited
        } else {
            RunState::Returned
        };
        self.cleanup();
        result
    }

    fn consult_debugger(&mut self, instr: &Instruction, pc: usize, scope: &Value, before: bool) -> DebugCommand {
        let Some(mut debugger) = self.debugger.take() else {
            return DebugCommand::Proceed;
        };
        let debug = self.options.debug_stacks;
        let status = self.status;
        let frame = self.frame.get_or_insert_with(|| Frame::new(debug));
        let state = DebugState {
            bytecode: &self.bytecode,
            pc,
            instruction: instr,
            stack: &frame.stack,
            contexts: &frame.contexts,
            status,
            scope,
        };
        let command = if before {
            debugger.step_before(&state)
        } else {
            debugger.step_after(&state);
            DebugCommand::Proceed
        };
        self.debugger = Some(debugger);
        command
    }
}

impl fmt::Debug for VM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VM")
            .field("bytecode", &self.bytecode.name())
            .field("state", &self.state)
            .field("status", &self.status)
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeId;
    use crate::vm::{BytecodeBuilder, CallSpec, Op};
    use std::sync::Mutex;

    fn build(ops: Vec<Op>) -> Arc<Bytecode> {
        let mut b = BytecodeBuilder::new("test");
        for op in ops {
            b.push_instruction(Instruction::new(op));
        }
        Arc::new(b.finish().unwrap())
    }

    fn labelled(ops: Vec<(Option<&str>, Op)>) -> Arc<Bytecode> {
        let mut b = BytecodeBuilder::new("test");
        for (label, op) in ops {
            if let Some(l) = label {
                b.label(l);
            }
            b.push_instruction(Instruction::new(op));
        }
        Arc::new(b.finish().unwrap())
    }

    fn isolated() -> VmOptions {
        VmOptions {
            exit_signal: ExitSignal::new(),
            ..Default::default()
        }
    }

    fn run_code(ops: Vec<Op>) -> Value {
        let mut vm = VM::with_options(build(ops), isolated());
        vm.execute(&Value::empty_dict()).unwrap()
    }

    #[test]
    fn test_push_and_return() {
        let r = run_code(vec![Op::PushVal(Value::int(7)), Op::Return]);
        assert_eq!(r.as_int(), Some(7));
    }

    #[test]
    fn test_falls_off_end_with_stack_top() {
        let r = run_code(vec![Op::PushVal(Value::int(1)), Op::PushVal(Value::int(2))]);
        assert_eq!(r.as_int(), Some(2));
        assert!(run_code(vec![Op::Nop]).is_null());
    }

    #[test]
    fn test_return_with_empty_stack_is_zero() {
        assert_eq!(run_code(vec![Op::Return]).as_int(), Some(0));
    }

    #[test]
    fn test_arithmetic() {
        let r = run_code(vec![
            Op::PushVal(Value::int(3)),
            Op::PushVal(Value::float(0.5)),
            Op::FunctionCall(CallSpec::infix("+", 2)),
            Op::Return,
        ]);
        assert_eq!(r.type_id(), TypeId::FLOAT);
        assert_eq!(r.as_float(), Some(3.5));
    }

    #[test]
    fn test_uncaught_exception_is_result() {
        let r = run_code(vec![
            Op::PushVal(Value::int(1)),
            Op::PushVal(Value::int(0)),
            Op::FunctionCall(CallSpec::infix("/", 2)),
            Op::Return,
        ]);
        let e = r.as_exception().unwrap();
        assert_eq!(e.code, ErrorCode::ZeroDivision);
        assert!(e.trace().is_some());
    }

    #[test]
    fn test_jump_to_missing_label_is_fatal() {
        let bytecode = Arc::new(Bytecode::from_instructions(
            "broken",
            vec![Instruction::new(Op::Jump("nowhere".into()))],
        ));
        let mut vm = VM::with_options(bytecode, isolated());
        let err = vm.execute(&Value::empty_dict()).unwrap_err();
        assert_eq!(
            err,
            FatalError::LabelNotFound {
                owner: "broken".into(),
                label: "nowhere".into()
            }
        );
        assert_eq!(vm.state(), RunState::Faulted);
    }

    #[test]
    fn test_loop_with_test_and_jump() {
        // i = 0; while i < 5: i = i + 1; return i
        let scope = Value::empty_dict();
        let bytecode = labelled(vec![
            (None, Op::PushVal(Value::int(0))),
            (None, Op::Assign("i".into())),
            (Some("top"), Op::PushVar("i".into())),
            (None, Op::PushVal(Value::int(5))),
            (None, Op::FunctionCall(CallSpec::infix("<", 2))),
            (None, Op::Test("done".into())),
            (None, Op::PushVar("i".into())),
            (None, Op::Incr),
            (None, Op::Assign("i".into())),
            (None, Op::Jump("top".into())),
            (Some("done"), Op::PushVar("i".into())),
            (None, Op::Return),
        ]);
        let mut vm = VM::with_options(bytecode, isolated());
        assert_eq!(vm.execute(&scope).unwrap().as_int(), Some(5));
    }

    #[test]
    fn test_break_skips_to_end_loop() {
        let bytecode = labelled(vec![
            (Some("top"), Op::VMStatus(VmStatus::Break)),
            (None, Op::PushVal(Value::string("skipped"))),
            (None, Op::EndLoop("top".into())),
            (None, Op::PushVal(Value::string("after"))),
            (None, Op::Return),
        ]);
        let mut vm = VM::with_options(bytecode, isolated());
        assert_eq!(vm.execute(&Value::empty_dict()).unwrap().to_string(), "after");
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_yield_and_resume() {
        let bytecode = build(vec![
            Op::PushVal(Value::int(1)),
            Op::Yield,
            Op::PushVal(Value::int(2)),
            Op::Yield,
            Op::PushVal(Value::int(3)),
            Op::Return,
        ]);
        let mut vm = VM::with_options(bytecode, isolated());
        let scope = Value::empty_dict();
        assert!(matches!(vm.resume(&scope).unwrap(), RunOutcome::Yielded(v) if v.as_int() == Some(1)));
        assert_eq!(vm.state(), RunState::Suspended);
        assert!(matches!(vm.resume(&scope).unwrap(), RunOutcome::Yielded(v) if v.as_int() == Some(2)));
        assert!(matches!(vm.resume(&scope).unwrap(), RunOutcome::Finished(v) if v.as_int() == Some(3)));
        assert_eq!(vm.state(), RunState::Returned);
    }

    #[test]
    fn test_exception_routed_to_context() {
        // Handler pushes the caught exception; the code after it returns it.
        let bytecode = labelled(vec![
            (None, Op::EnterContext { label: "catch".into(), var: Default::default() }),
            (None, Op::PushVal(Value::string("boom"))),
            (None, Op::Throw),
            (None, Op::PushVal(Value::string("not reached"))),
            (None, Op::Return),
            (Some("catch"), Op::LeaveContext),
            (None, Op::Deref("message".into())),
            (None, Op::Return),
        ]);
        let mut vm = VM::with_options(bytecode, isolated());
        let r = vm.execute(&Value::empty_dict()).unwrap();
        assert_eq!(r.to_string(), "boom");
    }

    #[test]
    fn test_return_passes_through_context() {
        let bytecode = labelled(vec![
            (None, Op::EnterContext { label: "leave".into(), var: Default::default() }),
            (None, Op::PushVal(Value::int(11))),
            (None, Op::Return),
            (Some("leave"), Op::LeaveContext),
            (None, Op::PushVal(Value::int(99))),
            (None, Op::Return),
        ]);
        let mut vm = VM::with_options(bytecode, isolated());
        assert_eq!(vm.execute(&Value::empty_dict()).unwrap().as_int(), Some(11));
    }

    #[test]
    fn test_leave_context_underflow_is_fatal() {
        let mut vm = VM::with_options(build(vec![Op::LeaveContext]), isolated());
        assert!(matches!(
            vm.execute(&Value::empty_dict()),
            Err(FatalError::ContextUnderflow { .. })
        ));
    }

    #[test]
    fn test_max_depth() {
        let options = VmOptions {
            max_depth: 0,
            ..isolated()
        };
        let mut vm = VM::with_options(build(vec![Op::Nop]), options);
        let r = vm.execute(&Value::empty_dict()).unwrap();
        assert_eq!(r.error_code(), Some(ErrorCode::MaxStackDepthExceeded));
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Debugger for Recorder {
        fn step_before(&mut self, state: &DebugState<'_>) -> DebugCommand {
            self.0.lock().unwrap().push(state.instruction.op.mnemonic().to_string());
            if state.instruction.op.mnemonic() == "Return" {
                DebugCommand::Halt
            } else {
                DebugCommand::Proceed
            }
        }
    }

    #[test]
    fn test_debugger_halt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut vm = VM::with_options(
            build(vec![Op::PushVal(Value::int(1)), Op::Return]),
            isolated(),
        );
        vm.set_debugger(Box::new(Recorder(seen.clone())));
        let r = vm.execute(&Value::empty_dict()).unwrap();
        let e = r.as_exception().unwrap();
        assert_eq!(e.code, ErrorCode::Exit);
        assert_eq!(e.message, "Cancelled by debugger");
        assert_eq!(*seen.lock().unwrap(), vec!["PushVal", "Return"]);
        assert_eq!(vm.state(), RunState::Exited);
    }

    #[test]
    fn test_exit_signal_skips_to_end() {
        let options = isolated();
        let signal = options.exit_signal.clone();
        let trigger = Value::native("exit", 0, Some(0), move |_, _| {
            signal.request(Value::int(3));
            Value::null()
        });
        let scope = Value::empty_dict();
        scope.set("exit", trigger);
        let bytecode = build(vec![
            Op::PushVar("exit".into()),
            Op::FunctionCall(CallSpec::new("exit", 0)),
            Op::PushVal(Value::string("not reached")),
            Op::Return,
        ]);
        let mut vm = VM::with_options(bytecode, options);
        assert_eq!(vm.execute(&scope).unwrap().as_int(), Some(3));
        assert_eq!(vm.state(), RunState::Exited);
    }
}
