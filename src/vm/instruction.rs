//! Instruction set.
//!
//! Executing an instruction returns a [`StepOutcome`] telling the run loop
//! what to do next. Exceptions of every kind, including re-raised `return`
//! and `exit` signals, travel as [`StepOutcome::Fail`].

use std::fmt;

use serde::Serialize;

use super::threads::LeavingGuard;
use super::vm::{Context, VM, VmStatus};
use crate::error::FatalError;
use crate::value::{ErrorCode, Interface, Kwargs, Name, TypeId, Value};

/// Result of executing one instruction.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Proceed with the next instruction.
    Continue,
    /// Resume at the instruction carrying this label.
    JumpTo(String),
    /// Hand a value back to the caller and keep the run resumable.
    Suspend(Value),
    /// Finish the run with this value.
    Complete(Value),
    /// Raise an exception value.
    Fail(Value),
}

/// Operands of a function call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSpec {
    /// Method name for infix calls, the callee's name otherwise.
    pub name: Name,
    pub arg_count: usize,
    /// Names of keyword arguments, in the order they were pushed.
    pub kwargs: Vec<String>,
    /// Call `name` as a method on the first argument.
    pub infix: bool,
    /// An extra int on top of the stack gives additional positional arguments.
    pub varargs: bool,
}

impl CallSpec {
    pub fn new(name: impl Into<Name>, arg_count: usize) -> Self {
        Self {
            name: name.into(),
            arg_count,
            ..Default::default()
        }
    }

    /// A method call on the first of `arg_count` arguments.
    pub fn infix(name: impl Into<Name>, arg_count: usize) -> Self {
        Self {
            infix: true,
            ..Self::new(name, arg_count)
        }
    }

    pub fn with_kwargs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.kwargs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_varargs(mut self) -> Self {
        self.varargs = true;
        self
    }
}

impl fmt::Display for CallSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(argv[{}]", self.name, self.arg_count)?;
        if !self.kwargs.is_empty() {
            write!(f, ", [{}]", self.kwargs.join(", "))?;
        }
        if self.varargs {
            write!(f, ", ...")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    Assign(Name),
    PushVal(Value),
    PushVar(Name),
    PushScope,
    PushCtx,
    Deref(Name),
    Subscript,
    FunctionCall(CallSpec),
    Test(String),
    Jump(String),
    EnterContext { label: String, var: Name },
    LeaveContext,
    Pop,
    Dup,
    Swap,
    Stash(usize),
    Unstash(usize),
    Incr,
    Decr,
    Return,
    Throw,
    Yield,
    Nop,
    EndLoop(String),
    VMStatus(VmStatus),
    Iter,
    Next(String),
}

impl Op {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Assign(_) => "Assign",
            Op::PushVal(_) => "PushVal",
            Op::PushVar(_) => "PushVar",
            Op::PushScope => "PushScope",
            Op::PushCtx => "PushCtx",
            Op::Deref(_) => "Deref",
            Op::Subscript => "Subscript",
            Op::FunctionCall(_) => "FunctionCall",
            Op::Test(_) => "Test",
            Op::Jump(_) => "Jump",
            Op::EnterContext { .. } => "EnterContext",
            Op::LeaveContext => "LeaveContext",
            Op::Pop => "Pop",
            Op::Dup => "Dup",
            Op::Swap => "Swap",
            Op::Stash(_) => "Stash",
            Op::Unstash(_) => "Unstash",
            Op::Incr => "Incr",
            Op::Decr => "Decr",
            Op::Return => "Return",
            Op::Throw => "Throw",
            Op::Yield => "Yield",
            Op::Nop => "Nop",
            Op::EndLoop(_) => "EndLoop",
            Op::VMStatus(_) => "VMStatus",
            Op::Iter => "Iter",
            Op::Next(_) => "Next",
        }
    }

    /// Label this instruction may transfer control to.
    pub fn target(&self) -> Option<&str> {
        match self {
            Op::Test(l) | Op::Jump(l) | Op::EndLoop(l) | Op::Next(l) => Some(l),
            Op::EnterContext { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn operand(&self) -> String {
        match self {
            Op::Assign(n) | Op::PushVar(n) | Op::Deref(n) => n.to_string(),
            Op::PushVal(v) => match v.type_id() {
                TypeId::STRING => format!("{:?}", v.to_str()),
                _ => v.to_string(),
            },
            Op::FunctionCall(call) => call.to_string(),
            Op::Test(l) | Op::Jump(l) | Op::EndLoop(l) | Op::Next(l) => l.clone(),
            Op::EnterContext { label, var } if var.is_empty() => label.clone(),
            Op::EnterContext { label, var } => format!("{} {}", label, var),
            Op::Stash(ix) | Op::Unstash(ix) => ix.to_string(),
            Op::VMStatus(s) => s.to_string(),
            _ => String::new(),
        }
    }
}

/// One instruction with its source line and the labels that land on it.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
    pub line: Option<u32>,
    pub labels: Vec<String>,
}

/// A row of a bytecode listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingEntry {
    pub index: usize,
    pub line: Option<u32>,
    pub labels: Vec<String>,
    pub mnemonic: &'static str,
    pub operand: String,
}

macro_rules! pop {
    ($vm:expr, $instr:expr) => {
        match $vm.pop() {
            Some(v) => v,
            None => return Ok(StepOutcome::Fail($instr.underflow())),
        }
    };
}

macro_rules! fail_on_exception {
    ($value:expr) => {{
        let v = $value;
        if v.is_exception() {
            return Ok(StepOutcome::Fail(v));
        }
        v
    }};
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            line: None,
            labels: Vec::new(),
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn is_leave_context(&self) -> bool {
        matches!(self.op, Op::LeaveContext)
    }

    pub fn is_end_loop(&self) -> bool {
        matches!(self.op, Op::EndLoop(_))
    }

    pub fn listing_entry(&self, index: usize) -> ListingEntry {
        ListingEntry {
            index,
            line: self.line,
            labels: self.labels.clone(),
            mnemonic: self.op.mnemonic(),
            operand: self.op.operand(),
        }
    }

    pub fn execute(&self, vm: &mut VM, scope: &Value) -> Result<StepOutcome, FatalError> {
        let outcome = match &self.op {
            Op::Assign(name) => {
                let value = pop!(vm, self);
                fail_on_exception!(name.assign(scope, value));
                StepOutcome::Continue
            }
            Op::PushVal(value) => {
                vm.push(value.clone());
                StepOutcome::Continue
            }
            Op::PushVar(name) => {
                let value = fail_on_exception!(name.resolve(scope));
                vm.push(value);
                StepOutcome::Continue
            }
            Op::PushScope => {
                vm.push(scope.clone());
                StepOutcome::Continue
            }
            Op::PushCtx => match vm.peek_context() {
                Some(ctx) => {
                    let value = ctx.value.clone().unwrap_or_else(Value::null);
                    vm.push(value);
                    StepOutcome::Continue
                }
                None => StepOutcome::Fail(Value::exception(
                    ErrorCode::InternalError,
                    "PushCtx with no active context",
                )),
            },
            Op::Deref(name) => {
                let object = pop!(vm, self);
                let value = fail_on_exception!(name.resolve(&object));
                vm.push(value);
                StepOutcome::Continue
            }
            Op::Subscript => {
                let subscript = pop!(vm, self);
                let subject = pop!(vm, self);
                match subject.resolve(&subscript.to_str()) {
                    Some(v) => {
                        let v = fail_on_exception!(v);
                        vm.push(v);
                        StepOutcome::Continue
                    }
                    None => StepOutcome::Fail(Value::exception(
                        ErrorCode::Name,
                        format!("{} '{}' has no element '{}'", subject.type_name(), subject, subscript),
                    )),
                }
            }
            Op::FunctionCall(call) => self.call(vm, call),
            Op::Test(label) => {
                let value = pop!(vm, self);
                match value.cast(TypeId::BOOL).and_then(|b| b.as_bool()) {
                    Some(true) => StepOutcome::Continue,
                    Some(false) => StepOutcome::JumpTo(label.clone()),
                    None => StepOutcome::Fail(Value::exception(
                        ErrorCode::Type,
                        format!("Cannot convert {} '{}' to boolean", value.type_name(), value),
                    )),
                }
            }
            Op::Jump(label) => StepOutcome::JumpTo(label.clone()),
            Op::EnterContext { label, var } => {
                let value = if var.is_empty() {
                    None
                } else {
                    Some(fail_on_exception!(var.resolve(scope)))
                };
                if let Some(v) = &value {
                    if v.has_interface(Interface::CtxHandler) {
                        fail_on_exception!(v.enter());
                    }
                }
                vm.push_context(Context {
                    label: label.clone(),
                    value,
                });
                StepOutcome::Continue
            }
            Op::LeaveContext => return self.leave_context(vm),
            Op::Pop => {
                pop!(vm, self);
                StepOutcome::Continue
            }
            Op::Dup if vm.dup() => StepOutcome::Continue,
            Op::Dup => StepOutcome::Fail(self.underflow()),
            Op::Swap => {
                let first = pop!(vm, self);
                let second = pop!(vm, self);
                vm.push(first);
                vm.push(second);
                StepOutcome::Continue
            }
            Op::Stash(ix) => {
                let value = pop!(vm, self);
                vm.stash(*ix, value);
                StepOutcome::Continue
            }
            Op::Unstash(ix) => {
                let value = vm.unstash(*ix);
                vm.push(value);
                StepOutcome::Continue
            }
            Op::Incr | Op::Decr => {
                let value = pop!(vm, self);
                if !value.has_interface(Interface::Incrementable) {
                    return Ok(StepOutcome::Fail(Value::exception(
                        ErrorCode::Type,
                        format!("Cannot {} {} '{}'", self.op.mnemonic(), value.type_name(), value),
                    )));
                }
                let next = if matches!(self.op, Op::Incr) {
                    value.incr()
                } else {
                    value.decr()
                };
                vm.push(fail_on_exception!(next));
                StepOutcome::Continue
            }
            Op::Return => StepOutcome::Complete(vm.pop().unwrap_or_else(|| Value::int(0))),
            Op::Throw => StepOutcome::Fail(Value::throwable(pop!(vm, self))),
            Op::Yield => StepOutcome::Suspend(vm.pop().unwrap_or_else(Value::null)),
            Op::Nop => StepOutcome::Continue,
            Op::EndLoop(label) => {
                let broke = vm.status() == VmStatus::Break;
                if matches!(vm.status(), VmStatus::Break | VmStatus::Continue) {
                    vm.set_status(VmStatus::None);
                }
                if broke {
                    StepOutcome::Continue
                } else {
                    StepOutcome::JumpTo(label.clone())
                }
            }
            Op::VMStatus(status) => {
                vm.set_status(*status);
                StepOutcome::Continue
            }
            Op::Iter => {
                let value = pop!(vm, self);
                let iter = fail_on_exception!(value.iter());
                vm.push(iter);
                StepOutcome::Continue
            }
            Op::Next(label) => {
                let iter = pop!(vm, self);
                let next = iter.next();
                match next.error_code() {
                    Some(ErrorCode::Exhausted) => StepOutcome::JumpTo(label.clone()),
                    Some(_) => StepOutcome::Fail(next),
                    None => {
                        vm.push(iter);
                        vm.push(next);
                        StepOutcome::Continue
                    }
                }
            }
        };
        Ok(outcome)
    }

    fn underflow(&self) -> Value {
        Value::exception(
            ErrorCode::InternalError,
            format!("{}: operand stack is empty", self.op.mnemonic()),
        )
    }

    fn call(&self, vm: &mut VM, call: &CallSpec) -> StepOutcome {
        let mut kwargs = Kwargs::new();
        let mut kw_values = Vec::with_capacity(call.kwargs.len());
        for _ in &call.kwargs {
            match vm.pop() {
                Some(v) => kw_values.push(v),
                None => return StepOutcome::Fail(self.underflow()),
            }
        }
        for (name, value) in call.kwargs.iter().zip(kw_values.into_iter().rev()) {
            kwargs.insert(name.clone(), value);
        }

        let mut count = call.arg_count;
        if call.varargs {
            let extra = vm
                .pop()
                .and_then(|v| v.as_int())
                .and_then(|extra| usize::try_from(extra).ok());
            match extra.and_then(|extra| count.checked_add(extra)) {
                Some(total) => count = total,
                None => {
                    return StepOutcome::Fail(Value::exception(
                        ErrorCode::InternalError,
                        "FunctionCall: varargs count is not a non-negative int",
                    ));
                }
            }
        }
        if count > vm.depth() {
            return StepOutcome::Fail(self.underflow());
        }
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            match vm.pop() {
                Some(v) => args.push(v),
                None => return StepOutcome::Fail(self.underflow()),
            }
        }
        args.reverse();

        let result = if call.infix {
            if args.is_empty() {
                return StepOutcome::Fail(Value::exception(
                    ErrorCode::ArgCount,
                    format!("Method '{}' called without a receiver", call.name),
                ));
            }
            let receiver = args.remove(0);
            let method = call.name.last().unwrap_or_default();
            receiver.execute_method(method, &args, &kwargs)
        } else {
            let Some(callable) = vm.pop() else {
                return StepOutcome::Fail(self.underflow());
            };
            if !callable.is_callable() {
                return StepOutcome::Fail(Value::exception(
                    ErrorCode::NotCallable,
                    format!("Atom '{}' is not callable", call.name),
                ));
            }
            callable.call(&args, &kwargs)
        };
        if result.is_exception() {
            StepOutcome::Fail(result)
        } else {
            vm.push(result);
            StepOutcome::Continue
        }
    }

    fn leave_context(&self, vm: &mut VM) -> Result<StepOutcome, FatalError> {
        let pending = vm.exception().cloned();
        let code = pending.as_ref().and_then(|p| p.as_exception()).map(|e| {
            e.mark_handled();
            e.code
        });
        let Some(ctx) = vm.pop_context() else {
            if vm.status() == VmStatus::Exit {
                return Ok(StepOutcome::Continue);
            }
            return Err(FatalError::ContextUnderflow {
                owner: vm.owner().to_string(),
            });
        };

        let mut raised = None;
        match ctx.value.filter(|v| v.has_interface(Interface::CtxHandler)) {
            Some(handler) => {
                let param = match (&pending, code) {
                    (Some(p), Some(c)) if c != ErrorCode::Leave && c != ErrorCode::Return => p.clone(),
                    _ => Value::bool(false),
                };
                let _leaving = LeavingGuard::set();
                if let Some(r) = handler.leave(&param) {
                    if r.is_exception() {
                        raised = Some(r);
                    }
                }
            }
            None => vm.push(pending.clone().unwrap_or_else(Value::null)),
        }

        if let (Some(p), Some(ErrorCode::Exit | ErrorCode::Return)) = (pending, code) {
            return Ok(StepOutcome::Fail(p));
        }
        match raised {
            Some(r) => Ok(StepOutcome::Fail(r)),
            None => {
                vm.clear_exception();
                Ok(StepOutcome::Continue)
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self.line.map(|l| format!("{:6}", l)).unwrap_or_default();
        let labels = if self.labels.is_empty() {
            " ".repeat(12)
        } else {
            let mut out = String::new();
            for (ix, label) in self.labels.iter().enumerate() {
                let label: String = label.chars().take(11).collect();
                if ix == 0 {
                    out.push_str(&format!(" {:<11}", label));
                } else {
                    out.push_str(&format!("\n{:7}{:<11}", "", label));
                }
            }
            out
        };
        let operand: String = self.op.operand().chars().take(27).collect();
        let text = format!("{:<6}{}{:<15}{}", line, labels, self.op.mnemonic(), operand);
        f.write_str(text.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Bytecode;
    use std::sync::Arc;

    fn vm() -> VM {
        VM::new(Arc::new(Bytecode::from_instructions("test", Vec::new())))
    }

    fn exec(vm: &mut VM, scope: &Value, op: Op) -> StepOutcome {
        Instruction::new(op).execute(vm, scope).unwrap()
    }

    #[test]
    fn test_assign_and_push_var() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(3));
        exec(&mut vm, &scope, Op::Assign("x".into()));
        assert_eq!(scope.resolve("x").unwrap().as_int(), Some(3));
        exec(&mut vm, &scope, Op::PushVar("x".into()));
        assert_eq!(vm.pop().unwrap().as_int(), Some(3));
        match exec(&mut vm, &scope, Op::PushVar("y".into())) {
            StepOutcome::Fail(e) => assert_eq!(e.error_code(), Some(ErrorCode::Name)),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_infix_call() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(4));
        vm.push(Value::int(2));
        exec(&mut vm, &scope, Op::FunctionCall(CallSpec::infix("-", 2)));
        assert_eq!(vm.pop().unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_call_with_kwargs() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        let f = Value::native("f", 0, None, |args, kwargs| {
            let keys: Vec<&str> = kwargs.keys().map(String::as_str).collect();
            Value::string(format!("{}:{}", args.len(), keys.join(",")))
        });
        vm.push(f);
        vm.push(Value::int(1));
        vm.push(Value::int(2));
        vm.push(Value::int(3));
        let call = CallSpec::new("f", 1).with_kwargs(["a", "b"]);
        exec(&mut vm, &scope, Op::FunctionCall(call));
        assert_eq!(vm.pop().unwrap().to_string(), "1:a,b");
    }

    #[test]
    fn test_call_varargs() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::native("n", 0, None, |args, _| Value::int(args.len() as i64)));
        for i in 0..4 {
            vm.push(Value::int(i));
        }
        vm.push(Value::int(3));
        exec(&mut vm, &scope, Op::FunctionCall(CallSpec::new("n", 1).with_varargs()));
        assert_eq!(vm.pop().unwrap().as_int(), Some(4));
    }

    #[test]
    fn test_varargs_count_past_stack_fails() {
        let scope = Value::empty_dict();
        for extra in [i64::MAX, 5, -1] {
            let mut vm = vm();
            vm.push(Value::native("n", 0, None, |args, _| Value::int(args.len() as i64)));
            vm.push(Value::int(extra));
            match exec(&mut vm, &scope, Op::FunctionCall(CallSpec::new("n", 0).with_varargs())) {
                StepOutcome::Fail(e) => assert_eq!(e.error_code(), Some(ErrorCode::InternalError)),
                other => panic!("expected failure for {}, got {:?}", extra, other),
            }
        }
    }

    #[test]
    fn test_not_callable() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(5));
        match exec(&mut vm, &scope, Op::FunctionCall(CallSpec::new("five", 0))) {
            StepOutcome::Fail(e) => assert_eq!(e.error_code(), Some(ErrorCode::NotCallable)),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_test_jumps_when_false() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(0));
        assert!(matches!(exec(&mut vm, &scope, Op::Test("else".into())), StepOutcome::JumpTo(l) if l == "else"));
        vm.push(Value::string("yes"));
        assert!(matches!(exec(&mut vm, &scope, Op::Test("else".into())), StepOutcome::Continue));
        vm.push(Value::list(Vec::new()).iter());
        assert!(matches!(exec(&mut vm, &scope, Op::Test("else".into())), StepOutcome::Fail(_)));
    }

    #[test]
    fn test_stack_shuffles() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(1));
        vm.push(Value::int(2));
        exec(&mut vm, &scope, Op::Swap);
        exec(&mut vm, &scope, Op::Dup);
        let out: Vec<i64> = std::iter::from_fn(|| vm.pop()).map(|v| v.as_int().unwrap()).collect();
        assert_eq!(out, vec![1, 1, 2]);
        assert!(matches!(exec(&mut vm, &scope, Op::Pop), StepOutcome::Fail(_)));
    }

    #[test]
    fn test_stash_out_of_range_is_noop() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::int(9));
        exec(&mut vm, &scope, Op::Stash(3));
        exec(&mut vm, &scope, Op::Unstash(3));
        assert_eq!(vm.pop().unwrap().as_int(), Some(9));
        vm.push(Value::int(1));
        exec(&mut vm, &scope, Op::Stash(42));
        exec(&mut vm, &scope, Op::Unstash(42));
        assert!(vm.pop().unwrap().is_null());
    }

    #[test]
    fn test_iter_next() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        vm.push(Value::list(vec![Value::int(7)]));
        exec(&mut vm, &scope, Op::Iter);
        assert!(matches!(exec(&mut vm, &scope, Op::Next("done".into())), StepOutcome::Continue));
        assert_eq!(vm.pop().unwrap().as_int(), Some(7));
        assert!(matches!(exec(&mut vm, &scope, Op::Next("done".into())), StepOutcome::JumpTo(_)));
    }

    #[test]
    fn test_end_loop() {
        let mut vm = vm();
        let scope = Value::empty_dict();
        assert!(matches!(exec(&mut vm, &scope, Op::EndLoop("top".into())), StepOutcome::JumpTo(_)));
        exec(&mut vm, &scope, Op::VMStatus(VmStatus::Break));
        assert!(matches!(exec(&mut vm, &scope, Op::EndLoop("top".into())), StepOutcome::Continue));
        assert_eq!(vm.status(), VmStatus::None);
    }

    #[test]
    fn test_listing_format() {
        let instr = Instruction::new(Op::PushVal(Value::int(3))).at_line(12).with_label("start");
        assert_eq!(instr.to_string(), "    12 start      PushVal        3");
        let plain = Instruction::new(Op::Pop);
        assert_eq!(plain.to_string(), "                  Pop");
    }
}
