//! Closures: a script bound to the scope chain it was created in.
//!
//! A closure value is also the scope its bytecode runs against. Names are
//! resolved in this order: `self`, local variables, parameters, functions
//! nested in the script (bound as closures over the current activation),
//! the enclosing closure, and finally the global scope.
//!
//! Calling a closure never runs the closure value itself: the call binds
//! the arguments into a fresh activation so that recursive and concurrent
//! calls do not share variables.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use super::generator;
use super::script::{Script, ScriptKind};
use crate::error::FatalError;
use crate::value::types::{MethodDescr, TypeDescr, TypeId, VTable};
use crate::value::{ErrorCode, Kwargs, Value};
use crate::vm::{Debugger, ThreadHandle, ThreadSpawner, VM, VmOptions, report_fatal};

#[derive(Debug)]
pub struct Closure {
    script: Arc<Script>,
    up: Option<Value>,
    globals: Value,
    this: Option<Value>,
    params: IndexMap<String, Value>,
    locals: Mutex<IndexMap<String, Value>>,
    options: VmOptions,
}

impl Closure {
    pub fn new(script: Arc<Script>, up: Option<Value>, globals: Value, options: VmOptions) -> Self {
        Self {
            script,
            up,
            globals,
            this: None,
            params: IndexMap::new(),
            locals: Mutex::new(IndexMap::new()),
            options,
        }
    }

    /// Bind `self` for method-style closures.
    pub fn with_self(mut self, this: Value) -> Self {
        self.this = Some(this);
        self
    }

    pub fn value(self) -> Value {
        Value::object(TypeId::CLOSURE, self)
    }

    pub fn name(&self) -> &str {
        &self.script.name
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    pub fn globals(&self) -> &Value {
        &self.globals
    }

    /// A VM for this closure's bytecode.
    pub(crate) fn vm(&self) -> VM {
        VM::with_options(Arc::clone(&self.script.bytecode), self.options.clone())
    }

    fn arg_error(&self, message: String) -> Value {
        Value::exception(ErrorCode::ArgCount, format!("{}(): {}", self.name(), message))
    }

    /// Bind arguments into a fresh activation.
    fn activate(&self, args: &[Value], kwargs: &Kwargs) -> Result<Closure, Value> {
        let params = &self.script.params;
        if args.len() > params.len() {
            return Err(self.arg_error(format!(
                "takes {} arguments, {} provided",
                params.len(),
                args.len()
            )));
        }
        let mut bound: IndexMap<String, Value> = params.iter().cloned().zip(args.iter().cloned()).collect();
        for (name, value) in kwargs {
            if !params.contains(name) {
                return Err(self.arg_error(format!("unexpected keyword argument '{}'", name)));
            }
            if bound.insert(name.clone(), value.clone()).is_some() {
                return Err(self.arg_error(format!("multiple values for argument '{}'", name)));
            }
        }
        if let Some(missing) = params.iter().find(|p| !bound.contains_key(*p)) {
            return Err(self.arg_error(format!("missing argument '{}'", missing)));
        }
        // Keep declaration order regardless of how arguments were passed.
        let params = params
            .iter()
            .filter_map(|p| bound.swap_remove(p).map(|v| (p.clone(), v)))
            .collect();
        Ok(Closure {
            script: Arc::clone(&self.script),
            up: self.up.clone(),
            globals: self.globals.clone(),
            this: self.this.clone(),
            params,
            locals: Mutex::new(IndexMap::new()),
            options: self.options.clone(),
        })
    }

    /// Call the closure.
    ///
    /// Script errors are returned as exception values. `Err` is a fatal error
    /// from running a synchronous body on this thread.
    pub fn execute(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, FatalError> {
        let activation = match self.activate(args, kwargs) {
            Ok(closure) => closure.value(),
            Err(exception) => return Ok(exception),
        };
        debug!(closure = %self.name(), kind = %self.script.kind, args = args.len(), "call");
        match self.script.kind {
            ScriptKind::Sync => run(&activation),
            ScriptKind::Async => Ok(spawn(activation)),
            ScriptKind::Generator => Ok(generator::start(activation)),
        }
    }

    /// Run a parameterless closure on this thread, consulting `debugger`
    /// around every instruction of its own bytecode.
    pub fn execute_debug(&self, debugger: Box<dyn Debugger>) -> Result<Value, FatalError> {
        let activation = match self.activate(&[], &Kwargs::new()) {
            Ok(closure) => closure,
            Err(exception) => return Ok(exception),
        };
        let mut vm = activation.vm();
        vm.set_debugger(debugger);
        vm.execute(&activation.value())
    }

    fn lookup(&self, this: &Value, name: &str) -> Option<Value> {
        if name == "self" {
            if let Some(obj) = &self.this {
                return Some(obj.clone());
            }
        }
        if let Some(v) = self.locals.lock().get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.params.get(name) {
            return Some(v.clone());
        }
        if let Some(f) = self.script.function(name) {
            let nested = Closure::new(
                Arc::clone(f),
                Some(this.clone()),
                self.globals.clone(),
                self.options.clone(),
            );
            return Some(nested.value());
        }
        match &self.up {
            Some(up) => up.resolve(name),
            None => self.globals.resolve(name),
        }
    }
}

/// Run an activation to completion on this thread.
fn run(activation: &Value) -> Result<Value, FatalError> {
    match activation.downcast::<Closure>() {
        Some(c) => c.vm().execute(activation),
        None => Ok(not_a_closure(activation)),
    }
}

fn not_a_closure(v: &Value) -> Value {
    Value::exception(
        ErrorCode::InternalError,
        format!("{} '{}' is not a closure", v.type_name(), v),
    )
}

/// Handle to the thread running an async closure.
#[derive(Debug)]
pub struct Thread {
    name: String,
    handle: Mutex<ThreadHandle>,
}

fn spawn(activation: Value) -> Value {
    let name = activation
        .downcast::<Closure>()
        .map(|c| c.name().to_string())
        .unwrap_or_default();
    let spawned = ThreadSpawner::spawn(name.clone(), move || {
        run(&activation).unwrap_or_else(|fatal| Value::exception(ErrorCode::InternalError, fatal.to_string()))
    });
    match spawned {
        Ok(handle) => Value::object(
            TypeId::THREAD,
            Thread {
                name,
                handle: Mutex::new(handle),
            },
        ),
        Err(e) => Value::exception(
            ErrorCode::SysError,
            format!("Could not start thread for '{}': {}", name, e),
        ),
    }
}

fn closure_call(v: &Value, args: &[Value], kwargs: &Kwargs) -> Value {
    let Some(c) = v.downcast::<Closure>() else {
        return not_a_closure(v);
    };
    c.execute(args, kwargs).unwrap_or_else(|fatal| {
        let exception = Value::exception(ErrorCode::InternalError, fatal.to_string());
        report_fatal(fatal);
        exception
    })
}

fn closure_resolve(v: &Value, name: &str) -> Option<Value> {
    v.downcast::<Closure>()?.lookup(v, name)
}

fn closure_set(v: &Value, name: &str, value: Value) -> Value {
    match v.downcast::<Closure>() {
        Some(c) => {
            c.locals.lock().insert(name.to_string(), value.clone());
            value
        }
        None => not_a_closure(v),
    }
}

fn closure_to_string(v: &Value) -> String {
    match v.downcast::<Closure>() {
        Some(c) => format!("<closure {}>", c.name()),
        None => "<closure>".to_string(),
    }
}

pub(crate) fn closure_type() -> TypeDescr {
    TypeDescr::new(TypeId::CLOSURE, "closure").with_vtable(VTable {
        call: Some(closure_call),
        resolve: Some(closure_resolve),
        set: Some(closure_set),
        to_string: Some(closure_to_string),
        ..Default::default()
    })
}

fn thread_join(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    match this.downcast::<Thread>() {
        Some(t) => t.handle.lock().join(),
        None => Value::exception(ErrorCode::InternalError, "not a thread"),
    }
}

fn thread_to_string(v: &Value) -> String {
    match v.downcast::<Thread>() {
        Some(t) => format!("<thread {}#{}>", t.name, t.handle.lock().id),
        None => "<thread>".to_string(),
    }
}

const THREAD_METHODS: &[MethodDescr] = &[MethodDescr::new("join", thread_join)];

pub(crate) fn thread_type() -> TypeDescr {
    TypeDescr::new(TypeId::THREAD, "thread")
        .with_vtable(VTable {
            to_string: Some(thread_to_string),
            ..Default::default()
        })
        .with_methods(THREAD_METHODS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{BytecodeBuilder, CallSpec, Instruction, Op, StepLimit};

    fn script(name: &str, params: &[&str], ops: Vec<Op>) -> Script {
        let mut b = BytecodeBuilder::new(name);
        for op in ops {
            b.push_instruction(Instruction::new(op));
        }
        Script::new(b.finish().unwrap()).with_params(params.iter().copied())
    }

    fn add() -> Script {
        script(
            "add",
            &["a", "b"],
            vec![
                Op::PushVar("a".into()),
                Op::PushVar("b".into()),
                Op::FunctionCall(CallSpec::infix("+", 2)),
                Op::Return,
            ],
        )
    }

    fn closure(script: Script) -> Value {
        Arc::new(script).closure(VmOptions::default())
    }

    #[test]
    fn test_call_binds_params() {
        let f = closure(add());
        let r = f.call(&[Value::int(1), Value::int(2)], &Kwargs::new());
        assert_eq!(r.as_int(), Some(3));

        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), Value::int(5));
        assert_eq!(f.call(&[Value::int(1)], &kwargs).as_int(), Some(6));
    }

    #[test]
    fn test_arg_count_mismatch() {
        let f = closure(add());
        let r = f.call(&[Value::int(1)], &Kwargs::new());
        assert_eq!(r.error_code(), Some(ErrorCode::ArgCount));
        let r = f.call(&[Value::int(1), Value::int(2), Value::int(3)], &Kwargs::new());
        assert_eq!(r.error_code(), Some(ErrorCode::ArgCount));

        let mut kwargs = Kwargs::new();
        kwargs.insert("c".into(), Value::int(5));
        let r = f.call(&[Value::int(1), Value::int(2)], &kwargs);
        assert_eq!(r.error_code(), Some(ErrorCode::ArgCount));
    }

    #[test]
    fn test_nested_function_and_globals() {
        let mut main = script(
            "main",
            &[],
            vec![
                Op::PushVal(Value::int(10)),
                Op::Assign("n".into()),
                Op::PushVar("twice".into()),
                Op::PushVar("len".into()),
                Op::PushVal(Value::string("abc")),
                Op::FunctionCall(CallSpec::new("len", 1)),
                Op::FunctionCall(CallSpec::new("twice", 1)),
                Op::PushVar("n".into()),
                Op::FunctionCall(CallSpec::infix("+", 2)),
                Op::Return,
            ],
        );
        // twice(x) = x * 2 + n, with n from the enclosing activation
        main.add_function(script(
            "twice",
            &["x"],
            vec![
                Op::PushVar("x".into()),
                Op::PushVal(Value::int(2)),
                Op::FunctionCall(CallSpec::infix("*", 2)),
                Op::PushVar("n".into()),
                Op::FunctionCall(CallSpec::infix("+", 2)),
                Op::Return,
            ],
        ));
        let r = closure(main).call(&[], &Kwargs::new());
        assert_eq!(r.as_int(), Some(26));
    }

    #[test]
    fn test_locals_do_not_leak_between_calls() {
        let f = closure(script(
            "f",
            &[],
            vec![
                Op::PushVar("seen".into()),
                Op::Return,
            ],
        ));
        assert_eq!(f.call(&[], &Kwargs::new()).error_code(), Some(ErrorCode::Name));
        f.set("seen", Value::int(1));
        assert_eq!(f.call(&[], &Kwargs::new()).error_code(), Some(ErrorCode::Name));
    }

    #[test]
    fn test_recursion_depth_limit() {
        let mut main = script(
            "main",
            &[],
            vec![
                Op::PushVar("down".into()),
                Op::FunctionCall(CallSpec::new("down", 0)),
                Op::Return,
            ],
        );
        main.add_function(script(
            "down",
            &[],
            vec![
                Op::PushVar("down".into()),
                Op::FunctionCall(CallSpec::new("down", 0)),
                Op::Return,
            ],
        ));
        let options = VmOptions {
            max_depth: 16,
            ..Default::default()
        };
        let r = Arc::new(main).closure(options).call(&[], &Kwargs::new());
        assert_eq!(r.error_code(), Some(ErrorCode::MaxStackDepthExceeded));
    }

    #[test]
    fn test_async_closure_joins() {
        let f = closure(add().with_kind(ScriptKind::Async));
        let thread = f.call(&[Value::int(40), Value::int(2)], &Kwargs::new());
        assert_eq!(thread.type_id(), TypeId::THREAD);
        let r = thread.execute_method("join", &[], &Kwargs::new());
        assert_eq!(r.as_int(), Some(42));
        assert!(thread.to_string().starts_with("<thread add#"));
    }

    #[test]
    fn test_execute_debug_halts() {
        let f = script(
            "main",
            &[],
            vec![Op::PushVal(Value::int(1)), Op::PushVal(Value::int(2)), Op::Return],
        );
        let c = Closure::new(Arc::new(f), None, Value::empty_dict(), VmOptions::default());
        let r = c.execute_debug(Box::new(StepLimit::new(1))).unwrap();
        assert_eq!(r.error_code(), Some(ErrorCode::Exit));
        let r = c.execute_debug(Box::new(StepLimit::new(10))).unwrap();
        assert_eq!(r.as_int(), Some(2));
    }

    #[test]
    fn test_self_binding() {
        let c = Closure::new(
            Arc::new(script("m", &[], vec![Op::PushVar("self".into()), Op::Return])),
            None,
            Value::empty_dict(),
            VmOptions::default(),
        )
        .with_self(Value::string("me"))
        .value();
        assert_eq!(c.call(&[], &Kwargs::new()).to_string(), "me");
        assert_eq!(c.to_string(), "<closure m>");
    }
}
