//! End-to-end behaviour of the VM core, driven through the public API.

use std::sync::Arc;

use kestrel::value::TypeId;
use kestrel::value::types::{self, TypeDescr, VTable};
use kestrel::vm::{CallSpec, DataStack, ExitSignal, Instruction, Op, RunState, VmOptions};
use kestrel::{Bytecode, BytecodeBuilder, ErrorCode, FatalError, Kwargs, VM, Value};

fn options() -> VmOptions {
    VmOptions {
        exit_signal: ExitSignal::new(),
        ..Default::default()
    }
}

fn assemble(code: Vec<(Option<&str>, Op)>) -> Arc<Bytecode> {
    let mut b = BytecodeBuilder::new("scenario");
    for (line, (label, op)) in code.into_iter().enumerate() {
        if let Some(label) = label {
            b.label(label);
        }
        b.set_line(line as u32 + 1);
        b.push_instruction(Instruction::new(op));
    }
    Arc::new(b.finish().unwrap())
}

fn run(bytecode: Arc<Bytecode>, scope: &Value) -> Result<Value, FatalError> {
    VM::with_options(bytecode, options()).execute(scope)
}

#[test]
fn copies_and_drops_track_liveness() {
    let v = Value::string("payload");
    let weak = v.downgrade();
    let handles: Vec<Value> = (0..3).map(|_| v.clone()).collect();
    assert_eq!(v.ref_count(), 4);
    drop(handles);
    assert_eq!(v.ref_count(), 1);
    assert!(weak.is_alive());
    drop(v);
    assert!(!weak.is_alive());

    let one = Value::int(1);
    assert!(one.is_constant());
    let weak_one = one.downgrade();
    drop(one);
    assert!(weak_one.is_alive());
    assert!(Value::int(1).same(&weak_one.upgrade().unwrap()));
}

#[test]
fn stack_pops_in_reverse_push_order() {
    let mut stack = DataStack::new("lifo");
    for i in 0..10 {
        stack.push(Value::int(i));
    }
    let popped: Vec<i64> = std::iter::from_fn(|| stack.pop()).filter_map(|v| v.as_int()).collect();
    assert_eq!(popped, (0..10).rev().collect::<Vec<_>>());
    assert!(stack.is_empty());
}

#[test]
fn equal_construction_compares_equal_and_unrelated_types_do_not() {
    for (a, b) in [
        (Value::int(1000), Value::int(1000)),
        (Value::float(2.5), Value::float(2.5)),
        (Value::string("abc"), Value::string("abc")),
    ] {
        assert!(!a.same(&b) || a.is_constant());
        assert!(a.compare(&b).is_eq());
    }
    let eq = Value::string("1").execute_method("==", &[Value::int(1)], &Kwargs::new());
    assert_eq!(eq.as_bool(), Some(false));
    let eq = Value::empty_dict().execute_method("==", &[Value::null()], &Kwargs::new());
    assert_eq!(eq.as_bool(), Some(false));
}

#[test]
fn arithmetic_promotes_int_to_float() {
    let kw = Kwargs::new();
    let r = Value::int(2).execute_method("+", &[Value::float(0.5)], &kw);
    assert_eq!(r.type_id(), TypeId::FLOAT);
    assert_eq!(r.as_float(), Some(2.5));

    let r = Value::float(0.5).execute_method("+", &[Value::int(2)], &kw);
    assert_eq!(r.as_float(), Some(2.5));

    let r = Value::int(2).execute_method("+", &[Value::int(3)], &kw);
    assert_eq!(r.type_id(), TypeId::INT);
    assert_eq!(r.as_int(), Some(5));

    let r = Value::int(2).execute_method("/", &[Value::int(0)], &kw);
    assert_eq!(r.error_code(), Some(ErrorCode::ZeroDivision));
}

#[test]
fn resolved_jumps_run_and_a_corrupted_target_is_fatal() {
    let code = vec![
        (None, Op::PushVal(Value::bool(false))),
        (None, Op::Test("skip".into())),
        (None, Op::PushVal(Value::string("wrong"))),
        (None, Op::Return),
        (Some("skip"), Op::Jump("end".into())),
        (None, Op::PushVal(Value::string("also wrong"))),
        (Some("end"), Op::PushVal(Value::string("right"))),
        (None, Op::Return),
    ];
    let good = assemble(code.clone());
    assert_eq!(run(good.clone(), &Value::empty_dict()).unwrap().to_string(), "right");

    let mut instructions = good.instructions().to_vec();
    instructions[4].op = Op::Jump("gone".into());
    let corrupted = Arc::new(Bytecode::from_instructions("scenario", instructions));
    let err = run(corrupted, &Value::empty_dict()).unwrap_err();
    assert_eq!(
        err,
        FatalError::LabelNotFound {
            owner: "scenario".into(),
            label: "gone".into(),
        }
    );
}

#[test]
fn handler_runs_once_and_a_second_throw_ends_the_run() {
    let scope = Value::empty_dict();
    let code = vec![
        (None, Op::PushVal(Value::int(0))),
        (None, Op::Assign("hits".into())),
        (None, Op::EnterContext { label: "handler".into(), var: Default::default() }),
        (None, Op::PushVal(Value::string("first"))),
        (None, Op::Throw),
        (Some("handler"), Op::LeaveContext),
        (None, Op::Pop),
        (None, Op::PushVar("hits".into())),
        (None, Op::Incr),
        (None, Op::Assign("hits".into())),
        (None, Op::PushVal(Value::string("second"))),
        (None, Op::Throw),
    ];
    let result = run(assemble(code), &scope).unwrap();
    let e = result.as_exception().unwrap();
    assert_eq!(e.code, ErrorCode::Throwable);
    assert_eq!(e.message, "second");
    assert_eq!(e.trace().unwrap().frames.last().unwrap().line, Some(12));
    assert_eq!(scope.resolve("hits").unwrap().as_int(), Some(1));
}

#[test]
fn assign_and_add() {
    let scope = Value::empty_dict();
    let code = vec![
        (None, Op::PushVal(Value::int(3))),
        (None, Op::Assign("x".into())),
        (None, Op::PushVar("x".into())),
        (None, Op::PushVal(Value::int(2))),
        (None, Op::FunctionCall(CallSpec::infix("+", 2))),
        (None, Op::Assign("y".into())),
        (None, Op::PushVar("y".into())),
        (None, Op::Return),
    ];
    assert_eq!(run(assemble(code), &scope).unwrap().as_int(), Some(5));
    assert_eq!(scope.resolve("x").unwrap().as_int(), Some(3));
}

/// Context handler that appends its enter/leave calls to a shared list.
struct Recorder {
    name: &'static str,
    log: Value,
}

fn record(v: &Value, entry: String) -> Value {
    if let Some(r) = v.downcast::<Recorder>() {
        r.log.execute_method("append", &[Value::string(entry)], &Kwargs::new());
    }
    Value::null()
}

fn recorder_enter(v: &Value) -> Value {
    let name = v.downcast::<Recorder>().map_or("?", |r| r.name);
    record(v, format!("enter {}", name))
}

fn recorder_leave(v: &Value, param: &Value) -> Value {
    let name = v.downcast::<Recorder>().map_or("?", |r| r.name);
    record(v, format!("leave {} {}", name, param))
}

fn recorder(name: &'static str, log: &Value) -> Value {
    let id = types::register(TypeDescr::new(TypeId::DYNAMIC, "recorder").with_vtable(VTable {
        enter: Some(recorder_enter),
        leave: Some(recorder_leave),
        ..Default::default()
    }));
    Value::object(
        id,
        Recorder {
            name,
            log: log.clone(),
        },
    )
}

/// Scope with recorders `a` and `b` and a `quit` native that requests exit code 4.
fn handler_scope(log: &Value, signal: &ExitSignal) -> Value {
    let scope = Value::empty_dict();
    scope.set("a", recorder("a", log));
    scope.set("b", recorder("b", log));
    let signal = signal.clone();
    scope.set(
        "quit",
        Value::native("quit", 0, Some(0), move |_, _| {
            signal.request(Value::int(4));
            Value::null()
        }),
    );
    scope
}

fn quit() -> Vec<(Option<&'static str>, Op)> {
    vec![
        (None, Op::PushVar("quit".into())),
        (None, Op::FunctionCall(CallSpec::new("quit", 0))),
    ]
}

#[test]
fn exit_request_leaves_contexts_once_in_reverse_order() {
    let log = Value::list(Vec::new());
    let signal = ExitSignal::new();
    let scope = handler_scope(&log, &signal);
    let mut code = vec![
        (None, Op::EnterContext { label: "leave_a".into(), var: "a".into() }),
        (None, Op::EnterContext { label: "leave_b".into(), var: "b".into() }),
    ];
    code.extend(quit());
    code.extend([
        (None, Op::PushVal(Value::string("skipped"))),
        (Some("leave_b"), Op::LeaveContext),
        (Some("leave_a"), Op::LeaveContext),
        (None, Op::PushVal(Value::int(7))),
        (None, Op::Return),
    ]);
    let options = VmOptions {
        exit_signal: signal,
        ..Default::default()
    };
    let mut vm = VM::with_options(assemble(code), options);
    let result = vm.execute(&scope).unwrap();
    assert_eq!(vm.state(), RunState::Exited);
    assert_eq!(result.as_int(), Some(4));
    assert_eq!(
        log.to_string(),
        "[enter a, enter b, leave b false, leave a false]"
    );
}

#[test]
fn exit_unwinds_contexts_with_no_leave_instructions() {
    let log = Value::list(Vec::new());
    let signal = ExitSignal::new();
    let scope = handler_scope(&log, &signal);
    let mut code = vec![
        (None, Op::EnterContext { label: "end".into(), var: "a".into() }),
        (None, Op::EnterContext { label: "end".into(), var: "b".into() }),
    ];
    code.extend(quit());
    code.push((Some("end"), Op::Nop));
    let options = VmOptions {
        exit_signal: signal,
        ..Default::default()
    };
    let result = VM::with_options(assemble(code), options).execute(&scope).unwrap();
    assert_eq!(result.as_int(), Some(4));
    assert_eq!(
        log.to_string(),
        "[enter a, enter b, leave b false, leave a false]"
    );
}

#[test]
fn leave_receives_the_pending_exception() {
    let log = Value::list(Vec::new());
    let scope = handler_scope(&log, &ExitSignal::new());
    let code = vec![
        (None, Op::EnterContext { label: "handler".into(), var: "a".into() }),
        (None, Op::PushVal(Value::string("oops"))),
        (None, Op::Throw),
        (Some("handler"), Op::LeaveContext),
        (None, Op::PushVal(Value::string("recovered"))),
        (None, Op::Return),
    ];
    let result = run(assemble(code), &scope).unwrap();
    assert_eq!(result.to_string(), "recovered");
    assert_eq!(log.to_string(), "[enter a, leave a ErrorThrowable: oops]");
}

#[test]
fn leave_gets_false_when_returning_through_a_context() {
    let log = Value::list(Vec::new());
    let scope = handler_scope(&log, &ExitSignal::new());
    let code = vec![
        (None, Op::EnterContext { label: "handler".into(), var: "a".into() }),
        (None, Op::PushVal(Value::int(11))),
        (None, Op::Return),
        (Some("handler"), Op::LeaveContext),
        (None, Op::PushVal(Value::int(99))),
        (None, Op::Return),
    ];
    assert_eq!(run(assemble(code), &scope).unwrap().as_int(), Some(11));
    assert_eq!(log.to_string(), "[enter a, leave a false]");
}

#[test]
fn scope_holding_itself_renders() {
    let scope = Value::empty_dict();
    let code = vec![
        (None, Op::PushScope),
        (None, Op::Assign("me".into())),
        (None, Op::PushScope),
        (None, Op::Return),
    ];
    let result = run(assemble(code), &scope).unwrap();
    assert_eq!(result.to_string(), "{me: {...}}");
    scope.set("me", Value::null());
}

#[test]
fn exit_status_runs_only_context_exits() {
    let code = vec![
        (None, Op::EnterContext { label: "outer".into(), var: Default::default() }),
        (None, Op::EnterContext { label: "inner".into(), var: Default::default() }),
        (None, Op::VMStatus("exit".parse().unwrap())),
        (None, Op::PushVal(Value::string("skipped"))),
        (Some("inner"), Op::LeaveContext),
        (Some("outer"), Op::LeaveContext),
        (None, Op::PushVal(Value::int(7))),
        (None, Op::Return),
    ];
    let mut vm = VM::with_options(assemble(code), options());
    let result = vm.execute(&Value::empty_dict()).unwrap();
    assert_eq!(vm.state(), RunState::Exited);
    assert_eq!(result.as_int(), Some(0));
}
