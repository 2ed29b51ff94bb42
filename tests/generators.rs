use std::sync::Arc;

use kestrel::asm::Program;
use kestrel::vm::{ExitSignal, VmOptions};
use kestrel::{ErrorCode, Kwargs, Script, Value};

fn options() -> VmOptions {
    VmOptions {
        exit_signal: ExitSignal::new(),
        ..Default::default()
    }
}

fn load(text: &str) -> Arc<Script> {
    Arc::new(Program::from_toml(text).unwrap().assemble().unwrap())
}

const COUNTDOWN: &str = r#"
[main]
code = [
  { op = "PushVal", value = [] },
  { op = "Assign", name = "seen" },
  { op = "PushVar", name = "countdown" },
  { op = "PushVal", value = 3 },
  { op = "FunctionCall", name = "countdown", argc = 1 },
  { op = "Iter" },
  { op = "Next", target = "done", label = "loop" },
  { op = "Stash", index = 0 },
  { op = "PushVar", name = "seen" },
  { op = "Unstash", index = 0 },
  { op = "FunctionCall", name = "append", argc = 2, infix = true },
  { op = "Pop" },
  { op = "Jump", target = "loop" },
  { op = "PushVar", name = "seen", label = "done" },
  { op = "Return" },
]

[[functions]]
name = "countdown"
params = ["n"]
kind = "generator"
code = [
  { op = "PushVar", name = "n", label = "top" },
  { op = "PushVal", value = 0 },
  { op = "FunctionCall", name = ">", argc = 2, infix = true },
  { op = "Test", target = "out" },
  { op = "PushVar", name = "n" },
  { op = "Yield" },
  { op = "PushVar", name = "n" },
  { op = "Decr" },
  { op = "Assign", name = "n" },
  { op = "Jump", target = "top" },
  { op = "PushVal", value = "liftoff", label = "out" },
  { op = "Return" },
]
"#;

#[test]
fn for_loop_over_a_generator() {
    let script = load(COUNTDOWN);
    let result = script.run(options()).unwrap();
    assert_eq!(result.to_string(), "[3, 2, 1]");
}

#[test]
fn yields_then_reports_the_return_value_once() {
    let script = load(COUNTDOWN);
    let countdown = script.closure(options()).resolve("countdown").unwrap();
    let generator = countdown.call(&[Value::int(2)], &Kwargs::new());

    assert_eq!(generator.next().as_int(), Some(2));
    assert_eq!(generator.next().as_int(), Some(1));
    let end = generator.next();
    let e = end.as_exception().unwrap();
    assert_eq!(e.code, ErrorCode::Exhausted);
    assert_eq!(e.throwable.as_ref().unwrap().to_string(), "liftoff");

    for _ in 0..3 {
        assert!(generator.next().same(&end));
    }
}

#[test]
fn each_call_starts_an_independent_generator() {
    let script = load(COUNTDOWN);
    let countdown = script.closure(options()).resolve("countdown").unwrap();
    let a = countdown.call(&[Value::int(5)], &Kwargs::new());
    let b = countdown.call(&[Value::int(5)], &Kwargs::new());
    assert_eq!(a.next().as_int(), Some(5));
    assert_eq!(a.next().as_int(), Some(4));
    assert_eq!(b.next().as_int(), Some(5));
}

#[test]
fn stopping_a_generator_exhausts_it() {
    let script = load(COUNTDOWN);
    let countdown = script.closure(options()).resolve("countdown").unwrap();
    let generator = countdown.call(&[Value::int(10)], &Kwargs::new());
    assert_eq!(generator.next().as_int(), Some(10));
    generator.execute_method("stop", &[], &Kwargs::new());
    assert!(!generator.has_next());
    assert_eq!(generator.next().error_code(), Some(ErrorCode::Exhausted));
}
