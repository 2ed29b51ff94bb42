use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use kestrel::runtime::{Script, ScriptKind};
use kestrel::vm::{CallSpec, ExitSignal, Instruction, Op, VmOptions};
use kestrel::{BuildError, BytecodeBuilder, Value};
use serde::Serialize;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    vm_secs: f64,
    rust_secs: f64,
    result: String,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop(n: i64) -> i64 {
    let mut sum = 0;
    for i in 1..=n {
        sum += i;
    }
    sum
}

fn rust_fibonacci(n: i64) -> i64 {
    if n < 2 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

type Code<'a> = [(Option<&'a str>, Op)];

fn assemble(name: &str, code: &Code<'_>) -> Result<Script, BuildError> {
    let mut builder = BytecodeBuilder::new(name);
    for (label, op) in code {
        if let Some(label) = label {
            builder.label(*label);
        }
        builder.push_instruction(Instruction::new(op.clone()));
    }
    Ok(Script::new(builder.finish()?))
}

fn var(name: &str) -> Op {
    Op::PushVar(name.into())
}

fn int(i: i64) -> Op {
    Op::PushVal(Value::int(i))
}

fn infix(op: &str) -> Op {
    Op::FunctionCall(CallSpec::infix(op, 2))
}

/// sum = 0; i = 1; while i <= n: sum = sum + i; i = i + 1
fn sum_loop(n: i64) -> Result<Script, BuildError> {
    assemble(
        "sum_loop",
        &[
            (None, int(0)),
            (None, Op::Assign("sum".into())),
            (None, int(1)),
            (None, Op::Assign("i".into())),
            (Some("top"), var("i")),
            (None, int(n)),
            (None, infix("<=")),
            (None, Op::Test("done".into())),
            (None, var("sum")),
            (None, var("i")),
            (None, infix("+")),
            (None, Op::Assign("sum".into())),
            (None, var("i")),
            (None, Op::Incr),
            (None, Op::Assign("i".into())),
            (None, Op::Jump("top".into())),
            (Some("done"), var("sum")),
            (None, Op::Return),
        ],
    )
}

fn fibonacci(n: i64) -> Result<Script, BuildError> {
    let call = |arg: i64| {
        vec![
            (None, var("fib")),
            (None, var("n")),
            (None, int(arg)),
            (None, infix("-")),
            (None, Op::FunctionCall(CallSpec::new("fib", 1))),
        ]
    };
    let mut body = vec![
        (None, var("n")),
        (None, int(2)),
        (None, infix("<")),
        (None, Op::Test("recurse".into())),
        (None, var("n")),
        (None, Op::Return),
        (Some("recurse"), Op::Nop),
    ];
    body.extend(call(1));
    body.extend(call(2));
    body.push((None, infix("+")));
    body.push((None, Op::Return));

    let mut main = assemble(
        "fibonacci",
        &[
            (None, var("fib")),
            (None, int(n)),
            (None, Op::FunctionCall(CallSpec::new("fib", 1))),
            (None, Op::Return),
        ],
    )?;
    main.add_function(assemble("fib", &body)?.with_params(["n"]));
    Ok(main)
}

/// Drain a generator yielding 0..n, summing what it yields.
fn generator_drain(n: i64) -> Result<Script, BuildError> {
    let counter = assemble(
        "counter",
        &[
            (None, int(0)),
            (None, Op::Assign("i".into())),
            (Some("top"), var("i")),
            (None, int(n)),
            (None, infix("<")),
            (None, Op::Test("done".into())),
            (None, var("i")),
            (None, Op::Yield),
            (None, var("i")),
            (None, Op::Incr),
            (None, Op::Assign("i".into())),
            (None, Op::Jump("top".into())),
            (Some("done"), Op::Nop),
        ],
    )?
    .with_kind(ScriptKind::Generator);

    let mut main = assemble(
        "generator_drain",
        &[
            (None, int(0)),
            (None, Op::Assign("sum".into())),
            (None, var("counter")),
            (None, Op::FunctionCall(CallSpec::new("counter", 0))),
            (None, Op::Iter),
            (Some("next"), Op::Next("done".into())),
            (None, var("sum")),
            (None, infix("+")),
            (None, Op::Assign("sum".into())),
            (None, Op::Jump("next".into())),
            (Some("done"), var("sum")),
            (None, Op::Return),
        ],
    )?;
    main.add_function(counter);
    Ok(main)
}

fn time_vm(script: Script) -> (f64, String) {
    let script = Arc::new(script);
    let options = VmOptions {
        exit_signal: ExitSignal::new(),
        ..Default::default()
    };
    let start = Instant::now();
    let result = script.run(options);
    let elapsed = start.elapsed().as_secs_f64();
    let result = match result {
        Ok(value) => value.to_string(),
        Err(e) => format!("fatal: {}", e),
    };
    (elapsed, result)
}

fn time_rust<F: FnOnce() -> i64>(f: F) -> f64 {
    let start = Instant::now();
    let r = f();
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("{}", r);
    elapsed
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut results = Vec::new();

    let (vm_secs, result) = time_vm(sum_loop(100_000)?);
    results.push(BenchmarkResult {
        name: "sum_loop".to_string(),
        vm_secs,
        rust_secs: time_rust(|| rust_sum_loop(100_000)),
        result,
    });

    let (vm_secs, result) = time_vm(fibonacci(18)?);
    results.push(BenchmarkResult {
        name: "fibonacci".to_string(),
        vm_secs,
        rust_secs: time_rust(|| rust_fibonacci(18)),
        result,
    });

    let (vm_secs, result) = time_vm(generator_drain(10_000)?);
    results.push(BenchmarkResult {
        name: "generator_drain".to_string(),
        vm_secs,
        rust_secs: time_rust(|| rust_sum_loop(9_999)),
        result,
    });

    let output = BenchmarkOutput { results };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
