//! Generators: a closure activation run one `yield` at a time.

use parking_lot::Mutex;
use tracing::debug;

use super::closure::Closure;
use crate::value::types::{MethodDescr, TypeDescr, TypeId, VTable};
use crate::value::{ErrorCode, Interface, Kwargs, Value};
use crate::vm::{RunOutcome, VM, report_fatal};

#[derive(Debug)]
pub struct Generator {
    name: String,
    scope: Value,
    state: Mutex<GeneratorState>,
}

#[derive(Debug)]
struct GeneratorState {
    vm: VM,
    /// Set once the body has finished: an `Exhausted` exception carrying the
    /// returned value, or the error the body ended with.
    done: Option<Value>,
}

impl Generator {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.try_lock().is_some_and(|s| s.done.is_some())
    }

    fn busy(&self) -> Value {
        Value::exception(
            ErrorCode::InternalError,
            format!("Generator '{}' is already running", self.name),
        )
    }

    fn resume(&self) -> Value {
        let Some(mut state) = self.state.try_lock() else {
            return self.busy();
        };
        if let Some(done) = &state.done {
            return done.clone();
        }
        match state.vm.resume(&self.scope) {
            Ok(RunOutcome::Yielded(value)) => value,
            Ok(RunOutcome::Finished(result)) => {
                debug!(generator = %self.name, result = %result, "generator finished");
                let done = if result.is_exception() {
                    result
                } else {
                    Value::exception_with(
                        ErrorCode::Exhausted,
                        format!("Generator '{}' exhausted", self.name),
                        result,
                    )
                };
                state.done = Some(done.clone());
                done
            }
            Err(fatal) => {
                let exception = Value::exception(ErrorCode::InternalError, fatal.to_string());
                report_fatal(fatal);
                state.done = Some(exception.clone());
                exception
            }
        }
    }

    /// Stop the generator. False if it had already finished.
    fn stop(&self) -> Result<bool, Value> {
        let mut state = self.state.try_lock().ok_or_else(|| self.busy())?;
        if state.done.is_some() {
            return Ok(false);
        }
        debug!(generator = %self.name, "generator stopped");
        state.done = Some(Value::exception(
            ErrorCode::Exhausted,
            format!("Generator '{}' stopped", self.name),
        ));
        Ok(true)
    }
}

/// Wrap a bound activation in a generator. Nothing runs until the first `next`.
pub(crate) fn start(activation: Value) -> Value {
    let Some(closure) = activation.downcast::<Closure>() else {
        return Value::exception(ErrorCode::InternalError, "generator body is not a closure");
    };
    let generator = Generator {
        name: closure.name().to_string(),
        state: Mutex::new(GeneratorState {
            vm: closure.vm(),
            done: None,
        }),
        scope: activation.clone(),
    };
    Value::object(TypeId::GENERATOR, generator)
}

fn generator_next(v: &Value) -> Value {
    match v.downcast::<Generator>() {
        Some(g) => g.resume(),
        None => Value::exception(ErrorCode::InternalError, "not a generator"),
    }
}

/// Never advances the body: true until the generator has finished.
fn generator_has_next(v: &Value) -> bool {
    v.downcast::<Generator>().is_some_and(|g| !g.is_exhausted())
}

fn generator_to_string(v: &Value) -> String {
    match v.downcast::<Generator>() {
        Some(g) => format!("<generator {}>", g.name),
        None => "<generator>".to_string(),
    }
}

fn method_next(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    generator_next(this)
}

fn method_has_next(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    Value::bool(generator_has_next(this))
}

fn method_stop(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    match this.downcast::<Generator>().map(Generator::stop) {
        Some(Ok(stopped)) => Value::bool(stopped),
        Some(Err(exception)) => exception,
        None => Value::exception(ErrorCode::InternalError, "not a generator"),
    }
}

const GENERATOR_METHODS: &[MethodDescr] = &[
    MethodDescr::new("next", method_next),
    MethodDescr::new("has_next", method_has_next),
    MethodDescr::new("stop", method_stop),
];

pub(crate) fn generator_type() -> TypeDescr {
    TypeDescr::new(TypeId::GENERATOR, "generator")
        .with_vtable(VTable {
            next: Some(generator_next),
            has_next: Some(generator_has_next),
            to_string: Some(generator_to_string),
            ..Default::default()
        })
        .with_methods(GENERATOR_METHODS)
        .implements(&[Interface::Iterable])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::{Script, ScriptKind};
    use crate::vm::{BytecodeBuilder, Instruction, Op, VmOptions};

    fn counter() -> Value {
        let mut b = BytecodeBuilder::new("counter");
        for op in [
            Op::PushVal(Value::int(1)),
            Op::Yield,
            Op::PushVal(Value::int(2)),
            Op::Yield,
            Op::PushVal(Value::string("done")),
            Op::Return,
        ] {
            b.push_instruction(Instruction::new(op));
        }
        let script = Script::new(b.finish().unwrap()).with_kind(ScriptKind::Generator);
        let g = Arc::new(script)
            .closure(VmOptions::default())
            .call(&[], &Kwargs::new());
        assert_eq!(g.type_id(), TypeId::GENERATOR);
        g
    }

    #[test]
    fn test_yields_then_exhausts() {
        let g = counter();
        assert!(g.has_next());
        assert_eq!(g.next().as_int(), Some(1));
        assert!(g.has_next());
        assert_eq!(g.next().as_int(), Some(2));
        assert!(g.has_next());

        let end = g.next();
        let e = end.as_exception().unwrap();
        assert_eq!(e.code, ErrorCode::Exhausted);
        assert_eq!(e.throwable.as_ref().unwrap().to_string(), "done");
        assert!(!g.has_next());
        assert!(g.next().same(&end));
    }

    #[test]
    fn test_has_next_does_not_advance() {
        let g = counter();
        for _ in 0..5 {
            assert!(g.has_next());
        }
        assert_eq!(g.next().as_int(), Some(1));
    }

    #[test]
    fn test_stop() {
        let g = counter();
        assert_eq!(g.next().as_int(), Some(1));
        let stopped = g.execute_method("stop", &[], &Kwargs::new());
        assert_eq!(stopped.as_bool(), Some(true));
        assert!(!g.has_next());
        assert_eq!(g.next().error_code(), Some(ErrorCode::Exhausted));
        let again = g.execute_method("stop", &[], &Kwargs::new());
        assert_eq!(again.as_bool(), Some(false));
    }

    #[test]
    fn test_is_its_own_iterator() {
        let g = counter();
        assert!(g.iter().same(&g));
        let items = crate::value::list::collect(&g);
        assert_eq!(items.to_string(), "[1, 2]");
        assert_eq!(g.to_string(), "<generator counter>");
    }
}
