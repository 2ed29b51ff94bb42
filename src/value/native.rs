//! Native functions callable from bytecode, and the default global builtins.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::exception::ErrorCode;
use super::list::collect;
use super::types::{Interface, TypeDescr, TypeId, VTable};
use super::{Kwargs, Value};

pub type NativeFn = Arc<dyn Fn(&[Value], &Kwargs) -> Value + Send + Sync>;

pub struct NativeFunction {
    pub name: String,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish()
    }
}

impl Value {
    pub fn native(
        name: impl Into<String>,
        min_args: usize,
        max_args: Option<usize>,
        func: impl Fn(&[Value], &Kwargs) -> Value + Send + Sync + 'static,
    ) -> Value {
        Value::object(
            TypeId::NATIVE_FUNCTION,
            NativeFunction {
                name: name.into(),
                min_args,
                max_args,
                func: Arc::new(func),
            },
        )
    }
}

fn native_call(v: &Value, args: &[Value], kwargs: &Kwargs) -> Value {
    let Some(f) = v.downcast::<NativeFunction>() else {
        return Value::exception(ErrorCode::InternalError, "not a native function");
    };
    if args.len() < f.min_args || f.max_args.is_some_and(|max| args.len() > max) {
        return Value::exception(
            ErrorCode::ArgCount,
            format!("{}() called with {} arguments", f.name, args.len()),
        );
    }
    (f.func)(args, kwargs)
}

pub(crate) fn native_function_type() -> TypeDescr {
    TypeDescr::new(TypeId::NATIVE_FUNCTION, "nativefunction")
        .with_vtable(VTable {
            call: Some(native_call),
            to_string: Some(|v| match v.downcast::<NativeFunction>() {
                Some(f) => format!("<native {}>", f.name),
                None => "<native>".to_string(),
            }),
            ..Default::default()
        })
        .implements(&[Interface::Callable])
}

fn construct(type_id: TypeId, args: &[Value]) -> Value {
    Value::create(type_id, args).unwrap_or_else(|| {
        Value::exception(ErrorCode::InternalError, format!("type {} has no constructor", type_id.0))
    })
}

/// The builtins visible to every script through the global scope.
pub fn builtins() -> IndexMap<String, Value> {
    let mut globals = IndexMap::new();
    let mut add = |v: Value| {
        if let Some(f) = v.downcast::<NativeFunction>() {
            globals.insert(f.name.clone(), v.clone());
        }
    };
    add(Value::native("len", 1, Some(1), |args, _| match args[0].len() {
        Some(n) => Value::int(n as i64),
        None => Value::exception(
            ErrorCode::Type,
            format!("{} '{}' has no length", args[0].type_name(), args[0]),
        ),
    }));
    add(Value::native("str", 0, None, |args, _| construct(TypeId::STRING, args)));
    add(Value::native("int", 0, Some(1), |args, _| construct(TypeId::INT, args)));
    add(Value::native("float", 0, Some(1), |args, _| construct(TypeId::FLOAT, args)));
    add(Value::native("bool", 0, Some(1), |args, _| construct(TypeId::BOOL, args)));
    add(Value::native("list", 0, None, |args, _| construct(TypeId::LIST, args)));
    add(Value::native("range", 1, Some(3), |args, _| construct(TypeId::RANGE, args)));
    add(Value::native("collect", 1, Some(1), |args, _| collect(&args[0])));
    add(Value::native("exception", 0, None, |args, _| construct(TypeId::EXCEPTION, args)));
    globals
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_native_call_and_arity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let f = Value::native("count", 0, Some(1), move |_, _| {
            Value::int(counter.fetch_add(1, Ordering::SeqCst) as i64 + 1)
        });
        assert!(f.is_callable());
        assert_eq!(f.call(&[], &Kwargs::new()).as_int(), Some(1));
        let err = f.call(&[Value::int(1), Value::int(2)], &Kwargs::new());
        assert_eq!(err.error_code(), Some(ErrorCode::ArgCount));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builtins() {
        let g = builtins();
        let k = Kwargs::new();
        let l = Value::list(vec![Value::int(1), Value::int(2)]);
        assert_eq!(g["len"].call(&[l], &k).as_int(), Some(2));
        assert_eq!(g["int"].call(&[Value::string("12")], &k).as_int(), Some(12));
        assert_eq!(g["str"].call(&[Value::int(3)], &k).to_string(), "3");
        assert_eq!(
            g["list"].call(&[Value::range(0, 3, 1)], &k).to_string(),
            "[0, 1, 2]"
        );
    }
}
