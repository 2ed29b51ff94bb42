//! `int` and `bool`.
//!
//! Both share the [`Payload::Int`] representation; `bool` inherits from
//! `int` and its two values are interned constants. Arithmetic on ints
//! switches to floats as soon as any operand is a float. Methods `int`
//! does not have are looked up on `float` after promotion.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use super::exception::ErrorCode;
use super::types::{ArgType, Interface, MethodDescr, TypeDescr, TypeId, VTable};
use super::{Kwargs, Payload, Value};

const NUMBER: ArgType = ArgType::Interface(Interface::Number);

fn int_of(v: &Value) -> i64 {
    v.as_int().unwrap_or_default()
}

fn int_new(_: TypeId, args: &[Value]) -> Value {
    match args.first() {
        None => Value::int(0),
        Some(arg) => arg.cast(TypeId::INT).unwrap_or_else(|| {
            Value::exception(
                ErrorCode::Type,
                format!("Cannot convert {} '{}' to int", arg.type_name(), arg),
            )
        }),
    }
}

fn int_parse(text: &str) -> Option<Value> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<i64>().ok()
    };
    parsed.map(Value::int)
}

fn int_cmp(a: &Value, b: &Value) -> Ordering {
    int_of(a).cmp(&int_of(b))
}

fn int_hash(v: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    int_of(v).hash(&mut hasher);
    hasher.finish()
}

fn int_cast(v: &Value, target: TypeId) -> Option<Value> {
    let i = int_of(v);
    match target {
        TypeId::INT => Some(Value::int(i)),
        TypeId::FLOAT => Some(Value::float(i as f64)),
        TypeId::BOOL => Some(Value::bool(i != 0)),
        TypeId::STRING => Some(Value::string(v.to_str().into_owned())),
        _ => None,
    }
}

fn any_float(args: &[Value]) -> bool {
    args.iter().any(|a| a.has_type(TypeId::FLOAT))
}

fn overflow(op: &str, a: i64) -> Value {
    Value::exception(
        ErrorCode::Range,
        format!("Integer overflow in {} '{}'", a, op),
    )
}

/// `+`, `-` and `sum`. With no arguments `-` negates and `+` is the identity.
fn int_add(this: &Value, name: &str, args: &[Value], _: &Kwargs) -> Value {
    let minus = name == "-";
    let start = int_of(this);
    if args.is_empty() {
        return if minus {
            start.checked_neg().map(Value::int).unwrap_or_else(|| overflow(name, start))
        } else {
            Value::int(start)
        };
    }
    if any_float(args) {
        let total = args.iter().fold(start as f64, |acc, a| {
            let x = a.as_float().unwrap_or_default();
            if minus { acc - x } else { acc + x }
        });
        return Value::float(total);
    }
    let mut total = start;
    for a in args {
        let next = if minus {
            total.checked_sub(int_of(a))
        } else {
            total.checked_add(int_of(a))
        };
        match next {
            Some(n) => total = n,
            None => return overflow(name, total),
        }
    }
    Value::int(total)
}

fn int_mult(this: &Value, name: &str, args: &[Value], _: &Kwargs) -> Value {
    if any_float(args) {
        let start = this.as_float().unwrap_or_default();
        return Value::float(args.iter().fold(start, |acc, a| acc * a.as_float().unwrap_or_default()));
    }
    let mut total = int_of(this);
    for a in args {
        match total.checked_mul(int_of(a)) {
            Some(n) => total = n,
            None => return overflow(name, total),
        }
    }
    Value::int(total)
}

pub(crate) fn division_by_zero(this: &Value) -> Value {
    Value::exception(ErrorCode::ZeroDivision, format!("Division by zero: {} / 0", this))
}

fn int_div(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let denom = &args[0];
    if denom.has_type(TypeId::INT) {
        let d = int_of(denom);
        if d == 0 {
            return division_by_zero(this);
        }
        return int_of(this)
            .checked_div(d)
            .map(Value::int)
            .unwrap_or_else(|| overflow("/", int_of(this)));
    }
    let d = denom.as_float().unwrap_or_default();
    if d == 0.0 {
        return division_by_zero(this);
    }
    Value::float(int_of(this) as f64 / d)
}

fn int_mod(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let d = int_of(&args[0]);
    if d == 0 {
        return division_by_zero(this);
    }
    Value::int(int_of(this).wrapping_rem(d))
}

fn int_abs(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    let i = int_of(this);
    i.checked_abs().map(Value::int).unwrap_or_else(|| overflow("abs", i))
}

fn int_incr(v: &Value) -> Value {
    let i = int_of(v);
    i.checked_add(1).map(Value::int).unwrap_or_else(|| overflow("++", i))
}

fn int_decr(v: &Value) -> Value {
    let i = int_of(v);
    i.checked_sub(1).map(Value::int).unwrap_or_else(|| overflow("--", i))
}

const INT_METHODS: &[MethodDescr] = &[
    MethodDescr::new("+", int_add).args(&[NUMBER], 0).varargs(),
    MethodDescr::new("-", int_add).args(&[NUMBER], 0).varargs(),
    MethodDescr::new("sum", int_add).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("*", int_mult).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("mult", int_mult).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("/", int_div).args(&[NUMBER], 1),
    MethodDescr::new("div", int_div).args(&[NUMBER], 1),
    MethodDescr::new("%", int_mod).args(&[ArgType::Type(TypeId::INT)], 1),
    MethodDescr::new("mod", int_mod).args(&[ArgType::Type(TypeId::INT)], 1),
    MethodDescr::new("abs", int_abs),
];

pub(crate) fn int_type() -> TypeDescr {
    TypeDescr::new(TypeId::INT, "int")
        .with_vtable(VTable {
            new: Some(int_new),
            to_string: Some(|v| int_of(v).to_string()),
            parse: Some(int_parse),
            cmp: Some(int_cmp),
            hash: Some(int_hash),
            cast: Some(int_cast),
            incr: Some(int_incr),
            decr: Some(int_decr),
            ..Default::default()
        })
        .with_methods(INT_METHODS)
        .implements(&[Interface::Number])
        .promote_to(TypeId::FLOAT)
        .immutable()
}

fn bool_new(_: TypeId, args: &[Value]) -> Value {
    Value::bool(args.first().is_some_and(Value::is_truthy))
}

fn bool_parse(text: &str) -> Option<Value> {
    if let Some(i) = int_parse(text) {
        return Some(Value::bool(int_of(&i) != 0));
    }
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(Value::bool(true)),
        "false" | "no" | "off" => Some(Value::bool(false)),
        _ => None,
    }
}

fn bool_cast(v: &Value, target: TypeId) -> Option<Value> {
    match target {
        TypeId::INT => Some(Value::int(int_of(v))),
        TypeId::FLOAT => Some(Value::float(int_of(v) as f64)),
        TypeId::STRING => Some(Value::string(v.to_str().into_owned())),
        _ => None,
    }
}

pub(crate) fn bool_type() -> TypeDescr {
    TypeDescr::new(TypeId::BOOL, "bool")
        .with_vtable(VTable {
            new: Some(bool_new),
            to_string: Some(|v| (int_of(v) != 0).to_string()),
            parse: Some(bool_parse),
            cast: Some(bool_cast),
            ..Default::default()
        })
        .inherits(TypeId::INT)
        .promote_to(TypeId::INT)
        .immutable()
}

impl Value {
    /// True for values whose payload is an integer (`int` and `bool`).
    pub fn is_int(&self) -> bool {
        matches!(self.payload(), Payload::Int(_))
    }
}
