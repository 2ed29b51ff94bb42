//! `float` and the numeric methods shared with `int` through promotion.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use super::exception::ErrorCode;
use super::int::division_by_zero;
use super::types::{ArgType, Interface, MethodDescr, TypeDescr, TypeId, VTable};
use super::{Kwargs, Value};

const NUMBER: ArgType = ArgType::Interface(Interface::Number);

fn flt(v: &Value) -> f64 {
    v.as_float().unwrap_or_default()
}

fn float_new(_: TypeId, args: &[Value]) -> Value {
    match args.first() {
        None => Value::float(0.0),
        Some(arg) => arg.cast(TypeId::FLOAT).unwrap_or_else(|| {
            Value::exception(
                ErrorCode::Type,
                format!("Cannot convert {} '{}' to float", arg.type_name(), arg),
            )
        }),
    }
}

fn float_to_string(v: &Value) -> String {
    let x = flt(v);
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        x.to_string()
    }
}

fn float_cast(v: &Value, target: TypeId) -> Option<Value> {
    let x = flt(v);
    match target {
        TypeId::INT if x.is_finite() => Some(Value::int(x.trunc() as i64)),
        TypeId::BOOL => Some(Value::bool(x != 0.0)),
        TypeId::STRING => Some(Value::string(float_to_string(v))),
        _ => None,
    }
}

fn float_hash(v: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    flt(v).to_bits().hash(&mut hasher);
    hasher.finish()
}

fn float_add(this: &Value, name: &str, args: &[Value], _: &Kwargs) -> Value {
    let minus = name == "-";
    if args.is_empty() {
        return Value::float(if minus { -flt(this) } else { flt(this) });
    }
    Value::float(args.iter().fold(flt(this), |acc, a| {
        if minus { acc - flt(a) } else { acc + flt(a) }
    }))
}

fn float_mult(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    Value::float(args.iter().fold(flt(this), |acc, a| acc * flt(a)))
}

fn float_div(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let d = flt(&args[0]);
    if d == 0.0 {
        return division_by_zero(this);
    }
    Value::float(flt(this) / d)
}

fn float_pow(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    Value::float(flt(this).powf(flt(&args[0])))
}

fn float_minmax(this: &Value, name: &str, args: &[Value], _: &Kwargs) -> Value {
    let mut best = this.clone();
    for a in args {
        let ord = a.compare(&best);
        if (name == "min" && ord == Ordering::Less) || (name == "max" && ord == Ordering::Greater) {
            best = a.clone();
        }
    }
    best
}

fn float_unary(this: &Value, name: &str, _: &[Value], _: &Kwargs) -> Value {
    let x = flt(this);
    let r = match name {
        "abs" => x.abs(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "sqrt" => x.sqrt(),
        _ => x,
    };
    Value::float(r)
}

/// Rounding methods return ints.
fn float_round(this: &Value, name: &str, _: &[Value], _: &Kwargs) -> Value {
    let x = flt(this);
    if !x.is_finite() {
        return Value::exception(ErrorCode::Range, format!("Cannot {} '{}'", name, this));
    }
    let r = match name {
        "round" => x.round(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        _ => x.trunc(),
    };
    Value::int(r as i64)
}

const FLOAT_METHODS: &[MethodDescr] = &[
    MethodDescr::new("+", float_add).args(&[NUMBER], 0).varargs(),
    MethodDescr::new("-", float_add).args(&[NUMBER], 0).varargs(),
    MethodDescr::new("sum", float_add).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("*", float_mult).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("mult", float_mult).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("/", float_div).args(&[NUMBER], 1),
    MethodDescr::new("div", float_div).args(&[NUMBER], 1),
    MethodDescr::new("^", float_pow).args(&[NUMBER], 1),
    MethodDescr::new("pow", float_pow).args(&[NUMBER], 1),
    MethodDescr::new("min", float_minmax).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("max", float_minmax).args(&[NUMBER], 1).varargs(),
    MethodDescr::new("abs", float_unary),
    MethodDescr::new("sin", float_unary),
    MethodDescr::new("cos", float_unary),
    MethodDescr::new("tan", float_unary),
    MethodDescr::new("sqrt", float_unary),
    MethodDescr::new("round", float_round),
    MethodDescr::new("trunc", float_round),
    MethodDescr::new("floor", float_round),
    MethodDescr::new("ceil", float_round),
];

pub(crate) fn float_type() -> TypeDescr {
    TypeDescr::new(TypeId::FLOAT, "float")
        .with_vtable(VTable {
            new: Some(float_new),
            to_string: Some(float_to_string),
            parse: Some(|s| s.trim().parse::<f64>().ok().map(Value::float)),
            cmp: Some(|a, b| flt(a).total_cmp(&flt(b))),
            hash: Some(float_hash),
            cast: Some(float_cast),
            ..Default::default()
        })
        .with_methods(FLOAT_METHODS)
        .implements(&[Interface::Number])
        .immutable()
}
