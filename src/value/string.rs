//! `string`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use super::exception::ErrorCode;
use super::types::{ArgType, MethodDescr, TypeDescr, TypeId, VTable};
use super::{Kwargs, Value};

const STRING: ArgType = ArgType::Type(TypeId::STRING);
const INT: ArgType = ArgType::Type(TypeId::INT);

fn text(v: &Value) -> &str {
    v.as_str().unwrap_or_default()
}

fn string_new(_: TypeId, args: &[Value]) -> Value {
    Value::string(args.iter().map(|a| a.to_str().into_owned()).collect::<String>())
}

fn string_cmp(a: &Value, b: &Value) -> Ordering {
    text(a).cmp(text(b))
}

fn string_hash(v: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text(v).hash(&mut hasher);
    hasher.finish()
}

fn string_cast(v: &Value, target: TypeId) -> Option<Value> {
    match target {
        TypeId::BOOL => Some(Value::bool(!text(v).is_empty())),
        TypeId::INT | TypeId::FLOAT => Value::parse(target, text(v)),
        _ => None,
    }
}

fn string_concat(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let mut out = text(this).to_string();
    for a in args {
        out.push_str(text(a));
    }
    Value::string(out)
}

fn string_repeat(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    match usize::try_from(args[0].as_int().unwrap_or_default()) {
        Ok(n) => Value::string(text(this).repeat(n)),
        Err(_) => Value::exception(
            ErrorCode::Range,
            format!("Cannot repeat string a negative number of times ({})", args[0]),
        ),
    }
}

fn string_case(this: &Value, name: &str, _: &[Value], _: &Kwargs) -> Value {
    if name == "upper" {
        Value::string(text(this).to_uppercase())
    } else {
        Value::string(text(this).to_lowercase())
    }
}

fn string_test(this: &Value, name: &str, args: &[Value], _: &Kwargs) -> Value {
    let s = text(this);
    let needle = text(&args[0]);
    Value::bool(match name {
        "startswith" => s.starts_with(needle),
        "endswith" => s.ends_with(needle),
        _ => s.contains(needle),
    })
}

fn string_split(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    Value::list(
        text(this)
            .split(text(&args[0]))
            .map(Value::string)
            .collect(),
    )
}

fn string_at(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let ix = args[0].as_int().unwrap_or_default();
    let chars: Vec<char> = text(this).chars().collect();
    let len = chars.len() as i64;
    let pos = if ix < 0 { len + ix } else { ix };
    if pos < 0 || pos >= len {
        return Value::exception(
            ErrorCode::Range,
            format!("Index {} out of range for string of length {}", ix, len),
        );
    }
    Value::string(chars[pos as usize].to_string())
}

const STRING_METHODS: &[MethodDescr] = &[
    MethodDescr::new("+", string_concat).args(&[STRING], 1).varargs(),
    MethodDescr::new("concat", string_concat).args(&[STRING], 1).varargs(),
    MethodDescr::new("*", string_repeat).args(&[INT], 1),
    MethodDescr::new("repeat", string_repeat).args(&[INT], 1),
    MethodDescr::new("upper", string_case),
    MethodDescr::new("lower", string_case),
    MethodDescr::new("has", string_test).args(&[STRING], 1),
    MethodDescr::new("startswith", string_test).args(&[STRING], 1),
    MethodDescr::new("endswith", string_test).args(&[STRING], 1),
    MethodDescr::new("split", string_split).args(&[STRING], 1),
    MethodDescr::new("at", string_at).args(&[INT], 1),
];

pub(crate) fn string_type() -> TypeDescr {
    TypeDescr::new(TypeId::STRING, "string")
        .with_vtable(VTable {
            new: Some(string_new),
            copy: Some(|v| Value::string(text(v))),
            to_string: Some(|v| text(v).to_string()),
            parse: Some(|s| Some(Value::string(s))),
            cmp: Some(string_cmp),
            hash: Some(string_hash),
            cast: Some(string_cast),
            len: Some(|v| text(v).chars().count()),
            ..Default::default()
        })
        .with_methods(STRING_METHODS)
        .immutable()
}
