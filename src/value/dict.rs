//! `dict`: string-keyed, insertion-ordered map. Also the plain scope type.

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::types::{ArgType, Interface, MethodDescr, TypeDescr, TypeId, VTable};
use super::{Kwargs, Value, visit};

#[derive(Debug, Default)]
pub struct Dict {
    pub entries: Mutex<IndexMap<String, Value>>,
}

impl Value {
    pub fn dict(entries: IndexMap<String, Value>) -> Value {
        Value::object(
            TypeId::DICT,
            Dict {
                entries: Mutex::new(entries),
            },
        )
    }

    pub fn empty_dict() -> Value {
        Value::dict(IndexMap::new())
    }
}

fn entries(v: &Value) -> IndexMap<String, Value> {
    v.downcast::<Dict>()
        .map(|d| d.entries.lock().clone())
        .unwrap_or_default()
}

fn dict_new(_: TypeId, args: &[Value]) -> Value {
    let mut out = IndexMap::new();
    for pair in args.chunks(2) {
        let value = pair.get(1).cloned().unwrap_or_else(Value::null);
        out.insert(pair[0].to_str().into_owned(), value);
    }
    Value::dict(out)
}

fn dict_to_string(v: &Value) -> String {
    visit(v, None, || {
        let parts: Vec<String> = entries(v)
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        format!("{{{}}}", parts.join(", "))
    })
    .unwrap_or_else(|| "{...}".to_string())
}

fn dict_resolve(v: &Value, name: &str) -> Option<Value> {
    v.downcast::<Dict>()?.entries.lock().get(name).cloned()
}

fn dict_set(v: &Value, name: &str, value: Value) -> Value {
    if let Some(d) = v.downcast::<Dict>() {
        d.entries.lock().insert(name.to_string(), value.clone());
    }
    value
}

fn keys(v: &Value) -> Value {
    Value::list(entries(v).keys().map(Value::string).collect())
}

fn dict_keys(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    keys(this)
}

fn dict_values(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    Value::list(entries(this).values().cloned().collect())
}

fn dict_has(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    Value::bool(dict_resolve(this, &args[0].to_str()).is_some())
}

fn dict_get(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    dict_resolve(this, &args[0].to_str())
        .or_else(|| args.get(1).cloned())
        .unwrap_or_else(Value::null)
}

const DICT_METHODS: &[MethodDescr] = &[
    MethodDescr::new("keys", dict_keys),
    MethodDescr::new("values", dict_values),
    MethodDescr::new("has", dict_has).args(&[ArgType::Any], 1),
    MethodDescr::new("get", dict_get).args(&[ArgType::Any, ArgType::Any], 1),
];

pub(crate) fn dict_type() -> TypeDescr {
    TypeDescr::new(TypeId::DICT, "dict")
        .with_vtable(VTable {
            new: Some(dict_new),
            copy: Some(|v| Value::dict(entries(v))),
            to_string: Some(dict_to_string),
            len: Some(|v| entries(v).len()),
            resolve: Some(dict_resolve),
            set: Some(dict_set),
            iter: Some(|v| keys(v).iter()),
            cast: Some(|v, t| (t == TypeId::BOOL).then(|| Value::bool(!entries(v).is_empty()))),
            ..Default::default()
        })
        .with_methods(DICT_METHODS)
        .implements(&[Interface::Scope, Interface::Iterable])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_and_set() {
        let d = Value::empty_dict();
        assert!(d.resolve("x").is_none());
        d.set("x", Value::int(3));
        assert_eq!(d.resolve("x").unwrap().as_int(), Some(3));
        assert_eq!(d.len(), Some(1));
        assert_eq!(d.to_string(), "{x: 3}");
    }

    #[test]
    fn test_self_containing_dict_renders() {
        let d = Value::empty_dict();
        d.set("me", d.clone());
        d.set("n", Value::int(1));
        assert_eq!(d.to_string(), "{me: {...}, n: 1}");
        let outer = Value::empty_dict();
        outer.set("a", d.clone());
        outer.set("b", d.clone());
        assert_eq!(outer.to_string(), "{a: {me: {...}, n: 1}, b: {me: {...}, n: 1}}");
        d.set("me", Value::null());
    }

    #[test]
    fn test_methods() {
        let d = Value::create(TypeId::DICT, &[Value::string("a"), Value::int(1)]).unwrap();
        let k = Kwargs::new();
        assert_eq!(d.execute_method("keys", &[], &k).to_string(), "[a]");
        assert_eq!(d.execute_method("has", &[Value::string("a")], &k).as_bool(), Some(true));
        let fallback = d.execute_method("get", &[Value::string("b"), Value::int(5)], &k);
        assert_eq!(fallback.as_int(), Some(5));
    }
}
