//! `list`, its iterator, and `range`.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use super::exception::ErrorCode;
use super::types::{ArgType, Interface, MethodDescr, TypeDescr, TypeId, VTable};
use super::{Kwargs, Value, visit};

/// Payload of a `list` value.
#[derive(Debug, Default)]
pub struct List {
    pub items: Mutex<Vec<Value>>,
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::object(
            TypeId::LIST,
            List {
                items: Mutex::new(items),
            },
        )
    }

    /// Snapshot of a list's elements.
    pub fn as_list(&self) -> Option<Vec<Value>> {
        self.downcast::<List>().map(|l| l.items.lock().clone())
    }
}

fn items(v: &Value) -> Vec<Value> {
    v.as_list().unwrap_or_default()
}

fn with_list<R>(v: &Value, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
    v.downcast::<List>().map(|l| f(&mut l.items.lock()))
}

fn normalize_index(ix: i64, len: usize) -> Option<usize> {
    let pos = if ix < 0 { len as i64 + ix } else { ix };
    (0..len as i64).contains(&pos).then_some(pos as usize)
}

fn index_error(ix: &Value, len: usize) -> Value {
    Value::exception(
        ErrorCode::Range,
        format!("Index {} out of range for list of length {}", ix, len),
    )
}

fn list_new(_: TypeId, args: &[Value]) -> Value {
    if let [single] = args {
        if single.has_interface(Interface::Iterable) {
            return collect(single);
        }
    }
    Value::list(args.to_vec())
}

/// Drain an iterable into a new list.
pub fn collect(iterable: &Value) -> Value {
    let iter = iterable.iter();
    if iter.is_exception() {
        return iter;
    }
    let mut out = Vec::new();
    while iter.has_next() {
        let v = iter.next();
        if v.error_code() == Some(ErrorCode::Exhausted) {
            break;
        }
        if v.is_exception() {
            return v;
        }
        out.push(v);
    }
    Value::list(out)
}

fn list_to_string(v: &Value) -> String {
    visit(v, None, || {
        let parts: Vec<String> = items(v).iter().map(|i| i.to_str().into_owned()).collect();
        format!("[{}]", parts.join(", "))
    })
    .unwrap_or_else(|| "[...]".to_string())
}

/// Element-wise. A pair already being compared further up counts as equal.
fn list_cmp(a: &Value, b: &Value) -> Ordering {
    visit(a, Some(b), || {
        let (a, b) = (items(a), items(b));
        for (x, y) in a.iter().zip(b.iter()) {
            let ord = x.compare(y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.len().cmp(&b.len())
    })
    .unwrap_or(Ordering::Equal)
}

fn list_resolve(v: &Value, name: &str) -> Option<Value> {
    let ix = name.parse::<i64>().ok()?;
    let items = items(v);
    normalize_index(ix, items.len()).map(|pos| items[pos].clone())
}

fn list_set(v: &Value, name: &str, value: Value) -> Value {
    let Ok(ix) = name.parse::<i64>() else {
        return Value::exception(ErrorCode::Type, format!("List index '{}' is not an int", name));
    };
    let result = with_list(v, |items| match normalize_index(ix, items.len()) {
        Some(pos) => {
            items[pos] = value.clone();
            value
        }
        None => index_error(&Value::int(ix), items.len()),
    });
    result.unwrap_or_else(Value::null)
}

fn list_append(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    with_list(this, |items| items.extend_from_slice(args));
    this.clone()
}

fn list_pop(this: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
    with_list(this, |items| items.pop())
        .flatten()
        .unwrap_or_else(|| Value::exception(ErrorCode::Range, "pop from empty list"))
}

fn list_at(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let items = items(this);
    let ix = args[0].as_int().unwrap_or_default();
    match normalize_index(ix, items.len()) {
        Some(pos) => items[pos].clone(),
        None => index_error(&args[0], items.len()),
    }
}

fn list_concat(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let mut out = items(this);
    for a in args {
        out.extend(items(a));
    }
    Value::list(out)
}

fn list_has(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    Value::bool(items(this).iter().any(|i| i == &args[0]))
}

fn list_join(this: &Value, _: &str, args: &[Value], _: &Kwargs) -> Value {
    let sep = args.first().map(|s| s.to_str().into_owned()).unwrap_or_default();
    let parts: Vec<String> = items(this).iter().map(|i| i.to_str().into_owned()).collect();
    Value::string(parts.join(&sep))
}

const LIST_METHODS: &[MethodDescr] = &[
    MethodDescr::new("append", list_append).args(&[ArgType::Any], 1).varargs(),
    MethodDescr::new("push", list_append).args(&[ArgType::Any], 1).varargs(),
    MethodDescr::new("pop", list_pop),
    MethodDescr::new("at", list_at).args(&[ArgType::Type(TypeId::INT)], 1),
    MethodDescr::new("+", list_concat).args(&[ArgType::Type(TypeId::LIST)], 1).varargs(),
    MethodDescr::new("has", list_has).args(&[ArgType::Any], 1),
    MethodDescr::new("join", list_join).args(&[ArgType::Type(TypeId::STRING)], 0),
];

pub(crate) fn list_type() -> TypeDescr {
    TypeDescr::new(TypeId::LIST, "list")
        .with_vtable(VTable {
            new: Some(list_new),
            copy: Some(|v| Value::list(items(v))),
            to_string: Some(list_to_string),
            cmp: Some(list_cmp),
            cast: Some(|v, t| (t == TypeId::BOOL).then(|| Value::bool(!items(v).is_empty()))),
            len: Some(|v| items(v).len()),
            resolve: Some(list_resolve),
            set: Some(list_set),
            iter: Some(|v| {
                Value::object(
                    TypeId::LIST_ITERATOR,
                    ListIterator {
                        list: v.clone(),
                        pos: AtomicUsize::new(0),
                    },
                )
            }),
            ..Default::default()
        })
        .with_methods(LIST_METHODS)
        .implements(&[Interface::Iterable])
}

/// Cursor over a list.
#[derive(Debug)]
pub struct ListIterator {
    list: Value,
    pos: AtomicUsize,
}

fn exhausted() -> Value {
    Value::exception(ErrorCode::Exhausted, "Iterator exhausted")
}

fn list_iter_has_next(v: &Value) -> bool {
    v.downcast::<ListIterator>().is_some_and(|it| {
        it.pos.load(AtomicOrdering::SeqCst) < it.list.len().unwrap_or_default()
    })
}

fn list_iter_next(v: &Value) -> Value {
    let Some(it) = v.downcast::<ListIterator>() else {
        return exhausted();
    };
    let pos = it.pos.fetch_add(1, AtomicOrdering::SeqCst);
    it.list
        .resolve(&pos.to_string())
        .unwrap_or_else(exhausted)
}

pub(crate) fn list_iterator_type() -> TypeDescr {
    TypeDescr::new(TypeId::LIST_ITERATOR, "listiterator").with_vtable(VTable {
        has_next: Some(list_iter_has_next),
        next: Some(list_iter_next),
        ..Default::default()
    })
}

/// Half-open integer range with a step.
#[derive(Debug)]
pub struct Range {
    next: AtomicI64,
    end: i64,
    step: i64,
}

impl Value {
    pub fn range(start: i64, end: i64, step: i64) -> Value {
        Value::object(
            TypeId::RANGE,
            Range {
                next: AtomicI64::new(start),
                end,
                step,
            },
        )
    }
}

fn range_new(_: TypeId, args: &[Value]) -> Value {
    let ints: Option<Vec<i64>> = args.iter().map(|a| a.cast(TypeId::INT)?.as_int()).collect();
    let (start, end, step) = match ints.as_deref() {
        Some([end]) => (0, *end, 1),
        Some([start, end]) => (*start, *end, 1),
        Some([start, end, step]) => (*start, *end, *step),
        Some(_) => {
            return Value::exception(
                ErrorCode::ArgCount,
                format!("range() takes 1 to 3 arguments, {} provided", args.len()),
            );
        }
        None => return Value::exception(ErrorCode::Type, "range() arguments must be ints"),
    };
    if step == 0 {
        return Value::exception(ErrorCode::Range, "range() step cannot be zero");
    }
    Value::range(start, end, step)
}

fn range_has_next(v: &Value) -> bool {
    v.downcast::<Range>().is_some_and(|r| {
        let next = r.next.load(AtomicOrdering::SeqCst);
        if r.step > 0 { next < r.end } else { next > r.end }
    })
}

fn range_next(v: &Value) -> Value {
    if !range_has_next(v) {
        return exhausted();
    }
    match v.downcast::<Range>() {
        Some(r) => Value::int(r.next.fetch_add(r.step, AtomicOrdering::SeqCst)),
        None => exhausted(),
    }
}

fn range_to_string(v: &Value) -> String {
    match v.downcast::<Range>() {
        Some(r) => format!("{}..{}", r.next.load(AtomicOrdering::SeqCst), r.end),
        None => "range".to_string(),
    }
}

pub(crate) fn range_type() -> TypeDescr {
    TypeDescr::new(TypeId::RANGE, "range").with_vtable(VTable {
        new: Some(range_new),
        to_string: Some(range_to_string),
        iter: Some(|v| match v.downcast::<Range>() {
            Some(r) => Value::range(r.next.load(AtomicOrdering::SeqCst), r.end, r.step),
            None => exhausted(),
        }),
        has_next: Some(range_has_next),
        next: Some(range_next),
        ..Default::default()
    })
}
