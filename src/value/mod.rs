//! Dynamic values.
//!
//! A [`Value`] is a cheap, reference-counted handle to a typed cell. Cloning
//! a handle shares the cell; [`Value::copy`] goes through the type's copy
//! constructor when it has one. The cell is released when the last handle is
//! dropped. Interned constants (`null`, `true`, `false` and small integers)
//! live in a static table and are never released.
//!
//! Behaviour is dispatched through the type registry in [`types`].

pub mod dict;
pub mod exception;
pub mod float;
pub mod int;
pub mod list;
pub mod name;
pub mod native;
pub mod string;
pub mod types;

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;

pub use exception::{ErrorCode, Exception};
pub use name::Name;
pub use types::{Interface, TypeId};

use types::{TypeDescr, VTable};

/// Keyword arguments, in call order.
pub type Kwargs = IndexMap<String, Value>;

/// Range of integers kept in the constant table.
const SMALL_INT_MIN: i64 = -16;
const SMALL_INT_MAX: i64 = 256;

/// Longest promotion chain followed by comparisons and method fallback.
const MAX_PROMOTIONS: usize = 3;

/// Raw contents of a cell.
pub enum Payload {
    Null,
    /// Shared by `int` and `bool`.
    Int(i64),
    Float(f64),
    Str(String),
    Object(Box<dyn Any + Send + Sync>),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Null => write!(f, "Null"),
            Payload::Int(i) => write!(f, "Int({})", i),
            Payload::Float(x) => write!(f, "Float({})", x),
            Payload::Str(s) => write!(f, "Str({:?})", s),
            Payload::Object(_) => write!(f, "Object(..)"),
        }
    }
}

struct Cell {
    type_id: TypeId,
    constant: bool,
    repr: OnceLock<String>,
    payload: Payload,
}

/// Handle to a dynamic value.
#[derive(Clone)]
pub struct Value(Arc<Cell>);

/// Non-owning handle; does not keep the cell alive.
#[derive(Clone)]
pub struct WeakValue(Weak<Cell>);

impl WeakValue {
    pub fn upgrade(&self) -> Option<Value> {
        self.0.upgrade().map(Value)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

struct Constants {
    null: Value,
    true_: Value,
    false_: Value,
    ints: Vec<Value>,
}

static CONSTANTS: OnceLock<Constants> = OnceLock::new();

fn constants() -> &'static Constants {
    CONSTANTS.get_or_init(|| Constants {
        null: Value::constant(TypeId::NULL, Payload::Null),
        true_: Value::constant(TypeId::BOOL, Payload::Int(1)),
        false_: Value::constant(TypeId::BOOL, Payload::Int(0)),
        ints: (SMALL_INT_MIN..SMALL_INT_MAX)
            .map(|i| Value::constant(TypeId::INT, Payload::Int(i)))
            .collect(),
    })
}

impl Value {
    /// Wrap a payload in a fresh cell.
    pub fn from_payload(type_id: TypeId, payload: Payload) -> Value {
        Value(Arc::new(Cell {
            type_id,
            constant: false,
            repr: OnceLock::new(),
            payload,
        }))
    }

    fn constant(type_id: TypeId, payload: Payload) -> Value {
        Value(Arc::new(Cell {
            type_id,
            constant: true,
            repr: OnceLock::new(),
            payload,
        }))
    }

    /// Wrap a native object.
    pub fn object<T: Any + Send + Sync>(type_id: TypeId, object: T) -> Value {
        Value::from_payload(type_id, Payload::Object(Box::new(object)))
    }

    pub fn null() -> Value {
        constants().null.clone()
    }

    pub fn bool(b: bool) -> Value {
        if b {
            constants().true_.clone()
        } else {
            constants().false_.clone()
        }
    }

    pub fn int(i: i64) -> Value {
        if (SMALL_INT_MIN..SMALL_INT_MAX).contains(&i) {
            constants().ints[(i - SMALL_INT_MIN) as usize].clone()
        } else {
            Value::from_payload(TypeId::INT, Payload::Int(i))
        }
    }

    pub fn float(x: f64) -> Value {
        Value::from_payload(TypeId::FLOAT, Payload::Float(x))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::from_payload(TypeId::STRING, Payload::Str(s.into()))
    }

    /// Construct a value of `type_id` through its constructor.
    ///
    /// Returns `None` when the type has no constructor. Constructor failures
    /// come back as exception values.
    pub fn create(type_id: TypeId, args: &[Value]) -> Option<Value> {
        let new = types::init().vtable(type_id).new?;
        Some(new(type_id, args))
    }

    /// Parse `text` as a value of `type_id`.
    pub fn parse(type_id: TypeId, text: &str) -> Option<Value> {
        let parse = types::init().vtable(type_id).parse?;
        parse(text)
    }

    /// Copy through the type's copy constructor, or share the cell.
    pub fn copy(&self) -> Value {
        match self.vtable().copy {
            Some(copy) => copy(self),
            None => self.clone(),
        }
    }

    pub fn downgrade(&self) -> WeakValue {
        WeakValue(Arc::downgrade(&self.0))
    }

    /// Number of live handles to this cell.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn is_constant(&self) -> bool {
        self.0.constant
    }

    /// True if both handles point to the same cell.
    pub fn same(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn type_id(&self) -> TypeId {
        self.0.type_id
    }

    pub fn descr(&self) -> Option<Arc<TypeDescr>> {
        types::init().get(self.type_id())
    }

    pub fn type_name(&self) -> String {
        self.descr()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("<type {}>", self.type_id().0))
    }

    fn vtable(&self) -> VTable {
        types::init().vtable(self.type_id())
    }

    /// True if the value's type is `type_id` or inherits from it.
    pub fn has_type(&self, type_id: TypeId) -> bool {
        types::init().is_a(self.type_id(), type_id)
    }

    pub fn has_interface(&self, interface: Interface) -> bool {
        types::init().implements(self.type_id(), interface)
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    pub fn is_null(&self) -> bool {
        self.type_id() == TypeId::NULL
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0.payload {
            Payload::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match (self.type_id(), &self.0.payload) {
            (TypeId::BOOL, Payload::Int(i)) => Some(*i != 0),
            _ => None,
        }
    }

    /// Numeric value as a float, for ints, bools and floats.
    pub fn as_float(&self) -> Option<f64> {
        match self.0.payload {
            Payload::Int(i) => Some(i as f64),
            Payload::Float(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        match &self.0.payload {
            Payload::Object(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// String form. Immutable types compute it once per cell.
    pub fn to_str(&self) -> Cow<'_, str> {
        let Some(descr) = self.descr() else {
            return Cow::Owned(format!("<{} at {:p}>", self.type_id().0, Arc::as_ptr(&self.0)));
        };
        let render = || match descr.inherited.to_string {
            Some(f) => f(self),
            None => format!("<{} at {:p}>", descr.name, Arc::as_ptr(&self.0)),
        };
        if descr.immutable {
            Cow::Borrowed(self.0.repr.get_or_init(render).as_str())
        } else {
            Cow::Owned(render())
        }
    }

    /// Three-way comparison.
    ///
    /// Values of unrelated types never compare equal. Values of related
    /// numeric types are promoted before comparing.
    pub fn compare(&self, other: &Value) -> Ordering {
        if self.same(other) {
            return Ordering::Equal;
        }
        if self.type_id() == other.type_id() {
            return match self.vtable().cmp {
                Some(cmp) => cmp(self, other),
                None => Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0)),
            };
        }
        if let Some(promoted) = self.promote(other.type_id()) {
            return promoted.compare(other);
        }
        if let Some(promoted) = other.promote(self.type_id()) {
            return self.compare(&promoted);
        }
        self.type_id().cmp(&other.type_id())
    }

    /// Follow the promotion chain until `target` is reached.
    fn promote(&self, target: TypeId) -> Option<Value> {
        let reg = types::init();
        let mut current = self.clone();
        for _ in 0..MAX_PROMOTIONS {
            let next = reg.get(current.type_id())?.promote_to?;
            current = current.cast(next)?;
            if next == target {
                return Some(current);
            }
        }
        None
    }

    pub fn hash_value(&self) -> u64 {
        match self.vtable().hash {
            Some(hash) => hash(self),
            None => {
                let mut hasher = DefaultHasher::new();
                (Arc::as_ptr(&self.0) as usize).hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    /// Convert to `target`. Same type returns the value itself.
    pub fn cast(&self, target: TypeId) -> Option<Value> {
        if self.type_id() == target {
            return Some(self.clone());
        }
        self.vtable().cast.and_then(|cast| cast(self, target))
    }

    /// Truth value via a cast to bool. Values without a bool cast are true.
    pub fn is_truthy(&self) -> bool {
        self.cast(TypeId::BOOL)
            .and_then(|b| b.as_bool())
            .unwrap_or(true)
    }

    pub fn len(&self) -> Option<usize> {
        self.vtable().len.map(|len| len(self))
    }

    pub fn is_callable(&self) -> bool {
        self.vtable().call.is_some()
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> Value {
        match self.vtable().call {
            Some(call) => call(self, args, kwargs),
            None => Value::exception(
                ErrorCode::NotCallable,
                format!("{} '{}' is not callable", self.type_name(), self),
            ),
        }
    }

    /// Invoke a named method, falling back along the promotion chain.
    pub fn execute_method(&self, name: &str, args: &[Value], kwargs: &Kwargs) -> Value {
        let reg = types::init();
        let mut receiver = self.clone();
        for _ in 0..=MAX_PROMOTIONS {
            if let Some(method) = reg.lookup_method(receiver.type_id(), name) {
                return method.invoke(&receiver, name, args, kwargs);
            }
            let promoted = reg
                .get(receiver.type_id())
                .and_then(|d| d.promote_to)
                .and_then(|t| receiver.cast(t));
            match promoted {
                Some(p) => receiver = p,
                None => break,
            }
        }
        if let Some(result) = self.comparison(name, args) {
            return result;
        }
        Value::exception(
            ErrorCode::Name,
            format!("{} '{}' has no method '{}'", self.type_name(), self, name),
        )
    }

    /// Comparison operators, available on every type.
    fn comparison(&self, name: &str, args: &[Value]) -> Option<Value> {
        let test: fn(Ordering) -> bool = match name {
            "==" => Ordering::is_eq,
            "!=" => Ordering::is_ne,
            "<" => Ordering::is_lt,
            "<=" => Ordering::is_le,
            ">" => Ordering::is_gt,
            ">=" => Ordering::is_ge,
            _ => return None,
        };
        let [other] = args else {
            return Some(Value::exception(
                ErrorCode::ArgCount,
                format!("'{}' takes exactly one argument, {} provided", name, args.len()),
            ));
        };
        Some(Value::bool(test(self.compare(other))))
    }

    pub fn has_method(&self, name: &str) -> bool {
        types::init().lookup_method(self.type_id(), name).is_some()
    }

    /// Look up an attribute. `None` means the name is not there.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.vtable().resolve.and_then(|resolve| resolve(self, name))
    }

    /// Assign an attribute. Returns the stored value or an exception.
    pub fn set(&self, name: &str, value: Value) -> Value {
        match self.vtable().set {
            Some(set) => set(self, name, value),
            None => Value::exception(
                ErrorCode::Type,
                format!("Cannot set '{}' on {} '{}'", name, self.type_name(), self),
            ),
        }
    }

    /// Get an iterator. Iterators are their own iterator.
    pub fn iter(&self) -> Value {
        let vt = self.vtable();
        match (vt.iter, vt.next) {
            (Some(iter), _) => iter(self),
            (None, Some(_)) => self.clone(),
            (None, None) => Value::exception(
                ErrorCode::NotIterable,
                format!("{} '{}' is not iterable", self.type_name(), self),
            ),
        }
    }

    /// Next element, or an `Exhausted` exception at the end.
    pub fn next(&self) -> Value {
        match self.vtable().next {
            Some(next) => next(self),
            None => Value::exception(
                ErrorCode::NotIterator,
                format!("{} '{}' is not an iterator", self.type_name(), self),
            ),
        }
    }

    pub fn has_next(&self) -> bool {
        self.vtable().has_next.is_some_and(|has_next| has_next(self))
    }

    pub fn incr(&self) -> Value {
        match self.vtable().incr {
            Some(incr) => incr(self),
            None => self.execute_method("+", &[Value::int(1)], &Kwargs::new()),
        }
    }

    pub fn decr(&self) -> Value {
        match self.vtable().decr {
            Some(decr) => decr(self),
            None => self.execute_method("-", &[Value::int(1)], &Kwargs::new()),
        }
    }

    /// Context-manager entry. Values without the capability enter as themselves.
    pub fn enter(&self) -> Value {
        match self.vtable().enter {
            Some(enter) => enter(self),
            None => self.clone(),
        }
    }

    /// Context-manager exit. `None` when the value has no exit capability.
    pub fn leave(&self, param: &Value) -> Option<Value> {
        self.vtable().leave.map(|leave| leave(self, param))
    }
}

thread_local! {
    /// Container cells being rendered or compared on this thread.
    static VISITING: RefCell<HashSet<(usize, usize)>> = RefCell::new(HashSet::new());
}

struct Visit((usize, usize));

impl Drop for Visit {
    fn drop(&mut self) {
        VISITING.with(|v| v.borrow_mut().remove(&self.0));
    }
}

/// Run `f` for the cell pair `(a, b)` unless that pair is already being
/// visited further up this thread's stack, in which case `None`.
/// Containers use it to stop at values that contain themselves.
pub(crate) fn visit<R>(a: &Value, b: Option<&Value>, f: impl FnOnce() -> R) -> Option<R> {
    let key = (
        Arc::as_ptr(&a.0) as usize,
        b.map_or(0, |b| Arc::as_ptr(&b.0) as usize),
    );
    if !VISITING.with(|v| v.borrow_mut().insert(key)) {
        return None;
    }
    let _visit = Visit(key);
    Some(f())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name(), self.to_str())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

fn null_to_string(_: &Value) -> String {
    "null".to_string()
}

fn null_cmp(_: &Value, _: &Value) -> Ordering {
    Ordering::Equal
}

fn null_cast(_: &Value, target: TypeId) -> Option<Value> {
    match target {
        TypeId::BOOL => Some(Value::bool(false)),
        TypeId::STRING => Some(Value::string("null")),
        _ => None,
    }
}

pub(crate) fn null_type() -> TypeDescr {
    TypeDescr::new(TypeId::NULL, "null")
        .with_vtable(VTable {
            to_string: Some(null_to_string),
            cmp: Some(null_cmp),
            cast: Some(null_cast),
            hash: Some(|_| 0),
            ..Default::default()
        })
        .immutable()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_interned() {
        assert!(Value::null().same(&Value::null()));
        assert!(Value::bool(true).same(&Value::bool(true)));
        assert!(Value::int(7).same(&Value::int(7)));
        assert!(Value::int(7).is_constant());
        assert!(!Value::int(1_000_000).is_constant());
    }

    #[test]
    fn test_ref_count_and_release() {
        let v = Value::int(1_000_000);
        let weak = v.downgrade();
        let copy = v.copy();
        assert_eq!(v.ref_count(), 2);
        drop(copy);
        assert_eq!(v.ref_count(), 1);
        drop(v);
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_string_copy_is_deep() {
        let s = Value::string("abc");
        let c = s.copy();
        assert!(!s.same(&c));
        assert_eq!(s, c);
        assert_eq!(s.ref_count(), 1);
    }

    #[test]
    fn test_compare() {
        assert_eq!(Value::int(3).compare(&Value::int(3)), Ordering::Equal);
        assert_eq!(Value::int(2).compare(&Value::int(3)), Ordering::Less);
        assert_eq!(Value::int(3), Value::float(3.0));
        assert_eq!(Value::bool(true), Value::int(1));
        assert_ne!(Value::string("3"), Value::int(3));
        assert_ne!(Value::null(), Value::int(0));
    }

    #[test]
    fn test_cast() {
        assert_eq!(Value::int(5).cast(TypeId::FLOAT).unwrap().as_float(), Some(5.0));
        assert_eq!(Value::int(0).cast(TypeId::BOOL).unwrap().as_bool(), Some(false));
        assert_eq!(Value::string("42").cast(TypeId::INT).unwrap().as_int(), Some(42));
        assert!(Value::string("x").cast(TypeId::INT).is_none());
        assert!(!Value::null().is_truthy());
    }

    #[test]
    fn test_to_string() {
        assert_eq!(Value::int(12).to_string(), "12");
        assert_eq!(Value::bool(true).to_string(), "true");
        assert_eq!(Value::null().to_string(), "null");
        assert_eq!(Value::string("hi").to_string(), "hi");
    }

    #[test]
    fn test_call_not_callable() {
        let r = Value::int(3).call(&[], &Kwargs::new());
        assert_eq!(r.as_exception().unwrap().code, ErrorCode::NotCallable);
    }

    #[test]
    fn test_method_fallback_to_float() {
        let r = Value::int(3).execute_method("sqrt", &[], &Kwargs::new());
        assert!((r.as_float().unwrap() - 3f64.sqrt()).abs() < 1e-12);
        let missing = Value::int(3).execute_method("frobnicate", &[], &Kwargs::new());
        assert_eq!(missing.as_exception().unwrap().code, ErrorCode::Name);
    }

    #[test]
    fn test_create_and_parse() {
        let v = Value::create(TypeId::INT, &[Value::string("17")]).unwrap();
        assert_eq!(v.as_int(), Some(17));
        assert_eq!(Value::parse(TypeId::FLOAT, "2.5").unwrap().as_float(), Some(2.5));
        assert!(Value::create(TypeId::EXCEPTION, &[]).is_some());
        assert!(Value::create(TypeId::NULL, &[]).is_none());
    }
}
