//! Process-wide type registry.
//!
//! Every [`Value`] carries a [`TypeId`]; all behaviour beyond raw payload
//! access is looked up here. A type is described by a [`TypeDescr`]: a
//! table of optional capabilities ([`VTable`]), a method table, up to
//! [`MAX_INHERITS`] ancestors and a set of [`Interface`] tags.
//!
//! The registry is created once, on first access, by [`init`]. Built-in
//! types are registered there and nowhere else. Embedders may register
//! further types with [`register`]; registration is keyed by name, so
//! registering the same name twice returns the first id.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use super::exception::ErrorCode;
use super::{Kwargs, Value};

/// Maximum number of direct ancestors a type may declare.
pub const MAX_INHERITS: usize = 3;

/// Identifies a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const NULL: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const INT: TypeId = TypeId(2);
    pub const FLOAT: TypeId = TypeId(3);
    pub const STRING: TypeId = TypeId(4);
    pub const LIST: TypeId = TypeId(5);
    pub const LIST_ITERATOR: TypeId = TypeId(6);
    pub const DICT: TypeId = TypeId(7);
    pub const EXCEPTION: TypeId = TypeId(8);
    pub const NATIVE_FUNCTION: TypeId = TypeId(9);
    pub const CLOSURE: TypeId = TypeId(10);
    pub const GENERATOR: TypeId = TypeId(11);
    pub const THREAD: TypeId = TypeId(12);
    pub const RANGE: TypeId = TypeId(13);

    /// Placeholder id for descriptors that want an id assigned on registration.
    pub const DYNAMIC: TypeId = TypeId(u32::MAX);

    const FIRST_DYNAMIC: u32 = 100;
}

/// Capability tags a type can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Number,
    Iterable,
    Iterator,
    Scope,
    Callable,
    CtxHandler,
    Incrementable,
}

pub type NewFn = fn(TypeId, &[Value]) -> Value;
pub type CopyFn = fn(&Value) -> Value;
pub type CmpFn = fn(&Value, &Value) -> Ordering;
pub type ToStringFn = fn(&Value) -> String;
pub type ParseFn = fn(&str) -> Option<Value>;
pub type CastFn = fn(&Value, TypeId) -> Option<Value>;
pub type HashFn = fn(&Value) -> u64;
pub type CallFn = fn(&Value, &[Value], &Kwargs) -> Value;
pub type ResolveFn = fn(&Value, &str) -> Option<Value>;
pub type SetFn = fn(&Value, &str, Value) -> Value;
pub type LenFn = fn(&Value) -> usize;
pub type UnaryFn = fn(&Value) -> Value;
pub type HasNextFn = fn(&Value) -> bool;
pub type LeaveFn = fn(&Value, &Value) -> Value;

macro_rules! vtable {
    ($($(#[$doc:meta])* $field:ident : $ty:ty),* $(,)?) => {
        /// Optional per-type capabilities.
        #[derive(Clone, Copy, Default)]
        pub struct VTable {
            $($(#[$doc])* pub $field: Option<$ty>,)*
        }

        impl VTable {
            /// Fill every missing capability from `parent`.
            pub fn inherit(mut self, parent: &VTable) -> VTable {
                $(if self.$field.is_none() {
                    self.$field = parent.$field;
                })*
                self
            }

            /// Names of the capabilities present in this table.
            pub fn capabilities(&self) -> Vec<&'static str> {
                let mut caps = Vec::new();
                $(if self.$field.is_some() {
                    caps.push(stringify!($field));
                })*
                caps
            }
        }
    };
}

vtable! {
    /// Constructor used by [`Value::create`].
    new: NewFn,
    /// Copy constructor. Absent means copies share the cell.
    copy: CopyFn,
    cmp: CmpFn,
    to_string: ToStringFn,
    parse: ParseFn,
    cast: CastFn,
    hash: HashFn,
    call: CallFn,
    resolve: ResolveFn,
    set: SetFn,
    len: LenFn,
    iter: UnaryFn,
    has_next: HasNextFn,
    next: UnaryFn,
    incr: UnaryFn,
    decr: UnaryFn,
    /// Context-manager entry.
    enter: UnaryFn,
    /// Context-manager exit; receives the pending exception or `false`.
    leave: LeaveFn,
}

impl fmt::Debug for VTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.capabilities()).finish()
    }
}

/// Expected type of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Any,
    Type(TypeId),
    Interface(Interface),
}

impl ArgType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgType::Any => true,
            ArgType::Type(t) => value.has_type(*t),
            ArgType::Interface(i) => value.has_interface(*i),
        }
    }
}

pub type MethodFn = fn(&Value, &str, &[Value], &Kwargs) -> Value;

/// A native method bound to a type.
#[derive(Clone)]
pub struct MethodDescr {
    pub name: &'static str,
    pub method: MethodFn,
    /// Argument types; with `varargs` the last entry applies to the rest.
    pub arg_types: &'static [ArgType],
    pub min_args: usize,
    pub varargs: bool,
}

impl MethodDescr {
    pub const fn new(name: &'static str, method: MethodFn) -> Self {
        Self {
            name,
            method,
            arg_types: &[],
            min_args: 0,
            varargs: false,
        }
    }

    pub const fn args(mut self, arg_types: &'static [ArgType], min_args: usize) -> Self {
        self.arg_types = arg_types;
        self.min_args = min_args;
        self
    }

    pub const fn varargs(mut self) -> Self {
        self.varargs = true;
        self
    }

    /// Check arguments and run the method.
    pub fn invoke(&self, receiver: &Value, name: &str, args: &[Value], kwargs: &Kwargs) -> Value {
        let max_args = if self.varargs {
            usize::MAX
        } else {
            self.arg_types.len()
        };
        if args.len() < self.min_args || args.len() > max_args {
            return Value::exception(
                ErrorCode::ArgCount,
                format!(
                    "{}.{}() takes {} arguments, {} provided",
                    receiver.type_name(),
                    name,
                    self.arity_text(),
                    args.len()
                ),
            );
        }
        for (ix, arg) in args.iter().enumerate() {
            let expected = self
                .arg_types
                .get(ix)
                .or_else(|| if self.varargs { self.arg_types.last() } else { None });
            if expected.is_some_and(|e| !e.accepts(arg)) {
                return Value::exception(
                    ErrorCode::Type,
                    format!(
                        "Type mismatch: {}.{}() cannot accept {} '{}' as argument {}",
                        receiver.type_name(),
                        name,
                        arg.type_name(),
                        arg,
                        ix + 1
                    ),
                );
            }
        }
        (self.method)(receiver, name, args, kwargs)
    }

    fn arity_text(&self) -> String {
        if self.varargs {
            format!("at least {}", self.min_args)
        } else if self.min_args == self.arg_types.len() {
            self.min_args.to_string()
        } else {
            format!("{}..{}", self.min_args, self.arg_types.len())
        }
    }
}

impl fmt::Debug for MethodDescr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescr")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("varargs", &self.varargs)
            .finish()
    }
}

/// Describes one registered type.
#[derive(Debug, Clone)]
pub struct TypeDescr {
    pub id: TypeId,
    pub name: String,
    /// Capabilities declared by this type itself.
    pub vtable: VTable,
    /// Own capabilities completed from the ancestors, filled on registration.
    pub inherited: VTable,
    pub methods: IndexMap<&'static str, MethodDescr>,
    pub inherits: Vec<TypeId>,
    pub interfaces: Vec<Interface>,
    /// Type used for implicit promotion in comparisons and method fallback.
    pub promote_to: Option<TypeId>,
    /// Values of immutable types cache their string form.
    pub immutable: bool,
}

impl TypeDescr {
    pub fn new(id: TypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            vtable: VTable::default(),
            inherited: VTable::default(),
            methods: IndexMap::new(),
            inherits: Vec::new(),
            interfaces: Vec::new(),
            promote_to: None,
            immutable: false,
        }
    }

    pub fn with_vtable(mut self, vtable: VTable) -> Self {
        self.vtable = vtable;
        self
    }

    pub fn with_methods(mut self, methods: &[MethodDescr]) -> Self {
        for m in methods {
            self.methods.insert(m.name, m.clone());
        }
        self
    }

    pub fn inherits(mut self, parent: TypeId) -> Self {
        if self.inherits.len() < MAX_INHERITS && !self.inherits.contains(&parent) {
            self.inherits.push(parent);
        }
        self
    }

    pub fn implements(mut self, interfaces: &[Interface]) -> Self {
        self.interfaces.extend_from_slice(interfaces);
        self
    }

    pub fn promote_to(mut self, target: TypeId) -> Self {
        self.promote_to = Some(target);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }
}

#[derive(Default)]
struct Types {
    by_id: IndexMap<TypeId, Arc<TypeDescr>>,
    by_name: IndexMap<String, TypeId>,
    next_dynamic: u32,
}

/// The table of all registered types.
pub struct TypeRegistry {
    types: RwLock<Types>,
}

static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

/// Get the registry, registering the built-in types on first use.
pub fn init() -> &'static TypeRegistry {
    REGISTRY.get_or_init(|| {
        let registry = TypeRegistry {
            types: RwLock::new(Types {
                next_dynamic: TypeId::FIRST_DYNAMIC,
                ..Default::default()
            }),
        };
        for descr in builtin_types() {
            registry.insert(descr);
        }
        debug!(types = registry.len(), "type registry initialised");
        registry
    })
}

/// Register a type; returns its id. Registering an existing name is a no-op.
pub fn register(descr: TypeDescr) -> TypeId {
    init().insert(descr)
}

fn builtin_types() -> Vec<TypeDescr> {
    vec![
        super::null_type(),
        super::int::int_type(),
        super::int::bool_type(),
        super::float::float_type(),
        super::string::string_type(),
        super::list::list_type(),
        super::list::list_iterator_type(),
        super::list::range_type(),
        super::dict::dict_type(),
        super::exception::exception_type(),
        super::native::native_function_type(),
        crate::runtime::closure::closure_type(),
        crate::runtime::generator::generator_type(),
        crate::runtime::closure::thread_type(),
    ]
}

impl TypeRegistry {
    fn insert(&self, mut descr: TypeDescr) -> TypeId {
        let mut types = self.types.write();
        if let Some(id) = types.by_name.get(&descr.name) {
            return *id;
        }
        if descr.id == TypeId::DYNAMIC {
            descr.id = TypeId(types.next_dynamic);
            types.next_dynamic += 1;
        }
        let mut inherited = descr.vtable;
        for parent in descr.inherits.iter().take(MAX_INHERITS) {
            if let Some(p) = types.by_id.get(parent) {
                inherited = inherited.inherit(&p.inherited);
            }
        }
        descr.inherited = inherited;
        let id = descr.id;
        debug!(id = id.0, name = %descr.name, caps = ?descr.inherited, "registered type");
        types.by_name.insert(descr.name.clone(), id);
        types.by_id.insert(id, Arc::new(descr));
        id
    }

    pub fn len(&self) -> usize {
        self.types.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: TypeId) -> Option<Arc<TypeDescr>> {
        self.types.read().by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<TypeDescr>> {
        let types = self.types.read();
        types
            .by_name
            .get(name)
            .and_then(|id| types.by_id.get(id))
            .cloned()
    }

    /// The resolved capability table for a type. Unknown ids get an empty table.
    pub fn vtable(&self, id: TypeId) -> VTable {
        self.types
            .read()
            .by_id
            .get(&id)
            .map(|d| d.inherited)
            .unwrap_or_default()
    }

    /// Find a method on the type or, depth first, on its ancestors.
    pub fn lookup_method(&self, id: TypeId, name: &str) -> Option<MethodDescr> {
        let descr = self.get(id)?;
        if let Some(m) = descr.methods.get(name) {
            return Some(m.clone());
        }
        descr
            .inherits
            .iter()
            .take(MAX_INHERITS)
            .find_map(|parent| self.lookup_method(*parent, name))
    }

    /// True if `id` is `ancestor` or inherits from it.
    pub fn is_a(&self, id: TypeId, ancestor: TypeId) -> bool {
        if id == ancestor {
            return true;
        }
        self.get(id).is_some_and(|d| {
            d.inherits
                .iter()
                .take(MAX_INHERITS)
                .any(|p| self.is_a(*p, ancestor))
        })
    }

    pub fn implements(&self, id: TypeId, interface: Interface) -> bool {
        let Some(descr) = self.get(id) else {
            return false;
        };
        let vt = descr.inherited;
        let implied = match interface {
            Interface::Callable => vt.call.is_some(),
            Interface::Iterable => vt.iter.is_some(),
            Interface::Iterator => vt.next.is_some(),
            Interface::Scope => vt.resolve.is_some() && vt.set.is_some(),
            Interface::CtxHandler => vt.enter.is_some() || vt.leave.is_some(),
            Interface::Incrementable => vt.incr.is_some() && vt.decr.is_some(),
            Interface::Number => false,
        };
        implied
            || descr.interfaces.contains(&interface)
            || descr
                .inherits
                .iter()
                .take(MAX_INHERITS)
                .any(|p| self.implements(*p, interface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(_: &Value, _: &str, _: &[Value], _: &Kwargs) -> Value {
        Value::int(42)
    }

    #[test]
    fn test_builtins_registered() {
        let reg = init();
        assert_eq!(reg.get(TypeId::INT).unwrap().name, "int");
        assert_eq!(reg.get_by_name("float").unwrap().id, TypeId::FLOAT);
        assert!(reg.is_a(TypeId::BOOL, TypeId::INT));
        assert!(!reg.is_a(TypeId::INT, TypeId::BOOL));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let first = register(TypeDescr::new(TypeId::DYNAMIC, "test_idempotent"));
        let second = register(TypeDescr::new(TypeId::DYNAMIC, "test_idempotent"));
        assert_eq!(first, second);
        assert!(first.0 >= 100);
    }

    #[test]
    fn test_inherited_capabilities_and_methods() {
        let parent = register(
            TypeDescr::new(TypeId::DYNAMIC, "test_parent")
                .with_vtable(VTable {
                    len: Some(|_| 7),
                    ..Default::default()
                })
                .with_methods(&[MethodDescr::new("answer", answer)]),
        );
        let child = register(TypeDescr::new(TypeId::DYNAMIC, "test_child").inherits(parent));
        let reg = init();
        assert!(reg.vtable(child).len.is_some());
        assert!(reg.lookup_method(child, "answer").is_some());
        assert!(reg.lookup_method(child, "question").is_none());
    }

    #[test]
    fn test_interfaces() {
        let reg = init();
        assert!(reg.implements(TypeId::INT, Interface::Number));
        assert!(reg.implements(TypeId::BOOL, Interface::Number));
        assert!(reg.implements(TypeId::LIST, Interface::Iterable));
        assert!(reg.implements(TypeId::DICT, Interface::Scope));
        assert!(reg.implements(TypeId::NATIVE_FUNCTION, Interface::Callable));
        assert!(!reg.implements(TypeId::STRING, Interface::Number));
    }
}
