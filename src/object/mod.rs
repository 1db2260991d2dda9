use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::warn;

use crate::host::Session;
use crate::value::Value;

/// Prototype walks give up after this many hops so a cyclic `__proto__`
/// cannot hang the interpreter.
const PROTO_CHAIN_LIMIT: usize = 256;

/// Arrays longer than this render only the elements they actually hold.
const DENSE_TEXT_LIMIT: usize = 1 << 16;

/// Nested arrays deeper than this render as empty text.
const JOIN_DEPTH_LIMIT: usize = 64;

thread_local! {
    /// Arrays whose text is being built; meeting one again renders it empty.
    static JOINING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// The member storage every script-visible object exposes.
///
/// Implementations use interior mutability; the interpreter only ever holds
/// shared handles.
pub trait ScriptObject: Any {
    fn get_own(&self, name: &str) -> Option<Value>;
    fn set_own(&self, name: &str, value: Value);
    fn delete_own(&self, name: &str) -> bool;
    /// Own member names in definition order, minus the non-enumerable ones.
    fn own_keys(&self) -> Vec<String>;
    fn prototype(&self) -> Option<ObjectRef>;
    fn set_prototype(&self, proto: Option<ObjectRef>);

    fn type_name(&self) -> &'static str {
        "object"
    }

    fn number_hook(&self) -> Option<f64> {
        None
    }

    fn text_hook(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub struct ObjectRef(Rc<dyn ScriptObject>);

#[derive(Clone)]
pub struct WeakObjectRef(Weak<dyn ScriptObject>);

impl ObjectRef {
    pub fn new<T: ScriptObject>(object: T) -> Self {
        ObjectRef(Rc::new(object))
    }

    pub fn from_rc(rc: Rc<dyn ScriptObject>) -> Self {
        ObjectRef(rc)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }

    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Rc::downgrade(&self.0))
    }

    pub fn downcast_ref<T: ScriptObject>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Member lookup through the prototype chain.
    pub fn get_member(&self, name: &str) -> Option<Value> {
        let mut current = Some(self.clone());
        let mut hops = 0;
        while let Some(obj) = current {
            if let Some(value) = obj.get_own(name) {
                return Some(value);
            }
            hops += 1;
            if hops > PROTO_CHAIN_LIMIT {
                warn!(member = name, "prototype chain too long, giving up");
                return None;
            }
            current = obj.prototype();
        }
        None
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.get_member(name).is_some()
    }

    pub fn set_member(&self, name: &str, value: Value) {
        self.set_own(name, value);
    }

    /// Like `set_member`, but plain objects keep the member out of
    /// enumeration.
    pub fn set_hidden(&self, name: &str, value: Value) {
        match self.downcast_ref::<PlainObject>() {
            Some(plain) => plain.set_hidden(name, value),
            None => self.set_own(name, value),
        }
    }

    pub fn delete_member(&self, name: &str) -> bool {
        self.delete_own(name)
    }

    pub fn enumerate_members(&self) -> Vec<String> {
        self.own_keys()
    }

    /// True when `constructor.prototype` appears on this object's chain.
    pub fn instance_of(&self, constructor: &Value) -> bool {
        let Some(target) = constructor
            .member_holder()
            .and_then(|holder| holder.get_member("prototype"))
            .and_then(|proto| proto.as_object().cloned())
        else {
            return false;
        };
        let mut current = self.prototype();
        let mut hops = 0;
        while let Some(proto) = current {
            if proto.ptr_eq(&target) {
                return true;
            }
            hops += 1;
            if hops > PROTO_CHAIN_LIMIT {
                return false;
            }
            current = proto.prototype();
        }
        false
    }
}

impl Deref for ObjectRef {
    type Target = dyn ScriptObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.type_name(), self.addr())
    }
}

impl WeakObjectRef {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(obj) => write!(f, "Weak({:?})", obj),
            None => write!(f, "Weak(<dropped>)"),
        }
    }
}

// ── Plain objects and arrays ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Object,
    Array,
}

#[derive(Debug, Clone)]
struct Property {
    value: Value,
    enumerable: bool,
}

/// Insertion-ordered member bag. Backs `{}` literals, arrays, function
/// property bags and constructed instances.
#[derive(Debug)]
pub struct PlainObject {
    class: ObjectClass,
    members: RefCell<IndexMap<String, Property>>,
    proto: RefCell<Option<ObjectRef>>,
}

impl PlainObject {
    pub fn new(proto: Option<ObjectRef>) -> Self {
        PlainObject {
            class: ObjectClass::Object,
            members: RefCell::new(IndexMap::new()),
            proto: RefCell::new(proto),
        }
    }

    pub fn array(proto: Option<ObjectRef>, items: Vec<Value>) -> Self {
        let array = PlainObject { class: ObjectClass::Array, ..PlainObject::new(proto) };
        array.set_hidden("length", Value::Number(items.len() as f64));
        for (i, item) in items.into_iter().enumerate() {
            array.set_own(&i.to_string(), item);
        }
        array
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    /// Define or overwrite a member that enumeration skips.
    pub fn set_hidden(&self, name: &str, value: Value) {
        self.members
            .borrow_mut()
            .insert(name.to_string(), Property { value, enumerable: false });
    }

    fn length(&self) -> usize {
        self.members
            .borrow()
            .get("length")
            .map(|p| p.value.to_number())
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    /// Elements `0..length`, holes as `undefined`. Past the dense limit
    /// only stored indices are listed, in index order.
    pub fn elements(&self) -> Vec<Value> {
        let length = self.length();
        let members = self.members.borrow();
        if length <= DENSE_TEXT_LIMIT {
            return (0..length)
                .map(|i| members.get(&i.to_string()).map(|p| p.value.clone()).unwrap_or_default())
                .collect();
        }
        warn!(length, "sparse array, listing stored elements only");
        let mut stored: Vec<(usize, Value)> = members
            .iter()
            .filter_map(|(key, p)| {
                let index = key.parse::<usize>().ok().filter(|i| *i < length && i.to_string() == *key)?;
                Some((index, p.value.clone()))
            })
            .collect();
        stored.sort_by_key(|(index, _)| *index);
        stored.into_iter().map(|(_, value)| value).collect()
    }

    fn join(&self) -> String {
        let id = self as *const PlainObject as usize;
        let entered = JOINING.with(|joining| {
            let mut joining = joining.borrow_mut();
            if joining.contains(&id) || joining.len() >= JOIN_DEPTH_LIMIT {
                return false;
            }
            joining.push(id);
            true
        });
        if !entered {
            return String::new();
        }
        let text = self.elements().iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
        JOINING.with(|joining| joining.borrow_mut().pop());
        text
    }
}

impl ScriptObject for PlainObject {
    fn get_own(&self, name: &str) -> Option<Value> {
        if name == "__proto__" {
            return self.proto.borrow().clone().map(Value::Object);
        }
        self.members.borrow().get(name).map(|p| p.value.clone())
    }

    fn set_own(&self, name: &str, value: Value) {
        if name == "__proto__" {
            self.set_prototype(value.as_object().cloned());
            return;
        }
        let grown_length = match self.class {
            ObjectClass::Array => name
                .parse::<usize>()
                .ok()
                .filter(|idx| *idx >= self.length())
                .map(|idx| idx + 1),
            ObjectClass::Object => None,
        };
        let mut members = self.members.borrow_mut();
        match members.get_mut(name) {
            Some(existing) => existing.value = value,
            None => {
                members.insert(name.to_string(), Property { value, enumerable: true });
            }
        }
        if let Some(len) = grown_length {
            members.insert(
                "length".to_string(),
                Property { value: Value::Number(len as f64), enumerable: false },
            );
        }
    }

    fn delete_own(&self, name: &str) -> bool {
        self.members.borrow_mut().shift_remove(name).is_some()
    }

    fn own_keys(&self) -> Vec<String> {
        self.members
            .borrow()
            .iter()
            .filter(|(_, p)| p.enumerable)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn prototype(&self) -> Option<ObjectRef> {
        self.proto.borrow().clone()
    }

    fn set_prototype(&self, proto: Option<ObjectRef>) {
        *self.proto.borrow_mut() = proto;
    }

    fn text_hook(&self) -> Option<String> {
        match self.class {
            ObjectClass::Array => Some(self.join()),
            ObjectClass::Object => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Host functions ──────────────────────────────────────────────────

/// Arguments handed to a host function: a typed list, never a format string.
pub struct NativeCall<'a> {
    pub session: &'a Session,
    pub this: Option<ObjectRef>,
    pub args: &'a [Value],
    pub constructing: bool,
}

impl NativeCall<'_> {
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }
}

pub type NativeFn = dyn Fn(&NativeCall<'_>) -> Value;

#[derive(Clone)]
pub struct NativeFunction {
    name: Rc<str>,
    func: Rc<NativeFn>,
    props: ObjectRef,
}

impl NativeFunction {
    pub fn new(name: &str, func: impl Fn(&NativeCall<'_>) -> Value + 'static) -> Self {
        NativeFunction {
            name: Rc::from(name),
            func: Rc::new(func),
            props: ObjectRef::new(PlainObject::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn props(&self) -> &ObjectRef {
        &self.props
    }

    pub fn call(&self, call: &NativeCall<'_>) -> Value {
        (self.func)(call)
    }

    pub fn ptr_eq(&self, other: &NativeFunction) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.func), Rc::as_ptr(&other.func))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}
