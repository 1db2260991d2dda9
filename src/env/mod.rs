use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::host::Session;
use crate::object::ObjectRef;
use crate::value::Value;

pub const GLOBAL_REGISTER_COUNT: usize = 4;

/// Deeper `with` blocks still consume their operand but scope nothing.
pub const WITH_STACK_LIMIT: usize = 8;

// ── With stack ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WithEntry {
    pub object: ObjectRef,
    /// Offset at which the block ends; the entry is gone once `pc >= end`.
    pub end: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WithStack {
    entries: Vec<WithEntry>,
}

impl WithStack {
    pub fn new() -> Self {
        WithStack::default()
    }

    /// Returns false, leaving the stack untouched, once the limit is reached.
    pub fn push(&mut self, object: ObjectRef, end: usize) -> bool {
        if self.entries.len() >= WITH_STACK_LIMIT {
            return false;
        }
        self.entries.push(WithEntry { object, end });
        true
    }

    pub fn expire(&mut self, pc: usize) {
        self.entries.retain(|entry| pc < entry.end);
    }

    /// Innermost block first.
    pub fn iter(&self) -> impl Iterator<Item = &WithEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Scope frames ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScopeFrame {
    pub name: String,
    pub value: Value,
}

/// Named locals of one activation. Closures defined inside a function
/// body hold the same handle, so they keep seeing its bindings after the
/// call returns.
#[derive(Debug, Default)]
pub struct LocalScope {
    frames: RefCell<Vec<ScopeFrame>>,
}

impl LocalScope {
    pub fn new() -> Rc<LocalScope> {
        Rc::new(LocalScope::default())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.frames.borrow().iter().rev().find(|frame| frame.name == name).map(|frame| frame.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frames.borrow().iter().any(|frame| frame.name == name)
    }

    /// New binding, shadowing any earlier one of the same name.
    pub fn add(&self, name: &str, value: Value) {
        self.frames.borrow_mut().push(ScopeFrame { name: name.to_string(), value });
    }

    /// Overwrite the innermost binding of `name`. False when there is none.
    pub fn overwrite(&self, name: &str, value: Value) -> bool {
        match self.frames.borrow_mut().iter_mut().rev().find(|frame| frame.name == name) {
            Some(frame) => {
                frame.value = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut frames = self.frames.borrow_mut();
        match frames.iter().rposition(|frame| frame.name == name) {
            Some(index) => {
                frames.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Binding context of one activation.
pub struct Environment {
    session: Rc<Session>,
    target: ObjectRef,
    original_target: ObjectRef,
    locals: Rc<LocalScope>,
    /// Local scopes of the functions this one was defined in, innermost first.
    enclosing: Vec<Rc<LocalScope>>,
    local_registers: Option<Vec<Value>>,
    in_function: bool,
}

impl Environment {
    /// Context for timeline code: declarations land on the target.
    pub fn new(session: Rc<Session>, target: ObjectRef) -> Self {
        Environment {
            session,
            original_target: target.clone(),
            target,
            locals: LocalScope::new(),
            enclosing: Vec::new(),
            local_registers: None,
            in_function: false,
        }
    }

    /// Context for a function body: declarations are locals. `enclosing`
    /// is the scope chain the function captured when it was defined.
    pub fn for_call(session: Rc<Session>, target: ObjectRef, enclosing: Vec<Rc<LocalScope>>) -> Self {
        Environment { in_function: true, enclosing, ..Environment::new(session, target) }
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }

    pub fn version(&self) -> u8 {
        self.session.version()
    }

    pub fn is_function(&self) -> bool {
        self.in_function
    }

    pub fn target(&self) -> &ObjectRef {
        &self.target
    }

    pub fn set_target(&mut self, target: ObjectRef) {
        self.target = target;
    }

    /// Back to the node the activation started on.
    pub fn reset_target(&mut self) {
        self.target = self.original_target.clone();
    }

    // ── Locals ──────────────────────────────────────────────────────

    /// Scopes a function defined here closes over: this activation's
    /// locals, then everything it closed over itself. Timeline code has
    /// no locals to offer.
    pub fn scope_chain(&self) -> Vec<Rc<LocalScope>> {
        if !self.in_function {
            return Vec::new();
        }
        let mut chain = Vec::with_capacity(self.enclosing.len() + 1);
        chain.push(self.locals.clone());
        chain.extend(self.enclosing.iter().cloned());
        chain
    }

    /// Detach this activation's bindings. Closures that captured them
    /// keep their own handle.
    pub fn release_locals(&mut self) {
        self.locals = LocalScope::new();
        self.enclosing.clear();
    }

    /// Own locals first, then the captured scopes.
    fn scopes(&self) -> impl Iterator<Item = &Rc<LocalScope>> {
        std::iter::once(&self.locals).chain(self.enclosing.iter())
    }

    /// Binding of `name` in this activation only.
    pub fn local(&self, name: &str) -> Option<Value> {
        self.locals.get(name)
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.locals.contains(name)
    }

    /// New binding, shadowing any earlier one of the same name.
    pub fn add_local(&mut self, name: &str, value: Value) {
        self.locals.add(name, value);
    }

    /// Overwrite the current activation's binding, or add one.
    pub fn set_local(&mut self, name: &str, value: Value) {
        if !self.locals.overwrite(name, value.clone()) {
            self.locals.add(name, value);
        }
    }

    pub fn declare_local(&mut self, name: &str) {
        if !self.has_local(name) {
            self.add_local(name, Value::Undefined);
        }
    }

    pub fn delete_local(&mut self, name: &str) -> bool {
        self.locals.remove(name)
    }

    // ── Registers ───────────────────────────────────────────────────

    /// Give this activation its own register file. Local registers are
    /// numbered from 1.
    pub fn enable_local_registers(&mut self, count: usize) {
        self.local_registers = Some(vec![Value::Undefined; count]);
    }

    pub fn has_local_registers(&self) -> bool {
        self.local_registers.is_some()
    }

    fn register_slot(&self, index: u8) -> Option<RegisterSlot> {
        match &self.local_registers {
            Some(regs) => (index as usize)
                .checked_sub(1)
                .filter(|i| *i < regs.len())
                .map(RegisterSlot::Local),
            None => ((index as usize) < GLOBAL_REGISTER_COUNT)
                .then_some(RegisterSlot::Global(index as usize)),
        }
    }

    /// Invalid indices are reported and read global register 0.
    pub fn register(&self, index: u8) -> Value {
        match (self.register_slot(index), &self.local_registers) {
            (Some(RegisterSlot::Local(i)), Some(regs)) => regs[i].clone(),
            (Some(RegisterSlot::Global(i)), _) => self.session.global_register(i),
            _ => {
                error!(register = index, "register index out of range, using global register 0");
                self.session.global_register(0)
            }
        }
    }

    /// Invalid indices are reported and write global register 0.
    pub fn set_register(&mut self, index: u8, value: Value) {
        match (self.register_slot(index), &mut self.local_registers) {
            (Some(RegisterSlot::Local(i)), Some(regs)) => regs[i] = value,
            (Some(RegisterSlot::Global(i)), _) => self.session.set_global_register(i, value),
            _ => {
                error!(register = index, "register index out of range, using global register 0");
                self.session.set_global_register(0, value);
            }
        }
    }

    // ── Name resolution ─────────────────────────────────────────────

    pub fn resolve(&self, name: &str, with: &WithStack) -> Value {
        if let Some((path, leaf)) = split_path(name) {
            return match self.find_target(path) {
                Some(node) => node.get_member(leaf).unwrap_or_default(),
                None => Value::Undefined,
            };
        }
        // A bare slash path names a clip; anything else it reaches falls
        // through to plain lookup.
        if name.contains('/') {
            if let Some(node) = self.find_target(name).filter(|node| self.session.display().is_node(node)) {
                return Value::Object(node);
            }
        }
        for entry in with.iter() {
            if let Some(value) = entry.object.get_member(name) {
                return value;
            }
        }
        if let Some(value) = self.scopes().find_map(|scope| scope.get(name)) {
            return value;
        }
        if name == "this" {
            return Value::Object(self.target.clone());
        }
        if let Some(value) = self.target.get_member(name) {
            return value;
        }
        match name {
            "_root" | "_level0" => return Value::Object(self.session.root()),
            "_global" => return Value::Object(self.session.global().clone()),
            _ => {}
        }
        if let Some(value) = self.session.global().get_member(name) {
            return value;
        }
        debug!(name, "undefined variable");
        Value::Undefined
    }

    /// Write through the innermost scope that already has `name`; otherwise
    /// define it on the current target.
    pub fn assign(&mut self, name: &str, value: Value, with: &WithStack) {
        if let Some((path, leaf)) = split_path(name) {
            if let Some(node) = self.find_target(path) {
                node.set_member(leaf, value);
            }
            return;
        }
        for entry in with.iter() {
            if entry.object.has_member(name) {
                entry.object.set_member(name, value);
                return;
            }
        }
        if let Some(scope) = self.scopes().find(|scope| scope.contains(name)) {
            scope.overwrite(name, value);
            return;
        }
        self.target.set_member(name, value);
    }

    pub fn delete_variable(&mut self, name: &str, with: &WithStack) -> bool {
        if let Some((path, leaf)) = split_path(name) {
            return self.find_target(path).is_some_and(|node| node.delete_member(leaf));
        }
        for entry in with.iter() {
            if entry.object.get_own(name).is_some() {
                return entry.object.delete_member(name);
            }
        }
        if let Some(scope) = self.scopes().find(|scope| scope.contains(name)) {
            return scope.remove(name);
        }
        if self.target.get_own(name).is_some() {
            return self.target.delete_member(name);
        }
        self.session.global().delete_member(name)
    }

    /// Resolve a slash or dot node path relative to the current target.
    pub fn find_target(&self, path: &str) -> Option<ObjectRef> {
        if path.is_empty() {
            return Some(self.target.clone());
        }
        let display = self.session.display();
        let (mut node, rest) = match path.strip_prefix('/') {
            Some(rest) => (display.root(), rest),
            None => (self.target.clone(), path),
        };
        for segment in path_segments(rest) {
            let next = match segment {
                "." | "this" => Some(node.clone()),
                ".." | "_parent" => display.parent(&node),
                "_root" | "_level0" => Some(display.root()),
                "_global" => Some(self.session.global().clone()),
                name => display.resolve_child(&node, name).or_else(|| {
                    node.get_member(name).and_then(|value| value.as_object().cloned())
                }),
            };
            match next {
                Some(found) => node = found,
                None => {
                    warn!(path, segment, "target path does not resolve");
                    return None;
                }
            }
        }
        Some(node)
    }

    /// A node given either as a path string or as the node itself.
    pub fn target_of(&self, value: &Value) -> Option<ObjectRef> {
        match value {
            Value::Object(obj) if self.session.display().is_node(obj) => Some(obj.clone()),
            other => self.find_target(&other.to_string_versioned(self.version())),
        }
    }
}

enum RegisterSlot {
    Local(usize),
    Global(usize),
}

/// Split `path:var` or `path.var` into the node path and the variable.
///
/// A colon wins over dots; without one the last dot splits. One trailing
/// slash on the path is dropped.
pub fn split_path(name: &str) -> Option<(&str, &str)> {
    let at = name.find(':').or_else(|| name.rfind('.'))?;
    let var = &name[at + 1..];
    let mut path = &name[..at];
    if path.len() > 1 && path.ends_with('/') {
        path = &path[..path.len() - 1];
    }
    Some((path, var))
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .flat_map(|part| {
            if part == ".." {
                vec![part]
            } else {
                part.split('.').collect()
            }
        })
        .filter(|segment| !segment.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::stage::Stage;
    use crate::host::{DisplayTree, LogHost, VmConfig};
    use crate::object::PlainObject;

    fn setup() -> (Rc<Stage>, Rc<Session>) {
        let stage = Rc::new(Stage::new(1));
        let session = Session::new(VmConfig::default(), stage.clone(), Rc::new(LogHost));
        (stage, session)
    }

    fn object_with(name: &str, value: Value) -> ObjectRef {
        let obj = ObjectRef::new(PlainObject::new(None));
        obj.set_member(name, value);
        obj
    }

    #[test]
    fn split_path_rules() {
        assert_eq!(split_path("/a/b:x"), Some(("/a/b", "x")));
        assert_eq!(split_path("/a/:x"), Some(("/a", "x")));
        assert_eq!(split_path("/:x"), Some(("/", "x")));
        assert_eq!(split_path("_root.menu.x"), Some(("_root.menu", "x")));
        assert_eq!(split_path("a.b:c.d"), Some(("a.b", "c.d")));
        assert_eq!(split_path("plain"), None);
    }

    #[test]
    fn segments_keep_parent_token() {
        assert_eq!(path_segments("../a.b/c"), vec!["..", "a", "b", "c"]);
        assert_eq!(path_segments("./x"), vec!["x"]);
    }

    #[test]
    fn resolution_order() {
        let (stage, session) = setup();
        let root = stage.root();
        session.global().set_member("g", Value::from("global"));
        root.set_member("g", Value::from("target"));
        let mut env = Environment::for_call(session.clone(), root.clone(), Vec::new());
        let mut with = WithStack::new();

        assert_eq!(env.resolve("g", &with), Value::from("target"));
        env.add_local("g", Value::from("local"));
        assert_eq!(env.resolve("g", &with), Value::from("local"));
        with.push(object_with("g", Value::from("with")), 100);
        assert_eq!(env.resolve("g", &with), Value::from("with"));

        assert_eq!(env.resolve("missing", &with), Value::Undefined);
        match env.resolve("this", &WithStack::new()) {
            Value::Object(obj) => assert!(obj.ptr_eq(&root)),
            other => panic!("expected target, got {:?}", other),
        }
        assert_eq!(env.resolve("Object", &with).type_of(), "function");
    }

    #[test]
    fn enclosing_scopes_are_shared() {
        let (stage, session) = setup();
        let root = stage.root();
        root.set_member("n", Value::from("target"));
        let mut outer = Environment::for_call(session.clone(), root.clone(), Vec::new());
        outer.add_local("n", Value::Number(1.0));
        let with = WithStack::new();

        let mut inner = Environment::for_call(session.clone(), root.clone(), outer.scope_chain());
        assert_eq!(inner.local("n"), None);
        assert_eq!(inner.resolve("n", &with), Value::Number(1.0));
        inner.assign("n", Value::Number(2.0), &with);
        assert_eq!(outer.local("n"), Some(Value::Number(2.0)));
        assert_eq!(root.get_member("n"), Some(Value::from("target")));

        inner.add_local("n", Value::Number(3.0));
        assert_eq!(inner.resolve("n", &with), Value::Number(3.0));
        assert_eq!(outer.resolve("n", &with), Value::Number(2.0));

        outer.release_locals();
        assert_eq!(outer.resolve("n", &with), Value::from("target"));
        assert!(inner.delete_variable("n", &with));
        assert_eq!(inner.resolve("n", &with), Value::Number(2.0));
    }

    #[test]
    fn timeline_code_captures_no_scope() {
        let (stage, session) = setup();
        let mut env = Environment::new(session, stage.root());
        env.add_local("x", Value::Null);
        assert!(env.scope_chain().is_empty());
    }

    #[test]
    fn assign_writes_through_existing_scope() {
        let (stage, session) = setup();
        let root = stage.root();
        let mut env = Environment::for_call(session, root.clone(), Vec::new());
        let scope = object_with("hit", Value::Number(0.0));
        let mut with = WithStack::new();
        with.push(scope.clone(), 50);
        env.add_local("counter", Value::Number(0.0));

        env.assign("hit", Value::Number(1.0), &with);
        env.assign("counter", Value::Number(2.0), &with);
        env.assign("fresh", Value::Number(3.0), &with);

        assert_eq!(scope.get_member("hit"), Some(Value::Number(1.0)));
        assert_eq!(env.local("counter"), Some(Value::Number(2.0)));
        assert_eq!(root.get_member("fresh"), Some(Value::Number(3.0)));
        assert!(scope.get_member("fresh").is_none());
    }

    #[test]
    fn path_qualified_names() {
        let (stage, session) = setup();
        let root = stage.root();
        let menu = stage.add_clip(&root, "menu", 1, 1).unwrap();
        let button = stage.add_clip(&menu, "button", 1, 1).unwrap();
        let mut env = Environment::new(session, button.clone());
        let with = WithStack::new();

        env.assign("/menu:label", Value::from("go"), &with);
        assert_eq!(menu.get_member("label"), Some(Value::from("go")));
        assert_eq!(env.resolve("_root.menu.label", &with), Value::from("go"));
        assert_eq!(env.resolve("../:label", &with), Value::from("go"));
        assert_eq!(env.resolve("_parent.label", &with), Value::from("go"));
        assert_eq!(env.resolve("/nowhere:label", &with), Value::Undefined);

        env.assign("/nowhere:label", Value::from("lost"), &with);
        assert!(root.get_member("label").is_none());

        match env.resolve("/menu", &with) {
            Value::Object(node) => assert!(node.ptr_eq(&menu)),
            other => panic!("expected the menu clip, got {:?}", other),
        }
        match env.resolve("../button", &with) {
            Value::Object(node) => assert!(node.ptr_eq(&button)),
            other => panic!("expected the button clip, got {:?}", other),
        }
        assert_eq!(env.resolve("/nowhere", &with), Value::Undefined);
    }

    #[test]
    fn path_bypasses_locals_and_with() {
        let (stage, session) = setup();
        let root = stage.root();
        root.set_member("x", Value::Number(1.0));
        let mut env = Environment::for_call(session, root, Vec::new());
        env.add_local("x", Value::Number(2.0));
        let mut with = WithStack::new();
        with.push(object_with("x", Value::Number(3.0)), 10);
        assert_eq!(env.resolve("/:x", &with), Value::Number(1.0));
    }

    #[test]
    fn register_files() {
        let (stage, session) = setup();
        let mut env = Environment::for_call(session.clone(), stage.root(), Vec::new());
        session.set_global_register(0, Value::from("zero"));
        env.set_register(2, Value::Number(2.0));
        assert_eq!(env.register(2), Value::Number(2.0));
        assert_eq!(env.register(9), Value::from("zero"));

        env.enable_local_registers(3);
        env.set_register(3, Value::Number(33.0));
        assert_eq!(env.register(3), Value::Number(33.0));
        assert_eq!(env.register(2), Value::Undefined);
        assert_eq!(env.register(0), Value::from("zero"));
        assert_eq!(env.register(4), Value::from("zero"));
        assert_eq!(session.global_register(2), Value::Number(2.0));
    }

    #[test]
    fn with_entries_expire_at_end() {
        let mut with = WithStack::new();
        with.push(object_with("a", Value::Null), 10);
        with.expire(9);
        assert_eq!(with.len(), 1);
        with.expire(10);
        assert!(with.is_empty());
    }

    #[test]
    fn with_stack_is_bounded() {
        let mut with = WithStack::new();
        for _ in 0..WITH_STACK_LIMIT {
            assert!(with.push(object_with("a", Value::Null), 10));
        }
        assert!(!with.push(object_with("a", Value::Null), 10));
        assert_eq!(with.len(), WITH_STACK_LIMIT);
    }

    #[test]
    fn delete_variable_prefers_locals() {
        let (stage, session) = setup();
        let root = stage.root();
        root.set_member("v", Value::Number(1.0));
        let mut env = Environment::for_call(session, root.clone(), Vec::new());
        env.add_local("v", Value::Number(2.0));
        let with = WithStack::new();
        assert!(env.delete_variable("v", &with));
        assert_eq!(env.resolve("v", &with), Value::Number(1.0));
        assert!(env.delete_variable("v", &with));
        assert!(!env.delete_variable("v", &with));
    }
}
