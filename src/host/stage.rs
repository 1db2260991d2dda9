//! In-memory display tree used by the command-line runner and the tests.

use std::any::Any;
use std::cell::{Cell, RefCell};

use indexmap::IndexMap;
use tracing::debug;

use super::{DisplayTree, DragSpec};
use crate::object::{ObjectRef, PlainObject, ScriptObject, WeakObjectRef};
use crate::value::Value;

const DEFAULT_PROPERTIES: [(&str, f64); 8] = [
    ("_x", 0.0),
    ("_y", 0.0),
    ("_xscale", 100.0),
    ("_yscale", 100.0),
    ("_alpha", 100.0),
    ("_rotation", 0.0),
    ("_width", 0.0),
    ("_height", 0.0),
];

pub struct Clip {
    name: RefCell<String>,
    depth: Cell<i32>,
    parent: RefCell<Option<WeakObjectRef>>,
    children: RefCell<Vec<ObjectRef>>,
    members: PlainObject,
    current_frame: Cell<u32>,
    total_frames: u32,
    labels: RefCell<IndexMap<String, u32>>,
    playing: Cell<bool>,
}

impl Clip {
    fn new(name: &str, depth: i32, total_frames: u32) -> Clip {
        let members = PlainObject::new(None);
        for (prop, value) in DEFAULT_PROPERTIES {
            members.set_hidden(prop, Value::Number(value));
        }
        members.set_hidden("_visible", Value::Bool(true));
        Clip {
            name: RefCell::new(name.to_string()),
            depth: Cell::new(depth),
            parent: RefCell::new(None),
            children: RefCell::new(Vec::new()),
            members,
            current_frame: Cell::new(0),
            total_frames: total_frames.max(1),
            labels: RefCell::new(IndexMap::new()),
            playing: Cell::new(true),
        }
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn depth(&self) -> i32 {
        self.depth.get()
    }

    pub fn current_frame(&self) -> u32 {
        self.current_frame.get()
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    pub fn is_playing(&self) -> bool {
        self.playing.get()
    }

    pub fn set_label(&self, label: &str, frame: u32) {
        self.labels.borrow_mut().insert(label.to_string(), frame);
    }

    pub fn parent(&self) -> Option<ObjectRef> {
        self.parent.borrow().as_ref().and_then(WeakObjectRef::upgrade)
    }

    pub fn child(&self, name: &str) -> Option<ObjectRef> {
        self.children
            .borrow()
            .iter()
            .find(|child| as_clip(child).is_some_and(|c| *c.name.borrow() == name))
            .cloned()
    }

    pub fn children(&self) -> Vec<ObjectRef> {
        self.children.borrow().clone()
    }

    fn attach(parent: &ObjectRef, child: ObjectRef) -> bool {
        let (Some(parent_clip), Some(child_clip)) = (as_clip(parent), as_clip(&child)) else {
            return false;
        };
        *child_clip.parent.borrow_mut() = Some(parent.downgrade());
        let depth = child_clip.depth();
        let mut children = parent_clip.children.borrow_mut();
        children.retain(|c| as_clip(c).is_none_or(|c| c.depth() != depth));
        let at = children
            .iter()
            .position(|c| as_clip(c).is_some_and(|c| c.depth() > depth))
            .unwrap_or(children.len());
        children.insert(at, child);
        true
    }

    fn segments(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = self.parent();
        if current.is_none() {
            return names;
        }
        names.push(self.name());
        while let Some(node) = current {
            let Some(clip) = as_clip(&node) else { break };
            current = clip.parent();
            if current.is_some() {
                names.push(clip.name());
            }
        }
        names.reverse();
        names
    }

    /// `_level0.a.b`
    pub fn dot_path(&self) -> String {
        let mut path = String::from("_level0");
        for name in self.segments() {
            path.push('.');
            path.push_str(&name);
        }
        path
    }

    /// `/a/b`
    pub fn slash_path(&self) -> String {
        let segments = self.segments();
        if segments.is_empty() {
            return "/".to_string();
        }
        segments.iter().map(|s| format!("/{}", s)).collect()
    }
}

impl ScriptObject for Clip {
    fn get_own(&self, name: &str) -> Option<Value> {
        match name {
            "_name" => Some(Value::String(self.name())),
            "_currentframe" => Some(Value::Number(self.current_frame() as f64 + 1.0)),
            "_totalframes" => Some(Value::Number(self.total_frames as f64)),
            "_framesloaded" => Some(Value::Number(self.total_frames as f64)),
            "_target" => Some(Value::String(self.slash_path())),
            "_parent" => self.parent().map(Value::Object),
            _ => self
                .child(name)
                .map(Value::Object)
                .or_else(|| self.members.get_own(name)),
        }
    }

    fn set_own(&self, name: &str, value: Value) {
        match name {
            "_name" => *self.name.borrow_mut() = value.to_string(),
            "_currentframe" | "_totalframes" | "_framesloaded" | "_target" | "_parent" => {
                debug!(property = name, "read-only clip property");
            }
            _ => self.members.set_own(name, value),
        }
    }

    fn delete_own(&self, name: &str) -> bool {
        self.members.delete_own(name)
    }

    fn own_keys(&self) -> Vec<String> {
        self.members.own_keys()
    }

    fn prototype(&self) -> Option<ObjectRef> {
        self.members.prototype()
    }

    fn set_prototype(&self, proto: Option<ObjectRef>) {
        self.members.set_prototype(proto);
    }

    fn type_name(&self) -> &'static str {
        "movieclip"
    }

    fn text_hook(&self) -> Option<String> {
        Some(self.dot_path())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn as_clip(node: &ObjectRef) -> Option<&Clip> {
    node.downcast_ref::<Clip>()
}

pub struct Stage {
    root: ObjectRef,
    drag: RefCell<Option<(WeakObjectRef, DragSpec)>>,
}

impl Stage {
    pub fn new(total_frames: u32) -> Stage {
        Stage { root: ObjectRef::new(Clip::new("", 0, total_frames)), drag: RefCell::new(None) }
    }

    /// Create a child clip under `parent`; an existing child at the same
    /// depth is replaced.
    pub fn add_clip(&self, parent: &ObjectRef, name: &str, depth: i32, total_frames: u32) -> Option<ObjectRef> {
        let child = ObjectRef::new(Clip::new(name, depth, total_frames));
        Clip::attach(parent, child.clone()).then_some(child)
    }

    pub fn clip<'a>(&self, node: &'a ObjectRef) -> Option<&'a Clip> {
        as_clip(node)
    }

    pub fn dragging(&self) -> Option<(ObjectRef, DragSpec)> {
        let drag = self.drag.borrow();
        let (node, spec) = drag.as_ref()?;
        Some((node.upgrade()?, *spec))
    }
}

impl DisplayTree for Stage {
    fn root(&self) -> ObjectRef {
        self.root.clone()
    }

    fn resolve_child(&self, node: &ObjectRef, name: &str) -> Option<ObjectRef> {
        as_clip(node)?.child(name)
    }

    fn parent(&self, node: &ObjectRef) -> Option<ObjectRef> {
        as_clip(node)?.parent()
    }

    fn is_node(&self, object: &ObjectRef) -> bool {
        as_clip(object).is_some()
    }

    fn target_path(&self, node: &ObjectRef) -> Option<String> {
        as_clip(node).map(Clip::dot_path)
    }

    fn current_frame(&self, node: &ObjectRef) -> u32 {
        as_clip(node).map(Clip::current_frame).unwrap_or(0)
    }

    fn loaded_frames(&self, node: &ObjectRef) -> u32 {
        as_clip(node).map(Clip::total_frames).unwrap_or(0)
    }

    fn frame_for_label(&self, node: &ObjectRef, label: &str) -> Option<u32> {
        as_clip(node)?.labels.borrow().get(label).copied()
    }

    fn goto_frame(&self, node: &ObjectRef, frame: u32) {
        if let Some(clip) = as_clip(node) {
            clip.current_frame.set(frame.min(clip.total_frames - 1));
        }
    }

    fn goto_labeled_frame(&self, node: &ObjectRef, label: &str) -> bool {
        match self.frame_for_label(node, label) {
            Some(frame) => {
                self.goto_frame(node, frame);
                true
            }
            None => false,
        }
    }

    fn set_play_state(&self, node: &ObjectRef, playing: bool) {
        if let Some(clip) = as_clip(node) {
            clip.playing.set(playing);
        }
    }

    fn start_drag(&self, node: &ObjectRef, drag: DragSpec) {
        *self.drag.borrow_mut() = Some((node.downgrade(), drag));
    }

    fn stop_drag(&self) {
        *self.drag.borrow_mut() = None;
    }

    fn duplicate(&self, node: &ObjectRef, name: &str, depth: i32) -> Option<ObjectRef> {
        let source = as_clip(node)?;
        let parent = source.parent()?;
        let copy = Clip::new(name, depth, source.total_frames);
        for key in DEFAULT_PROPERTIES.iter().map(|(k, _)| *k).chain(["_visible"]) {
            if let Some(value) = source.members.get_own(key) {
                copy.members.set_hidden(key, value);
            }
        }
        for key in source.members.own_keys() {
            if let Some(value) = source.members.get_own(&key) {
                copy.members.set_own(&key, value);
            }
        }
        *copy.labels.borrow_mut() = source.labels.borrow().clone();
        let copy = ObjectRef::new(copy);
        Clip::attach(&parent, copy.clone()).then_some(copy)
    }

    fn remove(&self, node: &ObjectRef) {
        let Some(clip) = as_clip(node) else { return };
        let Some(parent) = clip.parent() else {
            debug!("the root clip cannot be removed");
            return;
        };
        if let Some(parent_clip) = as_clip(&parent) {
            parent_clip.children.borrow_mut().retain(|c| !c.ptr_eq(node));
        }
        *clip.parent.borrow_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_hierarchy() {
        let stage = Stage::new(1);
        let root = stage.root();
        let menu = stage.add_clip(&root, "menu", 1, 1).unwrap();
        let button = stage.add_clip(&menu, "button", 1, 1).unwrap();
        assert_eq!(stage.target_path(&root).as_deref(), Some("_level0"));
        assert_eq!(stage.target_path(&button).as_deref(), Some("_level0.menu.button"));
        assert_eq!(button.get_own("_target"), Some(Value::from("/menu/button")));
        assert_eq!(root.get_own("_target"), Some(Value::from("/")));
        assert!(stage.parent(&button).unwrap().ptr_eq(&menu));
    }

    #[test]
    fn children_are_members() {
        let stage = Stage::new(1);
        let root = stage.root();
        let ball = stage.add_clip(&root, "ball", 3, 1).unwrap();
        match root.get_member("ball") {
            Some(Value::Object(found)) => assert!(found.ptr_eq(&ball)),
            other => panic!("expected clip, got {:?}", other),
        }
        assert_eq!(ball.get_member("_xscale"), Some(Value::Number(100.0)));
        assert!(ball.enumerate_members().is_empty());
    }

    #[test]
    fn same_depth_replaces() {
        let stage = Stage::new(1);
        let root = stage.root();
        stage.add_clip(&root, "a", 5, 1).unwrap();
        stage.add_clip(&root, "b", 5, 1).unwrap();
        assert!(stage.resolve_child(&root, "a").is_none());
        assert!(stage.resolve_child(&root, "b").is_some());
    }

    #[test]
    fn frames_and_labels() {
        let stage = Stage::new(10);
        let root = stage.root();
        stage.clip(&root).unwrap().set_label("intro", 4);
        assert!(stage.goto_labeled_frame(&root, "intro"));
        assert_eq!(stage.current_frame(&root), 4);
        assert_eq!(root.get_member("_currentframe"), Some(Value::Number(5.0)));
        stage.goto_frame(&root, 99);
        assert_eq!(stage.current_frame(&root), 9);
        assert!(!stage.goto_labeled_frame(&root, "missing"));
    }

    #[test]
    fn duplicate_and_remove() {
        let stage = Stage::new(1);
        let root = stage.root();
        let ball = stage.add_clip(&root, "ball", 1, 1).unwrap();
        ball.set_member("speed", Value::Number(3.0));
        ball.set_member("_x", Value::Number(20.0));
        let copy = stage.duplicate(&ball, "ball2", 2).unwrap();
        assert_eq!(copy.get_member("speed"), Some(Value::Number(3.0)));
        assert_eq!(copy.get_member("_x"), Some(Value::Number(20.0)));
        assert_eq!(copy.get_member("_name"), Some(Value::from("ball2")));
        stage.remove(&ball);
        assert!(stage.resolve_child(&root, "ball").is_none());
        assert!(stage.parent(&ball).is_none());
    }
}
