use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info};

use crate::env::GLOBAL_REGISTER_COUNT;
use crate::error::{VmError, VmResult};
use crate::object::{NativeCall, NativeFunction, ObjectRef, PlainObject};
use crate::value::Value;

pub mod stage;

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Document version; changes how `undefined` stringifies and which
    /// implicit bindings a call gets.
    pub version: u8,
    pub max_call_depth: usize,
    pub rng_seed: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { version: 7, max_call_depth: 256, rng_seed: None }
    }
}

// ── Capabilities supplied by the embedding player ───────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragBounds {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSpec {
    pub lock_center: bool,
    pub bounds: Option<DragBounds>,
}

/// Scene-graph operations the interpreter delegates. Frame numbers are
/// zero-based.
pub trait DisplayTree {
    fn root(&self) -> ObjectRef;
    fn resolve_child(&self, node: &ObjectRef, name: &str) -> Option<ObjectRef>;
    fn parent(&self, node: &ObjectRef) -> Option<ObjectRef>;
    fn is_node(&self, object: &ObjectRef) -> bool;
    /// Dot-syntax path such as `_level0.menu.button`.
    fn target_path(&self, node: &ObjectRef) -> Option<String>;
    fn current_frame(&self, node: &ObjectRef) -> u32;
    fn loaded_frames(&self, node: &ObjectRef) -> u32;
    fn frame_for_label(&self, node: &ObjectRef, label: &str) -> Option<u32>;
    fn goto_frame(&self, node: &ObjectRef, frame: u32);
    fn goto_labeled_frame(&self, node: &ObjectRef, label: &str) -> bool;
    fn set_play_state(&self, node: &ObjectRef, playing: bool);
    fn start_drag(&self, node: &ObjectRef, drag: DragSpec);
    fn stop_drag(&self);
    fn duplicate(&self, node: &ObjectRef, name: &str, depth: i32) -> Option<ObjectRef>;
    fn remove(&self, node: &ObjectRef);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMethod {
    None,
    Get,
    Post,
}

impl SendMethod {
    pub fn from_flags(flags: u8) -> SendMethod {
        match flags & 0x03 {
            1 => SendMethod::Get,
            2 => SendMethod::Post,
            _ => SendMethod::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    FsCommand {
        command: String,
        args: String,
    },
    Navigate {
        url: String,
        target: String,
        method: SendMethod,
        load_target: bool,
        load_variables: bool,
    },
}

/// Outbound calls to the embedding player. Requests are handed off; the
/// interpreter never waits for them.
pub trait HostBridge {
    fn dispatch(&self, root: &ObjectRef, request: HostRequest);

    fn trace(&self, message: &str) {
        info!(target: "actionvm::trace", "{}", message);
    }
}

/// Host bridge that only logs.
#[derive(Debug, Default)]
pub struct LogHost;

impl HostBridge for LogHost {
    fn dispatch(&self, _root: &ObjectRef, request: HostRequest) {
        info!(?request, "host request");
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Everything shared by the activations of one loaded document.
pub struct Session {
    config: VmConfig,
    global: ObjectRef,
    object_prototype: ObjectRef,
    array_prototype: ObjectRef,
    registers: RefCell<[Value; GLOBAL_REGISTER_COUNT]>,
    display: Rc<dyn DisplayTree>,
    host: Rc<dyn HostBridge>,
    started: Instant,
    rng: RefCell<fastrand::Rng>,
    depth: Cell<usize>,
}

impl Session {
    pub fn new(config: VmConfig, display: Rc<dyn DisplayTree>, host: Rc<dyn HostBridge>) -> Rc<Session> {
        let object_prototype = ObjectRef::new(PlainObject::new(None));
        let array_prototype = ObjectRef::new(PlainObject::new(Some(object_prototype.clone())));
        let global = ObjectRef::new(PlainObject::new(Some(object_prototype.clone())));
        let rng = match config.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let session = Session {
            config,
            global,
            object_prototype,
            array_prototype,
            registers: RefCell::new(Default::default()),
            display,
            host,
            started: Instant::now(),
            rng: RefCell::new(rng),
            depth: Cell::new(0),
        };
        session.install_builtins();
        Rc::new(session)
    }

    fn install_builtins(&self) {
        let object = NativeFunction::new("Object", |call| match &call.this {
            Some(this) if call.constructing => Value::Object(this.clone()),
            _ => Value::Object(call.session.new_object()),
        });
        object.props().set_hidden("prototype", Value::Object(self.object_prototype.clone()));
        self.global.set_hidden("Object", Value::NativeFunction(object));

        let array = NativeFunction::new("Array", |call| {
            Value::Object(call.session.new_array(call.args.to_vec()))
        });
        array.props().set_hidden("prototype", Value::Object(self.array_prototype.clone()));
        self.global.set_hidden("Array", Value::NativeFunction(array));
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn version(&self) -> u8 {
        self.config.version
    }

    pub fn global(&self) -> &ObjectRef {
        &self.global
    }

    pub fn object_prototype(&self) -> &ObjectRef {
        &self.object_prototype
    }

    pub fn display(&self) -> &dyn DisplayTree {
        &*self.display
    }

    pub fn host(&self) -> &dyn HostBridge {
        &*self.host
    }

    pub fn root(&self) -> ObjectRef {
        self.display.root()
    }

    pub fn new_object(&self) -> ObjectRef {
        ObjectRef::new(PlainObject::new(Some(self.object_prototype.clone())))
    }

    pub fn new_array(&self, items: Vec<Value>) -> ObjectRef {
        ObjectRef::new(PlainObject::array(Some(self.array_prototype.clone()), items))
    }

    /// Expose a host function on the global object.
    pub fn define_native(&self, name: &str, func: impl Fn(&NativeCall<'_>) -> Value + 'static) {
        self.global
            .set_hidden(name, Value::NativeFunction(NativeFunction::new(name, func)));
    }

    pub fn global_register(&self, index: usize) -> Value {
        self.registers.borrow().get(index).cloned().unwrap_or_default()
    }

    pub fn set_global_register(&self, index: usize, value: Value) {
        if let Some(slot) = self.registers.borrow_mut().get_mut(index) {
            *slot = value;
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Uniform integer in `0..max`; `max` must be at least 1.
    pub fn random(&self, max: u32) -> u32 {
        self.rng.borrow_mut().u32(0..max.max(1))
    }

    pub fn call_depth(&self) -> usize {
        self.depth.get()
    }

    /// Count one more nested call, refusing past the configured limit.
    pub fn enter_call(&self) -> VmResult<CallGuard<'_>> {
        let depth = self.depth.get();
        if depth >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded { limit: self.config.max_call_depth });
        }
        self.depth.set(depth + 1);
        debug!(depth = depth + 1, "enter call");
        Ok(CallGuard { session: self })
    }
}

pub struct CallGuard<'a> {
    session: &'a Session,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.session.depth.set(self.session.depth.get().saturating_sub(1));
    }
}
