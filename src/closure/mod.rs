use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use crate::bytecode::{CodeBuffer, DecodeError, Instruction, Opcode};
use crate::env::{Environment, LocalScope, WithStack};
use crate::host::Session;
use crate::object::{ObjectRef, PlainObject, WeakObjectRef};
use crate::value::Value;

/// Implicit-binding flags of a `function2` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionFlags(pub u16);

impl FunctionFlags {
    pub const PRELOAD_THIS: u16 = 0x0001;
    pub const SUPPRESS_THIS: u16 = 0x0002;
    pub const PRELOAD_ARGUMENTS: u16 = 0x0004;
    pub const SUPPRESS_ARGUMENTS: u16 = 0x0008;
    pub const PRELOAD_SUPER: u16 = 0x0010;
    pub const SUPPRESS_SUPER: u16 = 0x0020;
    pub const PRELOAD_ROOT: u16 = 0x0040;
    pub const PRELOAD_PARENT: u16 = 0x0080;
    pub const PRELOAD_GLOBAL: u16 = 0x0100;

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// `None` binds the parameter as a named local.
    pub register: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionKind {
    V1,
    V2 { register_count: u8, flags: FunctionFlags },
}

/// Operands of a `function` / `function2` instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionHeader {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub kind: FunctionKind,
    pub body_len: usize,
}

impl FunctionHeader {
    pub fn parse(code: &CodeBuffer, inst: &Instruction) -> Result<FunctionHeader, DecodeError> {
        let v2 = match inst.opcode {
            Some(Opcode::DefineFunction) => false,
            Some(Opcode::DefineFunction2) => true,
            _ => return Err(DecodeError::WrongOpcode { at: inst.pc, expected: "function definition" }),
        };
        let mut reader = code.operands(inst);
        let name = reader.string()?;
        let count = reader.u16()?;
        let kind = if v2 {
            let register_count = reader.u8()?;
            let flags = FunctionFlags(reader.u16()?);
            FunctionKind::V2 { register_count, flags }
        } else {
            FunctionKind::V1
        };
        let mut params = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let register = if v2 { Some(reader.u8()?).filter(|r| *r != 0) } else { None };
            params.push(Param { name: reader.string()?, register });
        }
        let body_len = reader.u16()? as usize;
        Ok(FunctionHeader {
            name: Some(name).filter(|n| !n.is_empty()),
            params,
            kind,
            body_len,
        })
    }
}

/// A script function: its code range plus the scope it was defined in.
///
/// Only the defining target is held weakly, so a closure stored on its own
/// target does not keep that target alive. The with-stack snapshot and the
/// enclosing local scopes are owned.
pub struct Closure {
    code: Rc<CodeBuffer>,
    name: Option<String>,
    body: Range<usize>,
    params: Vec<Param>,
    kind: FunctionKind,
    target: WeakObjectRef,
    with_stack: WithStack,
    scopes: Vec<Rc<LocalScope>>,
    props: ObjectRef,
}

impl Closure {
    pub fn new(
        session: &Session,
        code: Rc<CodeBuffer>,
        header: FunctionHeader,
        body: Range<usize>,
        env: &Environment,
        with: &WithStack,
    ) -> Closure {
        let props = ObjectRef::new(PlainObject::new(None));
        props.set_hidden("prototype", Value::Object(session.new_object()));
        // Version 6 brought activation scopes into closures.
        let scopes = if session.version() > 5 { env.scope_chain() } else { Vec::new() };
        Closure {
            code,
            name: header.name,
            body,
            params: header.params,
            kind: header.kind,
            target: env.target().downgrade(),
            with_stack: with.clone(),
            scopes,
            props,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn code(&self) -> &Rc<CodeBuffer> {
        &self.code
    }

    pub fn body(&self) -> Range<usize> {
        self.body.clone()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Member bag of the function value (`prototype` and friends).
    pub fn props(&self) -> &ObjectRef {
        &self.props
    }

    pub fn captured_target(&self) -> Option<ObjectRef> {
        self.target.upgrade()
    }

    /// The with-stack at definition time.
    pub fn captured_with_stack(&self) -> WithStack {
        self.with_stack.clone()
    }

    /// Locals of the enclosing function activations, innermost first.
    pub fn captured_scopes(&self) -> Vec<Rc<LocalScope>> {
        self.scopes.clone()
    }

    /// Install parameters and implicit bindings in a fresh call environment.
    ///
    /// `super` exists from version 6 on, and only when `this` has a
    /// grandparent prototype.
    pub fn bind(&self, env: &mut Environment, this: Option<ObjectRef>, args: &[Value], callee: Value) {
        let session = env.session().clone();
        let this_value = this.clone().map(Value::Object).unwrap_or_default();
        let arguments = session.new_array(args.to_vec());
        arguments.set_hidden("callee", callee);
        let arguments = Value::Object(arguments);
        let super_value = this
            .as_ref()
            .filter(|_| env.version() > 5)
            .and_then(|obj| obj.prototype())
            .and_then(|proto| proto.prototype())
            .map(Value::Object);
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        match self.kind {
            FunctionKind::V1 => {
                env.add_local("this", this_value);
                env.add_local("arguments", arguments);
                if let Some(super_value) = super_value {
                    env.add_local("super", super_value);
                }
                for (i, param) in self.params.iter().enumerate() {
                    env.add_local(&param.name, arg(i));
                }
            }
            FunctionKind::V2 { register_count, flags } => {
                let target = env.target().clone();
                let mut preloaded = Vec::new();
                if flags.contains(FunctionFlags::PRELOAD_THIS) && !flags.contains(FunctionFlags::SUPPRESS_THIS) {
                    preloaded.push(this_value.clone());
                }
                if flags.contains(FunctionFlags::PRELOAD_ARGUMENTS) {
                    preloaded.push(arguments.clone());
                }
                if flags.contains(FunctionFlags::PRELOAD_SUPER) {
                    // No register is taken when there is no super.
                    preloaded.extend(super_value.clone());
                }
                if flags.contains(FunctionFlags::PRELOAD_ROOT) {
                    preloaded.push(Value::Object(session.root()));
                }
                if flags.contains(FunctionFlags::PRELOAD_PARENT) {
                    preloaded.push(session.display().parent(&target).map(Value::Object).unwrap_or_default());
                }
                if flags.contains(FunctionFlags::PRELOAD_GLOBAL) {
                    preloaded.push(Value::Object(session.global().clone()));
                }
                let highest_param =
                    self.params.iter().filter_map(|p| p.register).max().unwrap_or(0);
                let size = (register_count as usize).max(preloaded.len()).max(highest_param as usize);
                env.enable_local_registers(size);
                for (i, value) in preloaded.into_iter().enumerate() {
                    env.set_register(i as u8 + 1, value);
                }

                if !flags.contains(FunctionFlags::SUPPRESS_THIS) {
                    env.add_local("this", this_value);
                }
                if !flags.contains(FunctionFlags::SUPPRESS_ARGUMENTS) {
                    env.add_local("arguments", arguments);
                }
                if let Some(super_value) = super_value.filter(|_| !flags.contains(FunctionFlags::SUPPRESS_SUPER)) {
                    env.add_local("super", super_value);
                }
                for (i, param) in self.params.iter().enumerate() {
                    match param.register {
                        Some(reg) => env.set_register(reg, arg(i)),
                        None => env.add_local(&param.name, arg(i)),
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("body", &self.body)
            .field("kind", &self.kind)
            .field("params", &self.params.len())
            .finish()
    }
}
