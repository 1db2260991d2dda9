use std::ops::Range;
use std::rc::Rc;

use tracing::{debug, error, trace, warn};

use crate::bytecode::{
    describe, decode_push, CodeBuffer, DecodeError, Instruction, Opcode, OperandReader, PoolError,
    PushItem,
};
use crate::closure::{Closure, FunctionHeader};
use crate::env::{Environment, WithStack};
use crate::error::{VmError, VmResult};
use crate::host::{DragBounds, DragSpec, HostRequest, SendMethod, Session};
use crate::object::{ObjectRef, PlainObject};
use crate::value::{parse_number, Value};

mod call;

pub use call::{call_value, construct, invoke_closure};

/// Property table addressed by index from `getproperty` / `setproperty`.
pub const PROPERTY_NAMES: [&str; 22] = [
    "_x",
    "_y",
    "_xscale",
    "_yscale",
    "_currentframe",
    "_totalframes",
    "_alpha",
    "_visible",
    "_width",
    "_height",
    "_rotation",
    "_target",
    "_framesloaded",
    "_name",
    "_droptarget",
    "_url",
    "_highquality",
    "_focusrect",
    "_soundbuftime",
    "_quality",
    "_xmouse",
    "_ymouse",
];

// ── Operand stack ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OperandStack {
    values: Vec<Value>,
}

impl OperandStack {
    pub fn new() -> Self {
        OperandStack::default()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Underflow is tolerated: it yields `undefined`.
    pub fn pop(&mut self) -> Value {
        match self.values.pop() {
            Some(value) => value,
            None => {
                warn!("operand stack underflow");
                Value::Undefined
            }
        }
    }

    pub fn peek(&self) -> Value {
        self.peek_at(0)
    }

    /// Value `depth` places below the top, `undefined` past the bottom.
    pub fn peek_at(&self, depth: usize) -> Value {
        self.values
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.values.get(index))
            .cloned()
            .unwrap_or_default()
    }

    /// Discard the top `n` values.
    pub fn drop_n(&mut self, n: usize) {
        if n > self.values.len() {
            warn!(requested = n, available = self.values.len(), "operand stack underflow");
        }
        let keep = self.values.len().saturating_sub(n);
        self.values.truncate(keep);
    }

    /// Pop a count operand, clamped to what is actually on the stack.
    pub fn pop_count(&mut self) -> usize {
        let n = self.pop().to_number();
        let n = if n.is_nan() || n < 0.0 { 0 } else { n as usize };
        if n > self.values.len() {
            warn!(requested = n, available = self.values.len(), "count exceeds stack depth");
        }
        n.min(self.values.len())
    }

    /// Pop `n` values; the first popped comes first.
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        (0..n).map(|_| self.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}

// ── Completion ──────────────────────────────────────────────────────

/// How an activation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Returned(Value),
    /// Ran off the end of its range or hit `end`.
    Finished,
    /// Bad branch target or undecodable instruction.
    Aborted,
}

impl Completion {
    pub fn into_value(self) -> Value {
        match self {
            Completion::Returned(value) => value,
            Completion::Finished | Completion::Aborted => Value::Undefined,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Completion::Returned(_) => "returned",
            Completion::Finished => "finished",
            Completion::Aborted => "aborted",
        }
    }
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
    Stop,
    Abort,
}

/// Why a step could not finish normally.
enum Fault {
    /// Undecodable operands: only this activation is abandoned.
    Malformed(DecodeError),
    Vm(VmError),
}

impl From<DecodeError> for Fault {
    fn from(err: DecodeError) -> Self {
        Fault::Malformed(err)
    }
}

impl From<VmError> for Fault {
    fn from(err: VmError) -> Self {
        Fault::Vm(err)
    }
}

type Step = Result<Flow, Fault>;

// ── Try blocks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum CatchTarget {
    Name(String),
    Register(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryState {
    Try,
    Catch,
    Finally,
}

/// What resumes once a `finally` region has run.
#[derive(Debug, Clone)]
enum Pending {
    Return(Value),
    Throw(Value),
}

#[derive(Debug, Clone)]
struct TryBlock {
    try_end: usize,
    catch_end: usize,
    finally_end: usize,
    catch: Option<CatchTarget>,
    state: TryState,
    pending: Option<Pending>,
}

impl TryBlock {
    fn has_finally(&self) -> bool {
        self.finally_end > self.catch_end
    }
}

const TRY_HAS_CATCH: u8 = 0x01;
const TRY_CATCH_IN_REGISTER: u8 = 0x04;

const GET_URL_LOAD_TARGET: u8 = 0x40;
const GET_URL_LOAD_VARIABLES: u8 = 0x80;
const FSCOMMAND_PREFIX: &str = "fscommand:";

// ── Activation ──────────────────────────────────────────────────────

/// One run of the interpreter over a range of a code buffer.
pub struct Activation {
    code: Rc<CodeBuffer>,
    start: usize,
    stop: usize,
    pc: usize,
    env: Environment,
    with_stack: WithStack,
    stack: OperandStack,
    try_blocks: Vec<TryBlock>,
}

impl Activation {
    pub fn new(code: Rc<CodeBuffer>, range: Range<usize>, env: Environment, with_stack: WithStack) -> Self {
        let stop = range.end.min(code.len());
        let start = range.start.min(stop);
        Activation {
            code,
            start,
            stop,
            pc: start,
            env,
            with_stack,
            stack: OperandStack::new(),
            try_blocks: Vec::new(),
        }
    }

    /// Timeline code: the whole buffer, run against `target`.
    pub fn top_level(session: Rc<Session>, code: Rc<CodeBuffer>, target: ObjectRef) -> Self {
        let range = 0..code.len();
        Activation::new(code, range, Environment::new(session, target), WithStack::new())
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    pub fn with_stack(&self) -> &WithStack {
        &self.with_stack
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn run(&mut self) -> VmResult<Completion> {
        loop {
            let pending = self.settle_try_blocks();
            let at = self.pc;
            let (result, next) = match pending {
                Some(Pending::Return(value)) => (Ok(Flow::Return(value)), at),
                Some(Pending::Throw(value)) => (self.throw(value), at),
                None => {
                    self.with_stack.expire(self.pc);
                    if self.pc >= self.stop {
                        return Ok(Completion::Finished);
                    }
                    let inst = match self.code.decode_at(self.pc, self.stop) {
                        Ok(inst) => inst,
                        Err(err) => {
                            error!(pc = self.pc, %err, "cannot decode instruction");
                            return Ok(Completion::Aborted);
                        }
                    };
                    trace!(pc = inst.pc, "{}", describe(&self.code, &inst));
                    (self.step(&inst), inst.next)
                }
            };

            let flow = match result {
                Ok(flow) => flow,
                Err(Fault::Malformed(err)) => {
                    error!(pc = at, %err, "malformed operands, abandoning activation");
                    return Ok(Completion::Aborted);
                }
                Err(Fault::Vm(err)) => return Err(err),
            };

            match flow {
                Flow::Next => self.pc = next,
                Flow::Jump(target) if target == self.stop => return Ok(Completion::Finished),
                Flow::Jump(target) if target < self.start || target > self.stop => {
                    error!(pc = at, dest = target, "branch target outside the activation");
                    return Ok(Completion::Aborted);
                }
                Flow::Jump(target) => self.pc = target,
                Flow::Return(value) => match self.finally_before_return(value) {
                    Ok(finally) => self.pc = finally,
                    Err(value) => return Ok(Completion::Returned(value)),
                },
                Flow::Stop => return Ok(Completion::Finished),
                Flow::Abort => return Ok(Completion::Aborted),
            }
        }
    }

    /// Advance try blocks past the regions `pc` has left. A finished
    /// `finally` hands back the return or throw it interrupted.
    fn settle_try_blocks(&mut self) -> Option<Pending> {
        while let Some(block) = self.try_blocks.last_mut() {
            match block.state {
                TryState::Try if self.pc >= block.try_end => {
                    block.state = TryState::Finally;
                    if self.pc < block.catch_end {
                        self.pc = block.catch_end;
                    }
                }
                TryState::Catch if self.pc >= block.catch_end => block.state = TryState::Finally,
                TryState::Finally if self.pc >= block.finally_end => {
                    let pending = block.pending.take();
                    self.try_blocks.pop();
                    if pending.is_some() {
                        return pending;
                    }
                }
                _ => break,
            }
        }
        None
    }

    /// Unwind to the innermost catch of this activation, or hand the value
    /// to the caller. A `finally` on the way runs first and rethrows.
    fn throw(&mut self, value: Value) -> Step {
        while let Some(block) = self.try_blocks.last_mut() {
            match (block.state, block.catch.clone()) {
                (TryState::Try, Some(catch)) => {
                    block.state = TryState::Catch;
                    let resume = block.try_end;
                    match catch {
                        CatchTarget::Name(name) => self.define_local(&name, value),
                        CatchTarget::Register(reg) => self.env.set_register(reg, value),
                    }
                    return Ok(Flow::Jump(resume));
                }
                (TryState::Try | TryState::Catch, _) if block.has_finally() => {
                    block.state = TryState::Finally;
                    block.pending = Some(Pending::Throw(value));
                    return Ok(Flow::Jump(block.catch_end));
                }
                _ => {
                    self.try_blocks.pop();
                }
            }
        }
        Err(Fault::Vm(VmError::Thrown(value)))
    }

    /// Offset of the innermost `finally` a return must run first, or the
    /// value back when there is none.
    fn finally_before_return(&mut self, value: Value) -> Result<usize, Value> {
        while let Some(block) = self.try_blocks.last_mut() {
            if block.state != TryState::Finally && block.has_finally() {
                block.state = TryState::Finally;
                block.pending = Some(Pending::Return(value));
                return Ok(block.catch_end);
            }
            self.try_blocks.pop();
        }
        Err(value)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn session(&self) -> Rc<Session> {
        self.env.session().clone()
    }

    fn version(&self) -> u8 {
        self.env.version()
    }

    fn pop(&mut self) -> Value {
        self.stack.pop()
    }

    fn push(&mut self, value: impl Into<Value>) {
        self.stack.push(value.into());
    }

    fn pop_string(&mut self) -> String {
        let version = self.version();
        self.pop().to_string_versioned(version)
    }

    fn binary(&mut self, op: impl FnOnce(Value, Value) -> Value) {
        let a = self.stack.peek_at(1);
        let b = self.stack.peek_at(0);
        self.stack.drop_n(2);
        self.push(op(a, b));
    }

    fn numeric(&mut self, op: impl FnOnce(f64, f64) -> f64) {
        self.binary(|a, b| Value::Number(op(a.to_number(), b.to_number())));
    }

    fn bitwise(&mut self, op: impl FnOnce(i32, i32) -> i32) {
        self.binary(|a, b| Value::Number(op(a.to_int32(), b.to_int32()) as f64));
    }

    fn strings(&mut self, op: impl FnOnce(&str, &str) -> Value) {
        let version = self.version();
        self.binary(|a, b| {
            op(&a.to_string_versioned(version), &b.to_string_versioned(version))
        });
    }

    /// `var x = v` semantics: a local inside functions, a target member at
    /// top level.
    fn define_local(&mut self, name: &str, value: Value) {
        if self.env.is_function() {
            self.env.set_local(name, value);
        } else {
            self.env.target().set_member(name, value);
        }
    }

    fn branch(&self, inst: &Instruction, offset: i16) -> Flow {
        match inst.next.checked_add_signed(offset as isize) {
            Some(target) => Flow::Jump(target),
            None => {
                error!(pc = inst.pc, offset, "branch before the start of the buffer");
                Flow::Abort
            }
        }
    }

    /// Offset after skipping `count` instructions starting at `from`.
    fn skip_instructions(&self, from: usize, count: u8) -> Result<usize, DecodeError> {
        let mut pc = from;
        for _ in 0..count {
            if pc >= self.stop {
                break;
            }
            pc = self.code.decode_at(pc, self.stop)?.next;
        }
        Ok(pc)
    }

    fn literal(&self, item: PushItem) -> Value {
        match item {
            PushItem::String(s) => Value::String(s),
            PushItem::Float(f) => Value::Number(f as f64),
            PushItem::Null => Value::Null,
            PushItem::Undefined => Value::Undefined,
            PushItem::Register(reg) => self.env.register(reg),
            PushItem::Bool(b) => Value::Bool(b),
            PushItem::Double(d) => Value::Number(d),
            PushItem::Int(i) => Value::Number(i as f64),
            PushItem::Constant8(i) => self.constant(i as usize),
            PushItem::Constant16(i) => self.constant(i as usize),
        }
    }

    fn constant(&self, index: usize) -> Value {
        match self.code.constant(index) {
            Some(s) => Value::String(s.to_string()),
            None => {
                error!(index, "constant pool index out of range");
                Value::Number(0.0)
            }
        }
    }

    /// Node named by a property/clip operand; an empty string means the
    /// current target.
    fn node_operand(&self, value: &Value) -> Option<ObjectRef> {
        match value {
            Value::String(s) if s.is_empty() => Some(self.env.target().clone()),
            Value::Undefined => Some(self.env.target().clone()),
            other => self.env.target_of(other),
        }
    }

    fn property_name(&self, index: &Value) -> Option<&'static str> {
        let n = index.to_number();
        let name = (n.is_finite() && n >= 0.0)
            .then(|| PROPERTY_NAMES.get(n as usize).copied())
            .flatten();
        if name.is_none() {
            warn!(index = n, "unknown property index");
        }
        name
    }

    fn finish_call(&mut self, result: VmResult<Value>) -> Step {
        match result {
            Ok(value) => {
                self.push(value);
                Ok(Flow::Next)
            }
            Err(VmError::Thrown(value)) => self.throw(value),
            Err(err) => {
                warn!(%err, "call failed");
                self.push(Value::Undefined);
                Ok(Flow::Next)
            }
        }
    }

    fn get_url(&self, url: String, target: String, flags: u8) {
        if url.is_empty() {
            warn!(window = %target, "geturl with an empty url");
            return;
        }
        let is_command = url
            .get(..FSCOMMAND_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(FSCOMMAND_PREFIX));
        let request = if is_command {
            HostRequest::FsCommand { command: url[FSCOMMAND_PREFIX.len()..].to_string(), args: target }
        } else {
            HostRequest::Navigate {
                url,
                target,
                method: SendMethod::from_flags(flags),
                load_target: flags & GET_URL_LOAD_TARGET != 0,
                load_variables: flags & GET_URL_LOAD_VARIABLES != 0,
            }
        };
        let session = self.env.session();
        session.host().dispatch(&session.root(), request);
    }

    /// Zero-based frame a `gotoframe2`/`waitforframe2` operand names, and
    /// the node it applies to.
    fn frame_operand(&self, frame: &Value, bias: u16) -> Option<(ObjectRef, u32)> {
        let display = self.env.session().display();
        let number = |n: f64| (n.trunc() as i64 - 1 + bias as i64).max(0) as u32;
        match frame {
            Value::String(text) => {
                let (node, frame) = match text.find(':') {
                    Some(at) => (self.env.find_target(&text[..at])?, &text[at + 1..]),
                    None => (self.env.target().clone(), text.as_str()),
                };
                if let Some(labelled) = display.frame_for_label(&node, frame) {
                    return Some((node, labelled));
                }
                let n = parse_number(frame);
                if n.is_finite() {
                    Some((node, number(n)))
                } else {
                    warn!(frame, "no such frame label");
                    None
                }
            }
            other => Some((self.env.target().clone(), number(other.to_number()))),
        }
    }

    fn define_function(&mut self, inst: &Instruction) -> Step {
        let header = FunctionHeader::parse(&self.code, inst)
            .map_err(|source| VmError::StructuralDecode { offset: inst.pc, source })?;
        let body_start = inst.next;
        let mut body_end = body_start + header.body_len;
        if body_end > self.stop {
            warn!(pc = inst.pc, body_end, stop = self.stop, "function body runs past its container, clamping");
            body_end = self.stop;
        }
        let name = header.name.clone();
        let session = self.session();
        let closure =
            Closure::new(&session, self.code.clone(), header, body_start..body_end, &self.env, &self.with_stack);
        let value = Value::ScriptFunction(Rc::new(closure));
        if let Some(name) = name {
            self.define_local(&name, value.clone());
        }
        self.push(value);
        Ok(Flow::Jump(body_end))
    }

    fn begin_try(&mut self, inst: &Instruction, reader: &mut OperandReader<'_>) -> Step {
        let flags = reader.u8()?;
        let try_size = reader.u16()? as usize;
        let catch_size = reader.u16()? as usize;
        let finally_size = reader.u16()? as usize;
        let catch_target = if flags & TRY_CATCH_IN_REGISTER != 0 {
            CatchTarget::Register(reader.u8()?)
        } else {
            CatchTarget::Name(reader.string()?)
        };
        let try_end = inst.next + try_size;
        let catch_end = try_end + catch_size;
        self.try_blocks.push(TryBlock {
            try_end,
            catch_end,
            finally_end: catch_end + finally_size,
            catch: (flags & TRY_HAS_CATCH != 0).then_some(catch_target),
            state: TryState::Try,
            pending: None,
        });
        Ok(Flow::Next)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn step(&mut self, inst: &Instruction) -> Step {
        let Some(op) = inst.opcode else {
            warn!(pc = inst.pc, byte = inst.byte, "unknown opcode, skipping");
            return Ok(Flow::Next);
        };
        let code = self.code.clone();
        let mut reader = code.operands(inst);
        let session = self.session();
        let display = session.display();
        let version = self.version();

        match op {
            Opcode::End => return Ok(Flow::Stop),

            // Timeline
            Opcode::NextFrame => {
                let target = self.env.target();
                display.goto_frame(target, display.current_frame(target) + 1);
            }
            Opcode::PrevFrame => {
                let target = self.env.target();
                display.goto_frame(target, display.current_frame(target).saturating_sub(1));
            }
            Opcode::Play => display.set_play_state(self.env.target(), true),
            Opcode::Stop => display.set_play_state(self.env.target(), false),
            Opcode::ToggleQuality | Opcode::StopSounds => debug!(?op, "ignored"),
            Opcode::GotoFrame => {
                let frame = reader.u16()? as u32;
                display.goto_frame(self.env.target(), frame);
            }
            Opcode::GotoLabel => {
                let label = reader.string()?;
                if !display.goto_labeled_frame(self.env.target(), &label) {
                    warn!(label = %label, "no such frame label");
                }
            }
            Opcode::GotoFrame2 => {
                let flags = reader.u8()?;
                let bias = if flags & 0x02 != 0 { reader.u16()? } else { 0 };
                let frame = self.pop();
                if let Some((node, frame)) = self.frame_operand(&frame, bias) {
                    display.goto_frame(&node, frame);
                    display.set_play_state(&node, flags & 0x01 != 0);
                }
            }
            Opcode::WaitForFrame => {
                let frame = reader.u16()? as u32;
                let skip = reader.u8()?;
                if display.loaded_frames(self.env.target()) <= frame {
                    return Ok(Flow::Jump(self.skip_instructions(inst.next, skip)?));
                }
            }
            Opcode::WaitForFrame2 => {
                let skip = reader.u8()?;
                let frame = self.pop();
                let loaded = match self.frame_operand(&frame, 0) {
                    Some((node, frame)) => display.loaded_frames(&node) > frame,
                    None => false,
                };
                if !loaded {
                    return Ok(Flow::Jump(self.skip_instructions(inst.next, skip)?));
                }
            }
            Opcode::SetTarget => {
                let path = reader.string()?;
                if path.is_empty() {
                    self.env.reset_target();
                } else if let Some(node) = self.env.find_target(&path) {
                    self.env.set_target(node);
                }
            }
            Opcode::SetTarget2 => {
                let target = self.pop();
                match &target {
                    Value::String(s) if s.is_empty() => self.env.reset_target(),
                    other => match self.env.target_of(other) {
                        Some(node) => self.env.set_target(node),
                        None => warn!(node = %other, "settarget2 to an unknown node"),
                    },
                }
            }

            // Arithmetic
            Opcode::Add => self.numeric(|a, b| a + b),
            Opcode::Subtract => self.numeric(|a, b| a - b),
            Opcode::Multiply => self.numeric(|a, b| a * b),
            Opcode::Divide => self.numeric(|a, b| a / b),
            Opcode::Modulo => self.numeric(|a, b| a % b),
            Opcode::Equals => self.binary(|a, b| Value::Bool(a.to_number() == b.to_number())),
            Opcode::Less => self.binary(|a, b| Value::Bool(a.to_number() < b.to_number())),
            Opcode::And => self.binary(|a, b| Value::Bool(a.to_bool() && b.to_bool())),
            Opcode::Or => self.binary(|a, b| Value::Bool(a.to_bool() || b.to_bool())),
            Opcode::Not => {
                let v = self.pop();
                self.push(!v.to_bool());
            }
            Opcode::Add2 => self.binary(|a, b| {
                if a.is_string() || b.is_string() {
                    Value::String(a.to_string_versioned(version) + &b.to_string_versioned(version))
                } else {
                    Value::Number(a.to_number() + b.to_number())
                }
            }),
            Opcode::Less2 => self.binary(|a, b| Value::Bool(a.less_than(&b, version))),
            Opcode::Greater => self.binary(|a, b| Value::Bool(b.less_than(&a, version))),
            Opcode::Equals2 => self.binary(|a, b| Value::Bool(a.loose_equals(&b))),
            Opcode::StrictEquals => self.binary(|a, b| Value::Bool(a.strict_equals(&b))),
            Opcode::Increment => {
                let n = self.pop().to_number();
                self.push(n + 1.0);
            }
            Opcode::Decrement => {
                let n = self.pop().to_number();
                self.push(n - 1.0);
            }
            Opcode::ToInteger => {
                let n = self.pop().to_int32();
                self.push(n);
            }
            Opcode::ToNumber => {
                let n = self.pop().to_number();
                self.push(n);
            }
            Opcode::ToString => {
                let s = self.pop_string();
                self.push(s);
            }
            Opcode::BitAnd => self.bitwise(|a, b| a & b),
            Opcode::BitOr => self.bitwise(|a, b| a | b),
            Opcode::BitXor => self.bitwise(|a, b| a ^ b),
            Opcode::BitLShift => self.bitwise(|a, b| a.wrapping_shl(b as u32 & 31)),
            Opcode::BitRShift => self.bitwise(|a, b| a.wrapping_shr(b as u32 & 31)),
            Opcode::BitURShift => self.binary(|a, b| {
                Value::Number((a.to_uint32() >> (b.to_uint32() & 31)) as f64)
            }),
            Opcode::RandomNumber => {
                let max = self.pop().to_int32().max(1) as u32;
                self.push(session.random(max) as f64);
            }
            Opcode::GetTime => self.push(session.elapsed_ms().floor()),

            // Strings
            Opcode::StringAdd => self.strings(|a, b| Value::String(format!("{}{}", a, b))),
            Opcode::StringEquals => self.strings(|a, b| Value::Bool(a == b)),
            Opcode::StringLess => self.strings(|a, b| Value::Bool(a < b)),
            Opcode::StringGreater => self.strings(|a, b| Value::Bool(a > b)),
            Opcode::StringLength => {
                let s = self.pop_string();
                self.push(s.len() as f64);
            }
            Opcode::MbStringLength => {
                let s = self.pop_string();
                self.push(s.chars().count() as f64);
            }
            Opcode::StringExtract | Opcode::MbStringExtract => {
                let count = self.pop().to_int32();
                let index = self.pop().to_int32();
                let s = self.pop_string();
                self.push(substring(&s, index, count));
            }
            Opcode::CharToAscii => {
                let s = self.pop_string();
                self.push(s.bytes().next().unwrap_or(0) as f64);
            }
            Opcode::MbCharToAscii => {
                let s = self.pop_string();
                self.push(s.chars().next().map(|c| c as u32).unwrap_or(0) as f64);
            }
            Opcode::AsciiToChar => {
                let code = self.pop().to_int32() as u8;
                let s = if code == 0 { String::new() } else { char::from(code).to_string() };
                self.push(s);
            }
            Opcode::MbAsciiToChar => {
                let code = self.pop().to_uint32();
                let s = char::from_u32(code).filter(|c| *c != '\0').map(String::from).unwrap_or_default();
                self.push(s);
            }

            // Stack
            Opcode::Push => {
                let (items, err) = decode_push(&code, inst);
                for item in items {
                    let value = self.literal(item);
                    self.push(value);
                }
                if let Some(err) = err {
                    error!(pc = inst.pc, %err, "malformed push literal, dropping the rest");
                }
            }
            Opcode::Pop => {
                self.pop();
            }
            Opcode::PushDuplicate => {
                let top = self.stack.peek();
                self.push(top);
            }
            Opcode::StackSwap => {
                let a = self.stack.peek_at(1);
                let b = self.stack.peek_at(0);
                self.stack.drop_n(2);
                self.push(b);
                self.push(a);
            }
            Opcode::StoreRegister => {
                let reg = reader.u8()?;
                let top = self.stack.peek();
                self.env.set_register(reg, top);
            }
            Opcode::ConstantPool => match code.declare_constant_pool(inst.pc) {
                Ok(()) => {}
                Err(PoolError::Redeclared { existing, requested }) => {
                    error!(existing, requested, "constant pool redeclared at a new offset, keeping the first");
                }
                Err(PoolError::Decode(source)) => {
                    return Err(VmError::StructuralDecode { offset: inst.pc, source }.into());
                }
            },

            // Variables
            Opcode::GetVariable => {
                let name = self.pop_string();
                let value = self.env.resolve(&name, &self.with_stack);
                self.push(value);
            }
            Opcode::SetVariable => {
                let value = self.pop();
                let name = self.pop_string();
                self.env.assign(&name, value, &self.with_stack);
            }
            Opcode::DefineLocal => {
                let value = self.pop();
                let name = self.pop_string();
                self.define_local(&name, value);
            }
            Opcode::DefineLocal2 => {
                let name = self.pop_string();
                if self.env.is_function() {
                    self.env.declare_local(&name);
                } else if !self.env.target().has_member(&name) {
                    self.env.target().set_member(&name, Value::Undefined);
                }
            }
            Opcode::Delete => {
                let name = self.pop_string();
                let object = self.pop();
                let deleted = object.member_holder().is_some_and(|holder| holder.delete_member(&name));
                self.push(deleted);
            }
            Opcode::Delete2 => {
                let name = self.pop_string();
                let deleted = self.env.delete_variable(&name, &self.with_stack);
                self.push(deleted);
            }

            // Members and properties
            Opcode::GetMember => {
                let name = self.pop_string();
                let object = self.pop();
                let value = match &object {
                    Value::String(s) if name == "length" => Value::Number(s.chars().count() as f64),
                    other => other
                        .member_holder()
                        .and_then(|holder| holder.get_member(&name))
                        .unwrap_or_default(),
                };
                self.push(value);
            }
            Opcode::SetMember => {
                let value = self.pop();
                let name = self.pop_string();
                let object = self.pop();
                match object.member_holder() {
                    Some(holder) => holder.set_member(&name, value),
                    None => warn!(member = %name, on = object.type_of(), "setmember on a primitive"),
                }
            }
            Opcode::GetProperty => {
                let index = self.pop();
                let target = self.pop();
                let value = match (self.node_operand(&target), self.property_name(&index)) {
                    (Some(node), Some(name)) => node.get_member(name).unwrap_or_default(),
                    _ => Value::Undefined,
                };
                self.push(value);
            }
            Opcode::SetProperty => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                if let (Some(node), Some(name)) = (self.node_operand(&target), self.property_name(&index)) {
                    node.set_member(name, value);
                }
            }
            Opcode::Enumerate | Opcode::Enumerate2 => {
                let object = if op == Opcode::Enumerate {
                    let name = self.pop_string();
                    self.env.resolve(&name, &self.with_stack)
                } else {
                    self.pop()
                };
                self.push(Value::Null);
                if let Some(holder) = object.member_holder() {
                    for key in holder.enumerate_members() {
                        self.push(key);
                    }
                }
            }
            Opcode::TypeOf => {
                let v = self.pop();
                self.push(v.type_of());
            }
            Opcode::TargetPath => {
                let v = self.pop();
                let path = v
                    .as_object()
                    .and_then(|obj| display.target_path(obj))
                    .map(Value::String)
                    .unwrap_or_default();
                self.push(path);
            }
            Opcode::InstanceOf => {
                let ctor = self.pop();
                let object = self.pop();
                let result = object.member_holder().is_some_and(|holder| holder.instance_of(&ctor));
                self.push(result);
            }
            Opcode::CastOp => {
                let object = self.pop();
                let ctor = self.pop();
                let matches = object.as_object().is_some_and(|obj| obj.instance_of(&ctor));
                self.push(if matches { object } else { Value::Null });
            }
            Opcode::ImplementsOp => {
                let ctor = self.pop();
                let count = self.stack.pop_count();
                self.stack.pop_n(count);
                debug!(class = %ctor, interfaces = count, "implements is not tracked");
            }
            Opcode::Extends => {
                let superclass = self.pop();
                let subclass = self.pop();
                let (Some(sup), Some(sub)) = (superclass.member_holder(), subclass.member_holder()) else {
                    warn!("extends needs two functions");
                    return Ok(Flow::Next);
                };
                let parent_proto = sup.get_member("prototype").and_then(|p| p.as_object().cloned());
                let proto = ObjectRef::new(PlainObject::new(parent_proto));
                proto.set_hidden("__constructor__", superclass);
                sub.set_hidden("prototype", Value::Object(proto));
            }

            // Construction
            Opcode::InitArray => {
                let count = self.stack.pop_count();
                let items = self.stack.pop_n(count);
                self.push(session.new_array(items));
            }
            Opcode::InitObject => {
                let count = self.stack.pop_count();
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop();
                    let name = self.pop_string();
                    pairs.push((name, value));
                }
                let object = session.new_object();
                for (name, value) in pairs.into_iter().rev() {
                    object.set_member(&name, value);
                }
                self.push(object);
            }
            Opcode::DefineFunction | Opcode::DefineFunction2 => return self.define_function(inst),

            // Calls
            Opcode::CallFunction | Opcode::NewObject => {
                let callee = self.pop();
                let count = self.stack.pop_count();
                let args = self.stack.pop_n(count);
                let func = if callee.is_callable() {
                    callee
                } else {
                    let name = callee.to_string_versioned(version);
                    self.env.resolve(&name, &self.with_stack)
                };
                let result = if op == Opcode::NewObject {
                    construct(&session, &func, &args)
                } else {
                    call_value(&session, &func, Some(self.env.target().clone()), &args)
                };
                return self.finish_call(result);
            }
            Opcode::CallMethod | Opcode::NewMethod => {
                let method = self.pop();
                let object = self.pop();
                let count = self.stack.pop_count();
                let args = self.stack.pop_n(count);
                let name = method.to_string_versioned(version);
                let (func, this) = if method.is_undefined() || name.is_empty() {
                    (object.clone(), None)
                } else {
                    let holder = object.member_holder();
                    let func = holder.as_ref().and_then(|h| h.get_member(&name)).unwrap_or_default();
                    (func, holder)
                };
                let result = if op == Opcode::NewMethod {
                    construct(&session, &func, &args)
                } else {
                    call_value(&session, &func, this, &args)
                };
                return self.finish_call(result);
            }
            Opcode::Return => return Ok(Flow::Return(self.pop())),
            Opcode::Call => {
                let frame = self.pop();
                warn!(frame = %frame, "frame actions are not supported");
            }

            // Control flow
            Opcode::Jump => {
                let offset = reader.i16()?;
                return Ok(self.branch(inst, offset));
            }
            Opcode::If => {
                let offset = reader.i16()?;
                if self.pop().to_bool() {
                    return Ok(self.branch(inst, offset));
                }
            }
            Opcode::With => {
                let size = reader.u16()? as usize;
                let object = self.pop();
                match object.member_holder() {
                    Some(holder) => {
                        if !self.with_stack.push(holder, inst.next + size) {
                            warn!(depth = self.with_stack.len(), "with nesting too deep, block not scoped");
                        }
                    }
                    None => warn!(on = object.type_of(), "with on a non-object"),
                }
            }
            Opcode::Try => return self.begin_try(inst, &mut reader),
            Opcode::Throw => {
                let value = self.pop();
                return self.throw(value);
            }

            // Display list
            Opcode::CloneSprite => {
                let depth = self.pop().to_int32();
                let name = self.pop_string();
                let source = self.pop();
                match self.env.target_of(&source) {
                    Some(node) => {
                        if display.duplicate(&node, &name, depth).is_none() {
                            warn!(name = %name, "clip could not be duplicated");
                        }
                    }
                    None => warn!(source = %source, "duplicate of an unknown clip"),
                }
            }
            Opcode::RemoveSprite => {
                let target = self.pop();
                if let Some(node) = self.env.target_of(&target) {
                    display.remove(&node);
                }
            }
            Opcode::StartDrag => {
                let target = self.pop();
                let lock_center = self.pop().to_bool();
                let constrained = self.pop().to_bool();
                let bounds = constrained.then(|| {
                    let y2 = self.pop().to_number();
                    let x2 = self.pop().to_number();
                    let y1 = self.pop().to_number();
                    let x1 = self.pop().to_number();
                    DragBounds { left: x1.min(x2), top: y1.min(y2), right: x1.max(x2), bottom: y1.max(y2) }
                });
                if let Some(node) = self.node_operand(&target) {
                    display.start_drag(&node, DragSpec { lock_center, bounds });
                }
            }
            Opcode::EndDrag => display.stop_drag(),

            // Host
            Opcode::Trace => {
                let message = self.pop_string();
                session.host().trace(&message);
            }
            Opcode::GetUrl => {
                let url = reader.string()?;
                let target = reader.string()?;
                self.get_url(url, target, 0);
            }
            Opcode::GetUrl2 => {
                let flags = reader.u8()?;
                let target = self.pop_string();
                let url = self.pop_string();
                self.get_url(url, target, flags);
            }
        }
        Ok(Flow::Next)
    }
}

/// Character substring with a 1-based start. A start below 1 is treated as
/// 1; a negative or oversized count takes the rest.
fn substring(s: &str, index: i32, count: i32) -> String {
    let len = s.chars().count();
    let start = index.max(1) as usize - 1;
    if start >= len {
        return String::new();
    }
    let rest = len - start;
    let take = if count < 0 || count as usize > rest { rest } else { count as usize };
    s.chars().skip(start).take(take).collect()
}

/// Run a whole buffer as timeline code on the root clip.
pub fn execute(session: &Rc<Session>, code: Rc<CodeBuffer>) -> VmResult<Completion> {
    let root = session.root();
    Activation::top_level(session.clone(), code, root).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::host::stage::Stage;
    use crate::host::{DisplayTree, HostBridge, LogHost, VmConfig};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        traces: RefCell<Vec<String>>,
        requests: RefCell<Vec<HostRequest>>,
    }

    impl HostBridge for Recorder {
        fn dispatch(&self, _root: &ObjectRef, request: HostRequest) {
            self.requests.borrow_mut().push(request);
        }

        fn trace(&self, message: &str) {
            self.traces.borrow_mut().push(message.to_string());
        }
    }

    fn session_with(version: u8) -> (Rc<Stage>, Rc<Session>) {
        let stage = Rc::new(Stage::new(10));
        let config = VmConfig { version, rng_seed: Some(7), ..VmConfig::default() };
        let session = Session::new(config, stage.clone(), Rc::new(LogHost));
        (stage, session)
    }

    fn run_source(source: &str) -> Completion {
        let (_, session) = session_with(7);
        let code = CodeBuffer::read(assemble(source).unwrap());
        execute(&session, code).unwrap()
    }

    fn eval(source: &str) -> Value {
        run_source(source).into_value()
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(eval("push 6, 7\nmultiply\nreturn"), Value::Number(42.0));
        assert_eq!(eval("push 7, 2\nmodulo\nreturn"), Value::Number(1.0));
        assert_eq!(eval("push \"3\", 4\nadd\nreturn"), Value::Number(7.0));
        assert_eq!(eval("push \"3\", 4\nadd2\nreturn"), Value::from("34"));
        assert_eq!(eval("push 1, 2\nless2\nreturn"), Value::Bool(true));
        assert_eq!(eval("push 1, 2\ngreater\nreturn"), Value::Bool(false));
        assert_eq!(eval("push \"1\", 1\nequals2\nreturn"), Value::Bool(true));
        assert_eq!(eval("push \"1\", 1\nstrictequals\nreturn"), Value::Bool(false));
        assert_eq!(eval("push -1, 28\nushr\nreturn"), Value::Number(15.0));
        assert_eq!(eval("push -7.5\nint\nreturn"), Value::Number(-7.0));
    }

    #[test]
    fn string_operations() {
        assert_eq!(eval("push \"hello\", 2, 3\nsubstring\nreturn"), Value::from("ell"));
        assert_eq!(eval("push \"hello\", 0, -1\nmbsubstring\nreturn"), Value::from("hello"));
        assert_eq!(eval("push \"hello\", 9, 1\nsubstring\nreturn"), Value::from(""));
        assert_eq!(eval("push \"h\u{e9}\"\nstringlength\nreturn"), Value::Number(3.0));
        assert_eq!(eval("push \"h\u{e9}\"\nmblength\nreturn"), Value::Number(2.0));
        assert_eq!(eval("push 65\nchr\nreturn"), Value::from("A"));
        assert_eq!(eval("push \"A\"\nord\nreturn"), Value::Number(65.0));
        assert_eq!(eval("push 0\nchr\nreturn"), Value::from(""));
        assert_eq!(eval("push \"a\", \"b\"\nstringless\nreturn"), Value::Bool(true));
        assert_eq!(eval("push \"a\", \"b\"\nconcat\nreturn"), Value::from("ab"));
        assert_eq!(eval("push \"abc\", \"length\"\ngetmember\nreturn"), Value::Number(3.0));
    }

    #[test]
    fn branches_and_loops() {
        let source = "
            push \"i\", 0
            setvariable
        top:
            push \"i\"
            getvariable
            push 5
            less2
            not
            if done
            push \"i\", \"i\"
            getvariable
            increment
            setvariable
            jump top
        done:
            push \"i\"
            getvariable
            return
        ";
        assert_eq!(eval(source), Value::Number(5.0));
    }

    #[test]
    fn branch_outside_range_aborts() {
        let code = CodeBuffer::read(vec![0x99, 0x02, 0x00, 0x00, 0x40]);
        let (_, session) = session_with(7);
        assert_eq!(execute(&session, code).unwrap(), Completion::Aborted);
    }

    #[test]
    fn branch_to_end_finishes() {
        assert_eq!(run_source("jump out\npush 1\nout:"), Completion::Finished);
    }

    #[test]
    fn unknown_opcodes_are_skipped() {
        let mut bytes = vec![0x01, 0xC0, 0x02, 0x00, 0xAA, 0xBB];
        bytes.extend(assemble("push 9\nreturn").unwrap());
        let (_, session) = session_with(7);
        let completion = execute(&session, CodeBuffer::read(bytes)).unwrap();
        assert_eq!(completion.into_value(), Value::Number(9.0));
    }

    #[test]
    fn truncated_instruction_aborts() {
        let (_, session) = session_with(7);
        let completion = execute(&session, CodeBuffer::read(vec![0x96, 0x09, 0x00, 0x07])).unwrap();
        assert_eq!(completion, Completion::Aborted);
    }

    #[test]
    fn underflow_yields_undefined() {
        assert_eq!(eval("pop\nreturn"), Value::Undefined);
    }

    #[test]
    fn pool_literals_and_bad_index() {
        assert_eq!(eval("constants \"a\" \"b\"\npush #1\nreturn"), Value::from("b"));
        assert_eq!(eval("constants \"a\"\npush ##5\nreturn"), Value::Number(0.0));
        assert_eq!(eval("push #0\nreturn"), Value::Number(0.0));
    }

    #[test]
    fn truncated_pool_is_structural() {
        let (_, session) = session_with(7);
        let code = CodeBuffer::read(vec![0x88, 0x01, 0x00, 0x05]);
        assert!(matches!(execute(&session, code), Err(VmError::StructuralDecode { offset: 0, .. })));
    }

    #[test]
    fn objects_and_arrays() {
        let source = "
            push \"b\", 2, \"a\", 1, 2
            initobject
            push \"a\"
            getmember
            return
        ";
        assert_eq!(eval(source), Value::Number(1.0));
        assert_eq!(eval("push 3, 2, 1, 3\ninitarray\ntostring\nreturn"), Value::from("1,2,3"));
        assert_eq!(eval("push 1, 0\ninitobject\ntypeof\nreturn"), Value::from("object"));
    }

    #[test]
    fn enumerate_pushes_null_then_names() {
        let (stage, session) = session_with(7);
        let root = stage.root();
        let code = CodeBuffer::read(assemble("push \"x\", 1, \"y\", 2, 2\ninitobject\nenumerate2").unwrap());
        let mut activation = Activation::top_level(session, code, root);
        activation.run().unwrap();
        let stack: Vec<String> = activation.stack().as_slice().iter().map(|v| v.to_string()).collect();
        assert_eq!(stack, vec!["null", "x", "y"]);
    }

    #[test]
    fn with_scope_reads_and_expires() {
        let source = "
            push \"name\", \"outer\"
            setvariable
            push \"name\", \"hi\", 1
            initobject
            with after
            push \"name\"
            getvariable
            store %1
            pop
        after:
            push \"name\"
            getvariable
            push %1
            concat
            return
        ";
        assert_eq!(eval(source), Value::from("outerhi"));
    }

    #[test]
    fn with_on_primitive_is_ignored() {
        let source = "
            push 5
            with after
            push \"x\"
            getvariable
            pop
        after:
            push 1
            return
        ";
        assert_eq!(eval(source), Value::Number(1.0));
    }

    #[test]
    fn try_catch_binds_and_resumes() {
        let source = "
            try \"e\" {
                push \"boom\"
                throw
                push \"unreachable\"
                return
            } catch {
                push \"caught\", \"e\"
                getvariable
                concat
                trace
            } finally {
                push \"finally\"
                trace
            }
            push \"after\"
            return
        ";
        let recorder = Rc::new(Recorder::default());
        let stage = Rc::new(Stage::new(1));
        let session = Session::new(VmConfig::default(), stage, recorder.clone());
        let code = CodeBuffer::read(assemble(source).unwrap());
        assert_eq!(execute(&session, code).unwrap().into_value(), Value::from("after"));
        assert_eq!(*recorder.traces.borrow(), vec!["caughtboom", "finally"]);
    }

    #[test]
    fn try_without_throw_skips_catch() {
        let source = "
            try %2 {
                push 1
                trace
            } catch {
                push 2
                trace
            }
            push %2
            return
        ";
        let recorder = Rc::new(Recorder::default());
        let session = Session::new(VmConfig::default(), Rc::new(Stage::new(1)), recorder.clone());
        let code = CodeBuffer::read(assemble(source).unwrap());
        assert_eq!(execute(&session, code).unwrap().into_value(), Value::Undefined);
        assert_eq!(*recorder.traces.borrow(), vec!["1"]);
    }

    #[test]
    fn uncaught_throw_reaches_caller() {
        let (_, session) = session_with(7);
        let code = CodeBuffer::read(assemble("push \"bad\"\nthrow").unwrap());
        match execute(&session, code) {
            Err(VmError::Thrown(value)) => assert_eq!(value, Value::from("bad")),
            other => panic!("expected a throw, got {:?}", other),
        }
    }

    fn run_recorded(source: &str) -> (VmResult<Completion>, Vec<String>) {
        let recorder = Rc::new(Recorder::default());
        let session = Session::new(VmConfig::default(), Rc::new(Stage::new(1)), recorder.clone());
        let code = CodeBuffer::read(assemble(source).unwrap());
        let result = execute(&session, code);
        let traces = recorder.traces.borrow().clone();
        (result, traces)
    }

    #[test]
    fn throw_from_catch_still_runs_finally() {
        let source = "
            try \"e\" {
                push \"first\"
                throw
            } catch {
                push \"second\"
                throw
            } finally {
                push \"finally\"
                trace
            }
            push \"after\"
            return
        ";
        let (result, traces) = run_recorded(source);
        assert!(matches!(result, Err(VmError::Thrown(Value::String(s))) if s == "second"));
        assert_eq!(traces, vec!["finally"]);
    }

    #[test]
    fn return_inside_try_runs_finally_first() {
        let source = "
            try \"e\" {
                push \"from try\"
                return
            } finally {
                push \"finally\"
                trace
            }
            push \"after\"
            return
        ";
        let (result, traces) = run_recorded(source);
        assert_eq!(result.unwrap(), Completion::Returned(Value::from("from try")));
        assert_eq!(traces, vec!["finally"]);
    }

    #[test]
    fn finally_rethrows_to_outer_catch() {
        let source = "
            try \"e\" {
                try \"e\" {
                    push \"inner\"
                    throw
                } finally {
                    push \"cleanup\"
                    trace
                }
            } catch {
                push \"e\"
                getvariable
                trace
            }
            push \"done\"
            return
        ";
        let (result, traces) = run_recorded(source);
        assert_eq!(result.unwrap(), Completion::Returned(Value::from("done")));
        assert_eq!(traces, vec!["cleanup", "inner"]);
    }

    #[test]
    fn stack_reads_below_the_top() {
        let mut stack = OperandStack::new();
        stack.push(Value::Number(1.0));
        stack.push(Value::Number(2.0));
        assert_eq!(stack.peek_at(0), Value::Number(2.0));
        assert_eq!(stack.peek_at(1), Value::Number(1.0));
        assert_eq!(stack.peek_at(2), Value::Undefined);
        stack.drop_n(1);
        assert_eq!(stack.peek(), Value::Number(1.0));
        stack.drop_n(5);
        assert!(stack.is_empty());
        assert_eq!(eval("push 10, 4\nswap\nsubtract\nreturn"), Value::Number(-6.0));
    }

    #[test]
    fn timeline_control() {
        let (stage, session) = session_with(7);
        let root = stage.root();
        stage.clip(&root).unwrap().set_label("menu", 6);
        let code = CodeBuffer::read(
            assemble("gotoframe 2\nnextframe\nstop\npush 1\nreturn").unwrap(),
        );
        execute(&session, code).unwrap();
        assert_eq!(stage.current_frame(&root), 3);
        assert!(!stage.clip(&root).unwrap().is_playing());

        let code = CodeBuffer::read(assemble("push \"menu\"\ngotoframe2 1").unwrap());
        execute(&session, code).unwrap();
        assert_eq!(stage.current_frame(&root), 6);
        assert!(stage.clip(&root).unwrap().is_playing());

        let code = CodeBuffer::read(assemble("push 3\ngotoframe2 0 2").unwrap());
        execute(&session, code).unwrap();
        assert_eq!(stage.current_frame(&root), 4);
    }

    #[test]
    fn wait_for_frame_skips_when_not_loaded() {
        let source = "
            waitforframe 50 1
            push \"skipped\"
            push \"kept\"
            return
        ";
        assert_eq!(eval(source), Value::from("kept"));
        let source = "
            waitforframe 2 1
            push \"loaded\"
            return
        ";
        assert_eq!(eval(source), Value::from("loaded"));
    }

    #[test]
    fn properties_by_index() {
        let (stage, session) = session_with(7);
        let root = stage.root();
        stage.add_clip(&root, "ball", 1, 1).unwrap();
        let source = "
            push \"/ball\", 0, 25
            setproperty
            push \"/ball\", 0
            getproperty
            push \"ball\", 13
            getproperty
            concat
            return
        ";
        let code = CodeBuffer::read(assemble(source).unwrap());
        assert_eq!(execute(&session, code).unwrap().into_value(), Value::from("25ball"));
    }

    #[test]
    fn set_target_switches_and_resets() {
        let (stage, session) = session_with(7);
        let root = stage.root();
        let menu = stage.add_clip(&root, "menu", 1, 1).unwrap();
        let source = "
            settarget \"menu\"
            push \"x\", 1
            setvariable
            settarget \"\"
            push \"y\", 2
            setvariable
        ";
        execute(&session, CodeBuffer::read(assemble(source).unwrap())).unwrap();
        assert_eq!(menu.get_member("x"), Some(Value::Number(1.0)));
        assert_eq!(root.get_member("y"), Some(Value::Number(2.0)));
        assert!(root.get_own("x").is_none());
    }

    #[test]
    fn host_requests() {
        let recorder = Rc::new(Recorder::default());
        let session = Session::new(VmConfig::default(), Rc::new(Stage::new(1)), recorder.clone());
        let source = "
            geturl \"FSCommand:quit\" \"now\"
            geturl \"\" \"_self\"
            push \"http://example.com\", \"_blank\"
            geturl2 0x82
        ";
        execute(&session, CodeBuffer::read(assemble(source).unwrap())).unwrap();
        let requests = recorder.requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], HostRequest::FsCommand { command: "quit".into(), args: "now".into() });
        assert_eq!(
            requests[1],
            HostRequest::Navigate {
                url: "http://example.com".into(),
                target: "_blank".into(),
                method: SendMethod::Post,
                load_target: false,
                load_variables: true,
            }
        );
    }

    #[test]
    fn drag_bounds_are_normalized() {
        let (stage, session) = session_with(7);
        let source = "
            push 10, 20, 0, 0, 1, 0, \"\"
            startdrag
        ";
        execute(&session, CodeBuffer::read(assemble(source).unwrap())).unwrap();
        let (_, spec) = stage.dragging().unwrap();
        assert_eq!(
            spec.bounds,
            Some(DragBounds { left: 0.0, top: 0.0, right: 10.0, bottom: 20.0 })
        );
        assert!(!spec.lock_center);
        execute(&session, CodeBuffer::read(assemble("stopdrag").unwrap())).unwrap();
        assert!(stage.dragging().is_none());
    }

    #[test]
    fn undefined_renders_by_version() {
        let (_, session) = session_with(6);
        let code = CodeBuffer::read(assemble("push undefined, \"!\"\nconcat\nreturn").unwrap());
        assert_eq!(execute(&session, code).unwrap().into_value(), Value::from("!"));
        assert_eq!(eval("push undefined, \"!\"\nconcat\nreturn"), Value::from("undefined!"));
    }

    #[test]
    fn substring_bounds() {
        assert_eq!(substring("abc", -3, 2), "ab");
        assert_eq!(substring("abc", 2, 99), "bc");
        assert_eq!(substring("abc", 4, 1), "");
        assert_eq!(substring("", 1, 1), "");
    }
}
