use std::cell::OnceCell;
use std::fmt::Write as _;
use std::ops::Range;
use std::rc::Rc;

use tracing::warn;

/// Substituted for pool entries whose terminator was never found.
pub const INVALID_CONSTANT: &str = "<invalid>";

macro_rules! opcodes {
    ($($name:ident = $byte:literal => $mnemonic:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    // ── Short form: opcode byte only ────────────────────────────────
    End = 0x00 => "end",
    NextFrame = 0x04 => "nextframe",
    PrevFrame = 0x05 => "prevframe",
    Play = 0x06 => "play",
    Stop = 0x07 => "stop",
    ToggleQuality = 0x08 => "togglequality",
    StopSounds = 0x09 => "stopsounds",
    Add = 0x0A => "add",
    Subtract = 0x0B => "subtract",
    Multiply = 0x0C => "multiply",
    Divide = 0x0D => "divide",
    Equals = 0x0E => "equals",
    Less = 0x0F => "less",
    And = 0x10 => "and",
    Or = 0x11 => "or",
    Not = 0x12 => "not",
    StringEquals = 0x13 => "stringequals",
    StringLength = 0x14 => "stringlength",
    StringExtract = 0x15 => "substring",
    Pop = 0x17 => "pop",
    ToInteger = 0x18 => "int",
    GetVariable = 0x1C => "getvariable",
    SetVariable = 0x1D => "setvariable",
    SetTarget2 = 0x20 => "settarget2",
    StringAdd = 0x21 => "concat",
    GetProperty = 0x22 => "getproperty",
    SetProperty = 0x23 => "setproperty",
    CloneSprite = 0x24 => "duplicateclip",
    RemoveSprite = 0x25 => "removeclip",
    Trace = 0x26 => "trace",
    StartDrag = 0x27 => "startdrag",
    EndDrag = 0x28 => "stopdrag",
    StringLess = 0x29 => "stringless",
    Throw = 0x2A => "throw",
    CastOp = 0x2B => "cast",
    ImplementsOp = 0x2C => "implements",
    RandomNumber = 0x30 => "random",
    MbStringLength = 0x31 => "mblength",
    CharToAscii = 0x32 => "ord",
    AsciiToChar = 0x33 => "chr",
    GetTime = 0x34 => "gettimer",
    MbStringExtract = 0x35 => "mbsubstring",
    MbCharToAscii = 0x36 => "mbord",
    MbAsciiToChar = 0x37 => "mbchr",
    Delete = 0x3A => "delete",
    Delete2 = 0x3B => "delete2",
    DefineLocal = 0x3C => "definelocal",
    CallFunction = 0x3D => "callfunction",
    Return = 0x3E => "return",
    Modulo = 0x3F => "modulo",
    NewObject = 0x40 => "new",
    DefineLocal2 = 0x41 => "declarelocal",
    InitArray = 0x42 => "initarray",
    InitObject = 0x43 => "initobject",
    TypeOf = 0x44 => "typeof",
    TargetPath = 0x45 => "targetpath",
    Enumerate = 0x46 => "enumerate",
    Add2 = 0x47 => "add2",
    Less2 = 0x48 => "less2",
    Equals2 = 0x49 => "equals2",
    ToNumber = 0x4A => "tonumber",
    ToString = 0x4B => "tostring",
    PushDuplicate = 0x4C => "dup",
    StackSwap = 0x4D => "swap",
    GetMember = 0x4E => "getmember",
    SetMember = 0x4F => "setmember",
    Increment = 0x50 => "increment",
    Decrement = 0x51 => "decrement",
    CallMethod = 0x52 => "callmethod",
    NewMethod = 0x53 => "newmethod",
    InstanceOf = 0x54 => "instanceof",
    Enumerate2 = 0x55 => "enumerate2",
    BitAnd = 0x60 => "bitand",
    BitOr = 0x61 => "bitor",
    BitXor = 0x62 => "bitxor",
    BitLShift = 0x63 => "shl",
    BitRShift = 0x64 => "shr",
    BitURShift = 0x65 => "ushr",
    StrictEquals = 0x66 => "strictequals",
    Greater = 0x67 => "greater",
    StringGreater = 0x68 => "stringgreater",
    Extends = 0x69 => "extends",

    // ── Long form: opcode, u16 length, operands ─────────────────────
    GotoFrame = 0x81 => "gotoframe",
    GetUrl = 0x83 => "geturl",
    StoreRegister = 0x87 => "store",
    ConstantPool = 0x88 => "constants",
    WaitForFrame = 0x8A => "waitforframe",
    SetTarget = 0x8B => "settarget",
    GotoLabel = 0x8C => "gotolabel",
    WaitForFrame2 = 0x8D => "waitforframe2",
    DefineFunction2 = 0x8E => "function2",
    Try = 0x8F => "try",
    With = 0x94 => "with",
    Push = 0x96 => "push",
    Jump = 0x99 => "jump",
    GetUrl2 = 0x9A => "geturl2",
    DefineFunction = 0x9B => "function",
    If = 0x9D => "if",
    Call = 0x9E => "call",
    GotoFrame2 = 0x9F => "gotoframe2",
}

impl Opcode {
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.mnemonic() == name)
    }

    pub fn is_long_form(self) -> bool {
        self as u8 & 0x80 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("instruction header at {pc} runs past offset {limit}")]
    TruncatedHeader { pc: usize, limit: usize },
    #[error("operands of instruction at {pc} run past offset {limit}")]
    OperandOverrun { pc: usize, limit: usize },
    #[error("operand truncated at offset {at}")]
    Truncated { at: usize },
    #[error("unterminated string at offset {at}")]
    UnterminatedString { at: usize },
    #[error("unknown push literal tag {tag} at offset {at}")]
    UnknownLiteral { tag: u8, at: usize },
    #[error("instruction at offset {at} is not a {expected}")]
    WrongOpcode { at: usize, expected: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("constant pool already declared at offset {existing}, ignoring declaration at {requested}")]
    Redeclared { existing: usize, requested: usize },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ── Constant pool ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    strings: Vec<String>,
}

impl ConstantPool {
    fn parse(code: &CodeBuffer, operands: Range<usize>) -> Result<ConstantPool, DecodeError> {
        let mut reader = OperandReader::new(code, operands);
        let count = reader.u16()? as usize;
        let mut strings = Vec::with_capacity(count.min(reader.remaining()));
        for parsed in 0..count {
            match reader.string() {
                Ok(s) => strings.push(s),
                Err(_) => {
                    warn!(declared = count, parsed, "constant pool runs past its declared length");
                    strings.resize(count, INVALID_CONSTANT.to_string());
                    break;
                }
            }
        }
        Ok(ConstantPool { strings })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

// ── Code buffer ─────────────────────────────────────────────────────

/// Immutable instruction bytes plus the pool the first `ConstantPool`
/// instruction executed against them declares.
#[derive(Debug)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    pool: OnceCell<(usize, ConstantPool)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub byte: u8,
    pub opcode: Option<Opcode>,
    pub operands: Range<usize>,
    pub next: usize,
}

impl CodeBuffer {
    /// Store the raw instruction stream; nothing is interpreted yet.
    pub fn read(bytes: impl Into<Vec<u8>>) -> Rc<CodeBuffer> {
        Rc::new(CodeBuffer { bytes: bytes.into(), pool: OnceCell::new() })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn pool(&self) -> Option<&ConstantPool> {
        self.pool.get().map(|(_, pool)| pool)
    }

    pub fn constant(&self, index: usize) -> Option<&str> {
        self.pool().and_then(|pool| pool.get(index))
    }

    /// Build the pool from the `ConstantPool` instruction at `offset`.
    ///
    /// Idempotent for the offset that built it; any other offset is refused
    /// and the existing pool stays.
    pub fn declare_constant_pool(&self, offset: usize) -> Result<(), PoolError> {
        if let Some((existing, _)) = self.pool.get() {
            if *existing == offset {
                return Ok(());
            }
            return Err(PoolError::Redeclared { existing: *existing, requested: offset });
        }
        let inst = self.decode_at(offset, self.bytes.len())?;
        if inst.opcode != Some(Opcode::ConstantPool) {
            return Err(DecodeError::WrongOpcode { at: offset, expected: "constant pool" }.into());
        }
        let pool = ConstantPool::parse(self, inst.operands)?;
        let _ = self.pool.set((offset, pool));
        Ok(())
    }

    /// Decode the instruction header at `pc`; operands must end by `limit`.
    pub fn decode_at(&self, pc: usize, limit: usize) -> Result<Instruction, DecodeError> {
        let limit = limit.min(self.bytes.len());
        if pc >= limit {
            return Err(DecodeError::Truncated { at: pc });
        }
        let byte = self.bytes[pc];
        let opcode = Opcode::from_byte(byte);
        if byte & 0x80 == 0 {
            return Ok(Instruction { pc, byte, opcode, operands: pc + 1..pc + 1, next: pc + 1 });
        }
        if pc + 3 > limit {
            return Err(DecodeError::TruncatedHeader { pc, limit });
        }
        let len = u16::from_le_bytes([self.bytes[pc + 1], self.bytes[pc + 2]]) as usize;
        let start = pc + 3;
        let next = start + len;
        if next > limit {
            return Err(DecodeError::OperandOverrun { pc, limit });
        }
        Ok(Instruction { pc, byte, opcode, operands: start..next, next })
    }

    pub fn operands(&self, inst: &Instruction) -> OperandReader<'_> {
        OperandReader::new(self, inst.operands.clone())
    }
}

/// Bounds-checked little-endian cursor over one instruction's operands.
pub struct OperandReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> OperandReader<'a> {
    pub fn new(code: &'a CodeBuffer, range: Range<usize>) -> Self {
        let end = range.end.min(code.bytes.len());
        OperandReader { bytes: &code.bytes, pos: range.start.min(end), end }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        if self.remaining() < N {
            return Err(DecodeError::Truncated { at: self.pos });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    /// Doubles are stored as two little-endian words, high word first.
    pub fn f64_swapped(&mut self) -> Result<f64, DecodeError> {
        let w: [u8; 8] = self.take()?;
        Ok(f64::from_le_bytes([w[4], w[5], w[6], w[7], w[0], w[1], w[2], w[3]]))
    }

    /// NUL-terminated string; the terminator must lie inside the operands.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let len = self.bytes[start..self.end]
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::UnterminatedString { at: start })?;
        self.pos = start + len + 1;
        Ok(String::from_utf8_lossy(&self.bytes[start..start + len]).into_owned())
    }
}

// ── Push literals ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PushItem {
    String(String),
    Float(f32),
    Null,
    Undefined,
    Register(u8),
    Bool(bool),
    Double(f64),
    Int(i32),
    Constant8(u8),
    Constant16(u16),
}

impl PushItem {
    pub fn tag(&self) -> u8 {
        match self {
            PushItem::String(_) => 0,
            PushItem::Float(_) => 1,
            PushItem::Null => 2,
            PushItem::Undefined => 3,
            PushItem::Register(_) => 4,
            PushItem::Bool(_) => 5,
            PushItem::Double(_) => 6,
            PushItem::Int(_) => 7,
            PushItem::Constant8(_) => 8,
            PushItem::Constant16(_) => 9,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            PushItem::String(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            PushItem::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
            PushItem::Null | PushItem::Undefined => {}
            PushItem::Register(r) => out.push(*r),
            PushItem::Bool(b) => out.push(*b as u8),
            PushItem::Double(d) => {
                let b = d.to_le_bytes();
                out.extend_from_slice(&[b[4], b[5], b[6], b[7], b[0], b[1], b[2], b[3]]);
            }
            PushItem::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
            PushItem::Constant8(i) => out.push(*i),
            PushItem::Constant16(i) => out.extend_from_slice(&i.to_le_bytes()),
        }
    }

    fn decode(reader: &mut OperandReader<'_>) -> Result<PushItem, DecodeError> {
        let at = reader.position();
        let tag = reader.u8()?;
        Ok(match tag {
            0 => PushItem::String(reader.string()?),
            1 => PushItem::Float(reader.f32()?),
            2 => PushItem::Null,
            3 => PushItem::Undefined,
            4 => PushItem::Register(reader.u8()?),
            5 => PushItem::Bool(reader.u8()? != 0),
            6 => PushItem::Double(reader.f64_swapped()?),
            7 => PushItem::Int(reader.i32()?),
            8 => PushItem::Constant8(reader.u8()?),
            9 => PushItem::Constant16(reader.u16()?),
            _ => return Err(DecodeError::UnknownLiteral { tag, at }),
        })
    }
}

/// Decode every literal of a push instruction. Items before a malformed one
/// are still returned alongside the error.
pub fn decode_push(code: &CodeBuffer, inst: &Instruction) -> (Vec<PushItem>, Option<DecodeError>) {
    let mut reader = code.operands(inst);
    let mut items = Vec::new();
    while !reader.is_empty() {
        match PushItem::decode(&mut reader) {
            Ok(item) => items.push(item),
            Err(err) => return (items, Some(err)),
        }
    }
    (items, None)
}

// ── Disassembly ─────────────────────────────────────────────────────

fn format_push_item(item: &PushItem) -> String {
    match item {
        PushItem::String(s) => format!("{:?}", s),
        PushItem::Float(f) => format!("{}f", f),
        PushItem::Null => "null".to_string(),
        PushItem::Undefined => "undefined".to_string(),
        PushItem::Register(r) => format!("%{}", r),
        PushItem::Bool(b) => b.to_string(),
        PushItem::Double(d) => format!("{:?}", d),
        PushItem::Int(i) => i.to_string(),
        PushItem::Constant8(i) => format!("#{}", i),
        PushItem::Constant16(i) => format!("##{}", i),
    }
}

/// Render one decoded instruction as `mnemonic operands`.
pub fn describe(code: &CodeBuffer, inst: &Instruction) -> String {
    let Some(op) = inst.opcode else {
        return format!("op_{:#04x}", inst.byte);
    };
    let mut out = op.mnemonic().to_string();
    let mut reader = code.operands(inst);
    let detail: Result<String, DecodeError> = (|| {
        Ok(match op {
            Opcode::Push => {
                let (items, err) = decode_push(code, inst);
                let mut text =
                    items.iter().map(format_push_item).collect::<Vec<_>>().join(", ");
                if let Some(err) = err {
                    let _ = write!(text, " <{}>", err);
                }
                text
            }
            Opcode::Jump | Opcode::If => {
                let offset = reader.i16()?;
                format!("{:04x}", inst.next as isize + offset as isize)
            }
            Opcode::With => format!("{:04x}", inst.next + reader.u16()? as usize),
            Opcode::ConstantPool => {
                let count = reader.u16()?;
                let mut names = Vec::new();
                for _ in 0..count {
                    names.push(format!("{:?}", reader.string()?));
                }
                names.join(" ")
            }
            Opcode::DefineFunction => {
                let name = reader.string()?;
                let count = reader.u16()?;
                let mut params = Vec::new();
                for _ in 0..count {
                    params.push(format!("{:?}", reader.string()?));
                }
                let body = reader.u16()?;
                format!("{:?} ({}) [{} bytes]", name, params.join(" "), body)
            }
            Opcode::DefineFunction2 => {
                let name = reader.string()?;
                let count = reader.u16()?;
                let registers = reader.u8()?;
                let flags = reader.u16()?;
                let mut params = Vec::new();
                for _ in 0..count {
                    let reg = reader.u8()?;
                    let param = reader.string()?;
                    params.push(if reg == 0 {
                        format!("{:?}", param)
                    } else {
                        format!("%{} {:?}", reg, param)
                    });
                }
                let body = reader.u16()?;
                format!(
                    "{:?} {} {:#x} ({}) [{} bytes]",
                    name,
                    registers,
                    flags,
                    params.join(" "),
                    body
                )
            }
            Opcode::GotoLabel | Opcode::SetTarget => format!("{:?}", reader.string()?),
            Opcode::GetUrl => format!("{:?} {:?}", reader.string()?, reader.string()?),
            Opcode::StoreRegister => format!("%{}", reader.u8()?),
            Opcode::GotoFrame => reader.u16()?.to_string(),
            Opcode::WaitForFrame => format!("{} {}", reader.u16()?, reader.u8()?),
            Opcode::WaitForFrame2 | Opcode::GetUrl2 | Opcode::GotoFrame2 => {
                reader.u8()?.to_string()
            }
            _ => code.bytes[inst.operands.clone()]
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" "),
        })
    })();
    match detail {
        Ok(detail) if !detail.is_empty() => {
            out.push(' ');
            out.push_str(&detail);
        }
        Ok(_) => {}
        Err(err) => {
            let _ = write!(out, " <{}>", err);
        }
    }
    out
}

/// One line per instruction. Stops at the first undecodable header.
pub fn disassemble(code: &CodeBuffer) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        match code.decode_at(pc, code.len()) {
            Ok(inst) => {
                lines.push(format!("{:04x}: {}", pc, describe(code, &inst)));
                pc = inst.next;
            }
            Err(err) => {
                lines.push(format!("{:04x}: <{}>", pc, err));
                break;
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_instruction(strings: &[&str], declared_len: Option<u16>) -> Vec<u8> {
        let mut operands = (strings.len() as u16).to_le_bytes().to_vec();
        for s in strings {
            operands.extend_from_slice(s.as_bytes());
            operands.push(0);
        }
        let len = declared_len.unwrap_or(operands.len() as u16);
        let mut out = vec![Opcode::ConstantPool as u8];
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&operands);
        out
    }

    #[test]
    fn opcode_table_is_consistent() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_byte(*op as u8), Some(*op));
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(*op));
        }
        assert_eq!(Opcode::from_byte(0x01), None);
        assert!(Opcode::Push.is_long_form());
        assert!(!Opcode::Add2.is_long_form());
    }

    #[test]
    fn decode_short_and_long_forms() {
        let code = CodeBuffer::read(vec![0x47, 0x96, 0x02, 0x00, 0x02, 0x03, 0x00]);
        let add = code.decode_at(0, code.len()).unwrap();
        assert_eq!(add.opcode, Some(Opcode::Add2));
        assert_eq!(add.next, 1);
        let push = code.decode_at(1, code.len()).unwrap();
        assert_eq!(push.opcode, Some(Opcode::Push));
        assert_eq!(push.operands, 4..6);
        assert_eq!(push.next, 6);
    }

    #[test]
    fn decode_rejects_overrun() {
        let code = CodeBuffer::read(vec![0x96, 0x09, 0x00, 0x02]);
        assert_eq!(
            code.decode_at(0, code.len()),
            Err(DecodeError::OperandOverrun { pc: 0, limit: 4 })
        );
        let code = CodeBuffer::read(vec![0x96, 0x09]);
        assert!(matches!(code.decode_at(0, 2), Err(DecodeError::TruncatedHeader { .. })));
    }

    #[test]
    fn push_literals_decode_every_tag() {
        let items = vec![
            PushItem::String("hi".into()),
            PushItem::Float(1.5),
            PushItem::Null,
            PushItem::Undefined,
            PushItem::Register(2),
            PushItem::Bool(true),
            PushItem::Double(-1234.5678),
            PushItem::Int(-7),
            PushItem::Constant8(3),
            PushItem::Constant16(300),
        ];
        let mut operands = Vec::new();
        for item in &items {
            item.encode(&mut operands);
        }
        let mut bytes = vec![Opcode::Push as u8];
        bytes.extend_from_slice(&(operands.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&operands);
        let code = CodeBuffer::read(bytes);
        let inst = code.decode_at(0, code.len()).unwrap();
        let (decoded, err) = decode_push(&code, &inst);
        assert_eq!(err, None);
        assert_eq!(decoded, items);
    }

    #[test]
    fn double_words_are_swapped() {
        let mut out = Vec::new();
        PushItem::Double(1.0).encode(&mut out);
        // 1.0 = 0x3FF0_0000_0000_0000; the high word comes first.
        assert_eq!(out, vec![6, 0x00, 0x00, 0xF0, 0x3F, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_literal_tag_keeps_earlier_items() {
        let code = CodeBuffer::read(vec![0x96, 0x04, 0x00, 0x02, 0x0B, 0x03, 0x03]);
        let inst = code.decode_at(0, code.len()).unwrap();
        let (items, err) = decode_push(&code, &inst);
        assert_eq!(items, vec![PushItem::Null]);
        assert_eq!(err, Some(DecodeError::UnknownLiteral { tag: 0x0B, at: 4 }));
    }

    #[test]
    fn constant_pool_declares_once() {
        let mut bytes = pool_instruction(&["a", "b"], None);
        let second = bytes.len();
        bytes.extend(pool_instruction(&["z"], None));
        let code = CodeBuffer::read(bytes);

        code.declare_constant_pool(0).unwrap();
        assert_eq!(code.constant(1), Some("b"));
        code.declare_constant_pool(0).unwrap();
        assert!(matches!(
            code.declare_constant_pool(second),
            Err(PoolError::Redeclared { existing: 0, .. })
        ));
        assert_eq!(code.constant(0), Some("a"));
        assert_eq!(code.pool().map(ConstantPool::len), Some(2));
    }

    #[test]
    fn constant_pool_fills_unterminated_entries() {
        // Declared length cuts the second string short.
        let code = CodeBuffer::read(pool_instruction(&["ab", "cd", "ef"], Some(6)));
        code.declare_constant_pool(0).unwrap();
        assert_eq!(code.constant(0), Some("ab"));
        assert_eq!(code.constant(1), Some(INVALID_CONSTANT));
        assert_eq!(code.constant(2), Some(INVALID_CONSTANT));
    }

    #[test]
    fn constant_pool_without_count_is_structural() {
        let code = CodeBuffer::read(vec![0x88, 0x01, 0x00, 0x05]);
        assert!(matches!(
            code.declare_constant_pool(0),
            Err(PoolError::Decode(DecodeError::Truncated { .. }))
        ));
        assert!(code.pool().is_none());
    }

    #[test]
    fn disassembly_tolerates_garbage() {
        let code = CodeBuffer::read(vec![0x01, 0x99, 0x02, 0x00, 0xFE, 0xFF, 0x96, 0x05]);
        let lines = disassemble(&code);
        assert_eq!(lines[0], "0000: op_0x01");
        assert_eq!(lines[1], "0001: jump 0004");
        assert!(lines[2].starts_with("0006: <"));
    }
}
