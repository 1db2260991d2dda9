//! Text assembler for action buffers.
//!
//! ```text
//! constants "x"
//!     push #0, 10
//!     setvariable
//! loop:
//!     push #0
//!     getvariable
//!     if done
//!     jump loop
//! done:
//!     function2 "f" 2 0x04 (%1 "a") { push %1 return }
//! ```

use std::collections::HashMap;

use crate::bytecode::{Opcode, PushItem};

pub mod lexer;

use lexer::{LexError, Token};

#[derive(Debug, thiserror::Error)]
pub enum AsmError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("at position {position}: expected {expected}, found {found}")]
    Unexpected { position: usize, expected: &'static str, found: String },
    #[error("at position {position}: unknown instruction '{name}'")]
    UnknownInstruction { position: usize, name: String },
    #[error("label '{0}' defined twice")]
    DuplicateLabel(String),
    #[error("label '{0}' is never defined")]
    UndefinedLabel(String),
    #[error("branch to '{label}' needs offset {offset}, outside the 16-bit range")]
    BranchOutOfRange { label: String, offset: i64 },
    #[error("operands of {len} bytes do not fit a 16-bit length")]
    OperandTooLong { len: usize },
    #[error("{what} {value} out of range")]
    OutOfRange { what: &'static str, value: i64 },
}

// ── Builder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    /// Signed offset for `jump` / `if`.
    Branch,
    /// Unsigned block size for `with`.
    Size,
}

#[derive(Debug)]
struct Fixup {
    at: usize,
    base: usize,
    label: String,
    kind: FixupKind,
}

/// Open function body awaiting its length.
#[derive(Debug)]
pub struct BlockMark {
    len_at: usize,
    body_start: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatchBinding {
    Name(String),
    Register(u8),
}

/// Open try statement awaiting its block sizes.
#[derive(Debug)]
pub struct TryMark {
    flags_at: usize,
    register_catch: bool,
    try_start: usize,
    catch_start: Option<usize>,
    finally_start: Option<usize>,
}

/// Builds an action buffer instruction by instruction. Branch targets are
/// labels resolved in `finish`.
#[derive(Debug, Default)]
pub struct Assembler {
    out: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    pub fn position(&self) -> usize {
        self.out.len()
    }

    fn patch_u16(&mut self, at: usize, value: u16) {
        self.out[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn size_since(&self, start: usize) -> Result<u16, AsmError> {
        let len = self.out.len() - start;
        u16::try_from(len).map_err(|_| AsmError::OperandTooLong { len })
    }

    /// Any instruction without operands.
    pub fn op(&mut self, op: Opcode) {
        self.out.push(op as u8);
        if op.is_long_form() {
            self.out.extend_from_slice(&[0, 0]);
        }
    }

    pub fn long(&mut self, op: Opcode, operands: &[u8]) -> Result<(), AsmError> {
        let len = u16::try_from(operands.len())
            .map_err(|_| AsmError::OperandTooLong { len: operands.len() })?;
        self.out.push(op as u8);
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(operands);
        Ok(())
    }

    pub fn push(&mut self, items: &[PushItem]) -> Result<(), AsmError> {
        let mut operands = Vec::new();
        for item in items {
            item.encode(&mut operands);
        }
        self.long(Opcode::Push, &operands)
    }

    pub fn constants(&mut self, strings: &[String]) -> Result<(), AsmError> {
        let count = u16::try_from(strings.len())
            .map_err(|_| AsmError::OutOfRange { what: "constant count", value: strings.len() as i64 })?;
        let mut operands = count.to_le_bytes().to_vec();
        for s in strings {
            push_cstr(&mut operands, s);
        }
        self.long(Opcode::ConstantPool, &operands)
    }

    pub fn label(&mut self, name: &str) -> Result<(), AsmError> {
        if self.labels.insert(name.to_string(), self.out.len()).is_some() {
            return Err(AsmError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    fn with_fixup(&mut self, op: Opcode, label: &str, kind: FixupKind) {
        self.out.extend_from_slice(&[op as u8, 2, 0]);
        let at = self.out.len();
        self.out.extend_from_slice(&[0, 0]);
        self.fixups.push(Fixup { at, base: at + 2, label: label.to_string(), kind });
    }

    pub fn jump(&mut self, label: &str) {
        self.with_fixup(Opcode::Jump, label, FixupKind::Branch);
    }

    pub fn branch_if(&mut self, label: &str) {
        self.with_fixup(Opcode::If, label, FixupKind::Branch);
    }

    /// `with` block on the popped object, ending at `label`.
    pub fn with_block(&mut self, label: &str) {
        self.with_fixup(Opcode::With, label, FixupKind::Size);
    }

    pub fn begin_function(&mut self, name: &str, params: &[String]) -> Result<BlockMark, AsmError> {
        let mut operands = Vec::new();
        push_cstr(&mut operands, name);
        operands.extend_from_slice(&param_count(params.len())?.to_le_bytes());
        for param in params {
            push_cstr(&mut operands, param);
        }
        operands.extend_from_slice(&[0, 0]);
        self.long(Opcode::DefineFunction, &operands)?;
        Ok(BlockMark { len_at: self.out.len() - 2, body_start: self.out.len() })
    }

    /// `params` pairs a register (0 for a named local) with each name.
    pub fn begin_function2(
        &mut self,
        name: &str,
        registers: u8,
        flags: u16,
        params: &[(u8, String)],
    ) -> Result<BlockMark, AsmError> {
        let mut operands = Vec::new();
        push_cstr(&mut operands, name);
        operands.extend_from_slice(&param_count(params.len())?.to_le_bytes());
        operands.push(registers);
        operands.extend_from_slice(&flags.to_le_bytes());
        for (register, param) in params {
            operands.push(*register);
            push_cstr(&mut operands, param);
        }
        operands.extend_from_slice(&[0, 0]);
        self.long(Opcode::DefineFunction2, &operands)?;
        Ok(BlockMark { len_at: self.out.len() - 2, body_start: self.out.len() })
    }

    pub fn end_function(&mut self, mark: BlockMark) -> Result<(), AsmError> {
        let len = self.size_since(mark.body_start)?;
        self.patch_u16(mark.len_at, len);
        Ok(())
    }

    pub fn begin_try(&mut self, catch: &CatchBinding) -> Result<TryMark, AsmError> {
        let mut operands = vec![0; 7];
        match catch {
            CatchBinding::Name(name) => push_cstr(&mut operands, name),
            CatchBinding::Register(reg) => operands.push(*reg),
        }
        self.long(Opcode::Try, &operands)?;
        let header = self.out.len() - operands.len();
        Ok(TryMark {
            flags_at: header,
            register_catch: matches!(catch, CatchBinding::Register(_)),
            try_start: self.out.len(),
            catch_start: None,
            finally_start: None,
        })
    }

    pub fn begin_catch(&mut self, mark: &mut TryMark) {
        mark.catch_start = Some(self.out.len());
    }

    pub fn begin_finally(&mut self, mark: &mut TryMark) {
        mark.finally_start = Some(self.out.len());
    }

    pub fn end_try(&mut self, mark: TryMark) -> Result<(), AsmError> {
        let end = self.out.len();
        let try_end = mark.catch_start.or(mark.finally_start).unwrap_or(end);
        let catch_end = mark.finally_start.unwrap_or(end);
        let sizes = [
            try_end - mark.try_start,
            mark.catch_start.map_or(0, |start| catch_end - start),
            mark.finally_start.map_or(0, |start| end - start),
        ];
        let mut flags = 0u8;
        if mark.catch_start.is_some() {
            flags |= 0x01;
        }
        if mark.finally_start.is_some() {
            flags |= 0x02;
        }
        if mark.register_catch {
            flags |= 0x04;
        }
        self.out[mark.flags_at] = flags;
        for (i, size) in sizes.into_iter().enumerate() {
            let size = u16::try_from(size).map_err(|_| AsmError::OperandTooLong { len: size })?;
            self.patch_u16(mark.flags_at + 1 + i * 2, size);
        }
        Ok(())
    }

    pub fn store_register(&mut self, register: u8) -> Result<(), AsmError> {
        self.long(Opcode::StoreRegister, &[register])
    }

    pub fn goto_frame(&mut self, frame: u16) -> Result<(), AsmError> {
        self.long(Opcode::GotoFrame, &frame.to_le_bytes())
    }

    pub fn goto_label(&mut self, label: &str) -> Result<(), AsmError> {
        self.long(Opcode::GotoLabel, &cstr(label))
    }

    pub fn set_target(&mut self, path: &str) -> Result<(), AsmError> {
        self.long(Opcode::SetTarget, &cstr(path))
    }

    pub fn get_url(&mut self, url: &str, target: &str) -> Result<(), AsmError> {
        let mut operands = cstr(url);
        push_cstr(&mut operands, target);
        self.long(Opcode::GetUrl, &operands)
    }

    pub fn get_url2(&mut self, flags: u8) -> Result<(), AsmError> {
        self.long(Opcode::GetUrl2, &[flags])
    }

    pub fn goto_frame2(&mut self, play: bool, bias: Option<u16>) -> Result<(), AsmError> {
        let mut operands = vec![play as u8];
        if let Some(bias) = bias {
            operands[0] |= 0x02;
            operands.extend_from_slice(&bias.to_le_bytes());
        }
        self.long(Opcode::GotoFrame2, &operands)
    }

    pub fn wait_for_frame(&mut self, frame: u16, skip: u8) -> Result<(), AsmError> {
        let mut operands = frame.to_le_bytes().to_vec();
        operands.push(skip);
        self.long(Opcode::WaitForFrame, &operands)
    }

    pub fn wait_for_frame2(&mut self, skip: u8) -> Result<(), AsmError> {
        self.long(Opcode::WaitForFrame2, &[skip])
    }

    /// Bytes copied verbatim, for deliberately malformed input.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn finish(mut self) -> Result<Vec<u8>, AsmError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| AsmError::UndefinedLabel(fixup.label.clone()))?;
            let offset = target as i64 - fixup.base as i64;
            let encoded = match fixup.kind {
                FixupKind::Branch => i16::try_from(offset)
                    .map(|o| o as u16)
                    .map_err(|_| AsmError::BranchOutOfRange { label: fixup.label.clone(), offset })?,
                FixupKind::Size => u16::try_from(offset)
                    .map_err(|_| AsmError::BranchOutOfRange { label: fixup.label.clone(), offset })?,
            };
            self.patch_u16(fixup.at, encoded);
        }
        Ok(self.out)
    }
}

fn cstr(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    push_cstr(&mut out, s);
    out
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn param_count(n: usize) -> Result<u16, AsmError> {
    u16::try_from(n).map_err(|_| AsmError::OutOfRange { what: "parameter count", value: n as i64 })
}

// ── Text front end ──────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(Token, std::ops::Range<usize>)>,
    pos: usize,
    end: usize,
    asm: Assembler,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, span)| span.start).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn unexpected<T>(&self, expected: &'static str) -> Result<T, AsmError> {
        let found = match self.peek() {
            Some(token) => format!("{:?}", token),
            None => "end of input".to_string(),
        };
        Err(AsmError::Unexpected { position: self.position(), expected, found })
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), AsmError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            self.unexpected(expected)
        }
    }

    fn string(&mut self) -> Result<String, AsmError> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => self.unexpected("a string"),
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, AsmError> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => self.unexpected(expected),
        }
    }

    fn int(&mut self) -> Result<i64, AsmError> {
        match self.peek() {
            Some(Token::Int(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            _ => self.unexpected("an integer"),
        }
    }

    fn int_as<T: TryFrom<i64>>(&mut self, what: &'static str) -> Result<T, AsmError> {
        let value = self.int()?;
        T::try_from(value).map_err(|_| AsmError::OutOfRange { what, value })
    }

    fn register(&mut self) -> Result<u8, AsmError> {
        match self.peek() {
            Some(Token::Register(r)) => {
                let value = *r;
                self.pos += 1;
                u8::try_from(value).map_err(|_| AsmError::OutOfRange { what: "register", value })
            }
            _ => self.unexpected("a register"),
        }
    }

    fn program(&mut self) -> Result<(), AsmError> {
        while self.peek().is_some() {
            self.statement()?;
        }
        Ok(())
    }

    fn block(&mut self) -> Result<(), AsmError> {
        self.expect(Token::LBrace, "'{'")?;
        while self.peek() != Some(&Token::RBrace) {
            if self.peek().is_none() {
                return self.unexpected("'}'");
            }
            self.statement()?;
        }
        self.pos += 1;
        Ok(())
    }

    fn literal(&mut self) -> Result<PushItem, AsmError> {
        let position = self.position();
        let item = match self.next() {
            Some(Token::Str(s)) => PushItem::String(s),
            Some(Token::Int(n)) => match i32::try_from(n) {
                Ok(n) => PushItem::Int(n),
                Err(_) => PushItem::Double(n as f64),
            },
            Some(Token::Double(d)) => PushItem::Double(d),
            Some(Token::Single(f)) => PushItem::Float(f),
            Some(Token::Register(r)) => PushItem::Register(
                u8::try_from(r).map_err(|_| AsmError::OutOfRange { what: "register", value: r })?,
            ),
            Some(Token::Pool(i)) => PushItem::Constant8(
                u8::try_from(i).map_err(|_| AsmError::OutOfRange { what: "pool index", value: i })?,
            ),
            Some(Token::WidePool(i)) => PushItem::Constant16(
                u16::try_from(i).map_err(|_| AsmError::OutOfRange { what: "pool index", value: i })?,
            ),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => PushItem::Bool(true),
                "false" => PushItem::Bool(false),
                "null" => PushItem::Null,
                "undefined" => PushItem::Undefined,
                "NaN" => PushItem::Double(f64::NAN),
                "Infinity" => PushItem::Double(f64::INFINITY),
                _ => {
                    self.pos -= 1;
                    return self.unexpected("a literal");
                }
            },
            other => {
                return Err(AsmError::Unexpected {
                    position,
                    expected: "a literal",
                    found: other.map_or("end of input".to_string(), |t| format!("{:?}", t)),
                });
            }
        };
        Ok(item)
    }

    fn statement(&mut self) -> Result<(), AsmError> {
        let position = self.position();
        let name = self.ident("an instruction or label")?;
        if self.peek() == Some(&Token::Colon) {
            self.pos += 1;
            return self.asm.label(&name);
        }

        match name.as_str() {
            "push" => {
                let mut items = vec![self.literal()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    items.push(self.literal()?);
                }
                self.asm.push(&items)
            }
            "constants" => {
                let mut strings = Vec::new();
                while let Some(Token::Str(_)) = self.peek() {
                    strings.push(self.string()?);
                }
                self.asm.constants(&strings)
            }
            "jump" => {
                let label = self.ident("a label")?;
                self.asm.jump(&label);
                Ok(())
            }
            "if" => {
                let label = self.ident("a label")?;
                self.asm.branch_if(&label);
                Ok(())
            }
            "with" => {
                let label = self.ident("a label")?;
                self.asm.with_block(&label);
                Ok(())
            }
            "function" => {
                let name = self.string()?;
                self.expect(Token::LParen, "'('")?;
                let mut params = Vec::new();
                while let Some(Token::Str(_)) = self.peek() {
                    params.push(self.string()?);
                }
                self.expect(Token::RParen, "')'")?;
                let mark = self.asm.begin_function(&name, &params)?;
                self.block()?;
                self.asm.end_function(mark)
            }
            "function2" => {
                let name = self.string()?;
                let registers = self.int_as::<u8>("register count")?;
                let flags = self.int_as::<u16>("function flags")?;
                self.expect(Token::LParen, "'('")?;
                let mut params = Vec::new();
                loop {
                    let register = match self.peek() {
                        Some(Token::Register(_)) => self.register()?,
                        Some(Token::Str(_)) => 0,
                        _ => break,
                    };
                    params.push((register, self.string()?));
                }
                self.expect(Token::RParen, "')'")?;
                let mark = self.asm.begin_function2(&name, registers, flags, &params)?;
                self.block()?;
                self.asm.end_function(mark)
            }
            "try" => {
                let binding = match self.peek() {
                    Some(Token::Register(_)) => CatchBinding::Register(self.register()?),
                    _ => CatchBinding::Name(self.string()?),
                };
                let mut mark = self.asm.begin_try(&binding)?;
                self.block()?;
                if matches!(self.peek(), Some(Token::Ident(w)) if w == "catch")
                    && self.peek_at(1) == Some(&Token::LBrace)
                {
                    self.pos += 1;
                    self.asm.begin_catch(&mut mark);
                    self.block()?;
                }
                if matches!(self.peek(), Some(Token::Ident(w)) if w == "finally")
                    && self.peek_at(1) == Some(&Token::LBrace)
                {
                    self.pos += 1;
                    self.asm.begin_finally(&mut mark);
                    self.block()?;
                }
                self.asm.end_try(mark)
            }
            "gotoframe" => {
                let frame = self.int_as::<u16>("frame")?;
                self.asm.goto_frame(frame)
            }
            "gotolabel" => {
                let label = self.string()?;
                self.asm.goto_label(&label)
            }
            "settarget" => {
                let path = self.string()?;
                self.asm.set_target(&path)
            }
            "geturl" => {
                let url = self.string()?;
                let target = self.string()?;
                self.asm.get_url(&url, &target)
            }
            "geturl2" => {
                let flags = self.int_as::<u8>("geturl2 flags")?;
                self.asm.get_url2(flags)
            }
            "gotoframe2" => {
                let play = self.int()? != 0;
                let bias = match self.peek() {
                    Some(Token::Int(_)) => Some(self.int_as::<u16>("scene bias")?),
                    _ => None,
                };
                self.asm.goto_frame2(play, bias)
            }
            "store" => {
                let register = self.register()?;
                self.asm.store_register(register)
            }
            "waitforframe" => {
                let frame = self.int_as::<u16>("frame")?;
                let skip = self.int_as::<u8>("skip count")?;
                self.asm.wait_for_frame(frame, skip)
            }
            "waitforframe2" => {
                let skip = self.int_as::<u8>("skip count")?;
                self.asm.wait_for_frame2(skip)
            }
            "bytes" => {
                let mut bytes = Vec::new();
                while let Some(Token::Int(_)) = self.peek() {
                    bytes.push(self.int_as::<u8>("byte")?);
                }
                self.asm.raw(&bytes);
                Ok(())
            }
            other => match Opcode::from_mnemonic(other) {
                Some(op) => {
                    self.asm.op(op);
                    Ok(())
                }
                None => Err(AsmError::UnknownInstruction { position, name }),
            },
        }
    }
}

/// Assemble source text into an action buffer.
pub fn assemble(source: &str) -> Result<Vec<u8>, AsmError> {
    let tokens = lexer::lex(source)?;
    let mut parser = Parser { tokens, pos: 0, end: source.len(), asm: Assembler::new() };
    parser.program()?;
    parser.asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{disassemble, CodeBuffer};

    #[test]
    fn short_and_push() {
        let bytes = assemble("push \"x\", 1\nadd2\nend").unwrap();
        assert_eq!(
            bytes,
            vec![0x96, 0x08, 0x00, 0x00, b'x', 0x00, 0x07, 0x01, 0x00, 0x00, 0x00, 0x47, 0x00]
        );
    }

    #[test]
    fn branch_offsets_are_relative_to_next() {
        let bytes = assemble("top: jump top").unwrap();
        assert_eq!(bytes, vec![0x99, 0x02, 0x00, 0xFB, 0xFF]);
        let bytes = assemble("if out\npop\nout:").unwrap();
        assert_eq!(bytes, vec![0x9D, 0x02, 0x00, 0x01, 0x00, 0x17]);
    }

    #[test]
    fn with_size_covers_block() {
        let bytes = assemble("with done\npop\npop\ndone:").unwrap();
        assert_eq!(&bytes[..5], &[0x94, 0x02, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn function_body_length_is_patched() {
        let bytes = assemble("function \"f\" (\"a\") { pop pop }\nend").unwrap();
        let code = CodeBuffer::read(bytes);
        let lines = disassemble(&code);
        assert_eq!(lines[0], "0000: function \"f\" (\"a\") [2 bytes]");
        assert_eq!(lines[3], "000d: end");
    }

    #[test]
    fn try_header_layout() {
        let bytes = assemble("try %3 { pop } finally { pop pop }").unwrap();
        assert_eq!(
            bytes,
            vec![0x8F, 0x08, 0x00, 0x06, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x03, 0x17, 0x17, 0x17]
        );
    }

    #[test]
    fn errors() {
        assert!(matches!(assemble("jump nowhere"), Err(AsmError::UndefinedLabel(l)) if l == "nowhere"));
        assert!(matches!(assemble("a: a:"), Err(AsmError::DuplicateLabel(_))));
        assert!(matches!(assemble("frobnicate"), Err(AsmError::UnknownInstruction { .. })));
        assert!(matches!(assemble("push #300"), Err(AsmError::OutOfRange { .. })));
        assert!(matches!(assemble("push ,"), Err(AsmError::Unexpected { .. })));
        assert!(matches!(assemble("push @"), Err(AsmError::Lex(_))));
    }

    #[test]
    fn far_branch_is_rejected() {
        let mut asm = Assembler::new();
        asm.jump("far");
        asm.raw(&[0x17; 40_000]);
        asm.label("far").unwrap();
        assert!(matches!(asm.finish(), Err(AsmError::BranchOutOfRange { .. })));
    }
}
