//! Producing method bodies without a compiler.
//!
//! [`IlBuilder`] emits instructions one at a time and resolves branch labels when the body
//! is built. [`assemble`] reads a small ILAsm-like text format on top of it:
//!
//! ```text
//! .maxstack 2
//! .locals i4
//!         ldc.i4.0
//!         stloc.0
//! loop:   ldloc.0
//!         ldc.i4.1
//!         add
//!         dup
//!         stloc.0
//!         ldc.i4.s 10
//!         blt.s loop
//!         ldloc.0
//!         ret
//! ```
//!
//! Token operands name symbols already defined in an [`Assemblies`]: `System.Int32` for
//! types, `Type::Name` for methods and fields, and a bare name for global methods.
//! Exception regions are declared with `.try <start> <end> catch <Type> <start> <end>`
//! or `.try <start> <end> finally <start> <end>`, where every bound is a label.
use crate::{
    resolve::Assemblies,
    types::{MethodBody, Token},
    value::ValueKind,
    vm::{
        exceptions::ExceptionHandlerRegion,
        opcodes::{Opcode, OperandKind},
    },
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AssembleError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("{op} takes a {expected:?} operand")]
    OperandMismatch { op: Opcode, expected: OperandKind },
    #[error("label {0} is used but never marked")]
    UnmarkedLabel(String),
    #[error("label {0} is marked twice")]
    DuplicateLabel(String),
    #[error("branch at {at:#06x} cannot reach {target:#06x} with a one-byte offset")]
    ShortBranchOutOfRange { at: usize, target: usize },
}

/// A position in the instruction stream, marked once with [`IlBuilder::mark`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    label: Label,
    /// Offset of the operand bytes.
    at: usize,
    /// Offset branch deltas are relative to: the end of the instruction.
    base: usize,
    short: bool,
}

#[derive(Debug)]
enum PendingHandler {
    Catch(Token),
    Finally,
    Fault,
}

#[derive(Debug)]
struct PendingRegion {
    try_start: Label,
    try_end: Label,
    handler_start: Label,
    handler_end: Label,
    handler: PendingHandler,
}

/// An assembled method body.
#[derive(Clone, Debug, PartialEq)]
pub struct Assembly {
    pub il: Vec<u8>,
    pub max_stack: u16,
    pub locals: Vec<ValueKind>,
    pub regions: Vec<ExceptionHandlerRegion>,
}

impl Assembly {
    pub fn into_body(self) -> MethodBody {
        MethodBody::new(self.il, self.max_stack)
            .with_locals(self.locals)
            .with_regions(self.regions)
    }
}

#[derive(Debug)]
pub struct IlBuilder {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    label_names: Vec<String>,
    fixups: Vec<Fixup>,
    regions: Vec<PendingRegion>,
    max_stack: u16,
    locals: Vec<ValueKind>,
}

impl Default for IlBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IlBuilder {
    pub fn new() -> Self {
        Self {
            code: vec![],
            labels: vec![],
            label_names: vec![],
            fixups: vec![],
            regions: vec![],
            max_stack: 8,
            locals: vec![],
        }
    }

    pub fn max_stack(&mut self, max_stack: u16) -> &mut Self {
        self.max_stack = max_stack;
        self
    }

    pub fn locals(&mut self, locals: Vec<ValueKind>) -> &mut Self {
        self.locals = locals;
        self
    }

    /// Offset the next instruction will be emitted at.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn define_label(&mut self) -> Label {
        let name = format!("L{}", self.labels.len());
        self.define_named_label(name)
    }

    fn define_named_label(&mut self, name: String) -> Label {
        self.labels.push(None);
        self.label_names.push(name);
        Label(self.labels.len() - 1)
    }

    pub fn mark(&mut self, label: Label) -> Result<&mut Self, AssembleError> {
        if self.labels[label.0].is_some() {
            return Err(AssembleError::DuplicateLabel(self.label_names[label.0].clone()));
        }
        self.labels[label.0] = Some(self.code.len());
        Ok(self)
    }

    fn expect(op: Opcode, kinds: &[OperandKind]) -> Result<(), AssembleError> {
        if kinds.contains(&op.operand()) {
            Ok(())
        } else {
            Err(AssembleError::OperandMismatch {
                op,
                expected: op.operand(),
            })
        }
    }

    /// Emits an instruction without inline operands.
    pub fn emit(&mut self, op: Opcode) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::None])?;
        op.encode(&mut self.code);
        Ok(self)
    }

    /// Emits an instruction with a one- or four-byte integer operand.
    pub fn emit_i4(&mut self, op: Opcode, value: i32) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::ShortI, OperandKind::I])?;
        op.encode(&mut self.code);
        if op.operand() == OperandKind::ShortI {
            let value = i8::try_from(value).map_err(|_| AssembleError::OperandMismatch {
                op,
                expected: OperandKind::ShortI,
            })?;
            self.code.push(value as u8);
        } else {
            self.code.extend_from_slice(&value.to_le_bytes());
        }
        Ok(self)
    }

    /// `ldc.i4` in its shortest encoding.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self, AssembleError> {
        match value {
            -1 => self.emit(Opcode::LdcI4M1),
            0 => self.emit(Opcode::LdcI40),
            1 => self.emit(Opcode::LdcI41),
            2 => self.emit(Opcode::LdcI42),
            3 => self.emit(Opcode::LdcI43),
            4 => self.emit(Opcode::LdcI44),
            5 => self.emit(Opcode::LdcI45),
            6 => self.emit(Opcode::LdcI46),
            7 => self.emit(Opcode::LdcI47),
            8 => self.emit(Opcode::LdcI48),
            v if i8::try_from(v).is_ok() => self.emit_i4(Opcode::LdcI4S, v),
            v => self.emit_i4(Opcode::LdcI4, v),
        }
    }

    pub fn emit_i8(&mut self, op: Opcode, value: i64) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::I8])?;
        op.encode(&mut self.code);
        self.code.extend_from_slice(&value.to_le_bytes());
        Ok(self)
    }

    /// Emits `ldc.r4` or `ldc.r8`.
    pub fn emit_r(&mut self, op: Opcode, value: f64) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::ShortR, OperandKind::R])?;
        op.encode(&mut self.code);
        if op.operand() == OperandKind::ShortR {
            self.code.extend_from_slice(&(value as f32).to_le_bytes());
        } else {
            self.code.extend_from_slice(&value.to_le_bytes());
        }
        Ok(self)
    }

    /// Emits an argument or local access.
    pub fn emit_var(&mut self, op: Opcode, index: u16) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::ShortVar, OperandKind::Var])?;
        op.encode(&mut self.code);
        if op.operand() == OperandKind::ShortVar {
            let index = u8::try_from(index).map_err(|_| AssembleError::OperandMismatch {
                op,
                expected: OperandKind::ShortVar,
            })?;
            self.code.push(index);
        } else {
            self.code.extend_from_slice(&index.to_le_bytes());
        }
        Ok(self)
    }

    pub fn emit_token(&mut self, op: Opcode, token: Token) -> Result<&mut Self, AssembleError> {
        if !op.operand().is_token() {
            return Err(AssembleError::OperandMismatch {
                op,
                expected: op.operand(),
            });
        }
        op.encode(&mut self.code);
        self.code.extend_from_slice(&token.0.to_le_bytes());
        Ok(self)
    }

    pub fn emit_branch(&mut self, op: Opcode, target: Label) -> Result<&mut Self, AssembleError> {
        Self::expect(op, &[OperandKind::ShortBrTarget, OperandKind::BrTarget])?;
        op.encode(&mut self.code);
        let at = self.code.len();
        let short = op.operand() == OperandKind::ShortBrTarget;
        let width = if short { 1 } else { 4 };
        self.code.resize(at + width, 0);
        self.fixups.push(Fixup {
            label: target,
            at,
            base: at + width,
            short,
        });
        Ok(self)
    }

    pub fn emit_switch(&mut self, targets: &[Label]) -> Result<&mut Self, AssembleError> {
        Opcode::Switch.encode(&mut self.code);
        self.code.extend_from_slice(&(targets.len() as u32).to_le_bytes());
        let first = self.code.len();
        let base = first + targets.len() * 4;
        self.code.resize(base, 0);
        for (i, target) in targets.iter().enumerate() {
            self.fixups.push(Fixup {
                label: *target,
                at: first + i * 4,
                base,
                short: false,
            });
        }
        Ok(self)
    }

    /// Declares a typed catch. Regions are matched in declaration order, so inner regions
    /// go first.
    pub fn try_catch(
        &mut self,
        try_range: (Label, Label),
        handler_range: (Label, Label),
        catch_type: Token,
    ) -> &mut Self {
        self.region(try_range, handler_range, PendingHandler::Catch(catch_type))
    }

    pub fn try_finally(&mut self, try_range: (Label, Label), handler_range: (Label, Label)) -> &mut Self {
        self.region(try_range, handler_range, PendingHandler::Finally)
    }

    pub fn try_fault(&mut self, try_range: (Label, Label), handler_range: (Label, Label)) -> &mut Self {
        self.region(try_range, handler_range, PendingHandler::Fault)
    }

    fn region(
        &mut self,
        (try_start, try_end): (Label, Label),
        (handler_start, handler_end): (Label, Label),
        handler: PendingHandler,
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            handler,
        });
        self
    }

    fn resolve(&self, label: Label) -> Result<usize, AssembleError> {
        self.labels[label.0].ok_or_else(|| AssembleError::UnmarkedLabel(self.label_names[label.0].clone()))
    }

    pub fn build(mut self) -> Result<Assembly, AssembleError> {
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            let delta = target as i64 - fixup.base as i64;
            if fixup.short {
                let delta = i8::try_from(delta).map_err(|_| AssembleError::ShortBranchOutOfRange {
                    at: fixup.at - 1,
                    target,
                })?;
                self.code[fixup.at] = delta as u8;
            } else {
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&(delta as i32).to_le_bytes());
            }
        }
        let regions = self
            .regions
            .iter()
            .map(|r| {
                let try_range = self.resolve(r.try_start)?..self.resolve(r.try_end)?;
                let handler_range = self.resolve(r.handler_start)?..self.resolve(r.handler_end)?;
                Ok(match r.handler {
                    PendingHandler::Catch(token) => ExceptionHandlerRegion::catch(try_range, handler_range, token),
                    PendingHandler::Finally => ExceptionHandlerRegion::finally(try_range, handler_range),
                    PendingHandler::Fault => ExceptionHandlerRegion::fault(try_range, handler_range),
                })
            })
            .collect::<Result<Vec<_>, AssembleError>>()?;
        Ok(Assembly {
            il: self.code,
            max_stack: self.max_stack,
            locals: self.locals,
            regions,
        })
    }
}

/// C#-style names accepted for the primitive types.
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("object", "System.Object"),
    ("string", "System.String"),
    ("bool", "System.Boolean"),
    ("char", "System.Char"),
    ("int8", "System.SByte"),
    ("uint8", "System.Byte"),
    ("int16", "System.Int16"),
    ("uint16", "System.UInt16"),
    ("int32", "System.Int32"),
    ("uint32", "System.UInt32"),
    ("int64", "System.Int64"),
    ("uint64", "System.UInt64"),
    ("native int", "System.IntPtr"),
    ("float32", "System.Single"),
    ("float64", "System.Double"),
];

struct TextAssembler<'a> {
    builder: IlBuilder,
    labels: HashMap<String, Label>,
    assemblies: &'a Assemblies,
    line: usize,
}

impl<'a> TextAssembler<'a> {
    fn error(&self, message: impl Into<String>) -> AssembleError {
        AssembleError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn label(&mut self, name: &str) -> Result<Label, AssembleError> {
        if !is_identifier(name) {
            return Err(self.error(format!("invalid label {:?}", name)));
        }
        if let Some(label) = self.labels.get(name) {
            return Ok(*label);
        }
        let label = self.builder.define_named_label(name.to_string());
        self.labels.insert(name.to_string(), label);
        Ok(label)
    }

    fn type_token(&self, name: &str) -> Result<Token, AssembleError> {
        let name = TYPE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map_or(name, |(_, full)| full);
        self.assemblies
            .type_token(name)
            .ok_or_else(|| self.error(format!("unknown type {}", name)))
    }

    fn member(&self, text: &str) -> (String, String) {
        match text.rsplit_once("::") {
            Some((ty, name)) => (ty.to_string(), name.to_string()),
            None => ("System.Object".to_string(), text.to_string()),
        }
    }

    fn method_token(&self, text: &str) -> Result<Token, AssembleError> {
        let (ty, name) = self.member(text);
        self.assemblies
            .method_token(&ty, &name)
            .ok_or_else(|| self.error(format!("unknown method {}", text)))
    }

    fn field_token(&self, text: &str) -> Result<Token, AssembleError> {
        let (ty, name) = self.member(text);
        self.assemblies
            .field_token(&ty, &name)
            .ok_or_else(|| self.error(format!("unknown field {}", text)))
    }

    fn statement(&mut self, text: &str) -> Result<(), AssembleError> {
        let mut rest = text.trim();
        if let Some((head, tail)) = rest.split_once(':') {
            // `::` belongs to a member reference, not a label.
            if !tail.starts_with(':') && is_identifier(head.trim()) {
                let label = self.label(head.trim())?;
                let marked = self.builder.mark(label).map(drop);
                marked.map_err(|e| self.error(e.to_string()))?;
                rest = tail.trim();
            }
        }
        if rest.is_empty() {
            return Ok(());
        }
        if rest.starts_with('.') {
            return self.directive(rest);
        }
        let (mnemonic, operand) = match rest.split_once(char::is_whitespace) {
            Some((m, o)) => (m, o.trim()),
            None => (rest, ""),
        };
        let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| self.error(format!("unknown opcode {}", mnemonic)))?;
        self.instruction(op, operand)
    }

    fn directive(&mut self, text: &str) -> Result<(), AssembleError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            [".maxstack", n] => {
                let n = n.parse().map_err(|_| self.error(format!("invalid .maxstack {}", n)))?;
                self.builder.max_stack(n);
            }
            [".locals", ..] => {
                let kinds = text[".locals".len()..]
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(|k| ValueKind::from_name(k).ok_or_else(|| self.error(format!("unknown local kind {}", k))))
                    .collect::<Result<Vec<_>, _>>()?;
                self.builder.locals(kinds);
            }
            [".try", start, end, "catch", ty, handler_start, handler_end] => {
                let token = self.type_token(ty)?;
                let try_range = (self.label(start)?, self.label(end)?);
                let handler_range = (self.label(handler_start)?, self.label(handler_end)?);
                self.builder.try_catch(try_range, handler_range, token);
            }
            [".try", start, end, kind @ ("finally" | "fault"), handler_start, handler_end] => {
                let try_range = (self.label(start)?, self.label(end)?);
                let handler_range = (self.label(handler_start)?, self.label(handler_end)?);
                if *kind == "finally" {
                    self.builder.try_finally(try_range, handler_range);
                } else {
                    self.builder.try_fault(try_range, handler_range);
                }
            }
            _ => return Err(self.error(format!("unrecognized directive {}", text))),
        }
        Ok(())
    }

    fn instruction(&mut self, op: Opcode, operand: &str) -> Result<(), AssembleError> {
        let line = self.line;
        let wrap = move |e: AssembleError| AssembleError::Syntax {
            line,
            message: e.to_string(),
        };
        let kind = op.operand();
        if kind == OperandKind::None {
            if !operand.is_empty() {
                return Err(self.error(format!("{} takes no operand", op)));
            }
            self.builder.emit(op).map_err(wrap)?;
            return Ok(());
        }
        if operand.is_empty() {
            return Err(self.error(format!("{} needs a {:?} operand", op, kind)));
        }
        match kind {
            OperandKind::None => {}
            OperandKind::ShortBrTarget | OperandKind::BrTarget => {
                let label = self.label(operand)?;
                self.builder.emit_branch(op, label).map_err(wrap)?;
            }
            OperandKind::ShortI | OperandKind::I => {
                let value = parse_int(operand)
                    .filter(|v| (i32::MIN as i64..=u32::MAX as i64).contains(v))
                    .ok_or_else(|| self.error(format!("invalid int32 {}", operand)))?;
                self.builder.emit_i4(op, value as i32).map_err(wrap)?;
            }
            OperandKind::I8 => {
                let value = parse_int(operand).ok_or_else(|| self.error(format!("invalid int64 {}", operand)))?;
                self.builder.emit_i8(op, value).map_err(wrap)?;
            }
            OperandKind::ShortR | OperandKind::R => {
                let value: f64 = operand
                    .parse()
                    .map_err(|_| self.error(format!("invalid float {}", operand)))?;
                self.builder.emit_r(op, value).map_err(wrap)?;
            }
            OperandKind::ShortVar | OperandKind::Var => {
                let index: u16 = operand
                    .parse()
                    .map_err(|_| self.error(format!("invalid index {}", operand)))?;
                self.builder.emit_var(op, index).map_err(wrap)?;
            }
            OperandKind::String => {
                let value = parse_string(operand).ok_or_else(|| self.error(format!("invalid string {}", operand)))?;
                let token = self.assemblies.define_string(value);
                self.builder.emit_token(op, token).map_err(wrap)?;
            }
            OperandKind::Method => {
                let token = self.method_token(operand)?;
                self.builder.emit_token(op, token).map_err(wrap)?;
            }
            OperandKind::Field => {
                let token = self.field_token(operand)?;
                self.builder.emit_token(op, token).map_err(wrap)?;
            }
            OperandKind::Type => {
                let token = self.type_token(operand)?;
                self.builder.emit_token(op, token).map_err(wrap)?;
            }
            OperandKind::Tok => {
                let token = self
                    .type_token(operand)
                    .or_else(|_| self.method_token(operand))
                    .or_else(|_| self.field_token(operand))
                    .map_err(|_| self.error(format!("unknown symbol {}", operand)))?;
                self.builder.emit_token(op, token).map_err(wrap)?;
            }
            OperandKind::Sig => {
                return Err(self.error(format!("{}: signature operands are not supported", op)));
            }
            OperandKind::Switch => {
                let inner = operand
                    .strip_prefix('(')
                    .and_then(|o| o.strip_suffix(')'))
                    .ok_or_else(|| self.error("switch targets must be parenthesized"))?;
                let targets = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| self.label(t))
                    .collect::<Result<Vec<_>, _>>()?;
                self.builder.emit_switch(&targets).map_err(wrap)?;
            }
        }
        Ok(())
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i128,
        None => digits.parse::<u64>().ok()? as i128,
    };
    let value = if negative { -magnitude } else { magnitude };
    // Hex literals may spell out the two's complement bit pattern.
    if value > i64::MAX as i128 && !negative {
        return Some(value as u64 as i64);
    }
    i64::try_from(value).ok()
}

fn parse_string(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '"' => '"',
            '\\' => '\\',
            _ => return None,
        });
    }
    Some(out)
}

/// Strips a `//` comment, ignoring slashes inside string literals.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Assembles a method body from its textual form, resolving symbols in `assemblies`.
/// String literals are added to its user-string heap.
pub fn assemble(source: &str, assemblies: &Assemblies) -> Result<Assembly, AssembleError> {
    let mut asm = TextAssembler {
        builder: IlBuilder::new(),
        labels: HashMap::new(),
        assemblies,
        line: 0,
    };
    for (number, line) in source.lines().enumerate() {
        asm.line = number + 1;
        asm.statement(strip_comment(line))?;
    }
    asm.builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::BytecodeBuffer;

    #[test]
    fn test_builder_resolves_forward_and_backward_labels() {
        let mut b = IlBuilder::new();
        let top = b.define_label();
        let done = b.define_label();
        b.mark(top).unwrap();
        b.emit(Opcode::Ldarg0).unwrap().emit_branch(Opcode::BrfalseS, done).unwrap();
        b.emit_branch(Opcode::Br, top).unwrap();
        b.mark(done).unwrap();
        b.emit(Opcode::Ret).unwrap();
        let asm = b.build().unwrap();

        let code = BytecodeBuffer::new(&asm.il);
        assert_eq!(code.branch_target(1).unwrap(), 8);
        assert_eq!(code.branch_target(3).unwrap(), 0);
    }

    #[test]
    fn test_unmarked_label_is_an_error() {
        let mut b = IlBuilder::new();
        let nowhere = b.define_label();
        b.emit_branch(Opcode::Br, nowhere).unwrap();
        assert!(matches!(b.build(), Err(AssembleError::UnmarkedLabel(_))));
    }

    #[test]
    fn test_operand_kind_is_checked() {
        let mut b = IlBuilder::new();
        assert!(b.emit(Opcode::LdcI4).is_err());
        assert!(b.emit_i4(Opcode::LdcI4S, 1000).is_err());
    }

    #[test]
    fn test_ldc_i4_picks_the_short_forms() {
        let mut b = IlBuilder::new();
        b.ldc_i4(3).unwrap().ldc_i4(-100).unwrap().ldc_i4(1 << 20).unwrap();
        let asm = b.build().unwrap();
        assert_eq!(asm.il[0], Opcode::LdcI43 as u8);
        assert_eq!(&asm.il[1..3], &[Opcode::LdcI4S as u8, (-100i8) as u8]);
        assert_eq!(asm.il[3], Opcode::LdcI4 as u8);
        assert_eq!(asm.il.len(), 8);
    }

    #[test]
    fn test_assemble_loop() {
        let assemblies = Assemblies::new();
        let asm = assemble(
            r#"
            .maxstack 2
            .locals i4
                    ldc.i4.0
                    stloc.0
            loop:   ldloc.0     // counter
                    ldc.i4.1
                    add
                    dup
                    stloc.0
                    ldc.i4.s 10
                    blt.s loop
                    ldloc.0
                    ret
            "#,
            &assemblies,
        )
        .unwrap();
        assert_eq!(asm.max_stack, 2);
        assert_eq!(asm.locals, vec![ValueKind::I4]);
        let code = BytecodeBuffer::new(&asm.il);
        assert_eq!(code.branch_target(9).unwrap(), 2);
    }

    #[test]
    fn test_assemble_regions_and_tokens() {
        let assemblies = Assemblies::new();
        let asm = assemble(
            r#"
            .try start end catch System.Exception handler after
            start:   ldstr "a // not a comment"
                     throw
            end:
            handler: pop
                     leave.s after
            after:   newarr int32
                     ret
            "#,
            &assemblies,
        )
        .unwrap();
        assert_eq!(asm.regions.len(), 1);
        let region = &asm.regions[0];
        assert_eq!(region.try_range(), 0..6);
        assert_eq!(region.handler_range(), 6..9);
        let code = BytecodeBuffer::new(&asm.il);
        assert_eq!(code.imm_token(9).unwrap(), assemblies.type_token("System.Int32").unwrap());
    }

    #[test]
    fn test_assemble_switch() {
        let assemblies = Assemblies::new();
        let asm = assemble(
            "ldarg.0\nswitch (a, b)\na: ldc.i4.1\nret\nb: ldc.i4.2\nret",
            &assemblies,
        )
        .unwrap();
        let code = BytecodeBuffer::new(&asm.il);
        assert_eq!(code.switch_targets(1).unwrap(), vec![14, 16]);
    }

    #[test]
    fn test_assemble_reports_the_line() {
        let assemblies = Assemblies::new();
        let err = assemble("nop\nfrobnicate\n", &assemblies).unwrap_err();
        assert_eq!(
            err,
            AssembleError::Syntax {
                line: 2,
                message: "unknown opcode frobnicate".to_string()
            }
        );
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("-12"), Some(-12));
        assert_eq!(parse_int("0xFFFFFFFF"), Some(0xFFFF_FFFF));
        assert_eq!(parse_int("0xFFFFFFFFFFFFFFFF"), Some(-1));
        assert_eq!(parse_int("x"), None);
    }
}
