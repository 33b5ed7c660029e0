//! Static stack-type analysis.
//!
//! Most arithmetic and comparison opcodes are polymorphic over the stack types of their
//! operands. Before a method runs, a single forward pass over every reachable offset
//! symbolically executes the body with a stack of [`StackType`]s and records which concrete
//! operation each polymorphic instruction denotes. The interpreter then dispatches on that
//! [`OpCodeType`] instead of inspecting operand tags.
//!
//! The pass visits each offset at most once, seeded with the stack of whichever path
//! reached it first. CIL requires the stack shape at an offset to be path independent, so
//! this is sufficient for valid programs; the analysis does not re-verify it.
//!
//! Operand rules follow ECMA-335 Partition III, tables 2 to 8. Any combination those tables
//! reject fails the method with [`EngineError::InvalidProgram`].
use crate::{
    resolve::SymbolResolver,
    types::{MethodSymbol, ResolutionScope, Token},
    value::StackType,
    vm::{
        bytecode::BytecodeBuffer,
        error::EngineError,
        exceptions::{resume_after_throw, ExceptionHandlerRegion, RegionKind},
        opcodes::{Opcode, StackEffect},
    },
};
use std::fmt::{self, Display, Formatter};
use tracing::debug;

/// The concrete operation a polymorphic instruction performs.
///
/// Pair variants name the deeper operand (pushed first) on the left. When both operands
/// have the same type the single-type variant is used.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpCodeType {
    Int32,
    Int64,
    NativeInt,
    NativeFloat,
    Object,
    ManagedPointer,
    Int32NativeInt,
    Int32ManagedPointer,
    NativeIntInt32,
    NativeIntManagedPointer,
    ManagedPointerInt32,
    ManagedPointerNativeInt,
    Int64Int32,
    Int64NativeInt,
}

impl OpCodeType {
    pub fn single(ty: StackType) -> Self {
        match ty {
            StackType::Int32 => OpCodeType::Int32,
            StackType::Int64 => OpCodeType::Int64,
            StackType::NativeInt => OpCodeType::NativeInt,
            StackType::NativeFloat => OpCodeType::NativeFloat,
            StackType::ObjectRef => OpCodeType::Object,
            StackType::ManagedPointer => OpCodeType::ManagedPointer,
        }
    }

    /// Combines two operand types. Returns `None` for combinations no instruction accepts.
    pub fn pair(left: StackType, right: StackType) -> Option<Self> {
        use StackType::*;
        Some(match (left, right) {
            (Int32, Int32) => OpCodeType::Int32,
            (Int32, NativeInt) => OpCodeType::Int32NativeInt,
            (Int32, ManagedPointer) => OpCodeType::Int32ManagedPointer,
            (Int64, Int64) => OpCodeType::Int64,
            (Int64, Int32) => OpCodeType::Int64Int32,
            (Int64, NativeInt) => OpCodeType::Int64NativeInt,
            (NativeInt, Int32) => OpCodeType::NativeIntInt32,
            (NativeInt, NativeInt) => OpCodeType::NativeInt,
            (NativeInt, ManagedPointer) => OpCodeType::NativeIntManagedPointer,
            (NativeFloat, NativeFloat) => OpCodeType::NativeFloat,
            (ManagedPointer, Int32) => OpCodeType::ManagedPointerInt32,
            (ManagedPointer, NativeInt) => OpCodeType::ManagedPointerNativeInt,
            (ManagedPointer, ManagedPointer) => OpCodeType::ManagedPointer,
            (ObjectRef, ObjectRef) => OpCodeType::Object,
            _ => return None,
        })
    }

    /// The operand types this annotation was built from, deeper operand first.
    pub fn operands(self) -> (StackType, Option<StackType>) {
        use StackType::*;
        match self {
            OpCodeType::Int32 => (Int32, None),
            OpCodeType::Int64 => (Int64, None),
            OpCodeType::NativeInt => (NativeInt, None),
            OpCodeType::NativeFloat => (NativeFloat, None),
            OpCodeType::Object => (ObjectRef, None),
            OpCodeType::ManagedPointer => (ManagedPointer, None),
            OpCodeType::Int32NativeInt => (Int32, Some(NativeInt)),
            OpCodeType::Int32ManagedPointer => (Int32, Some(ManagedPointer)),
            OpCodeType::NativeIntInt32 => (NativeInt, Some(Int32)),
            OpCodeType::NativeIntManagedPointer => (NativeInt, Some(ManagedPointer)),
            OpCodeType::ManagedPointerInt32 => (ManagedPointer, Some(Int32)),
            OpCodeType::ManagedPointerNativeInt => (ManagedPointer, Some(NativeInt)),
            OpCodeType::Int64Int32 => (Int64, Some(Int32)),
            OpCodeType::Int64NativeInt => (Int64, Some(NativeInt)),
        }
    }

    fn is_integer_pair(self) -> bool {
        matches!(
            self,
            OpCodeType::Int32
                | OpCodeType::Int32NativeInt
                | OpCodeType::NativeIntInt32
                | OpCodeType::NativeInt
                | OpCodeType::Int64
        )
    }

    /// `&` combined with an integer, in either order.
    fn is_pointer_offset(self) -> bool {
        matches!(
            self,
            OpCodeType::Int32ManagedPointer
                | OpCodeType::NativeIntManagedPointer
                | OpCodeType::ManagedPointerInt32
                | OpCodeType::ManagedPointerNativeInt
        )
    }

    /// Result of an arithmetic instruction with these operands (tables 2, 5 and 7).
    fn arithmetic_result(self) -> StackType {
        match self {
            OpCodeType::Int32 => StackType::Int32,
            OpCodeType::Int64 => StackType::Int64,
            OpCodeType::NativeFloat => StackType::NativeFloat,
            OpCodeType::Int32NativeInt | OpCodeType::NativeIntInt32 | OpCodeType::NativeInt => {
                StackType::NativeInt
            }
            OpCodeType::ManagedPointer => StackType::NativeInt,
            _ => StackType::ManagedPointer,
        }
    }
}

impl Display for OpCodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.operands() {
            (left, None) => write!(f, "{}", left),
            (left, Some(right)) => write!(f, "{}, {}", left, right),
        }
    }
}

/// The result of analyzing one method body. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodAnalysis {
    types: Box<[Option<OpCodeType>]>,
    depths: Box<[Option<u16>]>,
    starts: Box<[bool]>,
}

impl MethodAnalysis {
    /// Number of bytes covered, equal to the body length.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn op_type(&self, pc: usize) -> Option<OpCodeType> {
        self.types.get(pc).copied().flatten()
    }

    /// Evaluation stack depth on entry to the instruction at `pc`, if it is reachable.
    pub fn stack_depth(&self, pc: usize) -> Option<usize> {
        self.depths.get(pc).copied().flatten().map(usize::from)
    }

    pub fn is_instruction_start(&self, pc: usize) -> bool {
        self.starts.get(pc).copied().unwrap_or(false)
    }

    pub fn is_reachable(&self, pc: usize) -> bool {
        self.stack_depth(pc).is_some()
    }

    /// Every annotated offset in ascending order.
    pub fn annotations(&self) -> impl Iterator<Item = (usize, OpCodeType)> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter_map(|(pc, t)| t.map(|t| (pc, t)))
    }
}

struct Analyzer<'a> {
    code: BytecodeBuffer,
    method: &'a MethodSymbol,
    regions: &'a [ExceptionHandlerRegion],
    resolver: &'a dyn SymbolResolver,
    scope: &'a ResolutionScope,
    max_stack: usize,
    arguments: Vec<StackType>,
    locals: Vec<StackType>,
    starts: Vec<bool>,
    types: Vec<Option<OpCodeType>>,
    depths: Vec<Option<u16>>,
    queued: Vec<bool>,
    worklist: Vec<(usize, Vec<StackType>)>,
}

/// The symbolic evaluation stack at one instruction.
struct TypeStack<'s> {
    pc: usize,
    max: usize,
    items: &'s mut Vec<StackType>,
}

impl TypeStack<'_> {
    fn pop(&mut self) -> Result<StackType, EngineError> {
        self.items
            .pop()
            .ok_or_else(|| EngineError::invalid_program(self.pc, "evaluation stack underflow"))
    }

    fn push(&mut self, ty: StackType) -> Result<(), EngineError> {
        if self.items.len() >= self.max {
            return Err(EngineError::invalid_program(
                self.pc,
                format!("evaluation stack exceeds max stack of {}", self.max),
            ));
        }
        self.items.push(ty);
        Ok(())
    }

    fn pop_n(&mut self, n: usize) -> Result<(), EngineError> {
        for _ in 0..n {
            self.pop()?;
        }
        Ok(())
    }

    /// Pops the right then the left operand of a binary instruction.
    fn pop_pair(&mut self) -> Result<(StackType, StackType), EngineError> {
        let right = self.pop()?;
        let left = self.pop()?;
        Ok((left, right))
    }

    fn pop_address(&mut self) -> Result<StackType, EngineError> {
        match self.pop()? {
            t @ (StackType::ManagedPointer | StackType::NativeInt) => Ok(t),
            t => Err(self.illegal("address", t)),
        }
    }

    fn pop_index(&mut self) -> Result<StackType, EngineError> {
        match self.pop()? {
            t @ (StackType::Int32 | StackType::NativeInt) => Ok(t),
            t => Err(self.illegal("index", t)),
        }
    }

    fn pop_object(&mut self) -> Result<(), EngineError> {
        match self.pop()? {
            StackType::ObjectRef => Ok(()),
            t => Err(self.illegal("object reference", t)),
        }
    }

    fn illegal(&self, what: &str, ty: StackType) -> EngineError {
        EngineError::invalid_program(self.pc, format!("{} operand cannot be {}", what, ty))
    }
}

fn illegal_pair(pc: usize, op: Opcode, left: StackType, right: StackType) -> EngineError {
    EngineError::invalid_program(pc, format!("{} cannot combine {} and {}", op, left, right))
}

fn is_equality_comparison(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Ceq | Opcode::CgtUn | Opcode::Beq | Opcode::BeqS | Opcode::BneUn | Opcode::BneUnS
    )
}

/// Table 4: binary comparison and branch operands.
fn comparison_type(pc: usize, op: Opcode, left: StackType, right: StackType) -> Result<OpCodeType, EngineError> {
    let ty = OpCodeType::pair(left, right).ok_or_else(|| illegal_pair(pc, op, left, right))?;
    let allowed = ty.is_integer_pair()
        || ty == OpCodeType::NativeFloat
        || (is_equality_comparison(op)
            && matches!(
                ty,
                OpCodeType::Object
                    | OpCodeType::ManagedPointer
                    | OpCodeType::NativeIntManagedPointer
                    | OpCodeType::ManagedPointerNativeInt
            ));
    if allowed {
        Ok(ty)
    } else {
        Err(illegal_pair(pc, op, left, right))
    }
}

/// Tables 2, 5 and 7: binary arithmetic operands and the result type.
fn arithmetic_type(
    pc: usize,
    op: Opcode,
    left: StackType,
    right: StackType,
) -> Result<(OpCodeType, StackType), EngineError> {
    use Opcode::*;
    let ty = OpCodeType::pair(left, right).ok_or_else(|| illegal_pair(pc, op, left, right))?;
    let allowed = match op {
        Add => ty.is_integer_pair() || ty == OpCodeType::NativeFloat || ty.is_pointer_offset(),
        Sub => {
            ty.is_integer_pair()
                || ty == OpCodeType::NativeFloat
                || matches!(
                    ty,
                    OpCodeType::ManagedPointerInt32
                        | OpCodeType::ManagedPointerNativeInt
                        | OpCodeType::ManagedPointer
                )
        }
        Mul | Div | Rem => ty.is_integer_pair() || ty == OpCodeType::NativeFloat,
        And | Or | Xor | DivUn | RemUn | AddOvf | SubOvf | MulOvf | MulOvfUn => ty.is_integer_pair(),
        AddOvfUn => ty.is_integer_pair() || ty.is_pointer_offset(),
        SubOvfUn => {
            ty.is_integer_pair()
                || matches!(
                    ty,
                    OpCodeType::ManagedPointerInt32
                        | OpCodeType::ManagedPointerNativeInt
                        | OpCodeType::ManagedPointer
                )
        }
        _ => false,
    };
    if allowed {
        Ok((ty, ty.arithmetic_result()))
    } else {
        Err(illegal_pair(pc, op, left, right))
    }
}

/// Table 6: shift operands. The result has the type of the shifted value.
fn shift_type(pc: usize, op: Opcode, value: StackType, amount: StackType) -> Result<OpCodeType, EngineError> {
    use StackType::*;
    match (value, amount) {
        (Int32 | Int64 | NativeInt, Int32 | NativeInt) => {
            OpCodeType::pair(value, amount).ok_or_else(|| illegal_pair(pc, op, value, amount))
        }
        _ => Err(illegal_pair(pc, op, value, amount)),
    }
}

/// The stack type a conversion produces.
fn conversion_result(op: Opcode) -> Option<StackType> {
    use Opcode::*;
    Some(match op {
        ConvI1 | ConvI2 | ConvI4 | ConvU1 | ConvU2 | ConvU4 | ConvOvfI1 | ConvOvfI2 | ConvOvfI4
        | ConvOvfU1 | ConvOvfU2 | ConvOvfU4 | ConvOvfI1Un | ConvOvfI2Un | ConvOvfI4Un
        | ConvOvfU1Un | ConvOvfU2Un | ConvOvfU4Un => StackType::Int32,
        ConvI8 | ConvU8 | ConvOvfI8 | ConvOvfU8 | ConvOvfI8Un | ConvOvfU8Un => StackType::Int64,
        ConvI | ConvU | ConvOvfI | ConvOvfU | ConvOvfIUn | ConvOvfUUn => StackType::NativeInt,
        ConvR4 | ConvR8 | ConvRUn => StackType::NativeFloat,
        _ => return None,
    })
}

impl<'a> Analyzer<'a> {
    fn new(
        method: &'a MethodSymbol,
        resolver: &'a dyn SymbolResolver,
    ) -> Result<Self, EngineError> {
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state(0, format!("{:?} has no body", method)))?;
        let len = body.il.len();
        Ok(Self {
            code: BytecodeBuffer::new(&body.il),
            method,
            regions: &body.exception_regions,
            resolver,
            scope: &method.scope,
            max_stack: body.max_stack as usize,
            arguments: method.signature.argument_kinds().map(|k| k.stack_type()).collect(),
            locals: body.locals.iter().map(|k| k.stack_type()).collect(),
            starts: vec![false; len],
            types: vec![None; len],
            depths: vec![None; len],
            queued: vec![false; len],
            worklist: vec![],
        })
    }

    fn decode_error(e: EngineError) -> EngineError {
        match e {
            EngineError::Truncated(pc) => EngineError::invalid_program(pc, "truncated instruction"),
            e => e,
        }
    }

    /// Decodes the body linearly to find instruction boundaries.
    fn scan(&mut self) -> Result<(), EngineError> {
        let mut pc = 0;
        while pc < self.code.len() {
            self.starts[pc] = true;
            pc = self.code.next_pc(pc).map_err(Self::decode_error)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, from: usize, target: usize, stack: Vec<StackType>) -> Result<(), EngineError> {
        if !self.starts.get(target).copied().unwrap_or(false) {
            return Err(EngineError::invalid_program(
                from,
                format!("control transfer to IL_{:04x}, which is not an instruction start", target),
            ));
        }
        if !self.queued[target] {
            self.queued[target] = true;
            self.worklist.push((target, stack));
        }
        Ok(())
    }

    fn seed(&mut self) -> Result<(), EngineError> {
        if self.code.is_empty() {
            return Err(EngineError::invalid_program(0, "empty method body"));
        }
        self.enqueue(0, 0, vec![])?;
        for region in self.regions {
            let exception = vec![StackType::ObjectRef];
            match region.kind {
                RegionKind::Exception(_) => {
                    self.enqueue(region.handler_offset, region.handler_offset, exception)?
                }
                RegionKind::Finally | RegionKind::Fault => {
                    self.enqueue(region.handler_offset, region.handler_offset, vec![])?
                }
                RegionKind::Filter { filter_offset } => {
                    self.enqueue(region.handler_offset, region.handler_offset, exception.clone())?;
                    self.enqueue(filter_offset, filter_offset, exception)?;
                }
            }
        }
        Ok(())
    }

    fn run(mut self) -> Result<MethodAnalysis, EngineError> {
        self.scan()?;
        self.seed()?;
        while let Some((pc, mut stack)) = self.worklist.pop() {
            self.depths[pc] = Some(stack.len() as u16);
            let op = self.code.opcode_at(pc)?;
            let before = stack.len();
            let successors = self.transfer(pc, op, &mut stack)?;
            if let StackEffect::Fixed { .. } = op.stack_effect() {
                let expected = before as isize + op.stack_effect().delta().unwrap_or(0);
                if stack.len() as isize != expected {
                    return Err(EngineError::invalid_state(
                        pc,
                        format!("{} left {} slots, expected {}", op, stack.len(), expected),
                    ));
                }
            }
            for (target, empty) in successors {
                let next = if empty { vec![] } else { stack.clone() };
                self.enqueue(pc, target, next)?;
            }
        }
        debug!(
            method = %self.method.name,
            annotated = self.types.iter().filter(|t| t.is_some()).count(),
            "analyzed method"
        );
        Ok(MethodAnalysis {
            types: self.types.into_boxed_slice(),
            depths: self.depths.into_boxed_slice(),
            starts: self.starts.into_boxed_slice(),
        })
    }

    fn variable(&self, pc: usize, table: &[StackType], index: usize, what: &str) -> Result<StackType, EngineError> {
        table.get(index).copied().ok_or_else(|| {
            EngineError::invalid_program(pc, format!("{} {} out of range", what, index))
        })
    }

    fn annotate(&mut self, pc: usize, ty: OpCodeType) {
        self.types[pc] = Some(ty);
    }

    fn type_kind(&self, token: Token) -> Result<StackType, EngineError> {
        Ok(self.resolver.resolve_type(token, self.scope)?.stack_type())
    }

    /// Applies the transfer function of `op` and returns its successors. The flag marks
    /// successors entered with an empty stack.
    fn transfer(
        &mut self,
        pc: usize,
        op: Opcode,
        items: &mut Vec<StackType>,
    ) -> Result<Vec<(usize, bool)>, EngineError> {
        use Opcode::*;
        use StackType::*;

        let next = self.code.next_pc(pc).map_err(Self::decode_error)?;
        let mut stack = TypeStack {
            pc,
            max: self.max_stack,
            items,
        };
        let mut successors = vec![];
        let falls_through = !op.ends_block();

        match op {
            Nop | Break | Unaligned | Volatile | Tail | Constrained | No | Readonly => {}

            Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 | LdargS | Ldarg => {
                let index = match op {
                    Ldarg0 => 0,
                    Ldarg1 => 1,
                    Ldarg2 => 2,
                    Ldarg3 => 3,
                    _ => self.code.imm_var(pc)?,
                };
                stack.push(self.variable(pc, &self.arguments, index, "argument")?)?;
            }
            Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 | LdlocS | Ldloc => {
                let index = match op {
                    Ldloc0 => 0,
                    Ldloc1 => 1,
                    Ldloc2 => 2,
                    Ldloc3 => 3,
                    _ => self.code.imm_var(pc)?,
                };
                stack.push(self.variable(pc, &self.locals, index, "local")?)?;
            }
            Stloc0 | Stloc1 | Stloc2 | Stloc3 | StlocS | Stloc => {
                let index = match op {
                    Stloc0 => 0,
                    Stloc1 => 1,
                    Stloc2 => 2,
                    Stloc3 => 3,
                    _ => self.code.imm_var(pc)?,
                };
                self.variable(pc, &self.locals, index, "local")?;
                stack.pop()?;
            }
            StargS | Starg => {
                self.variable(pc, &self.arguments, self.code.imm_var(pc)?, "argument")?;
                stack.pop()?;
            }
            LdargaS | Ldarga => {
                self.variable(pc, &self.arguments, self.code.imm_var(pc)?, "argument")?;
                stack.push(ManagedPointer)?;
            }
            LdlocaS | Ldloca => {
                self.variable(pc, &self.locals, self.code.imm_var(pc)?, "local")?;
                stack.push(ManagedPointer)?;
            }

            Ldnull | Ldstr | Ldtoken => stack.push(ObjectRef)?,
            LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 | LdcI4S | LdcI4 | Sizeof => stack.push(Int32)?,
            LdcI8 => stack.push(Int64)?,
            LdcR4 | LdcR8 => stack.push(NativeFloat)?,
            Arglist => stack.push(NativeInt)?,

            Dup => {
                let top = stack.pop()?;
                stack.push(top)?;
                stack.push(top)?;
                self.annotate(pc, OpCodeType::single(top));
            }
            Pop => {
                stack.pop()?;
            }

            Jmp => {
                if !stack.items.is_empty() {
                    return Err(EngineError::invalid_program(pc, "jmp requires an empty stack"));
                }
            }
            Call | Callvirt => {
                let callee = self.resolver.resolve_method(self.code.imm_token(pc)?, self.scope)?;
                stack.pop_n(callee.signature.parameter_count_including_instance())?;
                if let Some(ret) = callee.signature.return_type {
                    stack.push(ret.stack_type())?;
                }
            }
            Newobj => {
                let ctor = self.resolver.resolve_method(self.code.imm_token(pc)?, self.scope)?;
                stack.pop_n(ctor.signature.parameters.len())?;
                stack.push(ObjectRef)?;
            }
            Calli => {
                let sig = self
                    .resolver
                    .resolve_signature(self.code.imm_token(pc)?, self.scope)?;
                stack.pop()?;
                stack.pop_n(sig.parameter_count_including_instance())?;
                if let Some(ret) = sig.return_type {
                    stack.push(ret.stack_type())?;
                }
            }
            CachedCall => {
                return Err(EngineError::UnsupportedOpcode {
                    opcode: CachedCall as u16,
                    offset: pc,
                })
            }
            Ret => {
                if self.method.has_return_value() {
                    stack.pop()?;
                }
                if !stack.items.is_empty() {
                    return Err(EngineError::invalid_program(
                        pc,
                        "evaluation stack not empty on return",
                    ));
                }
            }

            Br | BrS => successors.push((self.code.branch_target(pc)?, false)),
            Brfalse | BrfalseS | Brtrue | BrtrueS => {
                let ty = stack.pop()?;
                if ty == NativeFloat {
                    return Err(stack.illegal("condition", ty));
                }
                self.annotate(pc, OpCodeType::single(ty));
                successors.push((self.code.branch_target(pc)?, false));
            }
            Beq | BeqS | Bge | BgeS | Bgt | BgtS | Ble | BleS | Blt | BltS | BneUn | BneUnS
            | BgeUn | BgeUnS | BgtUn | BgtUnS | BleUn | BleUnS | BltUn | BltUnS => {
                let (left, right) = stack.pop_pair()?;
                let ty = comparison_type(pc, op, left, right)?;
                self.annotate(pc, ty);
                successors.push((self.code.branch_target(pc)?, false));
            }
            Switch => {
                let ty = stack.pop_index()?;
                self.annotate(pc, OpCodeType::single(ty));
                for target in self.code.switch_targets(pc)? {
                    successors.push((target, false));
                }
            }
            Leave | LeaveS => {
                stack.items.clear();
                successors.push((self.code.branch_target(pc)?, true));
            }
            Endfinally => stack.items.clear(),
            Endfilter => {
                stack.pop()?;
            }
            Throw | Rethrow => {
                if op == Throw {
                    stack.pop_object()?;
                }
                let resume = resume_after_throw(self.regions, pc).unwrap_or(next);
                if resume < self.code.len() {
                    successors.push((resume, true));
                }
            }

            Ceq | Cgt | CgtUn | Clt | CltUn => {
                let (left, right) = stack.pop_pair()?;
                self.annotate(pc, comparison_type(pc, op, left, right)?);
                stack.push(Int32)?;
            }
            Add | Sub | Mul | Div | Rem | DivUn | RemUn | And | Or | Xor | AddOvf | AddOvfUn
            | SubOvf | SubOvfUn | MulOvf | MulOvfUn => {
                let (left, right) = stack.pop_pair()?;
                let (ty, result) = arithmetic_type(pc, op, left, right)?;
                self.annotate(pc, ty);
                stack.push(result)?;
            }
            Shl | Shr | ShrUn => {
                let (value, amount) = stack.pop_pair()?;
                self.annotate(pc, shift_type(pc, op, value, amount)?);
                stack.push(value)?;
            }
            Neg | Not => {
                let ty = stack.pop()?;
                let allowed = match ty {
                    Int32 | Int64 | NativeInt => true,
                    NativeFloat => op == Neg,
                    _ => false,
                };
                if !allowed {
                    return Err(stack.illegal(op.mnemonic(), ty));
                }
                self.annotate(pc, OpCodeType::single(ty));
                stack.push(ty)?;
            }
            Ckfinite => {
                let ty = stack.pop()?;
                if ty != NativeFloat {
                    return Err(stack.illegal("ckfinite", ty));
                }
                self.annotate(pc, OpCodeType::NativeFloat);
                stack.push(NativeFloat)?;
            }
            op if conversion_result(op).is_some() => {
                let ty = stack.pop()?;
                let unrestricted = matches!(op, ConvI8 | ConvU8 | ConvI | ConvU);
                if matches!(ty, ObjectRef | ManagedPointer) && !unrestricted {
                    return Err(stack.illegal(op.mnemonic(), ty));
                }
                self.annotate(pc, OpCodeType::single(ty));
                if let Some(result) = conversion_result(op) {
                    stack.push(result)?;
                }
            }

            LdindI1 | LdindU1 | LdindI2 | LdindU2 | LdindI4 | LdindU4 | LdindI8 | LdindI
            | LdindR4 | LdindR8 | LdindRef => {
                let address = stack.pop_address()?;
                self.annotate(pc, OpCodeType::single(address));
                stack.push(match op {
                    LdindI8 => Int64,
                    LdindI => NativeInt,
                    LdindR4 | LdindR8 => NativeFloat,
                    LdindRef => ObjectRef,
                    _ => Int32,
                })?;
            }
            StindRef | StindI1 | StindI2 | StindI4 | StindI8 | StindR4 | StindR8 | StindI => {
                stack.pop()?;
                let address = stack.pop_address()?;
                self.annotate(pc, OpCodeType::single(address));
            }
            Ldobj => {
                let address = stack.pop_address()?;
                self.annotate(pc, OpCodeType::single(address));
                stack.push(self.type_kind(self.code.imm_token(pc)?)?)?;
            }
            Stobj => {
                stack.pop()?;
                let address = stack.pop_address()?;
                self.annotate(pc, OpCodeType::single(address));
            }
            Cpobj => {
                let source = stack.pop_address()?;
                let destination = stack.pop_address()?;
                let ty = OpCodeType::pair(destination, source)
                    .ok_or_else(|| illegal_pair(pc, op, destination, source))?;
                self.annotate(pc, ty);
            }
            Initobj => {
                let address = stack.pop_address()?;
                self.annotate(pc, OpCodeType::single(address));
            }
            Cpblk | Initblk => stack.pop_n(3)?,
            Localloc => {
                let ty = stack.pop_index()?;
                self.annotate(pc, OpCodeType::single(ty));
                stack.push(ManagedPointer)?;
            }

            Ldfld | Ldflda => {
                let object = stack.pop()?;
                if !matches!(object, ObjectRef | ManagedPointer | NativeInt) {
                    return Err(stack.illegal("field owner", object));
                }
                self.annotate(pc, OpCodeType::single(object));
                let field = self.resolver.resolve_field(self.code.imm_token(pc)?, self.scope)?;
                stack.push(match op {
                    Ldfld => field.kind.stack_type(),
                    _ if object == NativeInt => NativeInt,
                    _ => ManagedPointer,
                })?;
            }
            Stfld => {
                stack.pop()?;
                let object = stack.pop()?;
                if !matches!(object, ObjectRef | ManagedPointer | NativeInt) {
                    return Err(stack.illegal("field owner", object));
                }
                self.annotate(pc, OpCodeType::single(object));
            }
            Ldsfld => {
                let field = self.resolver.resolve_field(self.code.imm_token(pc)?, self.scope)?;
                stack.push(field.kind.stack_type())?;
            }
            Ldsflda => stack.push(ManagedPointer)?,
            Stsfld => {
                stack.pop()?;
            }

            Castclass | Isinst => {
                stack.pop_object()?;
                stack.push(ObjectRef)?;
            }
            Box => {
                stack.pop()?;
                stack.push(ObjectRef)?;
            }
            Unbox => {
                stack.pop_object()?;
                stack.push(ManagedPointer)?;
            }
            UnboxAny => {
                stack.pop_object()?;
                stack.push(self.type_kind(self.code.imm_token(pc)?)?)?;
            }

            Newarr => {
                let size = stack.pop_index()?;
                self.annotate(pc, OpCodeType::single(size));
                stack.push(ObjectRef)?;
            }
            Ldlen => {
                stack.pop_object()?;
                stack.push(NativeInt)?;
            }
            Ldelema | LdelemI1 | LdelemU1 | LdelemI2 | LdelemU2 | LdelemI4 | LdelemU4
            | LdelemI8 | LdelemI | LdelemR4 | LdelemR8 | LdelemRef | Ldelem => {
                let index = stack.pop_index()?;
                stack.pop_object()?;
                self.annotate(pc, OpCodeType::single(index));
                stack.push(match op {
                    Ldelema => ManagedPointer,
                    LdelemI8 => Int64,
                    LdelemI => NativeInt,
                    LdelemR4 | LdelemR8 => NativeFloat,
                    LdelemRef => ObjectRef,
                    Ldelem => self.type_kind(self.code.imm_token(pc)?)?,
                    _ => Int32,
                })?;
            }
            StelemI | StelemI1 | StelemI2 | StelemI4 | StelemI8 | StelemR4 | StelemR8
            | StelemRef | Stelem => {
                stack.pop()?;
                let index = stack.pop_index()?;
                stack.pop_object()?;
                self.annotate(pc, OpCodeType::single(index));
            }

            Ldftn => stack.push(ManagedPointer)?,
            Ldvirtftn => {
                stack.pop_object()?;
                stack.push(ManagedPointer)?;
            }
            Mkrefany => {
                stack.pop_address()?;
                stack.push(ObjectRef)?;
            }
            Refanyval => {
                stack.pop()?;
                stack.push(ManagedPointer)?;
            }
            Refanytype => {
                stack.pop()?;
                stack.push(ObjectRef)?;
            }

            op => {
                return Err(EngineError::UnsupportedOpcode {
                    opcode: op as u16,
                    offset: pc,
                })
            }
        }

        if falls_through {
            if next >= self.code.len() {
                return Err(EngineError::invalid_program(pc, "control falls through the end of the method"));
            }
            successors.push((next, false));
        }
        Ok(successors)
    }
}

/// Analyzes `method`'s body. The body is read as declared, never as patched at run time.
pub fn analyze(method: &MethodSymbol, resolver: &dyn SymbolResolver) -> Result<MethodAnalysis, EngineError> {
    Analyzer::new(method, resolver)?.run()
}
