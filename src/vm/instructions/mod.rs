//! Instruction semantics, grouped by category. [`Activation::step`] decodes nothing but
//! the inline operands; typing decisions come from the method's analysis.
use crate::{
    value::StackValue,
    vm::{
        error::{EngineError, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};

mod arithmetic;
mod calls;
mod comparisons;
mod conversions;
mod flow;
mod memory;
mod objects;
mod stack_ops;

fn not_implemented(op: Opcode) -> Trap {
    EngineError::NotImplemented(op.mnemonic().to_string()).into()
}

impl Activation<'_> {
    /// Executes the instruction `op` at `pc`.
    pub(crate) fn step(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        use Opcode::*;

        macro_rules! constant {
            ($value:expr) => {{
                self.result(0, $value)?;
                Ok(StepResult::Continue)
            }};
        }
        macro_rules! var {
            () => {
                self.method.code.imm_var(pc)?
            };
        }

        match op {
            Nop | Break | Unaligned | Volatile | Tail | Constrained | No | Readonly => {
                Ok(StepResult::Continue)
            }

            Ldarg0 => self.load_argument(0),
            Ldarg1 => self.load_argument(1),
            Ldarg2 => self.load_argument(2),
            Ldarg3 => self.load_argument(3),
            LdargS | Ldarg => self.load_argument(var!()),
            LdargaS | Ldarga => self.argument_address(var!()),
            StargS | Starg => self.store_argument(var!()),
            Ldloc0 => self.load_local(0),
            Ldloc1 => self.load_local(1),
            Ldloc2 => self.load_local(2),
            Ldloc3 => self.load_local(3),
            LdlocS | Ldloc => self.load_local(var!()),
            LdlocaS | Ldloca => self.local_address(var!()),
            Stloc0 => self.store_local(0),
            Stloc1 => self.store_local(1),
            Stloc2 => self.store_local(2),
            Stloc3 => self.store_local(3),
            StlocS | Stloc => self.store_local(var!()),

            Ldnull => constant!(StackValue::null()),
            LdcI4M1 => constant!(StackValue::Int32(-1)),
            LdcI40 => constant!(StackValue::Int32(0)),
            LdcI41 => constant!(StackValue::Int32(1)),
            LdcI42 => constant!(StackValue::Int32(2)),
            LdcI43 => constant!(StackValue::Int32(3)),
            LdcI44 => constant!(StackValue::Int32(4)),
            LdcI45 => constant!(StackValue::Int32(5)),
            LdcI46 => constant!(StackValue::Int32(6)),
            LdcI47 => constant!(StackValue::Int32(7)),
            LdcI48 => constant!(StackValue::Int32(8)),
            LdcI4S => constant!(StackValue::Int32(self.method.code.imm_i8(pc)? as i32)),
            LdcI4 => constant!(StackValue::Int32(self.method.code.imm_i32(pc)?)),
            LdcI8 => constant!(StackValue::Int64(self.method.code.imm_i64(pc)?)),
            LdcR4 => constant!(StackValue::NativeFloat(self.method.code.imm_f32(pc)? as f64)),
            LdcR8 => constant!(StackValue::NativeFloat(self.method.code.imm_f64(pc)?)),
            Dup => self.dup(),
            Pop => Ok(StepResult::Continue),

            Br | BrS => self.branch(pc, op),
            Brfalse | BrfalseS | Brtrue | BrtrueS => self.branch_on_condition(pc, op),
            Beq | BeqS | Bge | BgeS | Bgt | BgtS | Ble | BleS | Blt | BltS | BneUn | BneUnS
            | BgeUn | BgeUnS | BgtUn | BgtUnS | BleUn | BleUnS | BltUn | BltUnS => {
                self.compare_branch(pc, op)
            }
            Switch => self.switch(pc),
            Ret => self.ret(),
            Leave | LeaveS => self.leave(pc),
            Endfinally => self.end_finally(pc),
            Throw => self.throw(),
            Rethrow => self.rethrow(pc),

            Ceq | Cgt | CgtUn | Clt | CltUn => self.compare_push(pc, op),

            Add | Sub | Mul | Div | Rem | DivUn | RemUn | And | Or | Xor | AddOvf | AddOvfUn
            | SubOvf | SubOvfUn | MulOvf | MulOvfUn => self.binary(pc, op),
            Shl | Shr | ShrUn => self.shift(pc, op),
            Neg | Not => self.unary(pc, op),
            Ckfinite => self.ckfinite(),

            ConvI1 | ConvI2 | ConvI4 | ConvI8 | ConvR4 | ConvR8 | ConvU4 | ConvU8 | ConvRUn
            | ConvOvfI1Un | ConvOvfI2Un | ConvOvfI4Un | ConvOvfI8Un | ConvOvfU1Un | ConvOvfU2Un
            | ConvOvfU4Un | ConvOvfU8Un | ConvOvfIUn | ConvOvfUUn | ConvOvfI1 | ConvOvfU1
            | ConvOvfI2 | ConvOvfU2 | ConvOvfI4 | ConvOvfU4 | ConvOvfI8 | ConvOvfU8 | ConvU2
            | ConvU1 | ConvI | ConvOvfI | ConvOvfU | ConvU => self.convert(op),

            LdindI1 | LdindU1 | LdindI2 | LdindU2 | LdindI4 | LdindU4 | LdindI8 | LdindI
            | LdindR4 | LdindR8 | LdindRef => self.load_indirect(op),
            StindRef | StindI1 | StindI2 | StindI4 | StindI8 | StindR4 | StindR8 | StindI => {
                self.store_indirect(op)
            }
            Ldobj => self.load_object(pc),
            Stobj => self.store_object(pc),
            Cpobj => self.copy_object(pc),
            Initobj => self.init_object(pc),

            Ldstr => self.load_string(pc),
            Ldtoken => self.load_token(pc),
            Newarr => self.new_array(pc),
            Ldlen => self.array_length(),
            Ldelema => self.element_address(),
            LdelemI1 | LdelemU1 | LdelemI2 | LdelemU2 | LdelemI4 | LdelemU4 | LdelemI8
            | LdelemI | LdelemR4 | LdelemR8 | LdelemRef | Ldelem => self.load_element(pc, op),
            StelemI | StelemI1 | StelemI2 | StelemI4 | StelemI8 | StelemR4 | StelemR8
            | StelemRef | Stelem => self.store_element(pc, op),
            Ldfld => self.load_field(pc),
            Ldflda => self.field_address(pc),
            Stfld => self.store_field(pc),
            Ldsfld => self.load_static(pc),
            Ldsflda => self.static_address(pc),
            Stsfld => self.store_static(pc),
            Castclass => self.cast(pc, true),
            Isinst => self.cast(pc, false),
            Box => self.box_value(pc),
            Unbox => self.unbox(pc),
            UnboxAny => self.unbox_any(pc),
            Sizeof => self.size_of(pc),
            Ldftn => self.function_pointer(pc, false),
            Ldvirtftn => self.function_pointer(pc, true),

            Call | Callvirt | Newobj | Jmp => self.call_site(pc),
            CachedCall => self.cached_call(pc),

            Calli | Localloc | Cpblk | Initblk | Arglist | Mkrefany | Refanyval | Refanytype
            | Endfilter => Err(not_implemented(op)),
        }
    }
}
