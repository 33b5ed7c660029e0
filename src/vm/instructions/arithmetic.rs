use crate::{
    value::{ManagedPointer, StackType, StackValue},
    vm::{
        analysis::OpCodeType,
        arithmetic::{check_finite, float_binary, Integer},
        error::{EngineError, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};

fn unsupported(op: Opcode, ty: OpCodeType) -> Trap {
    EngineError::NotImplemented(format!("{} on {}", op, ty)).into()
}

impl Activation<'_> {
    pub(super) fn binary(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        use OpCodeType as T;
        let ty = self.op_type(pc)?;
        let value = match ty {
            T::Int32 => i32::binary(op, self.int32_at(1)?, self.int32_at(0)?)?.into_value(),
            T::Int64 => i64::binary(op, self.int64_at(1)?, self.int64_at(0)?)?.into_value(),
            T::NativeInt | T::Int32NativeInt | T::NativeIntInt32 => {
                isize::binary(op, self.native_at(1)?, self.native_at(0)?)?.into_value()
            }
            T::NativeFloat => StackValue::NativeFloat(float_binary(op, self.float_at(1)?, self.float_at(0)?)?),
            T::ManagedPointerInt32 | T::ManagedPointerNativeInt => {
                let offset = self.native_at(0)?;
                let offset = match op {
                    Opcode::Add | Opcode::AddOvfUn => offset,
                    Opcode::Sub | Opcode::SubOvfUn => offset.checked_neg().ok_or_else(|| unsupported(op, ty))?,
                    _ => return Err(unsupported(op, ty)),
                };
                StackValue::ManagedPtr(self.offset_pointer(self.pointer_at(1)?, offset)?)
            }
            T::Int32ManagedPointer | T::NativeIntManagedPointer => {
                StackValue::ManagedPtr(self.offset_pointer(self.pointer_at(0)?, self.native_at(1)?)?)
            }
            T::ManagedPointer => {
                StackValue::NativeInt(self.pointer_difference(&self.pointer_at(1)?, &self.pointer_at(0)?)?)
            }
            _ => return Err(unsupported(op, ty)),
        };
        self.result(2, value)?;
        Ok(StepResult::Continue)
    }

    /// Moves an element pointer by `bytes`, which must be a whole number of elements.
    fn offset_pointer(&self, pointer: ManagedPointer, bytes: isize) -> Result<ManagedPointer, Trap> {
        let ManagedPointer::Element { array, index } = pointer else {
            return Err(EngineError::NotImplemented(format!(
                "arithmetic on {:?}, which does not point into an array",
                pointer
            ))
            .into());
        };
        let size = self.engine.object_model().element_size(&array)? as isize;
        if size == 0 || bytes % size != 0 {
            return Err(EngineError::NotImplemented(format!(
                "offset of {} bytes into elements of {} bytes",
                bytes, size
            ))
            .into());
        }
        let index = (index as isize)
            .checked_add(bytes / size)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| EngineError::NotImplemented("pointer before the start of an array".to_string()))?;
        Ok(ManagedPointer::Element { array, index })
    }

    /// Byte distance between two pointers into the same array.
    fn pointer_difference(&self, left: &ManagedPointer, right: &ManagedPointer) -> Result<isize, Trap> {
        match (left, right) {
            (
                ManagedPointer::Element { array, index: a },
                ManagedPointer::Element { array: other, index: b },
            ) if array == other => {
                let size = self.engine.object_model().element_size(array)? as isize;
                Ok((*a as isize - *b as isize) * size)
            }
            _ if left == right => Ok(0),
            _ => Err(EngineError::NotImplemented(format!(
                "difference of unrelated pointers {:?} and {:?}",
                left, right
            ))
            .into()),
        }
    }

    pub(super) fn unary(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        fn apply<T: Integer>(op: Opcode, value: T) -> StackValue {
            match op {
                Opcode::Neg => value.negate(),
                _ => value.complement(),
            }
            .into_value()
        }

        let ty = self.op_type(pc)?;
        let value = match ty {
            OpCodeType::Int32 => apply(op, self.int32_at(0)?),
            OpCodeType::Int64 => apply(op, self.int64_at(0)?),
            OpCodeType::NativeInt => apply(op, self.native_at(0)?),
            OpCodeType::NativeFloat if op == Opcode::Neg => StackValue::NativeFloat(-self.float_at(0)?),
            _ => return Err(unsupported(op, ty)),
        };
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }

    /// `shl`, `shr` and `shr.un`. The result has the type of the shifted value.
    pub(super) fn shift(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let ty = self.op_type(pc)?;
        let amount = self.native_at(0)? as u32;
        let value = match ty.operands().0 {
            StackType::Int32 => i32::shift(op, self.int32_at(1)?, amount)?.into_value(),
            StackType::Int64 => i64::shift(op, self.int64_at(1)?, amount)?.into_value(),
            StackType::NativeInt => isize::shift(op, self.native_at(1)?, amount)?.into_value(),
            _ => return Err(unsupported(op, ty)),
        };
        self.result(2, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn ckfinite(&mut self) -> Result<StepResult, Trap> {
        let value = check_finite(self.float_at(0)?)?;
        let slot = self.result_slot(1)?;
        self.frame.put_native_float(slot, value)?;
        Ok(StepResult::Continue)
    }
}
