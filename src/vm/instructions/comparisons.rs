use crate::{
    value::StackValue,
    vm::{
        analysis::OpCodeType,
        arithmetic::{Comparison, Integer},
        error::{EngineError, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};

impl Activation<'_> {
    /// Evaluates the relation of `op` on the two topmost values without popping them.
    pub(super) fn compare(&self, pc: usize, op: Opcode) -> Result<bool, Trap> {
        let cmp = Comparison::for_opcode(op)
            .ok_or_else(|| EngineError::invalid_state(pc, format!("{} is not a comparison", op)))?;
        let ty = self.op_type(pc)?;
        let result = match ty {
            OpCodeType::Int32 => Some(i32::compare(cmp, self.int32_at(1)?, self.int32_at(0)?)),
            OpCodeType::Int64 => Some(i64::compare(cmp, self.int64_at(1)?, self.int64_at(0)?)),
            OpCodeType::NativeInt | OpCodeType::Int32NativeInt | OpCodeType::NativeIntInt32 => {
                Some(isize::compare(cmp, self.native_at(1)?, self.native_at(0)?))
            }
            OpCodeType::NativeFloat => Some(cmp.floats(self.float_at(1)?, self.float_at(0)?)),
            OpCodeType::Object => cmp.identity(self.object_at(1)? == self.object_at(0)?),
            OpCodeType::ManagedPointer => {
                let equal = match (self.peek(1)?, self.peek(0)?) {
                    (StackValue::ManagedPtr(a), StackValue::ManagedPtr(b)) => a == b,
                    // Uninitialized `&` slots hold null references.
                    (StackValue::ObjectRef(a), StackValue::ObjectRef(b)) => a.is_null() && b.is_null(),
                    _ => false,
                };
                cmp.identity(equal)
            }
            // Symbolic pointers never alias a raw address.
            OpCodeType::NativeIntManagedPointer | OpCodeType::ManagedPointerNativeInt => cmp.identity(false),
            _ => None,
        };
        result.ok_or_else(|| EngineError::NotImplemented(format!("{} on {}", op, ty)).into())
    }

    /// `ceq`, `cgt`, `cgt.un`, `clt` and `clt.un` push 1 or 0.
    pub(super) fn compare_push(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let value = self.compare(pc, op)? as i32;
        let slot = self.result_slot(2)?;
        self.frame.put_int32(slot, value)?;
        Ok(StepResult::Continue)
    }
}
