use crate::vm::{
    arithmetic::ConvOp,
    error::{EngineError, Trap},
    interpreter::{Activation, StepResult},
    opcodes::Opcode,
};

impl Activation<'_> {
    pub(super) fn convert(&mut self, op: Opcode) -> Result<StepResult, Trap> {
        let conv = ConvOp::for_opcode(op)
            .ok_or_else(|| EngineError::invalid_state(self.pc, format!("{} is not a conversion", op)))?;
        let value = conv.apply(self.peek(0)?)?;
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }
}
