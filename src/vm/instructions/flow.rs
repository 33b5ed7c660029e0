use crate::{
    utils::il_label,
    value::StackValue,
    vm::{
        analysis::OpCodeType,
        error::{EngineError, FaultKind, GuestException, Trap},
        exceptions::Unwind,
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
    vm_trace_branch,
};

impl Activation<'_> {
    fn jump_if(&self, pc: usize, op: Opcode, taken: bool) -> Result<StepResult, Trap> {
        let target = self.method.code.branch_target(pc)?;
        vm_trace_branch!(self, op.mnemonic(), target, taken);
        Ok(if taken {
            StepResult::Jump(target)
        } else {
            StepResult::Continue
        })
    }

    pub(super) fn branch(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        self.jump_if(pc, op, true)
    }

    /// `brtrue` and `brfalse`. Non-zero integers and non-null references are true.
    pub(super) fn branch_on_condition(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let truthy = match self.op_type(pc)? {
            OpCodeType::Int32 => self.int32_at(0)? != 0,
            OpCodeType::Int64 => self.int64_at(0)? != 0,
            OpCodeType::NativeInt => self.native_at(0)? != 0,
            OpCodeType::Object => !self.object_at(0)?.is_null(),
            OpCodeType::ManagedPointer => match self.peek(0)? {
                StackValue::ObjectRef(o) => !o.is_null(),
                _ => true,
            },
            ty => {
                return Err(EngineError::invalid_program(pc, format!("{} on {}", op, ty)).into())
            }
        };
        let taken = match op {
            Opcode::Brtrue | Opcode::BrtrueS => truthy,
            _ => !truthy,
        };
        self.jump_if(pc, op, taken)
    }

    pub(super) fn compare_branch(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let taken = self.compare(pc, op)?;
        self.jump_if(pc, op, taken)
    }

    /// Out-of-range indices, read as unsigned, fall through.
    pub(super) fn switch(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let index = match self.peek(0)? {
            StackValue::Int32(i) => *i as u32 as usize,
            _ => self.native_at(0)? as usize,
        };
        let targets = self.method.code.switch_targets(pc)?;
        Ok(match targets.get(index) {
            Some(target) => StepResult::Jump(*target),
            None => StepResult::Continue,
        })
    }

    pub(super) fn ret(&mut self) -> Result<StepResult, Trap> {
        let value = match self.method.symbol.signature.return_type {
            Some(kind) => {
                let value = self.pop()?;
                Some(self.engine.normalize(self.top, kind, value)?)
            }
            None => None,
        };
        if self.top != self.method.layout.stack_base() {
            return Err(EngineError::invalid_program(self.pc, "evaluation stack not empty on return").into());
        }
        Ok(StepResult::Return(value))
    }

    pub(super) fn leave(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let target = self.method.code.branch_target(pc)?;
        self.reset_stack();
        let method = self.method.clone();
        let next = self.eh.leave(&method.regions, pc, target);
        if next != target {
            self.enter_handler(next, None)?;
        }
        Ok(StepResult::Jump(next))
    }

    pub(super) fn end_finally(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let method = self.method.clone();
        match self.eh.end_finally(&method.regions, pc, self.engine.resolver())? {
            Unwind::Resume { pc, exception } => {
                self.enter_handler(pc, exception)?;
                Ok(StepResult::Jump(pc))
            }
            Unwind::Propagate(exception) => Ok(StepResult::Propagate(exception)),
        }
    }

    pub(super) fn throw(&mut self) -> Result<StepResult, Trap> {
        let object = self.object_at(0)?;
        let Some(ty) = object.type_handle() else {
            return Err(FaultKind::NullReference.into());
        };
        let message = self.engine.resolver().type_of(ty)?.name.clone();
        Err(Trap::Thrown(GuestException {
            object,
            kind: None,
            message,
        }))
    }

    pub(super) fn rethrow(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let exception = self.eh.rethrow(&self.method.regions, pc)?;
        tracing::trace!(offset = ?il_label(pc), %exception, "rethrow");
        Err(Trap::Thrown(exception))
    }
}
