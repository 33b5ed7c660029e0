use crate::{
    value::ManagedPointer,
    vm::{
        error::{EngineError, Trap},
        interpreter::{Activation, StepResult},
    },
};

impl Activation<'_> {
    fn argument_slot(&self, index: usize) -> Result<usize, Trap> {
        if index < self.method.layout.arguments {
            Ok(index)
        } else {
            Err(EngineError::invalid_program(self.pc, format!("argument {} out of range", index)).into())
        }
    }

    fn local_slot(&self, index: usize) -> Result<usize, Trap> {
        if index < self.method.layout.locals {
            Ok(self.method.layout.local_base() + index)
        } else {
            Err(EngineError::invalid_program(self.pc, format!("local {} out of range", index)).into())
        }
    }

    pub(super) fn load_argument(&mut self, index: usize) -> Result<StepResult, Trap> {
        let (src, dst) = (self.argument_slot(index)?, self.result_slot(0)?);
        self.frame.copy(src, dst)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn load_local(&mut self, index: usize) -> Result<StepResult, Trap> {
        let (src, dst) = (self.local_slot(index)?, self.result_slot(0)?);
        self.frame.copy(src, dst)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_argument(&mut self, index: usize) -> Result<StepResult, Trap> {
        let slot = self.argument_slot(index)?;
        let kind = self.method.arg_kinds[index];
        let value = self.engine.normalize(slot, kind, self.peek(0)?.clone())?;
        self.frame.put(slot, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_local(&mut self, index: usize) -> Result<StepResult, Trap> {
        let slot = self.local_slot(index)?;
        let kind = self.method.local_kinds[index];
        let value = self.engine.normalize(slot, kind, self.peek(0)?.clone())?;
        self.frame.put(slot, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn argument_address(&mut self, index: usize) -> Result<StepResult, Trap> {
        let slot = self.argument_slot(index)?;
        let pointer = ManagedPointer::Stack {
            frame: self.frame.id(),
            slot,
        };
        let top = self.result_slot(0)?;
        self.frame.put_pointer(top, pointer)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn local_address(&mut self, index: usize) -> Result<StepResult, Trap> {
        let slot = self.local_slot(index)?;
        let pointer = ManagedPointer::Stack {
            frame: self.frame.id(),
            slot,
        };
        let top = self.result_slot(0)?;
        self.frame.put_pointer(top, pointer)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn dup(&mut self) -> Result<StepResult, Trap> {
        let top = self.result_slot(1)?;
        self.frame.copy(top, top + 1)?;
        Ok(StepResult::Continue)
    }
}
