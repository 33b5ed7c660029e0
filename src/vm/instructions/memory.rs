//! Indirect loads and stores through managed pointers.
use crate::{
    types::TypeSymbol,
    value::{ManagedPointer, StackValue, ValueKind},
    vm::{
        error::{EngineError, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};
use std::sync::Arc;

fn indirect_kind(op: Opcode) -> Option<ValueKind> {
    use Opcode::*;
    Some(match op {
        LdindI1 | StindI1 => ValueKind::I1,
        LdindU1 => ValueKind::U1,
        LdindI2 | StindI2 => ValueKind::I2,
        LdindU2 => ValueKind::U2,
        LdindI4 | StindI4 => ValueKind::I4,
        LdindU4 => ValueKind::U4,
        LdindI8 | StindI8 => ValueKind::I8,
        LdindI | StindI => ValueKind::I,
        LdindR4 | StindR4 => ValueKind::R4,
        LdindR8 | StindR8 => ValueKind::R8,
        LdindRef | StindRef => ValueKind::Object,
        _ => return None,
    })
}

impl Activation<'_> {
    pub(super) fn resolve_type_at(&self, pc: usize) -> Result<Arc<TypeSymbol>, Trap> {
        let token = self.method.code.imm_token(pc)?;
        Ok(self.engine.resolver().resolve_type(token, &self.method.symbol.scope)?)
    }

    /// The declared kind of an argument or local slot of this frame.
    fn slot_kind(&self, slot: usize) -> Result<ValueKind, Trap> {
        let layout = &self.method.layout;
        let kind = if slot < layout.arguments {
            self.method.arg_kinds.get(slot)
        } else {
            self.method.local_kinds.get(slot - layout.local_base())
        };
        kind.copied().ok_or_else(|| {
            EngineError::invalid_state(self.pc, format!("slot {} is neither an argument nor a local", slot)).into()
        })
    }

    fn check_frame(&self, pointer: &ManagedPointer) -> Result<usize, Trap> {
        match pointer {
            ManagedPointer::Stack { frame, slot } if *frame == self.frame.id() => Ok(*slot),
            _ => Err(EngineError::NotImplemented(format!(
                "access through {:?} from another frame",
                pointer
            ))
            .into()),
        }
    }

    /// Reads the location `pointer` names, without value-type copying.
    pub(super) fn deref(&self, pointer: &ManagedPointer, kind: ValueKind) -> Result<StackValue, Trap> {
        let objects = self.engine.object_model();
        Ok(match pointer {
            ManagedPointer::Stack { .. } => self.frame.get(self.check_frame(pointer)?)?.clone(),
            ManagedPointer::Field { object, field } => objects.load_field(object, field)?,
            ManagedPointer::Static { field } => objects.load_static(field)?,
            ManagedPointer::Element { array, index } => objects.load_element(array, *index, kind)?,
            ManagedPointer::Boxed(object) => objects.load_boxed(object)?,
            ManagedPointer::Method(_) => {
                return Err(EngineError::NotImplemented("indirection through a method pointer".to_string()).into())
            }
        })
    }

    /// Reads `pointer` as a value of `kind`.
    pub(super) fn load_through(&self, pointer: &ManagedPointer, kind: ValueKind) -> Result<StackValue, Trap> {
        let value = self.deref(pointer, kind)?;
        self.engine.normalize(self.top, kind, value)
    }

    /// Writes `value` to the location `pointer` names, narrowed to `kind`.
    pub(super) fn store_through(
        &mut self,
        pointer: &ManagedPointer,
        kind: ValueKind,
        value: StackValue,
    ) -> Result<(), Trap> {
        let objects = self.engine.object_model();
        match pointer {
            ManagedPointer::Stack { .. } => {
                let slot = self.check_frame(pointer)?;
                let value = self.engine.normalize(slot, self.slot_kind(slot)?, value)?;
                self.frame.put(slot, value)?;
            }
            ManagedPointer::Field { object, field } => {
                let value = self.engine.normalize(self.top, field.kind, value)?;
                objects.store_field(object, field, value)?;
            }
            ManagedPointer::Static { field } => {
                let value = self.engine.normalize(self.top, field.kind, value)?;
                objects.store_static(field, value)?;
            }
            ManagedPointer::Element { array, index } => {
                let value = self.engine.normalize(self.top, kind, value)?;
                objects.store_element(array, *index, kind, value)?;
            }
            ManagedPointer::Boxed(object) => {
                let value = self.engine.normalize(self.top, kind, value)?;
                objects.store_boxed(object, value)?;
            }
            ManagedPointer::Method(_) => {
                return Err(EngineError::NotImplemented("store through a method pointer".to_string()).into())
            }
        }
        Ok(())
    }

    fn indirect_kind(&self, op: Opcode) -> Result<ValueKind, Trap> {
        indirect_kind(op)
            .ok_or_else(|| EngineError::invalid_state(self.pc, format!("{} is not an indirection", op)).into())
    }

    pub(super) fn load_indirect(&mut self, op: Opcode) -> Result<StepResult, Trap> {
        let kind = self.indirect_kind(op)?;
        let pointer = self.address_at(0)?;
        let value = self.load_through(&pointer, kind)?;
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_indirect(&mut self, op: Opcode) -> Result<StepResult, Trap> {
        let kind = self.indirect_kind(op)?;
        let pointer = self.address_at(1)?;
        let value = self.peek(0)?.clone();
        self.store_through(&pointer, kind, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn load_object(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let pointer = self.address_at(0)?;
        let value = self.load_through(&pointer, ty.kind)?;
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_object(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let pointer = self.address_at(1)?;
        let value = self.peek(0)?.clone();
        self.store_through(&pointer, ty.kind, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn copy_object(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let destination = self.address_at(1)?;
        let source = self.address_at(0)?;
        let value = self.load_through(&source, ty.kind)?;
        self.store_through(&destination, ty.kind, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn init_object(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let pointer = self.address_at(0)?;
        let value = self.engine.object_model().default_value(&ty)?;
        self.store_through(&pointer, ty.kind, value)?;
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indirect_kinds() {
        assert_eq!(indirect_kind(Opcode::LdindU1), Some(ValueKind::U1));
        assert_eq!(indirect_kind(Opcode::StindRef), Some(ValueKind::Object));
        assert_eq!(indirect_kind(Opcode::Ldobj), None);
    }
}
