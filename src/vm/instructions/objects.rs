use crate::{
    types::FieldSymbol,
    value::{ManagedPointer, ObjectRef, StackValue, ValueKind},
    vm::{
        error::{EngineError, FaultKind, Trap},
        interpreter::{Activation, StepResult},
        opcodes::Opcode,
    },
};
use std::sync::Arc;

/// Element kinds of the typed `ldelem.*` and `stelem.*` forms.
fn element_kind(op: Opcode) -> Option<ValueKind> {
    use Opcode::*;
    Some(match op {
        LdelemI1 | StelemI1 => ValueKind::I1,
        LdelemU1 => ValueKind::U1,
        LdelemI2 | StelemI2 => ValueKind::I2,
        LdelemU2 => ValueKind::U2,
        LdelemI4 | StelemI4 => ValueKind::I4,
        LdelemU4 => ValueKind::U4,
        LdelemI8 | StelemI8 => ValueKind::I8,
        LdelemI | StelemI => ValueKind::I,
        LdelemR4 | StelemR4 => ValueKind::R4,
        LdelemR8 | StelemR8 => ValueKind::R8,
        LdelemRef | StelemRef => ValueKind::Object,
        _ => return None,
    })
}

impl Activation<'_> {
    fn resolve_field_at(&self, pc: usize) -> Result<Arc<FieldSymbol>, Trap> {
        let token = self.method.code.imm_token(pc)?;
        Ok(self.engine.resolver().resolve_field(token, &self.method.symbol.scope)?)
    }

    fn element_kind_at(&self, pc: usize, op: Opcode) -> Result<ValueKind, Trap> {
        match element_kind(op) {
            Some(kind) => Ok(kind),
            None => Ok(self.resolve_type_at(pc)?.kind),
        }
    }

    /// The object whose field an `ldfld`, `ldflda` or `stfld` accesses. A `&` owner
    /// refers to a value-type instance, which is read in place.
    fn field_owner(&self, n: usize) -> Result<ObjectRef, Trap> {
        let object = match self.peek(n)? {
            StackValue::ObjectRef(object) => object.clone(),
            StackValue::ManagedPtr(pointer) => match self.deref(pointer, ValueKind::Struct)? {
                StackValue::ObjectRef(object) => object,
                other => {
                    return Err(EngineError::NotImplemented(format!(
                        "field access on {:?} through {:?}",
                        other, pointer
                    ))
                    .into())
                }
            },
            StackValue::NativeInt(_) => {
                return Err(EngineError::NotImplemented("field access through unmanaged pointers".to_string()).into())
            }
            other => {
                return Err(EngineError::invalid_program(self.pc, format!("field owner {:?}", other)).into())
            }
        };
        if object.is_null() {
            return Err(FaultKind::NullReference.into());
        }
        Ok(object)
    }

    fn non_null_at(&self, n: usize) -> Result<ObjectRef, Trap> {
        let object = self.object_at(n)?;
        if object.is_null() {
            return Err(FaultKind::NullReference.into());
        }
        Ok(object)
    }

    pub(super) fn load_string(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let token = self.method.code.imm_token(pc)?;
        let value = self.engine.metadata().user_string(&self.method.symbol.scope, token)?;
        let string = self.engine.object_model().create_string(&value)?;
        let slot = self.result_slot(0)?;
        self.frame.put_object(slot, string)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn load_token(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let token = self.method.code.imm_token(pc)?;
        let symbol = self.engine.resolver().resolve_token(token, &self.method.symbol.scope)?;
        let handle = self.engine.object_model().runtime_handle(&symbol)?;
        let slot = self.result_slot(0)?;
        self.frame.put_object(slot, handle)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn new_array(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let element = self.resolve_type_at(pc)?;
        let length = usize::try_from(self.native_at(0)?).map_err(|_| Trap::from(FaultKind::Overflow))?;
        let array = self.engine.object_model().new_array(&element, length)?;
        let slot = self.result_slot(1)?;
        self.frame.put_object(slot, array)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn array_length(&mut self) -> Result<StepResult, Trap> {
        let array = self.non_null_at(0)?;
        let length = self.engine.object_model().array_length(&array)?;
        let slot = self.result_slot(1)?;
        self.frame.put_native_int(slot, length as isize)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn element_address(&mut self) -> Result<StepResult, Trap> {
        let array = self.non_null_at(1)?;
        let index = self.index_at(0)?;
        if index >= self.engine.object_model().array_length(&array)? {
            return Err(FaultKind::IndexOutOfRange.into());
        }
        let slot = self.result_slot(2)?;
        self.frame.put_pointer(slot, ManagedPointer::Element { array, index })?;
        Ok(StepResult::Continue)
    }

    pub(super) fn load_element(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let kind = self.element_kind_at(pc, op)?;
        let array = self.non_null_at(1)?;
        let index = self.index_at(0)?;
        let value = self.engine.object_model().load_element(&array, index, kind)?;
        self.result(2, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_element(&mut self, pc: usize, op: Opcode) -> Result<StepResult, Trap> {
        let kind = self.element_kind_at(pc, op)?;
        let array = self.non_null_at(2)?;
        let index = self.index_at(1)?;
        let value = self.engine.normalize(self.top, kind, self.peek(0)?.clone())?;
        self.engine.object_model().store_element(&array, index, kind, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn load_field(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let objects = self.engine.object_model();
        let value = if field.is_static {
            objects.load_static(&field)?
        } else {
            objects.load_field(&self.field_owner(0)?, &field)?
        };
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn field_address(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let pointer = if field.is_static {
            ManagedPointer::Static { field }
        } else {
            ManagedPointer::Field {
                object: self.field_owner(0)?,
                field,
            }
        };
        let slot = self.result_slot(1)?;
        self.frame.put_pointer(slot, pointer)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_field(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let value = self.engine.normalize(self.top, field.kind, self.peek(0)?.clone())?;
        let objects = self.engine.object_model();
        if field.is_static {
            objects.store_static(&field, value)?;
        } else {
            objects.store_field(&self.field_owner(1)?, &field, value)?;
        }
        Ok(StepResult::Continue)
    }

    pub(super) fn load_static(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let value = self.engine.object_model().load_static(&field)?;
        self.result(0, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn static_address(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let slot = self.result_slot(0)?;
        self.frame.put_pointer(slot, ManagedPointer::Static { field })?;
        Ok(StepResult::Continue)
    }

    pub(super) fn store_static(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let field = self.resolve_field_at(pc)?;
        let value = self.engine.normalize(self.top, field.kind, self.peek(0)?.clone())?;
        self.engine.object_model().store_static(&field, value)?;
        Ok(StepResult::Continue)
    }

    /// `castclass` when `throw_on_fail` is set, `isinst` otherwise. Null always passes.
    pub(super) fn cast(&mut self, pc: usize, throw_on_fail: bool) -> Result<StepResult, Trap> {
        let target = self.resolve_type_at(pc)?;
        let object = self.object_at(0)?;
        let Some(ty) = object.type_handle() else {
            return Ok(StepResult::Continue);
        };
        if !self.engine.resolver().is_assignable(ty, target.handle) {
            if throw_on_fail {
                let from = self.engine.resolver().type_of(ty)?;
                return Err(Trap::Fault(
                    FaultKind::InvalidCast,
                    format!("Unable to cast object of type '{}' to type '{}'.", from.name, target.name),
                ));
            }
            self.result(1, StackValue::null())?;
        }
        Ok(StepResult::Continue)
    }

    pub(super) fn box_value(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        if !ty.is_value_type {
            // Boxing a reference type leaves the reference unchanged.
            return Ok(StepResult::Continue);
        }
        let value = self.engine.normalize(self.top, ty.kind, self.peek(0)?.clone())?;
        let boxed = self.engine.object_model().box_value(&ty, value)?;
        let slot = self.result_slot(1)?;
        self.frame.put_object(slot, boxed)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn unbox(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let object = self.non_null_at(0)?;
        let pointer = self.engine.object_model().unbox_reference(&object, &ty)?;
        let slot = self.result_slot(1)?;
        self.frame.put_pointer(slot, pointer)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn unbox_any(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        if !ty.is_value_type {
            return self.cast(pc, true);
        }
        let object = self.non_null_at(0)?;
        let value = self.engine.object_model().unbox(&object, &ty)?;
        self.result(1, value)?;
        Ok(StepResult::Continue)
    }

    pub(super) fn size_of(&mut self, pc: usize) -> Result<StepResult, Trap> {
        let ty = self.resolve_type_at(pc)?;
        let size = self.engine.object_model().size_of(&ty) as i32;
        let slot = self.result_slot(0)?;
        self.frame.put_int32(slot, size)?;
        Ok(StepResult::Continue)
    }

    /// `ldftn`, or `ldvirtftn` when `virtual` is set, which selects the implementation
    /// for the receiver on top of the stack.
    pub(super) fn function_pointer(&mut self, pc: usize, r#virtual: bool) -> Result<StepResult, Trap> {
        let token = self.method.code.imm_token(pc)?;
        let resolver = self.engine.resolver();
        let mut method = resolver.resolve_method(token, &self.method.symbol.scope)?;
        if r#virtual {
            let receiver = self.non_null_at(0)?;
            if let (true, Some(ty)) = (method.is_virtual, receiver.type_handle()) {
                method = resolver.resolve_virtual(&method, ty)?;
            }
        }
        let pops = usize::from(r#virtual);
        let slot = self.result_slot(pops)?;
        self.frame.put_pointer(slot, ManagedPointer::Method(method.handle))?;
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_kinds() {
        assert_eq!(element_kind(Opcode::LdelemU2), Some(ValueKind::U2));
        assert_eq!(element_kind(Opcode::StelemRef), Some(ValueKind::Object));
        assert_eq!(element_kind(Opcode::Ldelem), None);
    }
}
