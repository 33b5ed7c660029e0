//! A reference-counted object model backing [`Assemblies`].
//!
//! Objects are plain `Arc`s; there is no collector. An optional allocation limit makes
//! `OutOfMemory` reachable from guest code.
use crate::{
    resolve::{Assemblies, SymbolResolver},
    types::{FieldHandle, FieldSymbol, MethodHandle, MethodSymbol, TokenSymbol, TypeHandle, TypeSymbol},
    utils::sync::{AtomicUsize, Mutex, Ordering, RwLock},
    value::{ManagedObject, ManagedPointer, ObjectModel, ObjectRef, StackValue, ValueKind},
    vm::error::{EngineError, ExecutionError, FaultKind},
};
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// A host function standing in for a method without a CIL body.
pub type NativeMethod =
    Arc<dyn Fn(&[StackValue]) -> Result<Option<StackValue>, ExecutionError> + Send + Sync>;

macro_rules! managed_object {
    ($name:ident) => {
        impl ManagedObject for $name {
            fn type_handle(&self) -> TypeHandle {
                self.type_handle
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

#[derive(Debug)]
pub struct StringObject {
    type_handle: TypeHandle,
    pub value: String,
}
managed_object!(StringObject);

#[derive(Debug)]
pub struct ArrayObject {
    type_handle: TypeHandle,
    pub element: Arc<TypeSymbol>,
    items: Mutex<Vec<StackValue>>,
}
managed_object!(ArrayObject);

impl ArrayObject {
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A class instance, or a value type instance when `is_value_type` is set.
#[derive(Debug)]
pub struct InstanceObject {
    type_handle: TypeHandle,
    is_value_type: bool,
    fields: Mutex<HashMap<FieldHandle, StackValue>>,
}
managed_object!(InstanceObject);

#[derive(Debug)]
pub struct BoxedValue {
    type_handle: TypeHandle,
    value: Mutex<StackValue>,
}
managed_object!(BoxedValue);

/// An exception raised by the engine itself.
#[derive(Debug)]
pub struct ExceptionObject {
    type_handle: TypeHandle,
    pub kind: FaultKind,
    pub message: String,
}
managed_object!(ExceptionObject);

pub struct RuntimeHandleObject {
    type_handle: TypeHandle,
    pub symbol: TokenSymbol,
}
managed_object!(RuntimeHandleObject);

impl fmt::Debug for RuntimeHandleObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            TokenSymbol::Type(t) => write!(f, "RuntimeTypeHandle({})", t.name),
            TokenSymbol::Method(m) => write!(f, "RuntimeMethodHandle({})", m.name),
            TokenSymbol::Field(x) => write!(f, "RuntimeFieldHandle({})", x.name),
        }
    }
}

fn no_op_constructor(_: &[StackValue]) -> Result<Option<StackValue>, ExecutionError> {
    Ok(None)
}

pub struct Heap {
    assemblies: Arc<Assemblies>,
    statics: Mutex<HashMap<FieldHandle, StackValue>>,
    natives: RwLock<HashMap<MethodHandle, NativeMethod>>,
    allocated: AtomicUsize,
    limit: Option<usize>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .field("limit", &self.limit)
            .finish()
    }
}

impl Heap {
    pub fn new(assemblies: Arc<Assemblies>) -> Self {
        let heap = Self {
            assemblies,
            statics: Mutex::new(HashMap::new()),
            natives: RwLock::new(HashMap::new()),
            allocated: AtomicUsize::new(0),
            limit: None,
        };
        let core = *heap.assemblies.core();
        for ctor in [core.object_ctor, core.exception_ctor] {
            if let Ok(method) = heap.assemblies.method(ctor) {
                heap.register_native(method.handle, Arc::new(no_op_constructor));
            }
        }
        heap
    }

    /// Fails allocations with `OutOfMemory` once `limit` objects have been allocated.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn register_native(&self, method: MethodHandle, implementation: NativeMethod) {
        self.natives.write().insert(method, implementation);
    }

    /// The contents of a string object.
    pub fn string_value(&self, object: &ObjectRef) -> Option<String> {
        object.downcast::<StringObject>().map(|s| s.value.clone())
    }

    fn allocate(&self, object: impl ManagedObject) -> Result<ObjectRef, FaultKind> {
        let count = self.allocated.fetch_add(1, Ordering::Relaxed);
        if self.limit.is_some_and(|limit| count >= limit) {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return Err(FaultKind::OutOfMemory);
        }
        Ok(ObjectRef::new(object))
    }

    fn type_handle_of(&self, name: &str) -> TypeHandle {
        let token = self
            .assemblies
            .type_token(name)
            .unwrap_or(self.assemblies.core().object);
        TypeHandle(token.row())
    }

    fn array<'a>(&self, array: &'a ObjectRef) -> Result<&'a ArrayObject, FaultKind> {
        if array.is_null() {
            return Err(FaultKind::NullReference);
        }
        array.downcast::<ArrayObject>().ok_or(FaultKind::InvalidCast)
    }

    fn instance<'a>(&self, object: &'a ObjectRef) -> Result<&'a InstanceObject, FaultKind> {
        if object.is_null() {
            return Err(FaultKind::NullReference);
        }
        object.downcast::<InstanceObject>().ok_or(FaultKind::InvalidCast)
    }

    fn boxed<'a>(&self, object: &'a ObjectRef) -> Result<&'a BoxedValue, FaultKind> {
        if object.is_null() {
            return Err(FaultKind::NullReference);
        }
        object.downcast::<BoxedValue>().ok_or(FaultKind::InvalidCast)
    }

    fn field_default(&self, field: &FieldSymbol) -> Result<StackValue, FaultKind> {
        match self.assemblies.type_symbol(field.field_type) {
            Some(ty) => self.default_value(&ty),
            None => Ok(field.kind.default_value()),
        }
    }

    fn store(kind: ValueKind, value: StackValue) -> Result<StackValue, FaultKind> {
        kind.coerce(value).ok_or(FaultKind::InvalidCast)
    }
}

impl ObjectModel for Heap {
    fn create_string(&self, value: &str) -> Result<ObjectRef, FaultKind> {
        self.allocate(StringObject {
            type_handle: TypeHandle(self.assemblies.core().string.row()),
            value: value.to_string(),
        })
    }

    fn create_new(&self, ty: &TypeSymbol) -> Result<ObjectRef, FaultKind> {
        let mut fields = HashMap::new();
        for field in self.assemblies.instance_fields(ty.handle) {
            fields.insert(field.handle, self.field_default(&field)?);
        }
        self.allocate(InstanceObject {
            type_handle: ty.handle,
            is_value_type: ty.is_value_type,
            fields: Mutex::new(fields),
        })
    }

    fn create_exception(&self, kind: FaultKind, message: &str) -> ObjectRef {
        ObjectRef::new(ExceptionObject {
            type_handle: self.type_handle_of(&kind.to_string()),
            kind,
            message: message.to_string(),
        })
    }

    fn box_value(&self, ty: &TypeSymbol, value: StackValue) -> Result<ObjectRef, FaultKind> {
        if !ty.is_value_type {
            return match value {
                StackValue::ObjectRef(o) => Ok(o),
                _ => Err(FaultKind::InvalidCast),
            };
        }
        let value = Self::store(ty.kind, self.copy_value(&value)?)?;
        self.allocate(BoxedValue {
            type_handle: ty.handle,
            value: Mutex::new(value),
        })
    }

    fn unbox(&self, object: &ObjectRef, ty: &TypeSymbol) -> Result<StackValue, FaultKind> {
        let boxed = self.boxed(object)?;
        if boxed.type_handle != ty.handle {
            return Err(FaultKind::InvalidCast);
        }
        let value = boxed.value.lock().clone();
        self.copy_value(&value)
    }

    fn unbox_reference(
        &self,
        object: &ObjectRef,
        ty: &TypeSymbol,
    ) -> Result<ManagedPointer, FaultKind> {
        let boxed = self.boxed(object)?;
        if boxed.type_handle != ty.handle {
            return Err(FaultKind::InvalidCast);
        }
        Ok(ManagedPointer::Boxed(object.clone()))
    }

    fn load_boxed(&self, object: &ObjectRef) -> Result<StackValue, FaultKind> {
        Ok(self.boxed(object)?.value.lock().clone())
    }

    fn store_boxed(&self, object: &ObjectRef, value: StackValue) -> Result<(), FaultKind> {
        let boxed = self.boxed(object)?;
        let mut slot = boxed.value.lock();
        let kind = self
            .assemblies
            .type_symbol(boxed.type_handle)
            .map_or(ValueKind::Object, |t| t.kind);
        *slot = Self::store(kind, value)?;
        Ok(())
    }

    fn new_array(&self, element: &TypeSymbol, length: usize) -> Result<ObjectRef, FaultKind> {
        let items = (0..length)
            .map(|_| self.default_value(element))
            .collect::<Result<Vec<_>, _>>()?;
        self.allocate(ArrayObject {
            type_handle: TypeHandle(self.assemblies.core().array.row()),
            element: Arc::new(element.clone()),
            items: Mutex::new(items),
        })
    }

    fn array_length(&self, array: &ObjectRef) -> Result<usize, FaultKind> {
        Ok(self.array(array)?.len())
    }

    fn element_size(&self, array: &ObjectRef) -> Result<usize, FaultKind> {
        let array = self.array(array)?;
        Ok(self.size_of(&array.element))
    }

    fn load_element(
        &self,
        array: &ObjectRef,
        index: usize,
        kind: ValueKind,
    ) -> Result<StackValue, FaultKind> {
        let array = self.array(array)?;
        if kind.stack_type() != array.element.kind.stack_type() {
            return Err(FaultKind::ArrayTypeMismatch);
        }
        let value = array
            .items
            .lock()
            .get(index)
            .cloned()
            .ok_or(FaultKind::IndexOutOfRange)?;
        Self::store(kind, value)
    }

    fn store_element(
        &self,
        array: &ObjectRef,
        index: usize,
        kind: ValueKind,
        value: StackValue,
    ) -> Result<(), FaultKind> {
        let array = self.array(array)?;
        if kind.stack_type() != array.element.kind.stack_type() {
            return Err(FaultKind::ArrayTypeMismatch);
        }
        if let StackValue::ObjectRef(o) = &value {
            if let Some(actual) = o.type_handle() {
                if !array.element.is_value_type
                    && !self.assemblies.is_assignable(actual, array.element.handle)
                {
                    return Err(FaultKind::ArrayTypeMismatch);
                }
            }
        }
        let value = Self::store(array.element.kind, value)?;
        let mut items = array.items.lock();
        let slot = items.get_mut(index).ok_or(FaultKind::IndexOutOfRange)?;
        *slot = value;
        Ok(())
    }

    fn load_field(&self, object: &ObjectRef, field: &FieldSymbol) -> Result<StackValue, FaultKind> {
        let instance = self.instance(object)?;
        let existing = instance.fields.lock().get(&field.handle).cloned();
        match existing {
            Some(v) => Ok(v),
            None => self.field_default(field),
        }
    }

    fn store_field(
        &self,
        object: &ObjectRef,
        field: &FieldSymbol,
        value: StackValue,
    ) -> Result<(), FaultKind> {
        let instance = self.instance(object)?;
        let value = Self::store(field.kind, value)?;
        instance.fields.lock().insert(field.handle, value);
        Ok(())
    }

    fn load_static(&self, field: &FieldSymbol) -> Result<StackValue, FaultKind> {
        let existing = self.statics.lock().get(&field.handle).cloned();
        match existing {
            Some(v) => Ok(v),
            None => {
                let value = self.field_default(field)?;
                self.statics.lock().insert(field.handle, value.clone());
                Ok(value)
            }
        }
    }

    fn store_static(&self, field: &FieldSymbol, value: StackValue) -> Result<(), FaultKind> {
        let value = Self::store(field.kind, value)?;
        self.statics.lock().insert(field.handle, value);
        Ok(())
    }

    fn copy_value(&self, value: &StackValue) -> Result<StackValue, FaultKind> {
        let StackValue::ObjectRef(o) = value else {
            return Ok(value.clone());
        };
        match o.downcast::<InstanceObject>() {
            Some(instance) if instance.is_value_type => {
                let fields = instance.fields.lock().clone();
                self.allocate(InstanceObject {
                    type_handle: instance.type_handle,
                    is_value_type: true,
                    fields: Mutex::new(fields),
                })
                .map(StackValue::ObjectRef)
            }
            _ => Ok(value.clone()),
        }
    }

    fn size_of(&self, ty: &TypeSymbol) -> usize {
        match ty.kind {
            ValueKind::Struct => self
                .assemblies
                .instance_fields(ty.handle)
                .iter()
                .map(|f| f.kind.size())
                .sum::<usize>()
                .max(1),
            kind => kind.size(),
        }
    }

    fn runtime_handle(&self, symbol: &TokenSymbol) -> Result<ObjectRef, FaultKind> {
        self.allocate(RuntimeHandleObject {
            type_handle: TypeHandle(self.assemblies.core().runtime_handle.row()),
            symbol: symbol.clone(),
        })
    }

    fn invoke_native(
        &self,
        method: &MethodSymbol,
        args: &[StackValue],
    ) -> Result<Option<StackValue>, ExecutionError> {
        let native = self.natives.read().get(&method.handle).cloned();
        match native {
            Some(f) => f(args),
            None => Err(EngineError::NotImplemented(format!("native method {}", method.name)).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResolutionScope;

    fn setup() -> (Arc<Assemblies>, Heap) {
        let assemblies = Arc::new(Assemblies::new());
        let heap = Heap::new(assemblies.clone());
        (assemblies, heap)
    }

    fn ty(a: &Assemblies, name: &str) -> Arc<TypeSymbol> {
        let token = a.type_token(name).unwrap();
        a.resolve_type(token, &ResolutionScope::default()).unwrap()
    }

    #[test]
    fn test_array_bounds() {
        let (a, heap) = setup();
        let array = heap.new_array(&ty(&a, "System.Int32"), 3).unwrap();
        assert_eq!(heap.array_length(&array), Ok(3));
        heap.store_element(&array, 2, ValueKind::I4, StackValue::Int32(7)).unwrap();
        assert_eq!(heap.load_element(&array, 2, ValueKind::I4), Ok(StackValue::Int32(7)));
        assert_eq!(heap.load_element(&array, 3, ValueKind::I4), Err(FaultKind::IndexOutOfRange));
        assert_eq!(
            heap.load_element(&array, 0, ValueKind::R8),
            Err(FaultKind::ArrayTypeMismatch)
        );
    }

    #[test]
    fn test_byte_array_truncates() {
        let (a, heap) = setup();
        let array = heap.new_array(&ty(&a, "System.Byte"), 1).unwrap();
        heap.store_element(&array, 0, ValueKind::I1, StackValue::Int32(0x1ff)).unwrap();
        assert_eq!(heap.load_element(&array, 0, ValueKind::U1), Ok(StackValue::Int32(0xff)));
        assert_eq!(heap.load_element(&array, 0, ValueKind::I1), Ok(StackValue::Int32(-1)));
    }

    #[test]
    fn test_null_array() {
        let (_, heap) = setup();
        assert_eq!(heap.array_length(&ObjectRef(None)), Err(FaultKind::NullReference));
    }

    #[test]
    fn test_box_roundtrip_checks_type() {
        let (a, heap) = setup();
        let int32 = ty(&a, "System.Int32");
        let boxed = heap.box_value(&int32, StackValue::Int32(5)).unwrap();
        assert_eq!(heap.unbox(&boxed, &int32), Ok(StackValue::Int32(5)));
        assert_eq!(heap.unbox(&boxed, &ty(&a, "System.Int64")), Err(FaultKind::InvalidCast));
    }

    #[test]
    fn test_allocation_limit() {
        let (_, heap) = setup();
        let heap = heap.with_limit(1);
        assert!(heap.create_string("a").is_ok());
        assert_eq!(heap.create_string("b"), Err(FaultKind::OutOfMemory));
        // Engine-raised exceptions never fail.
        assert!(!heap.create_exception(FaultKind::OutOfMemory, "").is_null());
    }

    #[test]
    fn test_struct_copies_are_independent() {
        let (a, heap) = setup();
        let point = a.define_type("Point", ValueKind::Struct, None);
        let int32 = a.type_token("System.Int32").unwrap();
        let x = a.define_field(point, "X", int32, false).unwrap();
        let point = a.resolve_type(point, &Default::default()).unwrap();
        let x = a.resolve_field(x, &Default::default()).unwrap();

        let original = heap.create_new(&point).unwrap();
        let copy = heap.copy_value(&StackValue::ObjectRef(original.clone())).unwrap();
        heap.store_field(&original, &x, StackValue::Int32(9)).unwrap();
        let copy = copy.as_object().unwrap();
        assert_eq!(heap.load_field(copy, &x), Ok(StackValue::Int32(0)));
        assert_eq!(heap.load_field(&original, &x), Ok(StackValue::Int32(9)));
        assert_eq!(heap.size_of(&point), 4);
    }
}
