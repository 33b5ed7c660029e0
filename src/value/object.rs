use crate::{
    types::{FieldSymbol, MethodSymbol, TokenSymbol, TypeHandle, TypeSymbol},
    value::{ManagedPointer, StackValue, ValueKind},
    vm::error::{EngineError, ExecutionError, FaultKind},
};
use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Anything the object model allocates. The engine only needs the runtime type and
/// reference identity; everything else goes back through [`ObjectModel`].
pub trait ManagedObject: Any + Debug + Send + Sync {
    fn type_handle(&self) -> TypeHandle;
    fn as_any(&self) -> &dyn Any;
}

/// A possibly-null reference to a managed object. Equality is reference identity.
#[derive(Clone, Default)]
#[repr(transparent)]
pub struct ObjectRef(pub Option<Arc<dyn ManagedObject>>);

impl ObjectRef {
    pub fn new(object: impl ManagedObject) -> Self {
        Self(Some(Arc::new(object)))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn type_handle(&self) -> Option<TypeHandle> {
        self.0.as_ref().map(|o| o.type_handle())
    }

    pub fn downcast<T: ManagedObject>(&self) -> Option<&T> {
        self.0.as_deref()?.as_any().downcast_ref()
    }

    fn addr(&self) -> usize {
        match &self.0 {
            Some(o) => Arc::as_ptr(o) as *const () as usize,
            None => 0,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "null"),
            Some(o) => write!(f, "{:?}@{:#x}", o, self.addr()),
        }
    }
}

/// Allocation, field storage and element access, provided by the runtime hosting the engine.
///
/// Every fallible operation reports the guest fault it maps to; the interpreter turns that
/// into a catchable exception at the faulting instruction.
pub trait ObjectModel: Send + Sync {
    fn create_string(&self, value: &str) -> Result<ObjectRef, FaultKind>;

    /// Allocates the receiver for `newobj`. Value types yield a fresh zeroed instance.
    fn create_new(&self, ty: &TypeSymbol) -> Result<ObjectRef, FaultKind>;

    /// Materializes an implicit guest fault. Must not fail; an `OutOfMemory` instance is
    /// expected to be preallocated.
    fn create_exception(&self, kind: FaultKind, message: &str) -> ObjectRef;

    fn box_value(&self, ty: &TypeSymbol, value: StackValue) -> Result<ObjectRef, FaultKind>;

    /// `unbox.any` on a value type: copies the boxed value out.
    fn unbox(&self, object: &ObjectRef, ty: &TypeSymbol) -> Result<StackValue, FaultKind>;

    /// `unbox`: a pointer to the value inside the box.
    fn unbox_reference(
        &self,
        object: &ObjectRef,
        ty: &TypeSymbol,
    ) -> Result<ManagedPointer, FaultKind>;

    fn load_boxed(&self, object: &ObjectRef) -> Result<StackValue, FaultKind>;

    fn store_boxed(&self, object: &ObjectRef, value: StackValue) -> Result<(), FaultKind>;

    fn new_array(&self, element: &TypeSymbol, length: usize) -> Result<ObjectRef, FaultKind>;

    fn array_length(&self, array: &ObjectRef) -> Result<usize, FaultKind>;

    /// Size in bytes of one element, used for managed-pointer arithmetic.
    fn element_size(&self, array: &ObjectRef) -> Result<usize, FaultKind>;

    fn load_element(
        &self,
        array: &ObjectRef,
        index: usize,
        kind: ValueKind,
    ) -> Result<StackValue, FaultKind>;

    fn store_element(
        &self,
        array: &ObjectRef,
        index: usize,
        kind: ValueKind,
        value: StackValue,
    ) -> Result<(), FaultKind>;

    fn load_field(&self, object: &ObjectRef, field: &FieldSymbol) -> Result<StackValue, FaultKind>;

    fn store_field(
        &self,
        object: &ObjectRef,
        field: &FieldSymbol,
        value: StackValue,
    ) -> Result<(), FaultKind>;

    fn load_static(&self, field: &FieldSymbol) -> Result<StackValue, FaultKind>;

    fn store_static(&self, field: &FieldSymbol, value: StackValue) -> Result<(), FaultKind>;

    /// The zero value of `ty`, used by `initobj`.
    fn default_value(&self, ty: &TypeSymbol) -> Result<StackValue, FaultKind> {
        match ty.kind {
            ValueKind::Struct => self.create_new(ty).map(StackValue::ObjectRef),
            kind => Ok(kind.default_value()),
        }
    }

    /// Value-type copy semantics for `ldobj`/`stobj`/`cpobj`. Reference values are returned as is.
    fn copy_value(&self, value: &StackValue) -> Result<StackValue, FaultKind> {
        Ok(value.clone())
    }

    fn size_of(&self, ty: &TypeSymbol) -> usize {
        ty.kind.size()
    }

    /// The runtime handle object pushed by `ldtoken`.
    fn runtime_handle(&self, symbol: &TokenSymbol) -> Result<ObjectRef, FaultKind>;

    /// Invokes a method that has no CIL body (internal calls, intrinsics).
    fn invoke_native(
        &self,
        method: &MethodSymbol,
        _args: &[StackValue],
    ) -> Result<Option<StackValue>, ExecutionError> {
        Err(EngineError::NotImplemented(format!("native method {}", method.name)).into())
    }
}
