use crate::{
    types::{FieldSymbol, MethodHandle},
    value::ObjectRef,
};
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

/// Identifies one activation's frame. Stack pointers are only meaningful inside it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// A managed (`&`) pointer. Pointers are symbolic: they name the location they refer to
/// rather than holding an address.
#[derive(Clone)]
pub enum ManagedPointer {
    /// An argument or local slot of a live frame (`ldarga`, `ldloca`).
    Stack { frame: FrameId, slot: usize },
    /// An instance field (`ldflda`).
    Field {
        object: ObjectRef,
        field: Arc<FieldSymbol>,
    },
    /// A static field (`ldsflda`).
    Static { field: Arc<FieldSymbol> },
    /// An array element (`ldelema`).
    Element { array: ObjectRef, index: usize },
    /// The value inside a box (`unbox`).
    Boxed(ObjectRef),
    /// A method entry point (`ldftn`, `ldvirtftn`).
    Method(MethodHandle),
}

impl ManagedPointer {
    /// Orders two pointers into the same storage. Pointers into unrelated storage have no
    /// defined order.
    pub fn address_cmp(&self, other: &Self) -> Option<Ordering> {
        use ManagedPointer::*;
        match (self, other) {
            (Stack { frame: f1, slot: s1 }, Stack { frame: f2, slot: s2 }) if f1 == f2 => {
                Some(s1.cmp(s2))
            }
            (Element { array: a1, index: i1 }, Element { array: a2, index: i2 }) if a1 == a2 => {
                Some(i1.cmp(i2))
            }
            _ if self == other => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl PartialEq for ManagedPointer {
    fn eq(&self, other: &Self) -> bool {
        use ManagedPointer::*;
        match (self, other) {
            (Stack { frame: f1, slot: s1 }, Stack { frame: f2, slot: s2 }) => f1 == f2 && s1 == s2,
            (Field { object: o1, field: f1 }, Field { object: o2, field: f2 }) => {
                o1 == o2 && f1.handle == f2.handle
            }
            (Static { field: f1 }, Static { field: f2 }) => f1.handle == f2.handle,
            (Element { array: a1, index: i1 }, Element { array: a2, index: i2 }) => {
                a1 == a2 && i1 == i2
            }
            (Boxed(o1), Boxed(o2)) => o1 == o2,
            (Method(m1), Method(m2)) => m1 == m2,
            _ => false,
        }
    }
}

impl Debug for ManagedPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use ManagedPointer::*;
        match self {
            Stack { frame, slot } => write!(f, "&frame{}[{}]", frame.0, slot),
            Field { object, field } => write!(f, "&{:?}.{}", object, field.name),
            Static { field } => write!(f, "&static {}", field.name),
            Element { array, index } => write!(f, "&{:?}[{}]", array, index),
            Boxed(o) => write!(f, "&unbox {:?}", o),
            Method(m) => write!(f, "&fn {:?}", m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_pointers_order_by_slot() {
        let a = ManagedPointer::Stack { frame: FrameId(1), slot: 2 };
        let b = ManagedPointer::Stack { frame: FrameId(1), slot: 5 };
        let c = ManagedPointer::Stack { frame: FrameId(2), slot: 5 };
        assert_eq!(a.address_cmp(&b), Some(Ordering::Less));
        assert_eq!(b.address_cmp(&c), None);
        assert_ne!(b, c);
    }
}
