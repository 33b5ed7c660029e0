use std::fmt::{self, Display, Formatter};

pub mod heap;
pub mod object;
pub mod pointer;

pub use object::{ManagedObject, ObjectModel, ObjectRef};
pub use pointer::ManagedPointer;

/// The primitive kinds tracked on the evaluation stack (ECMA-335 I.12.3.2.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StackType {
    Int32,
    Int64,
    NativeInt,
    NativeFloat,
    ObjectRef,
    ManagedPointer,
}

impl Display for StackType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackType::Int32 => "int32",
            StackType::Int64 => "int64",
            StackType::NativeInt => "native int",
            StackType::NativeFloat => "F",
            StackType::ObjectRef => "O",
            StackType::ManagedPointer => "&",
        };
        f.write_str(s)
    }
}

/// How a value is stored in a typed location (local, argument, field, element, indirection).
///
/// Loading widens to the stack kind; storing narrows, e.g. `I1` keeps the low byte and
/// sign-extends it back when read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
    Object,
    ByRef,
    Struct,
}

impl ValueKind {
    pub fn stack_type(self) -> StackType {
        use ValueKind::*;
        match self {
            Boolean | Char | I1 | U1 | I2 | U2 | I4 | U4 => StackType::Int32,
            I8 | U8 => StackType::Int64,
            I | U => StackType::NativeInt,
            R4 | R8 => StackType::NativeFloat,
            Object | Struct => StackType::ObjectRef,
            ByRef => StackType::ManagedPointer,
        }
    }

    /// Byte size of the storage, as reported by `sizeof` for primitives.
    pub fn size(self) -> usize {
        use ValueKind::*;
        match self {
            Boolean | I1 | U1 => 1,
            Char | I2 | U2 => 2,
            I4 | U4 | R4 => 4,
            I8 | U8 | R8 => 8,
            I | U | Object | ByRef | Struct => std::mem::size_of::<usize>(),
        }
    }

    /// Narrows `value` to this storage kind and widens it back to its stack representation.
    ///
    /// Returns `None` when the value's stack type cannot be stored in this kind at all.
    pub fn coerce(self, value: StackValue) -> Option<StackValue> {
        use ValueKind::*;
        let bits = match &value {
            StackValue::Int32(i) => Some(*i as i64),
            StackValue::Int64(i) => Some(*i),
            StackValue::NativeInt(i) => Some(*i as i64),
            _ => None,
        };
        Some(match self {
            Boolean | U1 => StackValue::Int32(bits? as u8 as i32),
            I1 => StackValue::Int32(bits? as i8 as i32),
            Char | U2 => StackValue::Int32(bits? as u16 as i32),
            I2 => StackValue::Int32(bits? as i16 as i32),
            I4 | U4 => StackValue::Int32(bits? as i32),
            I8 | U8 => StackValue::Int64(bits?),
            I | U => StackValue::NativeInt(bits? as isize),
            R4 => match value {
                StackValue::NativeFloat(f) => StackValue::NativeFloat(f as f32 as f64),
                _ => return None,
            },
            R8 => match value {
                StackValue::NativeFloat(f) => StackValue::NativeFloat(f),
                _ => return None,
            },
            Object | Struct => match value {
                StackValue::ObjectRef(_) => value,
                _ => return None,
            },
            ByRef => match value {
                StackValue::ManagedPtr(_) => value,
                StackValue::NativeInt(_) => value,
                _ => return None,
            },
        })
    }

    /// Parses the ILAsm-style short name of a kind, e.g. `i4`, `u1` or `object`.
    pub fn from_name(name: &str) -> Option<Self> {
        use ValueKind::*;
        Some(match name {
            "bool" => Boolean,
            "char" => Char,
            "i1" => I1,
            "u1" => U1,
            "i2" => I2,
            "u2" => U2,
            "i4" => I4,
            "u4" => U4,
            "i8" => I8,
            "u8" => U8,
            "i" => I,
            "u" => U,
            "r4" => R4,
            "r8" => R8,
            "object" => Object,
            "ref" => ByRef,
            "struct" => Struct,
            _ => return None,
        })
    }

    /// The zero value a fresh location of this kind holds.
    pub fn default_value(self) -> StackValue {
        match self.stack_type() {
            StackType::Int32 => StackValue::Int32(0),
            StackType::Int64 => StackValue::Int64(0),
            StackType::NativeInt => StackValue::NativeInt(0),
            StackType::NativeFloat => StackValue::NativeFloat(0.0),
            StackType::ObjectRef | StackType::ManagedPointer => StackValue::null(),
        }
    }
}

/// A value held in a frame slot.
#[derive(Clone, Debug, PartialEq)]
pub enum StackValue {
    Int32(i32),
    Int64(i64),
    NativeInt(isize),
    NativeFloat(f64),
    ObjectRef(ObjectRef),
    ManagedPtr(ManagedPointer),
}

impl Default for StackValue {
    fn default() -> Self {
        Self::null()
    }
}

impl StackValue {
    pub fn null() -> Self {
        Self::ObjectRef(ObjectRef(None))
    }

    pub fn stack_type(&self) -> StackType {
        match self {
            Self::Int32(_) => StackType::Int32,
            Self::Int64(_) => StackType::Int64,
            Self::NativeInt(_) => StackType::NativeInt,
            Self::NativeFloat(_) => StackType::NativeFloat,
            Self::ObjectRef(_) => StackType::ObjectRef,
            Self::ManagedPtr(_) => StackType::ManagedPointer,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::ObjectRef(o) => Some(o),
            _ => None,
        }
    }
}

impl From<i32> for StackValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for StackValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for StackValue {
    fn from(value: f64) -> Self {
        Self::NativeFloat(value)
    }
}

impl From<ObjectRef> for StackValue {
    fn from(value: ObjectRef) -> Self {
        Self::ObjectRef(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_narrows_integers() {
        assert_eq!(ValueKind::I1.coerce(StackValue::Int32(0x1ff)), Some(StackValue::Int32(-1)));
        assert_eq!(ValueKind::U1.coerce(StackValue::Int32(-1)), Some(StackValue::Int32(255)));
        assert_eq!(ValueKind::Char.coerce(StackValue::Int32(-1)), Some(StackValue::Int32(0xffff)));
        assert_eq!(
            ValueKind::I4.coerce(StackValue::NativeInt(0x1_0000_0002)),
            Some(StackValue::Int32(2))
        );
    }

    #[test]
    fn test_coerce_rejects_mismatched_kinds() {
        assert_eq!(ValueKind::I4.coerce(StackValue::NativeFloat(1.0)), None);
        assert_eq!(ValueKind::Object.coerce(StackValue::Int32(1)), None);
    }

    #[test]
    fn test_r4_rounds_through_single() {
        let v = ValueKind::R4.coerce(StackValue::NativeFloat(0.1)).unwrap();
        assert_eq!(v, StackValue::NativeFloat(0.1f32 as f64));
    }
}
