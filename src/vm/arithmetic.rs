//! Numeric semantics of the polymorphic instructions, independent of frames and dispatch.
//!
//! Integer operations are defined once per stack width through [`Integer`]; the interpreter
//! widens mixed `int32`/`native int` operands to `isize` before calling in.
use crate::{
    value::StackValue,
    vm::{
        error::{EngineError, FaultKind, Trap},
        opcodes::Opcode,
    },
};

fn unsupported(op: Opcode, operands: &str) -> Trap {
    Trap::Engine(EngineError::NotImplemented(format!("{} on {}", op, operands)))
}

/// Relations tested by comparison and conditional branch instructions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    NeUn,
    Gt,
    GtUn,
    Ge,
    GeUn,
    Lt,
    LtUn,
    Le,
    LeUn,
}

impl Comparison {
    pub fn for_opcode(op: Opcode) -> Option<Self> {
        use Opcode::*;
        Some(match op {
            Ceq | Beq | BeqS => Comparison::Eq,
            BneUn | BneUnS => Comparison::NeUn,
            Cgt | Bgt | BgtS => Comparison::Gt,
            CgtUn | BgtUn | BgtUnS => Comparison::GtUn,
            Bge | BgeS => Comparison::Ge,
            BgeUn | BgeUnS => Comparison::GeUn,
            Clt | Blt | BltS => Comparison::Lt,
            CltUn | BltUn | BltUnS => Comparison::LtUn,
            Ble | BleS => Comparison::Le,
            BleUn | BleUnS => Comparison::LeUn,
            _ => return None,
        })
    }

    /// Floating point comparison. The `.un` forms also hold when either operand is NaN.
    pub fn floats(self, a: f64, b: f64) -> bool {
        match self {
            Comparison::Eq => a == b,
            Comparison::NeUn => a != b,
            Comparison::Gt => a > b,
            Comparison::GtUn => !(a <= b),
            Comparison::Ge => a >= b,
            Comparison::GeUn => !(a < b),
            Comparison::Lt => a < b,
            Comparison::LtUn => !(a >= b),
            Comparison::Le => a <= b,
            Comparison::LeUn => !(a > b),
        }
    }

    /// For operand types that only support (in)equality, such as object references.
    pub fn identity(self, equal: bool) -> Option<bool> {
        match self {
            Comparison::Eq => Some(equal),
            Comparison::NeUn | Comparison::GtUn => Some(!equal),
            _ => None,
        }
    }
}

pub(crate) trait Integer: Copy + Eq + std::fmt::Debug {
    fn binary(op: Opcode, a: Self, b: Self) -> Result<Self, Trap>;
    fn shift(op: Opcode, value: Self, amount: u32) -> Result<Self, Trap>;
    fn compare(cmp: Comparison, a: Self, b: Self) -> bool;
    fn negate(self) -> Self;
    fn complement(self) -> Self;
    fn is_zero(self) -> bool;
    fn into_value(self) -> StackValue;
    /// The value as a mathematical integer, reading the bits as unsigned if requested.
    fn to_i128(self, unsigned: bool) -> i128;
}

macro_rules! integer {
    ($($t:ty, $u:ty, $variant:ident;)*) => {$(
        impl Integer for $t {
            fn binary(op: Opcode, a: Self, b: Self) -> Result<Self, Trap> {
                use Opcode::*;
                Ok(match op {
                    Add => a.wrapping_add(b),
                    Sub => a.wrapping_sub(b),
                    Mul => a.wrapping_mul(b),
                    Div | Rem => {
                        if b == 0 {
                            return Err(FaultKind::DivideByZero.into());
                        }
                        let result = if op == Div { a.checked_div(b) } else { a.checked_rem(b) };
                        result.ok_or(FaultKind::Overflow)?
                    }
                    DivUn | RemUn => {
                        if b == 0 {
                            return Err(FaultKind::DivideByZero.into());
                        }
                        let (a, b) = (a as $u, b as $u);
                        (if op == DivUn { a / b } else { a % b }) as $t
                    }
                    And => a & b,
                    Or => a | b,
                    Xor => a ^ b,
                    AddOvf => a.checked_add(b).ok_or(FaultKind::Overflow)?,
                    SubOvf => a.checked_sub(b).ok_or(FaultKind::Overflow)?,
                    MulOvf => a.checked_mul(b).ok_or(FaultKind::Overflow)?,
                    AddOvfUn => (a as $u).checked_add(b as $u).ok_or(FaultKind::Overflow)? as $t,
                    SubOvfUn => (a as $u).checked_sub(b as $u).ok_or(FaultKind::Overflow)? as $t,
                    MulOvfUn => (a as $u).checked_mul(b as $u).ok_or(FaultKind::Overflow)? as $t,
                    _ => return Err(unsupported(op, stringify!($t))),
                })
            }

            fn shift(op: Opcode, value: Self, amount: u32) -> Result<Self, Trap> {
                Ok(match op {
                    Opcode::Shl => value.wrapping_shl(amount),
                    Opcode::Shr => value.wrapping_shr(amount),
                    Opcode::ShrUn => (value as $u).wrapping_shr(amount) as $t,
                    _ => return Err(unsupported(op, stringify!($t))),
                })
            }

            fn compare(cmp: Comparison, a: Self, b: Self) -> bool {
                let (ua, ub) = (a as $u, b as $u);
                match cmp {
                    Comparison::Eq => a == b,
                    Comparison::NeUn => a != b,
                    Comparison::Gt => a > b,
                    Comparison::GtUn => ua > ub,
                    Comparison::Ge => a >= b,
                    Comparison::GeUn => ua >= ub,
                    Comparison::Lt => a < b,
                    Comparison::LtUn => ua < ub,
                    Comparison::Le => a <= b,
                    Comparison::LeUn => ua <= ub,
                }
            }

            fn negate(self) -> Self {
                self.wrapping_neg()
            }

            fn complement(self) -> Self {
                !self
            }

            fn is_zero(self) -> bool {
                self == 0
            }

            fn into_value(self) -> StackValue {
                StackValue::$variant(self)
            }

            fn to_i128(self, unsigned: bool) -> i128 {
                if unsigned {
                    self as $u as i128
                } else {
                    self as i128
                }
            }
        }
    )*};
}

integer! {
    i32, u32, Int32;
    i64, u64, Int64;
    isize, usize, NativeInt;
}

pub(crate) fn float_binary(op: Opcode, a: f64, b: f64) -> Result<f64, Trap> {
    Ok(match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Rem => a % b,
        _ => return Err(unsupported(op, "F")),
    })
}

/// `ckfinite`. Infinities and NaN raise an overflow fault.
pub(crate) fn check_finite(value: f64) -> Result<f64, Trap> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FaultKind::Overflow.into())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConvTarget {
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
    RUn,
}

impl ConvTarget {
    fn range(self) -> Option<(i128, i128)> {
        use ConvTarget::*;
        Some(match self {
            I1 => (i8::MIN as i128, i8::MAX as i128),
            U1 => (0, u8::MAX as i128),
            I2 => (i16::MIN as i128, i16::MAX as i128),
            U2 => (0, u16::MAX as i128),
            I4 => (i32::MIN as i128, i32::MAX as i128),
            U4 => (0, u32::MAX as i128),
            I8 => (i64::MIN as i128, i64::MAX as i128),
            U8 => (0, u64::MAX as i128),
            I => (isize::MIN as i128, isize::MAX as i128),
            U => (0, usize::MAX as i128),
            R4 | R8 | RUn => return None,
        })
    }

    /// Truncates to the target width and widens back to the stack representation.
    fn narrow(self, value: i128) -> StackValue {
        use ConvTarget::*;
        match self {
            I1 => StackValue::Int32(value as i8 as i32),
            U1 => StackValue::Int32(value as u8 as i32),
            I2 => StackValue::Int32(value as i16 as i32),
            U2 => StackValue::Int32(value as u16 as i32),
            I4 | U4 => StackValue::Int32(value as i32),
            I8 | U8 => StackValue::Int64(value as i64),
            I | U => StackValue::NativeInt(value as isize),
            R4 => StackValue::NativeFloat(value as f32 as f64),
            R8 | RUn => StackValue::NativeFloat(value as f64),
        }
    }

    fn is_float(self) -> bool {
        matches!(self, ConvTarget::R4 | ConvTarget::R8 | ConvTarget::RUn)
    }
}

/// A decoded `conv.*` instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConvOp {
    pub target: ConvTarget,
    pub overflow: bool,
    /// `.un` forms read an integer source as unsigned.
    pub unsigned_source: bool,
}

impl ConvOp {
    pub fn for_opcode(op: Opcode) -> Option<Self> {
        use ConvTarget as T;
        use Opcode::*;
        let (target, overflow, unsigned_source) = match op {
            ConvI1 => (T::I1, false, false),
            ConvI2 => (T::I2, false, false),
            ConvI4 => (T::I4, false, false),
            ConvI8 => (T::I8, false, false),
            ConvU1 => (T::U1, false, false),
            ConvU2 => (T::U2, false, false),
            ConvU4 => (T::U4, false, false),
            ConvU8 => (T::U8, false, false),
            ConvI => (T::I, false, false),
            ConvU => (T::U, false, false),
            ConvR4 => (T::R4, false, false),
            ConvR8 => (T::R8, false, false),
            ConvRUn => (T::RUn, false, true),
            ConvOvfI1 => (T::I1, true, false),
            ConvOvfI2 => (T::I2, true, false),
            ConvOvfI4 => (T::I4, true, false),
            ConvOvfI8 => (T::I8, true, false),
            ConvOvfU1 => (T::U1, true, false),
            ConvOvfU2 => (T::U2, true, false),
            ConvOvfU4 => (T::U4, true, false),
            ConvOvfU8 => (T::U8, true, false),
            ConvOvfI => (T::I, true, false),
            ConvOvfU => (T::U, true, false),
            ConvOvfI1Un => (T::I1, true, true),
            ConvOvfI2Un => (T::I2, true, true),
            ConvOvfI4Un => (T::I4, true, true),
            ConvOvfI8Un => (T::I8, true, true),
            ConvOvfU1Un => (T::U1, true, true),
            ConvOvfU2Un => (T::U2, true, true),
            ConvOvfU4Un => (T::U4, true, true),
            ConvOvfU8Un => (T::U8, true, true),
            ConvOvfIUn => (T::I, true, true),
            ConvOvfUUn => (T::U, true, true),
            _ => return None,
        };
        Some(Self {
            target,
            overflow,
            unsigned_source,
        })
    }

    fn integer(self, value: i128) -> Result<StackValue, Trap> {
        if self.overflow {
            if let Some((min, max)) = self.target.range() {
                if value < min || value > max {
                    return Err(FaultKind::Overflow.into());
                }
            }
        }
        Ok(self.target.narrow(value))
    }

    fn float(self, value: f64) -> Result<StackValue, Trap> {
        match self.target {
            ConvTarget::R4 => return Ok(StackValue::NativeFloat(value as f32 as f64)),
            ConvTarget::R8 | ConvTarget::RUn => return Ok(StackValue::NativeFloat(value)),
            _ => {}
        }
        let truncated = value.trunc();
        if self.overflow {
            // Beyond 2^127 the value cannot fit any target, and `as i128` would saturate.
            if !truncated.is_finite() || truncated.abs() >= 1.7e38 {
                return Err(FaultKind::Overflow.into());
            }
        }
        self.integer(truncated as i128)
    }

    pub fn apply(self, value: &StackValue) -> Result<StackValue, Trap> {
        // Zero-extending widenings read an int32 source as unsigned even without `.un`.
        let zero_extend = self.unsigned_source
            || (!self.overflow && matches!(self.target, ConvTarget::U8 | ConvTarget::U));
        match *value {
            StackValue::Int32(i) => self.integer_source(i, zero_extend),
            StackValue::Int64(i) => self.integer_source(i, self.unsigned_source),
            StackValue::NativeInt(i) => self.integer_source(i, self.unsigned_source),
            StackValue::NativeFloat(f) => self.float(f),
            StackValue::ObjectRef(_) | StackValue::ManagedPtr(_) => Err(Trap::Engine(
                EngineError::NotImplemented(
                    "conversion of object references and managed pointers".to_string(),
                ),
            )),
        }
    }

    fn integer_source<T: Integer>(self, value: T, unsigned: bool) -> Result<StackValue, Trap> {
        let value = value.to_i128(unsigned);
        if self.target.is_float() {
            let as_float = match self.target {
                ConvTarget::R4 => value as f32 as f64,
                _ => value as f64,
            };
            return Ok(StackValue::NativeFloat(as_float));
        }
        self.integer(value)
    }
}
