//! The CIL opcode table (ECMA-335 Partition III).
//!
//! Two-byte opcodes are numbered `0xFE00 | second_byte`.
use std::fmt::{self, Display, Formatter};

/// Inline operand encoding following an opcode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
    None,
    ShortBrTarget,
    BrTarget,
    ShortI,
    I,
    I8,
    ShortR,
    R,
    ShortVar,
    Var,
    Method,
    Field,
    Type,
    Tok,
    String,
    Sig,
    /// `u32` count followed by that many `i32` targets.
    Switch,
}

impl OperandKind {
    /// Fixed operand size in bytes; `None` for the variable-length switch table.
    pub fn size(self) -> Option<usize> {
        use OperandKind::*;
        match self {
            None => Some(0),
            ShortBrTarget | ShortI | ShortVar => Some(1),
            Var => Some(2),
            BrTarget | I | ShortR | Method | Field | Type | Tok | String | Sig => Some(4),
            I8 | R => Some(8),
            Switch => Option::None,
        }
    }

    pub fn is_token(self) -> bool {
        matches!(
            self,
            OperandKind::Method
                | OperandKind::Field
                | OperandKind::Type
                | OperandKind::Tok
                | OperandKind::String
                | OperandKind::Sig
        )
    }
}

/// How many evaluation stack slots an opcode pops and pushes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackEffect {
    Fixed { pop: u8, push: u8 },
    /// Depends on a call signature or the method's return type, or empties the stack.
    Variable,
}

impl StackEffect {
    pub fn delta(self) -> Option<isize> {
        match self {
            StackEffect::Fixed { pop, push } => Some(push as isize - pop as isize),
            StackEffect::Variable => None,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:literal, $mnemonic:literal, $operand:ident, $effect:tt;)*) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn operand(self) -> OperandKind {
                match self {
                    $(Opcode::$name => OperandKind::$operand,)*
                }
            }

            pub fn stack_effect(self) -> StackEffect {
                match self {
                    $(Opcode::$name => opcodes!(@effect $effect),)*
                }
            }
        }
    };
    (@effect var) => { StackEffect::Variable };
    (@effect ($pop:literal, $push:literal)) => { StackEffect::Fixed { pop: $pop, push: $push } };
}

opcodes! {
    Nop = 0x00, "nop", None, (0, 0);
    Break = 0x01, "break", None, (0, 0);
    Ldarg0 = 0x02, "ldarg.0", None, (0, 1);
    Ldarg1 = 0x03, "ldarg.1", None, (0, 1);
    Ldarg2 = 0x04, "ldarg.2", None, (0, 1);
    Ldarg3 = 0x05, "ldarg.3", None, (0, 1);
    Ldloc0 = 0x06, "ldloc.0", None, (0, 1);
    Ldloc1 = 0x07, "ldloc.1", None, (0, 1);
    Ldloc2 = 0x08, "ldloc.2", None, (0, 1);
    Ldloc3 = 0x09, "ldloc.3", None, (0, 1);
    Stloc0 = 0x0A, "stloc.0", None, (1, 0);
    Stloc1 = 0x0B, "stloc.1", None, (1, 0);
    Stloc2 = 0x0C, "stloc.2", None, (1, 0);
    Stloc3 = 0x0D, "stloc.3", None, (1, 0);
    LdargS = 0x0E, "ldarg.s", ShortVar, (0, 1);
    LdargaS = 0x0F, "ldarga.s", ShortVar, (0, 1);
    StargS = 0x10, "starg.s", ShortVar, (1, 0);
    LdlocS = 0x11, "ldloc.s", ShortVar, (0, 1);
    LdlocaS = 0x12, "ldloca.s", ShortVar, (0, 1);
    StlocS = 0x13, "stloc.s", ShortVar, (1, 0);
    Ldnull = 0x14, "ldnull", None, (0, 1);
    LdcI4M1 = 0x15, "ldc.i4.m1", None, (0, 1);
    LdcI40 = 0x16, "ldc.i4.0", None, (0, 1);
    LdcI41 = 0x17, "ldc.i4.1", None, (0, 1);
    LdcI42 = 0x18, "ldc.i4.2", None, (0, 1);
    LdcI43 = 0x19, "ldc.i4.3", None, (0, 1);
    LdcI44 = 0x1A, "ldc.i4.4", None, (0, 1);
    LdcI45 = 0x1B, "ldc.i4.5", None, (0, 1);
    LdcI46 = 0x1C, "ldc.i4.6", None, (0, 1);
    LdcI47 = 0x1D, "ldc.i4.7", None, (0, 1);
    LdcI48 = 0x1E, "ldc.i4.8", None, (0, 1);
    LdcI4S = 0x1F, "ldc.i4.s", ShortI, (0, 1);
    LdcI4 = 0x20, "ldc.i4", I, (0, 1);
    LdcI8 = 0x21, "ldc.i8", I8, (0, 1);
    LdcR4 = 0x22, "ldc.r4", ShortR, (0, 1);
    LdcR8 = 0x23, "ldc.r8", R, (0, 1);
    Dup = 0x25, "dup", None, (1, 2);
    Pop = 0x26, "pop", None, (1, 0);
    Jmp = 0x27, "jmp", Method, var;
    Call = 0x28, "call", Method, var;
    Calli = 0x29, "calli", Sig, var;
    Ret = 0x2A, "ret", None, var;
    BrS = 0x2B, "br.s", ShortBrTarget, (0, 0);
    BrfalseS = 0x2C, "brfalse.s", ShortBrTarget, (1, 0);
    BrtrueS = 0x2D, "brtrue.s", ShortBrTarget, (1, 0);
    BeqS = 0x2E, "beq.s", ShortBrTarget, (2, 0);
    BgeS = 0x2F, "bge.s", ShortBrTarget, (2, 0);
    BgtS = 0x30, "bgt.s", ShortBrTarget, (2, 0);
    BleS = 0x31, "ble.s", ShortBrTarget, (2, 0);
    BltS = 0x32, "blt.s", ShortBrTarget, (2, 0);
    BneUnS = 0x33, "bne.un.s", ShortBrTarget, (2, 0);
    BgeUnS = 0x34, "bge.un.s", ShortBrTarget, (2, 0);
    BgtUnS = 0x35, "bgt.un.s", ShortBrTarget, (2, 0);
    BleUnS = 0x36, "ble.un.s", ShortBrTarget, (2, 0);
    BltUnS = 0x37, "blt.un.s", ShortBrTarget, (2, 0);
    Br = 0x38, "br", BrTarget, (0, 0);
    Brfalse = 0x39, "brfalse", BrTarget, (1, 0);
    Brtrue = 0x3A, "brtrue", BrTarget, (1, 0);
    Beq = 0x3B, "beq", BrTarget, (2, 0);
    Bge = 0x3C, "bge", BrTarget, (2, 0);
    Bgt = 0x3D, "bgt", BrTarget, (2, 0);
    Ble = 0x3E, "ble", BrTarget, (2, 0);
    Blt = 0x3F, "blt", BrTarget, (2, 0);
    BneUn = 0x40, "bne.un", BrTarget, (2, 0);
    BgeUn = 0x41, "bge.un", BrTarget, (2, 0);
    BgtUn = 0x42, "bgt.un", BrTarget, (2, 0);
    BleUn = 0x43, "ble.un", BrTarget, (2, 0);
    BltUn = 0x44, "blt.un", BrTarget, (2, 0);
    Switch = 0x45, "switch", Switch, (1, 0);
    LdindI1 = 0x46, "ldind.i1", None, (1, 1);
    LdindU1 = 0x47, "ldind.u1", None, (1, 1);
    LdindI2 = 0x48, "ldind.i2", None, (1, 1);
    LdindU2 = 0x49, "ldind.u2", None, (1, 1);
    LdindI4 = 0x4A, "ldind.i4", None, (1, 1);
    LdindU4 = 0x4B, "ldind.u4", None, (1, 1);
    LdindI8 = 0x4C, "ldind.i8", None, (1, 1);
    LdindI = 0x4D, "ldind.i", None, (1, 1);
    LdindR4 = 0x4E, "ldind.r4", None, (1, 1);
    LdindR8 = 0x4F, "ldind.r8", None, (1, 1);
    LdindRef = 0x50, "ldind.ref", None, (1, 1);
    StindRef = 0x51, "stind.ref", None, (2, 0);
    StindI1 = 0x52, "stind.i1", None, (2, 0);
    StindI2 = 0x53, "stind.i2", None, (2, 0);
    StindI4 = 0x54, "stind.i4", None, (2, 0);
    StindI8 = 0x55, "stind.i8", None, (2, 0);
    StindR4 = 0x56, "stind.r4", None, (2, 0);
    StindR8 = 0x57, "stind.r8", None, (2, 0);
    Add = 0x58, "add", None, (2, 1);
    Sub = 0x59, "sub", None, (2, 1);
    Mul = 0x5A, "mul", None, (2, 1);
    Div = 0x5B, "div", None, (2, 1);
    DivUn = 0x5C, "div.un", None, (2, 1);
    Rem = 0x5D, "rem", None, (2, 1);
    RemUn = 0x5E, "rem.un", None, (2, 1);
    And = 0x5F, "and", None, (2, 1);
    Or = 0x60, "or", None, (2, 1);
    Xor = 0x61, "xor", None, (2, 1);
    Shl = 0x62, "shl", None, (2, 1);
    Shr = 0x63, "shr", None, (2, 1);
    ShrUn = 0x64, "shr.un", None, (2, 1);
    Neg = 0x65, "neg", None, (1, 1);
    Not = 0x66, "not", None, (1, 1);
    ConvI1 = 0x67, "conv.i1", None, (1, 1);
    ConvI2 = 0x68, "conv.i2", None, (1, 1);
    ConvI4 = 0x69, "conv.i4", None, (1, 1);
    ConvI8 = 0x6A, "conv.i8", None, (1, 1);
    ConvR4 = 0x6B, "conv.r4", None, (1, 1);
    ConvR8 = 0x6C, "conv.r8", None, (1, 1);
    ConvU4 = 0x6D, "conv.u4", None, (1, 1);
    ConvU8 = 0x6E, "conv.u8", None, (1, 1);
    Callvirt = 0x6F, "callvirt", Method, var;
    Cpobj = 0x70, "cpobj", Type, (2, 0);
    Ldobj = 0x71, "ldobj", Type, (1, 1);
    Ldstr = 0x72, "ldstr", String, (0, 1);
    Newobj = 0x73, "newobj", Method, var;
    Castclass = 0x74, "castclass", Type, (1, 1);
    Isinst = 0x75, "isinst", Type, (1, 1);
    ConvRUn = 0x76, "conv.r.un", None, (1, 1);
    Unbox = 0x79, "unbox", Type, (1, 1);
    Throw = 0x7A, "throw", None, (1, 0);
    Ldfld = 0x7B, "ldfld", Field, (1, 1);
    Ldflda = 0x7C, "ldflda", Field, (1, 1);
    Stfld = 0x7D, "stfld", Field, (2, 0);
    Ldsfld = 0x7E, "ldsfld", Field, (0, 1);
    Ldsflda = 0x7F, "ldsflda", Field, (0, 1);
    Stsfld = 0x80, "stsfld", Field, (1, 0);
    Stobj = 0x81, "stobj", Type, (2, 0);
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None, (1, 1);
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None, (1, 1);
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None, (1, 1);
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None, (1, 1);
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None, (1, 1);
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None, (1, 1);
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None, (1, 1);
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None, (1, 1);
    ConvOvfIUn = 0x8A, "conv.ovf.i.un", None, (1, 1);
    ConvOvfUUn = 0x8B, "conv.ovf.u.un", None, (1, 1);
    Box = 0x8C, "box", Type, (1, 1);
    Newarr = 0x8D, "newarr", Type, (1, 1);
    Ldlen = 0x8E, "ldlen", None, (1, 1);
    Ldelema = 0x8F, "ldelema", Type, (2, 1);
    LdelemI1 = 0x90, "ldelem.i1", None, (2, 1);
    LdelemU1 = 0x91, "ldelem.u1", None, (2, 1);
    LdelemI2 = 0x92, "ldelem.i2", None, (2, 1);
    LdelemU2 = 0x93, "ldelem.u2", None, (2, 1);
    LdelemI4 = 0x94, "ldelem.i4", None, (2, 1);
    LdelemU4 = 0x95, "ldelem.u4", None, (2, 1);
    LdelemI8 = 0x96, "ldelem.i8", None, (2, 1);
    LdelemI = 0x97, "ldelem.i", None, (2, 1);
    LdelemR4 = 0x98, "ldelem.r4", None, (2, 1);
    LdelemR8 = 0x99, "ldelem.r8", None, (2, 1);
    LdelemRef = 0x9A, "ldelem.ref", None, (2, 1);
    StelemI = 0x9B, "stelem.i", None, (3, 0);
    StelemI1 = 0x9C, "stelem.i1", None, (3, 0);
    StelemI2 = 0x9D, "stelem.i2", None, (3, 0);
    StelemI4 = 0x9E, "stelem.i4", None, (3, 0);
    StelemI8 = 0x9F, "stelem.i8", None, (3, 0);
    StelemR4 = 0xA0, "stelem.r4", None, (3, 0);
    StelemR8 = 0xA1, "stelem.r8", None, (3, 0);
    StelemRef = 0xA2, "stelem.ref", None, (3, 0);
    Ldelem = 0xA3, "ldelem", Type, (2, 1);
    Stelem = 0xA4, "stelem", Type, (3, 0);
    UnboxAny = 0xA5, "unbox.any", Type, (1, 1);
    CachedCall = 0xA6, "<cached call>", I, var;
    ConvOvfI1 = 0xB3, "conv.ovf.i1", None, (1, 1);
    ConvOvfU1 = 0xB4, "conv.ovf.u1", None, (1, 1);
    ConvOvfI2 = 0xB5, "conv.ovf.i2", None, (1, 1);
    ConvOvfU2 = 0xB6, "conv.ovf.u2", None, (1, 1);
    ConvOvfI4 = 0xB7, "conv.ovf.i4", None, (1, 1);
    ConvOvfU4 = 0xB8, "conv.ovf.u4", None, (1, 1);
    ConvOvfI8 = 0xB9, "conv.ovf.i8", None, (1, 1);
    ConvOvfU8 = 0xBA, "conv.ovf.u8", None, (1, 1);
    Refanyval = 0xC2, "refanyval", Type, (1, 1);
    Ckfinite = 0xC3, "ckfinite", None, (1, 1);
    Mkrefany = 0xC6, "mkrefany", Type, (1, 1);
    Ldtoken = 0xD0, "ldtoken", Tok, (0, 1);
    ConvU2 = 0xD1, "conv.u2", None, (1, 1);
    ConvU1 = 0xD2, "conv.u1", None, (1, 1);
    ConvI = 0xD3, "conv.i", None, (1, 1);
    ConvOvfI = 0xD4, "conv.ovf.i", None, (1, 1);
    ConvOvfU = 0xD5, "conv.ovf.u", None, (1, 1);
    AddOvf = 0xD6, "add.ovf", None, (2, 1);
    AddOvfUn = 0xD7, "add.ovf.un", None, (2, 1);
    MulOvf = 0xD8, "mul.ovf", None, (2, 1);
    MulOvfUn = 0xD9, "mul.ovf.un", None, (2, 1);
    SubOvf = 0xDA, "sub.ovf", None, (2, 1);
    SubOvfUn = 0xDB, "sub.ovf.un", None, (2, 1);
    Endfinally = 0xDC, "endfinally", None, var;
    Leave = 0xDD, "leave", BrTarget, var;
    LeaveS = 0xDE, "leave.s", ShortBrTarget, var;
    StindI = 0xDF, "stind.i", None, (2, 0);
    ConvU = 0xE0, "conv.u", None, (1, 1);
    Arglist = 0xFE00, "arglist", None, (0, 1);
    Ceq = 0xFE01, "ceq", None, (2, 1);
    Cgt = 0xFE02, "cgt", None, (2, 1);
    CgtUn = 0xFE03, "cgt.un", None, (2, 1);
    Clt = 0xFE04, "clt", None, (2, 1);
    CltUn = 0xFE05, "clt.un", None, (2, 1);
    Ldftn = 0xFE06, "ldftn", Method, (0, 1);
    Ldvirtftn = 0xFE07, "ldvirtftn", Method, (1, 1);
    Ldarg = 0xFE09, "ldarg", Var, (0, 1);
    Ldarga = 0xFE0A, "ldarga", Var, (0, 1);
    Starg = 0xFE0B, "starg", Var, (1, 0);
    Ldloc = 0xFE0C, "ldloc", Var, (0, 1);
    Ldloca = 0xFE0D, "ldloca", Var, (0, 1);
    Stloc = 0xFE0E, "stloc", Var, (1, 0);
    Localloc = 0xFE0F, "localloc", None, (1, 1);
    Endfilter = 0xFE11, "endfilter", None, (1, 0);
    Unaligned = 0xFE12, "unaligned.", ShortI, (0, 0);
    Volatile = 0xFE13, "volatile.", None, (0, 0);
    Tail = 0xFE14, "tail.", None, (0, 0);
    Initobj = 0xFE15, "initobj", Type, (1, 0);
    Constrained = 0xFE16, "constrained.", Type, (0, 0);
    Cpblk = 0xFE17, "cpblk", None, (3, 0);
    Initblk = 0xFE18, "initblk", None, (3, 0);
    No = 0xFE19, "no.", ShortI, (0, 0);
    Rethrow = 0xFE1A, "rethrow", None, (0, 0);
    Sizeof = 0xFE1C, "sizeof", Type, (0, 1);
    Refanytype = 0xFE1D, "refanytype", None, (1, 1);
    Readonly = 0xFE1E, "readonly.", None, (0, 0);
}

impl Opcode {
    pub const TWO_BYTE_PREFIX: u8 = 0xFE;

    /// Encoded size of the opcode itself, excluding operands.
    pub fn size(self) -> usize {
        if (self as u16) > 0xFF {
            2
        } else {
            1
        }
    }

    pub fn encode(self, out: &mut Vec<u8>) {
        let value = self as u16;
        if value > 0xFF {
            out.push(Self::TWO_BYTE_PREFIX);
        }
        out.push(value as u8);
    }

    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|op| *op != Opcode::CachedCall)
            .find(|op| op.mnemonic() == mnemonic)
    }

    /// Opcodes that may be rewritten into a [`Opcode::CachedCall`].
    pub fn is_call_site(self) -> bool {
        matches!(
            self,
            Opcode::Call | Opcode::Callvirt | Opcode::Newobj | Opcode::Jmp
        )
    }

    pub fn is_prefix(self) -> bool {
        matches!(
            self,
            Opcode::Unaligned
                | Opcode::Volatile
                | Opcode::Tail
                | Opcode::Constrained
                | Opcode::No
                | Opcode::Readonly
        )
    }

    /// Instructions after which control never falls through to the next one.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::BrS
                | Opcode::Leave
                | Opcode::LeaveS
                | Opcode::Ret
                | Opcode::Jmp
                | Opcode::Throw
                | Opcode::Rethrow
                | Opcode::Endfinally
                | Opcode::Endfilter
        )
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_roundtrips_values() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u16(*op as u16), Some(*op));
        }
        assert_eq!(Opcode::from_u16(0x24), None);
        assert_eq!(Opcode::from_u16(0xFE08), None);
    }

    #[test]
    fn test_mnemonics_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for op in Opcode::ALL {
            assert!(seen.insert(op.mnemonic()), "duplicate {}", op.mnemonic());
        }
        assert_eq!(Opcode::from_mnemonic("ldc.i4.s"), Some(Opcode::LdcI4S));
        assert_eq!(Opcode::from_mnemonic("<cached call>"), None);
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Opcode::Add.stack_effect().delta(), Some(-1));
        assert_eq!(Opcode::Dup.stack_effect().delta(), Some(1));
        assert_eq!(Opcode::StelemI4.stack_effect().delta(), Some(-3));
        assert_eq!(Opcode::Call.stack_effect().delta(), None);
    }
}
