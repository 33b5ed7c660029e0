use crate::{
    types::Token,
    utils::sync::{AtomicU8, Ordering},
    vm::{
        error::EngineError,
        opcodes::{Opcode, OperandKind},
    },
};
use std::fmt::{self, Debug, Formatter};

/// Length of a patched call site: the sentinel opcode plus a little-endian `u32` cache index.
pub const PATCH_LENGTH: usize = 5;

/// The instruction bytes of one method body.
///
/// The buffer is shared by every activation of the method and is rewritten in place when a
/// call site gets specialized. Bytes are stored as atomics so a patch racing with readers is
/// never a data race; [`BytecodeBuffer::patch`] publishes the opcode byte last, so a reader
/// that observes [`Opcode::CachedCall`] with acquire ordering also observes its index.
pub struct BytecodeBuffer {
    bytes: Box<[AtomicU8]>,
}

impl Debug for BytecodeBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BytecodeBuffer({} bytes)", self.bytes.len())
    }
}

impl BytecodeBuffer {
    pub fn new(code: &[u8]) -> Self {
        Self {
            bytes: code.iter().map(|b| AtomicU8::new(*b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A snapshot of the current bytes, patches included.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    fn byte(&self, pc: usize) -> Result<u8, EngineError> {
        self.bytes
            .get(pc)
            .map(|b| b.load(Ordering::Relaxed))
            .ok_or(EngineError::Truncated(pc))
    }

    fn read<const N: usize>(&self, at: usize, pc: usize) -> Result<[u8; N], EngineError> {
        let end = at.checked_add(N).ok_or(EngineError::Truncated(pc))?;
        if end > self.bytes.len() {
            return Err(EngineError::Truncated(pc));
        }
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.bytes[at + i].load(Ordering::Relaxed);
        }
        Ok(out)
    }

    pub fn opcode_at(&self, pc: usize) -> Result<Opcode, EngineError> {
        let first = self
            .bytes
            .get(pc)
            .map(|b| b.load(Ordering::Acquire))
            .ok_or(EngineError::Truncated(pc))?;
        let value = if first == Opcode::TWO_BYTE_PREFIX {
            0xFE00 | self.byte(pc + 1)? as u16
        } else {
            first as u16
        };
        Opcode::from_u16(value).ok_or(EngineError::UnsupportedOpcode {
            opcode: value,
            offset: pc,
        })
    }

    /// Offset of the first operand byte of the instruction at `pc`.
    fn operand_at(&self, pc: usize) -> Result<usize, EngineError> {
        Ok(pc + self.opcode_at(pc)?.size())
    }

    /// The offset of the instruction following the one at `pc`.
    pub fn next_pc(&self, pc: usize) -> Result<usize, EngineError> {
        let op = self.opcode_at(pc)?;
        let operand = pc + op.size();
        let next = match op.operand().size() {
            Some(n) => operand + n,
            None => {
                let count = u32::from_le_bytes(self.read::<4>(operand, pc)?) as usize;
                count
                    .checked_mul(4)
                    .and_then(|n| n.checked_add(operand + 4))
                    .ok_or(EngineError::Truncated(pc))?
            }
        };
        if next > self.bytes.len() {
            return Err(EngineError::Truncated(pc));
        }
        Ok(next)
    }

    pub fn imm_i8(&self, pc: usize) -> Result<i8, EngineError> {
        Ok(self.read::<1>(self.operand_at(pc)?, pc)?[0] as i8)
    }

    pub fn imm_u8(&self, pc: usize) -> Result<u8, EngineError> {
        Ok(self.read::<1>(self.operand_at(pc)?, pc)?[0])
    }

    pub fn imm_i16(&self, pc: usize) -> Result<i16, EngineError> {
        Ok(i16::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_u16(&self, pc: usize) -> Result<u16, EngineError> {
        Ok(u16::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_i32(&self, pc: usize) -> Result<i32, EngineError> {
        Ok(i32::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_u32(&self, pc: usize) -> Result<u32, EngineError> {
        Ok(u32::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_i64(&self, pc: usize) -> Result<i64, EngineError> {
        Ok(i64::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_u64(&self, pc: usize) -> Result<u64, EngineError> {
        Ok(u64::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_f32(&self, pc: usize) -> Result<f32, EngineError> {
        Ok(f32::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_f64(&self, pc: usize) -> Result<f64, EngineError> {
        Ok(f64::from_le_bytes(self.read(self.operand_at(pc)?, pc)?))
    }

    pub fn imm_token(&self, pc: usize) -> Result<Token, EngineError> {
        self.imm_u32(pc).map(Token)
    }

    /// Local or argument index of a `*.s` or long-form variable instruction.
    pub fn imm_var(&self, pc: usize) -> Result<usize, EngineError> {
        match self.opcode_at(pc)?.operand() {
            OperandKind::ShortVar => self.imm_u8(pc).map(usize::from),
            OperandKind::Var => self.imm_u16(pc).map(usize::from),
            _ => Err(EngineError::invalid_state(pc, "instruction has no variable operand")),
        }
    }

    /// Absolute target of a branch instruction at `pc`.
    pub fn branch_target(&self, pc: usize) -> Result<usize, EngineError> {
        let next = self.next_pc(pc)?;
        let delta = match self.opcode_at(pc)?.operand() {
            OperandKind::ShortBrTarget => self.imm_i8(pc)? as isize,
            OperandKind::BrTarget => self.imm_i32(pc)? as isize,
            _ => return Err(EngineError::invalid_state(pc, "instruction is not a branch")),
        };
        next.checked_add_signed(delta)
            .filter(|t| *t < self.bytes.len())
            .ok_or_else(|| EngineError::invalid_program(pc, "branch target outside of method body"))
    }

    /// All case targets of the `switch` at `pc`, in table order.
    pub fn switch_targets(&self, pc: usize) -> Result<Vec<usize>, EngineError> {
        let operand = self.operand_at(pc)?;
        let count = u32::from_le_bytes(self.read::<4>(operand, pc)?) as usize;
        let next = self.next_pc(pc)?;
        (0..count)
            .map(|i| {
                let delta = i32::from_le_bytes(self.read::<4>(operand + 4 + i * 4, pc)?);
                next.checked_add_signed(delta as isize)
                    .filter(|t| *t < self.bytes.len())
                    .ok_or_else(|| {
                        EngineError::invalid_program(pc, "switch target outside of method body")
                    })
            })
            .collect()
    }

    /// Overwrites the instruction at `pc` in place. The first byte becomes visible last.
    pub fn patch(&self, pc: usize, bytes: &[u8]) -> Result<(), EngineError> {
        let end = pc.checked_add(bytes.len()).ok_or(EngineError::Truncated(pc))?;
        if bytes.is_empty() || end > self.bytes.len() {
            return Err(EngineError::Truncated(pc));
        }
        for (i, b) in bytes.iter().enumerate().skip(1) {
            self.bytes[pc + i].store(*b, Ordering::Relaxed);
        }
        self.bytes[pc].store(bytes[0], Ordering::Release);
        Ok(())
    }
}

/// Builds the replacement bytes for a call site: the sentinel, the cache index, and `nop`
/// padding up to the original instruction length.
pub fn prepare_patch(index: u32, target_length: usize) -> Result<Vec<u8>, EngineError> {
    if target_length < PATCH_LENGTH {
        return Err(EngineError::NotImplemented(format!(
            "call site of {} bytes cannot hold a cache index",
            target_length
        )));
    }
    let mut patch = Vec::with_capacity(target_length);
    patch.push(Opcode::CachedCall as u8);
    patch.extend_from_slice(&index.to_le_bytes());
    patch.resize(target_length, Opcode::Nop as u8);
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_two_byte_opcodes() {
        let buf = BytecodeBuffer::new(&[0xFE, 0x01, 0x2A]);
        assert_eq!(buf.opcode_at(0).unwrap(), Opcode::Ceq);
        assert_eq!(buf.next_pc(0).unwrap(), 2);
        assert_eq!(buf.opcode_at(2).unwrap(), Opcode::Ret);
    }

    #[test]
    fn test_immediates_are_little_endian() {
        // ldc.i4 0x12345678; ldc.i4.s -2; ldc.r8 1.5
        let mut code = vec![0x20, 0x78, 0x56, 0x34, 0x12, 0x1F, 0xFE, 0x23];
        code.extend_from_slice(&1.5f64.to_le_bytes());
        let buf = BytecodeBuffer::new(&code);
        assert_eq!(buf.imm_i32(0).unwrap(), 0x12345678);
        assert_eq!(buf.imm_u32(0).unwrap(), 0x12345678);
        assert_eq!(buf.imm_i8(5).unwrap(), -2);
        assert_eq!(buf.imm_u8(5).unwrap(), 0xFE);
        assert_eq!(buf.imm_f64(7).unwrap(), 1.5);
        assert_eq!(buf.next_pc(7).unwrap(), 16);
    }

    #[test]
    fn test_switch_length_and_targets() {
        // switch (2 cases: +0, +1); nop; ret
        let code = [0x45, 2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0x00, 0x2A];
        let buf = BytecodeBuffer::new(&code);
        assert_eq!(buf.next_pc(0).unwrap(), 13);
        assert_eq!(buf.switch_targets(0).unwrap(), vec![13, 14]);
    }

    #[test]
    fn test_truncated_operand_is_an_error() {
        let buf = BytecodeBuffer::new(&[0x20, 0x01]);
        assert_eq!(buf.next_pc(0), Err(EngineError::Truncated(0)));
        assert_eq!(buf.imm_i32(0), Err(EngineError::Truncated(0)));
    }

    #[test]
    fn test_unknown_opcode() {
        let buf = BytecodeBuffer::new(&[0x24]);
        assert!(matches!(
            buf.opcode_at(0),
            Err(EngineError::UnsupportedOpcode { opcode: 0x24, offset: 0 })
        ));
    }

    #[test]
    fn test_patch_installs_cached_call() {
        // call 0x06000001; ret
        let buf = BytecodeBuffer::new(&[0x28, 0x01, 0x00, 0x00, 0x06, 0x2A]);
        let patch = prepare_patch(7, 5).unwrap();
        buf.patch(0, &patch).unwrap();
        assert_eq!(buf.opcode_at(0).unwrap(), Opcode::CachedCall);
        assert_eq!(buf.imm_u32(0).unwrap(), 7);
        assert_eq!(buf.next_pc(0).unwrap(), 5);
        assert_eq!(buf.opcode_at(5).unwrap(), Opcode::Ret);
    }

    #[test]
    fn test_patch_pads_with_nops() {
        let patch = prepare_patch(1, 7).unwrap();
        assert_eq!(patch, vec![0xA6, 1, 0, 0, 0, 0, 0]);
        assert!(prepare_patch(1, 4).is_err());
    }
}
