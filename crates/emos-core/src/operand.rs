//! The operand model (spec.md §4.1) and its wire encoding (spec.md §4.2).
//!
//! Every instruction operand is a tagged descriptor of where to read or
//! write bytes. Decoding a descriptor that embeds sub-operands (a MEM's
//! offset, say) resolves those sub-operands immediately against the
//! current register file, so by the time an `Operand` reaches the
//! executor every numeric field is concrete.

use crate::error::{EmuError, EmuResult};
use crate::register::{RegName, RegisterFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Sub-byte-range of a register.
    Reg { reg: RegName, offset: u32, len: u32 },
    /// Bytes in the current process's memory image.
    Mem { offset: u32, len: u32 },
    /// Immediate literal embedded in the instruction stream.
    Const { bytes: Vec<u8> },
    /// Bytes in heap partition `("mem", heap_id)`.
    Heap { heap_id: u32, offset: u32, len: u32 },
    /// Bytes in device partition `("perp", dev_id)`.
    Perp { dev_id: u32, offset: u32, len: u32 },
    /// Bytes in another process's memory.
    Pmem { pid: u32, offset: u32, len: u32 },
    /// Shorthand for `Reg(r, 0, 4)`.
    Rlo { reg: RegName },
    /// Shorthand for `Reg(r, 4, 4)`.
    Rhi { reg: RegName },
}

impl Operand {
    /// The byte length this operand reads or writes — `getsize()` in the
    /// original implementation.
    pub fn len(&self) -> u32 {
        match self {
            Operand::Reg { len, .. } => *len,
            Operand::Mem { len, .. } => *len,
            Operand::Const { bytes } => bytes.len() as u32,
            Operand::Heap { len, .. } => *len,
            Operand::Perp { len, .. } => *len,
            Operand::Pmem { len, .. } => *len,
            Operand::Rlo { .. } | Operand::Rhi { .. } => 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalize `Rlo`/`Rhi` into their equivalent `Reg` shorthand; every
    /// other variant is returned unchanged.
    pub fn as_reg(&self) -> Operand {
        match *self {
            Operand::Rlo { reg } => Operand::Reg { reg, offset: 0, len: 4 },
            Operand::Rhi { reg } => Operand::Reg { reg, offset: 4, len: 4 },
            ref other => other.clone(),
        }
    }
}

/// Tag bytes from spec.md §4.2.
mod tag {
    pub const REG: u8 = 0x00;
    pub const MEM: u8 = 0x01;
    pub const CONST: u8 = 0x02;
    pub const HEAP: u8 = 0x03;
    pub const PERP: u8 = 0x04;
    pub const RLO: u8 = 0x05;
    pub const RHI: u8 = 0x06;
    pub const PMEM: u8 = 0x07;
}

/// Byte cursor over the code section used while decoding one instruction.
pub struct Cursor<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8], start: usize) -> Self {
        Self { bytes, pos: start }
    }

    fn take(&mut self, n: usize) -> EmuResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(EmuError::OutOfRange);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> EmuResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> EmuResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
}

/// A sub-operand that has been resolved to a plain integer (used for the
/// offset/length/id fields nested inside REG/MEM/HEAP/PERP/PMEM).
fn resolve_index(op: &Operand, regs: &RegisterFile) -> EmuResult<u32> {
    match op {
        Operand::Const { bytes } => {
            if bytes.len() > 4 {
                return Err(EmuError::SizeMismatch);
            }
            let mut buf = [0u8; 4];
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(u32::from_le_bytes(buf))
        }
        Operand::Reg { reg, offset, len } => {
            if *len > 4 {
                return Err(EmuError::SizeMismatch);
            }
            let data = regs.read(*reg, *offset as usize, *len as usize)?;
            let mut buf = [0u8; 4];
            buf[..data.len()].copy_from_slice(&data);
            Ok(u32::from_le_bytes(buf))
        }
        Operand::Rlo { reg } => resolve_index(&Operand::Reg { reg: *reg, offset: 0, len: 4 }, regs),
        Operand::Rhi { reg } => resolve_index(&Operand::Reg { reg: *reg, offset: 4, len: 4 }, regs),
        // MEM/HEAP/PERP/PMEM as a sub-operand would need the length the
        // reader does not have in hand at decode time (see SPEC_FULL.md's
        // Open Question resolution) — reject rather than guess.
        Operand::Mem { .. } | Operand::Heap { .. } | Operand::Perp { .. } | Operand::Pmem { .. } => {
            Err(EmuError::InvalidOperandType)
        }
    }
}

/// Decode one operand (and recursively, any sub-operands it embeds) from
/// `cursor`, resolving sub-operands against `regs`.
pub fn decode_operand(cursor: &mut Cursor, regs: &RegisterFile) -> EmuResult<Operand> {
    let kind = cursor.take_u8()?;
    match kind {
        tag::REG => {
            let reg = RegName::from_index(cursor.take_u8()?)?;
            let offset_op = decode_operand(cursor, regs)?;
            let len_op = decode_operand(cursor, regs)?;
            Ok(Operand::Reg {
                reg,
                offset: resolve_index(&offset_op, regs)?,
                len: resolve_index(&len_op, regs)?,
            })
        }
        tag::MEM => {
            let offset_op = decode_operand(cursor, regs)?;
            let len_op = decode_operand(cursor, regs)?;
            Ok(Operand::Mem {
                offset: resolve_index(&offset_op, regs)?,
                len: resolve_index(&len_op, regs)?,
            })
        }
        tag::CONST => {
            let len = cursor.take_u16()? as usize;
            Ok(Operand::Const { bytes: cursor.take(len)?.to_vec() })
        }
        tag::HEAP => {
            let id_op = decode_operand(cursor, regs)?;
            let offset_op = decode_operand(cursor, regs)?;
            let len_op = decode_operand(cursor, regs)?;
            Ok(Operand::Heap {
                heap_id: resolve_index(&id_op, regs)?,
                offset: resolve_index(&offset_op, regs)?,
                len: resolve_index(&len_op, regs)?,
            })
        }
        tag::PERP => {
            let id_op = decode_operand(cursor, regs)?;
            let offset_op = decode_operand(cursor, regs)?;
            let len_op = decode_operand(cursor, regs)?;
            Ok(Operand::Perp {
                dev_id: resolve_index(&id_op, regs)?,
                offset: resolve_index(&offset_op, regs)?,
                len: resolve_index(&len_op, regs)?,
            })
        }
        tag::PMEM => {
            let id_op = decode_operand(cursor, regs)?;
            let offset_op = decode_operand(cursor, regs)?;
            let len_op = decode_operand(cursor, regs)?;
            Ok(Operand::Pmem {
                pid: resolve_index(&id_op, regs)?,
                offset: resolve_index(&offset_op, regs)?,
                len: resolve_index(&len_op, regs)?,
            })
        }
        tag::RLO => Ok(Operand::Rlo { reg: RegName::from_index(cursor.take_u8()?)? }),
        tag::RHI => Ok(Operand::Rhi { reg: RegName::from_index(cursor.take_u8()?)? }),
        _ => Err(EmuError::InvalidOperandType),
    }
}
