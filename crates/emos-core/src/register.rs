//! The 22-register file (spec.md §3, §4.4).
//!
//! Every register is 8 bytes. `RIP`, `RCS`, `RDS`, `RSS`, `RES` store their
//! "real" value in the upper 4 bytes (`[4, 8)`); the lower 4 bytes are the
//! short accumulator view used by most opcodes. Flags live in `RFLAGS`'s
//! low byte.

use crate::error::{EmuError, EmuResult};
use std::fmt;

/// One of the 22 named registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegName {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    Rip = 8,
    Rcs = 9,
    Rds = 10,
    Rss = 11,
    Res = 12,
    Rflags = 13,
    R8 = 14,
    R9 = 15,
    R10 = 16,
    R11 = 17,
    R12 = 18,
    R13 = 19,
    R14 = 20,
    R15 = 21,
}

pub const NUM_REGISTERS: usize = 22;

impl RegName {
    pub const ALL: [RegName; NUM_REGISTERS] = [
        RegName::Rax,
        RegName::Rcx,
        RegName::Rdx,
        RegName::Rbx,
        RegName::Rsp,
        RegName::Rbp,
        RegName::Rsi,
        RegName::Rdi,
        RegName::Rip,
        RegName::Rcs,
        RegName::Rds,
        RegName::Rss,
        RegName::Res,
        RegName::Rflags,
        RegName::R8,
        RegName::R9,
        RegName::R10,
        RegName::R11,
        RegName::R12,
        RegName::R13,
        RegName::R14,
        RegName::R15,
    ];

    pub fn from_index(i: u8) -> EmuResult<RegName> {
        RegName::ALL.get(i as usize).copied().ok_or(EmuError::InvalidOperandType)
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            RegName::Rax => "RAX",
            RegName::Rcx => "RCX",
            RegName::Rdx => "RDX",
            RegName::Rbx => "RBX",
            RegName::Rsp => "RSP",
            RegName::Rbp => "RBP",
            RegName::Rsi => "RSI",
            RegName::Rdi => "RDI",
            RegName::Rip => "RIP",
            RegName::Rcs => "RCS",
            RegName::Rds => "RDS",
            RegName::Rss => "RSS",
            RegName::Res => "RES",
            RegName::Rflags => "RFLAGS",
            RegName::R8 => "R8",
            RegName::R9 => "R9",
            RegName::R10 => "R10",
            RegName::R11 => "R11",
            RegName::R12 => "R12",
            RegName::R13 => "R13",
            RegName::R14 => "R14",
            RegName::R15 => "R15",
        }
    }
}

bitflags::bitflags! {
    /// Bits 0..8 of RFLAGS (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const CF = 1 << 0;
        const OF = 1 << 1;
        const PF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const LT = 1 << 5;
        const GT = 1 << 6;
        const EQ = 1 << 7;
    }
}

/// A single 8-byte register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    bytes: [u8; 8],
}

impl Register {
    pub const SIZE: usize = 8;

    pub fn zeroed() -> Self {
        Self { bytes: [0; 8] }
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> EmuResult<&[u8]> {
        if offset + len > Self::SIZE {
            return Err(EmuError::OutOfRange);
        }
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn set_bytes(&mut self, offset: usize, data: &[u8]) -> EmuResult<()> {
        if offset + data.len() > Self::SIZE {
            return Err(EmuError::SizeMismatch);
        }
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn as_u32_low(&self) -> u32 {
        u32::from_le_bytes(self.bytes[0..4].try_into().unwrap())
    }

    pub fn as_u32_high(&self) -> u32 {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    pub fn set_u32_low(&mut self, value: u32) {
        self.bytes[0..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_u32_high(&mut self, value: u32) {
        self.bytes[4..8].copy_from_slice(&value.to_le_bytes());
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", u64::from_le_bytes(self.bytes))
    }
}

/// The full set of 22 registers belonging to a bound core/thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [Register; NUM_REGISTERS],
}

impl RegisterFile {
    /// Create a register file initialized per spec.md §4.4: the four
    /// segment registers and RSP/RBP take the process's section bases,
    /// everything else is zero.
    pub fn init_for_process(cs: u32, ds: u32, ss: u32, es: u32) -> Self {
        let mut file = Self { regs: [Register::zeroed(); NUM_REGISTERS] };
        file.set_high32(RegName::Rcs, cs);
        file.set_high32(RegName::Rds, ds);
        file.set_high32(RegName::Rss, ss);
        file.set_high32(RegName::Res, es);
        file.set_high32(RegName::Rsp, ss);
        file.set_high32(RegName::Rbp, ss);
        file
    }

    pub fn get(&self, reg: RegName) -> &Register {
        &self.regs[reg.index()]
    }

    pub fn get_mut(&mut self, reg: RegName) -> &mut Register {
        &mut self.regs[reg.index()]
    }

    pub fn read(&self, reg: RegName, offset: usize, len: usize) -> EmuResult<Vec<u8>> {
        Ok(self.regs[reg.index()].get_bytes(offset, len)?.to_vec())
    }

    pub fn write(&mut self, reg: RegName, offset: usize, data: &[u8]) -> EmuResult<()> {
        self.regs[reg.index()].set_bytes(offset, data)
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.regs[RegName::Rflags.index()].get_bytes(0, 1).unwrap()[0])
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.regs[RegName::Rflags.index()].set_bytes(0, &[flags.bits()]).unwrap();
    }

    /// Convenience accessor for the low 4 bytes of a register ("short" view).
    pub fn low32(&self, reg: RegName) -> u32 {
        self.regs[reg.index()].as_u32_low()
    }

    pub fn set_low32(&mut self, reg: RegName, value: u32) {
        self.regs[reg.index()].set_u32_low(value);
    }

    /// Convenience accessor for the upper 4 bytes (segment/IP view).
    pub fn high32(&self, reg: RegName) -> u32 {
        self.regs[reg.index()].as_u32_high()
    }

    pub fn set_high32(&mut self, reg: RegName, value: u32) {
        self.regs[reg.index()].set_u32_high(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_for_process_sets_segment_bases() {
        let rf = RegisterFile::init_for_process(0, 10, 20, 30);
        assert_eq!(rf.high32(RegName::Rcs), 0);
        assert_eq!(rf.high32(RegName::Rds), 10);
        assert_eq!(rf.high32(RegName::Rss), 20);
        assert_eq!(rf.high32(RegName::Res), 30);
        assert_eq!(rf.high32(RegName::Rsp), 20);
        assert_eq!(rf.high32(RegName::Rbp), 20);
        assert_eq!(rf.low32(RegName::Rax), 0);
    }

    #[test]
    fn sub_byte_range_roundtrips() {
        let mut rf = RegisterFile::init_for_process(0, 0, 0, 0);
        rf.write(RegName::Rbx, 1, &[0xAB, 0xCD]).unwrap();
        assert_eq!(rf.read(RegName::Rbx, 1, 2).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn out_of_range_write_rejected() {
        let mut rf = RegisterFile::init_for_process(0, 0, 0, 0);
        assert_eq!(rf.write(RegName::Rax, 6, &[1, 2, 3]), Err(EmuError::SizeMismatch));
    }

    #[test]
    fn flags_round_trip() {
        let mut rf = RegisterFile::init_for_process(0, 0, 0, 0);
        rf.set_flags(Flags::ZF | Flags::EQ);
        assert_eq!(rf.flags(), Flags::ZF | Flags::EQ);
    }
}
