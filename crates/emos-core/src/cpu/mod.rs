//! The CPU core: instruction decode/dispatch and the bounded execution
//! loop (spec.md §4.3-§4.5).

mod access;
mod alu;
mod fpu;
mod opcode;

pub use access::GlobalAccess;
pub use alu::Alu;
pub use fpu::Fpu;
pub use opcode::Opcode;

use crate::error::{exit_code, EmuError, EmuResult};
use crate::memory::ProcessMemory;
use crate::operand::{decode_operand, Cursor, Operand};
use crate::register::{Flags, RegName, RegisterFile};

/// Default quantum: operations run per scheduler visit (spec.md §4.6).
pub const DEFAULT_QUANTUM: u32 = 64;

/// Why a `step`/`execute_num` call returned without running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    Syscall,
    Interrupt { iid: u32 },
    Library { lid: u32, call: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Suspended(Suspend),
    Terminated(u8),
}

/// One core bound to a thread's process memory and register file.
pub struct CpuCore {
    pub regs: RegisterFile,
    pub memory: ProcessMemory,
    pub running: bool,
}

impl CpuCore {
    pub fn new(memory: ProcessMemory) -> Self {
        let regs = RegisterFile::init_for_process(memory.cs, memory.ds, memory.ss, memory.es);
        Self { regs, memory, running: true }
    }

    fn rip(&self) -> u32 {
        self.regs.high32(RegName::Rip)
    }

    fn set_rip(&mut self, value: u32) {
        self.regs.set_high32(RegName::Rip, value);
    }

    fn read_operand(&self, op: &Operand, ga: &dyn GlobalAccess) -> EmuResult<Vec<u8>> {
        match op.as_reg() {
            Operand::Reg { reg, offset, len } => self.regs.read(reg, offset as usize, len as usize),
            Operand::Mem { offset, len } => self.memory.get_bytes(offset, len),
            Operand::Const { bytes } => Ok(bytes),
            Operand::Heap { heap_id, offset, len } => ga.heap_get(heap_id, offset, len),
            Operand::Perp { dev_id, offset, len } => ga.perp_get(dev_id, offset, len),
            Operand::Pmem { pid, offset, len } => ga.pmem_get(pid, offset, len),
            Operand::Rlo { .. } | Operand::Rhi { .. } => unreachable!("as_reg() normalizes these away"),
        }
    }

    fn write_operand(&mut self, op: &Operand, data: &[u8], ga: &mut dyn GlobalAccess) -> EmuResult<()> {
        match op.as_reg() {
            Operand::Reg { reg, offset, len } => {
                if data.len() != len as usize {
                    return Err(EmuError::SizeMismatch);
                }
                self.regs.write(reg, offset as usize, data)
            }
            Operand::Mem { offset, len } => {
                if data.len() != len as usize {
                    return Err(EmuError::SizeMismatch);
                }
                self.memory.set_bytes(offset, data)
            }
            Operand::Heap { heap_id, offset, .. } => ga.heap_set(heap_id, offset, data),
            Operand::Perp { dev_id, offset, .. } => ga.perp_set(dev_id, offset, data),
            Operand::Pmem { pid, offset, .. } => ga.pmem_set(pid, offset, data),
            Operand::Const { .. } => Err(EmuError::InvalidOperandType),
            Operand::Rlo { .. } | Operand::Rhi { .. } => unreachable!("as_reg() normalizes these away"),
        }
    }

    fn addr_of(&self, op: &Operand, ga: &dyn GlobalAccess) -> EmuResult<u32> {
        let bytes = self.read_operand(op, ga)?;
        let mut buf = [0u8; 4];
        buf[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
        Ok(u32::from_le_bytes(buf))
    }

    fn decode_next(&self, opcode: Opcode) -> EmuResult<(Vec<Operand>, u32)> {
        let code = self.memory.code.as_slice();
        let mut cursor = Cursor::new(code, self.rip() as usize);
        let mut operands = Vec::with_capacity(opcode.arg_count());
        for _ in 0..opcode.arg_count() {
            operands.push(decode_operand(&mut cursor, &self.regs)?);
        }
        Ok((operands, cursor.pos as u32))
    }

    fn push4(&mut self, bytes: [u8; 4]) -> EmuResult<()> {
        self.memory.push_stack(bytes)?;
        self.regs.set_high32(RegName::Res, self.regs.high32(RegName::Res) + 4);
        Ok(())
    }

    fn pop4(&mut self) -> EmuResult<Vec<u8>> {
        let data = self.memory.pop_stack()?;
        self.regs.set_high32(RegName::Res, self.regs.high32(RegName::Res) - 4);
        Ok(data)
    }

    fn set_cmp_flags(&mut self, lt: bool, gt: bool, eq: bool) {
        let mut flags = self.regs.flags();
        flags.remove(Flags::LT | Flags::GT | Flags::EQ);
        if lt {
            flags.insert(Flags::LT);
        }
        if gt {
            flags.insert(Flags::GT);
        }
        if eq {
            flags.insert(Flags::EQ);
        }
        self.regs.set_flags(flags);
    }

    fn set_arith_flags(&mut self, result: &[u8], overflow: Option<Flags>) {
        let mut flags = self.regs.flags();
        flags.remove(Flags::CF | Flags::OF | Flags::PF | Flags::ZF);
        let (pf, zf) = alu::parity_zero(result);
        if pf {
            flags.insert(Flags::PF);
        }
        if zf {
            flags.insert(Flags::ZF);
        }
        if let Some(bit) = overflow {
            flags.insert(bit);
        }
        self.regs.set_flags(flags);
    }

    /// Execute one instruction. Returns `Continue` on a normal instruction,
    /// `Suspended` for `SYS`/`INT`/`LIB`, `Terminated` for `HLT`/fall-off.
    pub fn step(&mut self, ga: &mut dyn GlobalAccess) -> EmuResult<StepOutcome> {
        if !self.running {
            return Ok(StepOutcome::Terminated(exit_code::NORMAL));
        }
        if self.rip() >= self.regs.high32(RegName::Rds) {
            self.running = false;
            self.memory.set_bytes(self.memory.es.saturating_sub(2), &0u16.to_le_bytes())?;
            return Ok(StepOutcome::Terminated(exit_code::NORMAL));
        }

        let opcode_byte = self.memory.get_byte(self.rip())?;
        self.set_rip(self.rip() + 1);
        let opcode = Opcode::from_byte(opcode_byte)?;
        let (ops, new_rip) = self.decode_next(opcode)?;
        self.set_rip(new_rip);

        self.execute(opcode, &ops, ga)
    }

    fn execute(&mut self, opcode: Opcode, ops: &[Operand], ga: &mut dyn GlobalAccess) -> EmuResult<StepOutcome> {
        use Opcode::*;

        macro_rules! bin_int {
            ($alufn:expr, $flagged:expr, $overflow_bit:expr) => {{
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let width = ops[2].len() as usize;
                match $alufn(&a, &b, width) {
                    Ok(result) => {
                        self.write_operand(&ops[2], &result, ga)?;
                        if $flagged {
                            self.set_arith_flags(&result, None);
                        }
                        Ok(StepOutcome::Continue)
                    }
                    Err(_) => {
                        if $flagged {
                            let mut flags = self.regs.flags();
                            flags.insert($overflow_bit);
                            self.regs.set_flags(flags);
                        }
                        Ok(StepOutcome::Continue)
                    }
                }
            }};
        }

        macro_rules! div_int {
            ($alufn:expr, $flagged:expr, $overflow_bit:expr) => {{
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let qw = ops[2].len() as usize;
                let rw = ops[3].len() as usize;
                match $alufn(&a, &b, qw, rw) {
                    Ok((q, r)) => {
                        self.write_operand(&ops[2], &q, ga)?;
                        self.write_operand(&ops[3], &r, ga)?;
                        if $flagged {
                            self.set_arith_flags(&q, None);
                        }
                        Ok(StepOutcome::Continue)
                    }
                    Err(EmuError::DivideByZero) => Err(EmuError::DivideByZero),
                    Err(_) => {
                        if $flagged {
                            let mut flags = self.regs.flags();
                            flags.insert($overflow_bit);
                            self.regs.set_flags(flags);
                        }
                        Ok(StepOutcome::Continue)
                    }
                }
            }};
        }

        macro_rules! shift {
            ($signed:expr, $flagged:expr) => {{
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let width = ops[2].len() as usize;
                let result = Alu::shl(&a, &b, width, $signed)?;
                self.write_operand(&ops[2], &result, ga)?;
                if $flagged {
                    self.set_arith_flags(&result, None);
                }
                Ok(StepOutcome::Continue)
            }};
        }

        macro_rules! shift_right {
            ($signed:expr, $flagged:expr) => {{
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let width = ops[2].len() as usize;
                let result = Alu::shr(&a, &b, width, $signed)?;
                self.write_operand(&ops[2], &result, ga)?;
                if $flagged {
                    self.set_arith_flags(&result, None);
                }
                Ok(StepOutcome::Continue)
            }};
        }

        macro_rules! cond_jump {
            ($cond:expr) => {{
                if $cond {
                    let addr = self.addr_of(&ops[0], ga)?;
                    self.set_rip(addr);
                }
                Ok(StepOutcome::Continue)
            }};
        }

        macro_rules! cond_move {
            ($cond:expr) => {{
                if $cond {
                    let data = self.read_operand(&ops[1], ga)?;
                    self.write_operand(&ops[0], &data, ga)?;
                }
                Ok(StepOutcome::Continue)
            }};
        }

        match opcode {
            Mov => {
                let data = self.read_operand(&ops[1], ga)?;
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }

            Add => bin_int!(Alu::add, true, Flags::CF),
            AddN => bin_int!(Alu::add, false, Flags::CF),
            Sub => bin_int!(Alu::sub, true, Flags::OF),
            SubN => bin_int!(Alu::sub, false, Flags::OF),
            Mul => bin_int!(Alu::mul, true, Flags::CF),
            MulN => bin_int!(Alu::mul, false, Flags::CF),
            Muls => bin_int!(Alu::mul_signed, true, Flags::OF),
            MulsN => bin_int!(Alu::mul_signed, false, Flags::OF),
            Div => div_int!(Alu::div, true, Flags::CF),
            DivN => div_int!(Alu::div, false, Flags::CF),
            Divs => div_int!(Alu::div_signed, true, Flags::OF),
            DivsN => div_int!(Alu::div_signed, false, Flags::OF),

            And => bin_int!(Alu::bit_and, true, Flags::CF),
            AndN => bin_int!(Alu::bit_and, false, Flags::CF),
            Or => bin_int!(Alu::bit_or, true, Flags::CF),
            OrN => bin_int!(Alu::bit_or, false, Flags::CF),
            Xor => bin_int!(Alu::bit_xor, true, Flags::CF),
            XorN => bin_int!(Alu::bit_xor, false, Flags::CF),
            Not => {
                let a = self.read_operand(&ops[0], ga)?;
                let width = ops[1].len() as usize;
                let result = Alu::bit_not(&a, width)?;
                self.write_operand(&ops[1], &result, ga)?;
                self.set_arith_flags(&result, None);
                Ok(StepOutcome::Continue)
            }
            NotN => {
                let a = self.read_operand(&ops[0], ga)?;
                let width = ops[1].len() as usize;
                let result = Alu::bit_not(&a, width)?;
                self.write_operand(&ops[1], &result, ga)?;
                Ok(StepOutcome::Continue)
            }

            Shl | Sal => shift!(matches!(opcode, Sal), true),
            ShlN | SalN => shift!(matches!(opcode, SalN), false),
            Shr | Sar => shift_right!(matches!(opcode, Sar), true),
            ShrN | SarN => shift_right!(matches!(opcode, SarN), false),

            Push => {
                let data = self.read_operand(&ops[0], ga)?;
                let mut buf = [0u8; 4];
                buf[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
                self.push4(buf)?;
                Ok(StepOutcome::Continue)
            }
            Pop => {
                let data = self.pop4()?;
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }
            Pushn => {
                let data = self.read_operand(&ops[0], ga)?;
                self.memory.pushn_stack(&data)?;
                self.regs.set_high32(RegName::Res, self.regs.high32(RegName::Res) + data.len() as u32);
                Ok(StepOutcome::Continue)
            }
            Popn => {
                let n = self.addr_of(&ops[1], ga)?;
                let data = self.memory.popn_stack(n)?;
                self.regs.set_high32(RegName::Res, self.regs.high32(RegName::Res) - n);
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }
            Popr => {
                self.pop4()?;
                Ok(StepOutcome::Continue)
            }
            Popnr => {
                let n = self.addr_of(&ops[0], ga)?;
                self.memory.popn_stack(n)?;
                self.regs.set_high32(RegName::Res, self.regs.high32(RegName::Res) - n);
                Ok(StepOutcome::Continue)
            }

            Jmp => {
                let addr = self.addr_of(&ops[0], ga)?;
                self.set_rip(addr);
                Ok(StepOutcome::Continue)
            }
            Cmp => {
                let a = u32::from_le_bytes(pad4(&self.read_operand(&ops[0], ga)?));
                let b = u32::from_le_bytes(pad4(&self.read_operand(&ops[1], ga)?));
                self.set_cmp_flags(a < b, a > b, a == b);
                Ok(StepOutcome::Continue)
            }
            Cmps => {
                let a = i32::from_le_bytes(pad4(&self.read_operand(&ops[0], ga)?));
                let b = i32::from_le_bytes(pad4(&self.read_operand(&ops[1], ga)?));
                self.set_cmp_flags(a < b, a > b, a == b);
                Ok(StepOutcome::Continue)
            }
            Jl => cond_jump!(self.regs.flags().contains(Flags::LT)),
            Jg => cond_jump!(self.regs.flags().contains(Flags::GT)),
            Je => cond_jump!(self.regs.flags().contains(Flags::EQ)),
            Jle => cond_jump!(self.regs.flags().intersects(Flags::LT | Flags::EQ)),
            Jge => cond_jump!(self.regs.flags().intersects(Flags::GT | Flags::EQ)),
            Jne => cond_jump!(!self.regs.flags().contains(Flags::EQ)),

            Call => {
                let addr = self.addr_of(&ops[0], ga)?;
                let next_rip = self.rip();
                self.push4(next_rip.to_le_bytes())?;
                let bp = self.regs.high32(RegName::Rbp);
                self.push4(bp.to_le_bytes())?;
                self.regs.set_high32(RegName::Rbp, self.regs.high32(RegName::Res));
                self.set_rip(addr);
                Ok(StepOutcome::Continue)
            }
            Ret => {
                let bp = self.pop4()?;
                self.regs.set_high32(RegName::Rbp, u32::from_le_bytes(pad4(&bp)));
                let rip = self.pop4()?;
                self.set_rip(u32::from_le_bytes(pad4(&rip)));
                Ok(StepOutcome::Continue)
            }
            Nop => Ok(StepOutcome::Continue),
            Hlt => {
                let code = self.addr_of(&ops[0], ga)?;
                let code = code as u16;
                self.memory.set_bytes(self.memory.es.saturating_sub(2), &code.to_le_bytes())?;
                self.running = false;
                Ok(StepOutcome::Terminated(code as u8))
            }
            Infl => {
                self.set_rip(self.rip().wrapping_sub(1));
                Ok(StepOutcome::Continue)
            }
            Eir => {
                let rax = self.regs.low32(RegName::Rax);
                if rax != 0 {
                    self.running = false;
                    Ok(StepOutcome::Terminated((rax & 0xFFFF) as u8))
                } else {
                    Ok(StepOutcome::Continue)
                }
            }

            Ml => cond_move!(self.regs.flags().contains(Flags::LT)),
            Mg => cond_move!(self.regs.flags().contains(Flags::GT)),
            Me => cond_move!(self.regs.flags().contains(Flags::EQ)),
            Mle => cond_move!(self.regs.flags().intersects(Flags::LT | Flags::EQ)),
            Mge => cond_move!(self.regs.flags().intersects(Flags::GT | Flags::EQ)),
            Mne => cond_move!(!self.regs.flags().contains(Flags::EQ)),

            Argn => {
                let n = self.addr_of(&ops[1], ga)?;
                let offset = self.regs.high32(RegName::Rbp).wrapping_sub(8 + 4 * (n + 1));
                if offset < self.memory.ss {
                    return Err(EmuError::OutOfRange);
                }
                let data = self.memory.get_bytes(offset, 4)?;
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }
            Varn => {
                let n = self.addr_of(&ops[1], ga)?;
                let offset = self.memory.es.wrapping_sub(4 * (n + 1));
                if offset < self.memory.ss {
                    return Err(EmuError::OutOfRange);
                }
                let data = self.memory.get_bytes(offset, 4)?;
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }
            Offsg => {
                let off = self.addr_of(&ops[1], ga)?;
                let n = self.addr_of(&ops[2], ga)?;
                let offset = self.memory.es.wrapping_sub(off);
                if offset < self.memory.ss {
                    return Err(EmuError::OutOfRange);
                }
                let data = self.memory.get_bytes(offset, n)?;
                self.write_operand(&ops[0], &data, ga)?;
                Ok(StepOutcome::Continue)
            }

            Sys => Ok(StepOutcome::Suspended(Suspend::Syscall)),
            Int => {
                let iid = self.addr_of(&ops[0], ga)?;
                Ok(StepOutcome::Suspended(Suspend::Interrupt { iid }))
            }
            Lib => {
                let lid = self.addr_of(&ops[0], ga)?;
                let call = self.addr_of(&ops[1], ga)?;
                Ok(StepOutcome::Suspended(Suspend::Library { lid, call }))
            }

            Addf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let result = Fpu::add(&a, &b)?;
                self.write_operand(&ops[2], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Subf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let result = Fpu::sub(&a, &b)?;
                self.write_operand(&ops[2], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Mulf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let result = Fpu::mul(&a, &b)?;
                self.write_operand(&ops[2], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Divf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let result = Fpu::div(&a, &b)?;
                self.write_operand(&ops[2], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Powf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let result = Fpu::power(&a, &b)?;
                self.write_operand(&ops[2], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Cmpf => {
                let a = self.read_operand(&ops[0], ga)?;
                let b = self.read_operand(&ops[1], ga)?;
                let (lt, gt, eq) = Fpu::cmp(&a, &b)?;
                self.set_cmp_flags(lt, gt, eq);
                Ok(StepOutcome::Continue)
            }
            Itf => {
                let src = self.read_operand(&ops[0], ga)?;
                let result = Fpu::int_to_float(&src)?;
                self.write_operand(&ops[1], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Sitf => {
                let src = self.read_operand(&ops[0], ga)?;
                let result = Fpu::signed_int_to_float(&src)?;
                self.write_operand(&ops[1], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Fti => {
                let src = self.read_operand(&ops[0], ga)?;
                let width = ops[1].len() as usize;
                let result = Fpu::float_to_int(&src, width)?;
                self.write_operand(&ops[1], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
            Ftsi => {
                let src = self.read_operand(&ops[0], ga)?;
                let width = ops[1].len() as usize;
                let result = Fpu::float_to_signed_int(&src, width)?;
                self.write_operand(&ops[1], &result, ga)?;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Run until a suspend, a terminate, or `k` instructions have executed
    /// (spec.md §4.5's `execute_num`).
    pub fn execute_num(&mut self, k: u32, ga: &mut dyn GlobalAccess) -> EmuResult<StepOutcome> {
        for _ in 0..k {
            match self.step(ga)? {
                StepOutcome::Continue => continue,
                other => return Ok(other),
            }
        }
        Ok(StepOutcome::Continue)
    }

    /// Run unbounded, until a suspend or a terminate (spec.md §4.5's
    /// `execute`).
    pub fn execute(&mut self, ga: &mut dyn GlobalAccess) -> EmuResult<StepOutcome> {
        loop {
            match self.step(ga)? {
                StepOutcome::Continue => continue,
                other => return Ok(other),
            }
        }
    }
}

fn pad4(bytes: &[u8]) -> [u8; 4] {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(4);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ProcessMemory;

    struct NoGlobals;
    impl GlobalAccess for NoGlobals {
        fn heap_get(&self, _: u32, _: u32, _: u32) -> EmuResult<Vec<u8>> {
            Err(EmuError::PartitionMissing)
        }
        fn heap_set(&mut self, _: u32, _: u32, _: &[u8]) -> EmuResult<()> {
            Err(EmuError::PartitionMissing)
        }
        fn perp_get(&self, _: u32, _: u32, _: u32) -> EmuResult<Vec<u8>> {
            Err(EmuError::PartitionMissing)
        }
        fn perp_set(&mut self, _: u32, _: u32, _: &[u8]) -> EmuResult<()> {
            Err(EmuError::PartitionMissing)
        }
        fn pmem_get(&self, _: u32, _: u32, _: u32) -> EmuResult<Vec<u8>> {
            Err(EmuError::PartitionMissing)
        }
        fn pmem_set(&mut self, _: u32, _: u32, _: &[u8]) -> EmuResult<()> {
            Err(EmuError::PartitionMissing)
        }
    }

    fn encode_const(bytes: &[u8]) -> Vec<u8> {
        let mut out = vec![0x02];
        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn encode_reg(reg: RegName) -> Vec<u8> {
        vec![0x05, reg.index() as u8] // RLO shorthand
    }

    /// `MOV RAX, 7` then `HLT RAX`.
    #[test]
    fn mov_const_then_halt_records_exit_code() {
        let mut code = vec![Opcode::Mov as u8];
        code.extend(encode_reg(RegName::Rax));
        code.extend(encode_const(&7u32.to_le_bytes()));
        code.push(Opcode::Hlt as u8);
        code.extend(encode_reg(RegName::Rax));

        let pm = ProcessMemory::new(code, vec![], vec![0; 16]);
        let mut core = CpuCore::new(pm);
        let mut ga = NoGlobals;

        let out = core.execute(&mut ga).unwrap();
        assert_eq!(out, StepOutcome::Terminated(7));
        assert_eq!(core.regs.low32(RegName::Rax), 7);
    }

    #[test]
    fn add_sets_zero_flag_on_zero_result() {
        let mut code = vec![Opcode::Add as u8];
        code.extend(encode_const(&0u32.to_le_bytes()));
        code.extend(encode_const(&0u32.to_le_bytes()));
        code.extend(encode_reg(RegName::Rax));
        code.push(Opcode::Hlt as u8);
        code.extend(encode_const(&0u32.to_le_bytes()));

        let pm = ProcessMemory::new(code, vec![], vec![0; 16]);
        let mut core = CpuCore::new(pm);
        let mut ga = NoGlobals;
        core.execute(&mut ga).unwrap();
        assert!(core.regs.flags().contains(Flags::ZF));
    }

    #[test]
    fn sys_suspends_without_advancing_past_the_syscall() {
        let code = vec![Opcode::Sys as u8];
        let pm = ProcessMemory::new(code, vec![], vec![0; 8]);
        let mut core = CpuCore::new(pm);
        let mut ga = NoGlobals;
        let out = core.step(&mut ga).unwrap();
        assert_eq!(out, StepOutcome::Suspended(Suspend::Syscall));
    }

    #[test]
    fn call_then_ret_restores_rip() {
        // MOV RAX,1 ; CALL +11 ; HLT RAX ; (callee at 11:) RET
        let mov_len = 1 + 2 + 4; // opcode + reg-shorthand + const(u32)
        let call_len = 1 + 4; // opcode + const(u32) addr
        let hlt_len = 1 + 4;
        let callee_addr = (mov_len + call_len + hlt_len) as u32;

        let mut code = vec![Opcode::Mov as u8];
        code.extend(encode_reg(RegName::Rax));
        code.extend(encode_const(&1u32.to_le_bytes()));
        code.push(Opcode::Call as u8);
        code.extend(encode_const(&callee_addr.to_le_bytes()));
        code.push(Opcode::Hlt as u8);
        code.extend(encode_const(&9u32.to_le_bytes()));
        code.push(Opcode::Ret as u8);

        let pm = ProcessMemory::new(code, vec![], vec![0; 64]);
        let mut core = CpuCore::new(pm);
        let mut ga = NoGlobals;
        let out = core.execute(&mut ga).unwrap();
        assert_eq!(out, StepOutcome::Terminated(9));
    }
}
