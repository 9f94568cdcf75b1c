//! Dynamic library interface (spec.md §4.8): small privileged in-kernel
//! services a thread can call via the `LIB` opcode.

use crate::error::{EmuError, EmuResult};
use crate::memory::ProcessMemory;
use crate::register::RegisterFile;

/// What a library call needs to touch: the caller's registers/stack and
/// (for `WriteLib`) a line of input already collected by the terminal.
pub struct LibraryCtx<'a> {
    pub regs: &'a mut RegisterFile,
    pub memory: &'a mut ProcessMemory,
    pub stdin_line: Option<Vec<u8>>,
}

pub trait DynamicLibrary: Send {
    fn defined_calls(&self) -> &'static [u32];
    fn handle(&mut self, call_id: u32, ctx: &mut LibraryCtx) -> EmuResult<()>;
}

fn push_digits(ctx: &mut LibraryCtx, digits: &[u8]) -> EmuResult<()> {
    ctx.memory.pushn_stack(digits)?;
    let es = crate::register::RegName::Res;
    ctx.regs.set_high32(es, ctx.regs.high32(es) + digits.len() as u32);
    ctx.regs.set_low32(crate::register::RegName::Rbx, digits.len() as u32);
    Ok(())
}

/// Conventional registration ids for the two built-in libraries (spec.md
/// §4.8); not fixed by the original, assigned here for the kernel's
/// library-table wiring.
pub const INT_STR_LIB_ID: u32 = 0;
pub const WRITE_LIB_ID: u32 = 1;

/// Calls 0..3: integer↔decimal-string conversion, signed and unsigned,
/// writing the resulting ASCII bytes onto the caller's stack.
pub struct IntStrLib;

impl DynamicLibrary for IntStrLib {
    fn defined_calls(&self) -> &'static [u32] {
        &[0, 1, 2, 3]
    }

    fn handle(&mut self, call_id: u32, ctx: &mut LibraryCtx) -> EmuResult<()> {
        use crate::register::RegName::{Rax, Rbx};
        match call_id {
            // 0: unsigned int (in RAX) -> decimal string on stack.
            0 => {
                let value = ctx.regs.low32(Rax);
                push_digits(ctx, value.to_string().as_bytes())
            }
            // 1: signed int (in RAX) -> decimal string on stack.
            1 => {
                let value = ctx.regs.low32(Rax) as i32;
                push_digits(ctx, value.to_string().as_bytes())
            }
            // 2: decimal string at stack top (len in RBX) -> unsigned int in RAX.
            2 => {
                let len = ctx.regs.low32(Rbx);
                let bytes = ctx.memory.popn_stack(len)?;
                let text = std::str::from_utf8(&bytes).map_err(|_| EmuError::SizeMismatch)?;
                let value: u32 = text.trim().parse().map_err(|_| EmuError::SizeMismatch)?;
                ctx.regs.set_low32(Rax, value);
                Ok(())
            }
            // 3: decimal string at stack top (len in RBX) -> signed int in RAX.
            3 => {
                let len = ctx.regs.low32(Rbx);
                let bytes = ctx.memory.popn_stack(len)?;
                let text = std::str::from_utf8(&bytes).map_err(|_| EmuError::SizeMismatch)?;
                let value: i32 = text.trim().parse().map_err(|_| EmuError::SizeMismatch)?;
                ctx.regs.set_low32(Rax, value as u32);
                Ok(())
            }
            _ => Err(EmuError::LibraryCallInvalid),
        }
    }
}

/// Call 0: a line-oriented editor. Reads from stdin until Ctrl-G (0x07);
/// the caller is expected to have already placed one collected line in
/// `ctx.stdin_line` via the terminal (spec.md §4.8).
pub struct WriteLib;

pub const CTRL_G: u8 = 0x07;

impl DynamicLibrary for WriteLib {
    fn defined_calls(&self) -> &'static [u32] {
        &[0]
    }

    fn handle(&mut self, call_id: u32, ctx: &mut LibraryCtx) -> EmuResult<()> {
        if call_id != 0 {
            return Err(EmuError::LibraryCallInvalid);
        }
        let mut line = ctx.stdin_line.take().unwrap_or_default();
        if let Some(pos) = line.iter().position(|&b| b == CTRL_G) {
            line.truncate(pos);
        }
        // The allocated heap partition id is handed back by the kernel
        // after this call returns (it owns the global memory table); here
        // we just stash the collected bytes for the kernel to place.
        ctx.regs.set_low32(crate::register::RegName::Rcx, line.len() as u32);
        ctx.stdin_line = Some(line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegName;

    fn ctx(memory: &mut ProcessMemory, regs: &mut RegisterFile) -> LibraryCtx<'_> {
        LibraryCtx { regs, memory, stdin_line: None }
    }

    #[test]
    fn int_str_lib_unsigned_round_trip() {
        let mut memory = ProcessMemory::new(vec![], vec![], vec![]);
        let mut regs = RegisterFile::init_for_process(0, 0, 0, 0);
        regs.set_low32(RegName::Rax, 1234);
        let mut lib = IntStrLib;
        {
            let mut c = ctx(&mut memory, &mut regs);
            lib.handle(0, &mut c).unwrap();
        }
        let len = regs.low32(RegName::Rbx);
        regs.set_low32(RegName::Rbx, len);
        {
            let mut c = ctx(&mut memory, &mut regs);
            lib.handle(2, &mut c).unwrap();
        }
        assert_eq!(regs.low32(RegName::Rax), 1234);
    }

    #[test]
    fn write_lib_truncates_at_ctrl_g() {
        let mut memory = ProcessMemory::new(vec![], vec![], vec![]);
        let mut regs = RegisterFile::init_for_process(0, 0, 0, 0);
        let mut lib = WriteLib;
        let mut c = ctx(&mut memory, &mut regs);
        c.stdin_line = Some(vec![b'h', b'i', CTRL_G, b'x']);
        lib.handle(0, &mut c).unwrap();
        assert_eq!(c.stdin_line.as_ref().unwrap(), b"hi");
    }

    #[test]
    fn unknown_call_id_is_rejected() {
        let mut memory = ProcessMemory::new(vec![], vec![], vec![]);
        let mut regs = RegisterFile::init_for_process(0, 0, 0, 0);
        let mut lib = IntStrLib;
        let mut c = ctx(&mut memory, &mut regs);
        assert_eq!(lib.handle(9, &mut c), Err(EmuError::LibraryCallInvalid));
    }
}
