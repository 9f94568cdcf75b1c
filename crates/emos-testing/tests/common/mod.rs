//! Byte-level assembler helpers and collaborator doubles shared by the
//! scenario and round-trip tests. `emos_core::operand`'s wire tags are
//! private to that crate, so the byte literals below are hardcoded exactly
//! as the in-crate unit tests in `cpu/mod.rs` and `operand.rs` do.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use emos_core::kernel::{FileSystemOps, TerminalHost};
use emos_core::register::RegName;
use emos_core::{EmuError, EmuResult, Pid};

pub const TAG_REG: u8 = 0x00;
pub const TAG_MEM: u8 = 0x01;
pub const TAG_CONST: u8 = 0x02;
pub const TAG_RLO: u8 = 0x05;
pub const TAG_RHI: u8 = 0x06;

/// `CONST` operand carrying `bytes` verbatim.
pub fn encode_const(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![TAG_CONST];
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

pub fn encode_const_u32(v: u32) -> Vec<u8> {
    encode_const(&v.to_le_bytes())
}

/// `RLO` shorthand: the register's low 4 bytes.
pub fn encode_reg(reg: RegName) -> Vec<u8> {
    vec![TAG_RLO, reg.index() as u8]
}

/// `RHI` shorthand: the register's high 4 bytes (`RIP`/`RDS`/`RBP`/... real value).
pub fn encode_rhi(reg: RegName) -> Vec<u8> {
    vec![TAG_RHI, reg.index() as u8]
}

/// `MEM` operand with both offset and length given as plain constants.
pub fn encode_mem(offset: u32, len: u32) -> Vec<u8> {
    let mut out = vec![TAG_MEM];
    out.extend(encode_const_u32(offset));
    out.extend(encode_const_u32(len));
    out
}

pub struct NullFs;

impl FileSystemOps for NullFs {
    fn read_file(&mut self, _: &str, _: &str) -> EmuResult<Vec<u8>> {
        Err(EmuError::FileNotFound)
    }
    fn write_file(&mut self, _: &str, _: &str, _: &[u8]) -> EmuResult<()> {
        Ok(())
    }
    fn delete_file(&mut self, _: &str, _: &str) -> EmuResult<()> {
        Ok(())
    }
    fn rename_file(&mut self, _: &str, _: &str, _: &str) -> EmuResult<()> {
        Ok(())
    }
    fn create_dir(&mut self, _: &str, _: &str) -> EmuResult<()> {
        Ok(())
    }
    fn delete_dir(&mut self, _: &str, _: &str) -> EmuResult<()> {
        Ok(())
    }
    fn list_dir(&mut self, _: &str, _: &str) -> EmuResult<Vec<String>> {
        Ok(vec![])
    }
}

/// `TerminalHost` double that buffers `write_stdout` bytes in a shared,
/// externally-inspectable `Vec<u8>` rather than touching real stdio.
#[derive(Clone, Default)]
pub struct CapturingTerm {
    pub captured: Arc<Mutex<Vec<u8>>>,
}

impl CapturingTerm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured_bytes(&self) -> Vec<u8> {
        self.captured.lock().unwrap().clone()
    }
}

impl TerminalHost for CapturingTerm {
    fn write_stdout(&mut self, _pid: Pid, bytes: &[u8]) {
        self.captured.lock().unwrap().extend_from_slice(bytes);
    }
    fn read_stdin(&mut self, _pid: Pid, _len: u32) -> Vec<u8> {
        vec![]
    }
    fn read_line(&mut self, _pid: Pid) -> Vec<u8> {
        vec![]
    }
    fn kernel_panic(&mut self, _error: u32) {}
    fn write_host(&mut self, _bytes: &[u8]) {}
    fn set_view(&mut self, _pid: Option<Pid>) -> EmuResult<()> {
        Ok(())
    }
    fn mark_stealable(&mut self, _stealable: bool) {}
}
