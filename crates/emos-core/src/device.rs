//! Device/peripheral interface (spec.md §4.9). A peripheral owns one
//! `("perp", dev_id)` memory partition and answers a fixed set of
//! interrupt IDs.

use crate::error::{EmuError, EmuResult};
use crate::memory::MemorySection;

pub trait Peripheral: Send {
    fn dev_id(&self) -> u32;
    fn defined_interrupts(&self) -> &'static [u32];
    fn partition(&self) -> &MemorySection;
    fn partition_mut(&mut self) -> &mut MemorySection;
    fn handle_interrupt(&mut self, iid: u32) -> EmuResult<()>;
}

/// Terminal's three standing interrupts (spec.md §4.9). The actual host
/// stdout rendering is an external collaborator's job (emos-daemon); this
/// just tracks which of the three was requested so the collaborator can
/// act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalInterrupt {
    UpdateScreen = 0,
    ReadOneChar = 1,
    ReadNChars = 2,
}

impl TerminalInterrupt {
    pub fn from_id(id: u32) -> EmuResult<Self> {
        match id {
            0 => Ok(TerminalInterrupt::UpdateScreen),
            1 => Ok(TerminalInterrupt::ReadOneChar),
            2 => Ok(TerminalInterrupt::ReadNChars),
            _ => Err(EmuError::InvalidSyscall),
        }
    }
}

/// Rows×cols text-mode screen buffer, sized `rows*cols + rows` bytes (the
/// trailing `rows` bytes hold per-row line-length markers).
pub struct TerminalDevice {
    dev_id: u32,
    rows: u32,
    cols: u32,
    partition: MemorySection,
    pub pending: Option<TerminalInterrupt>,
}

impl TerminalDevice {
    pub fn new(dev_id: u32, rows: u32, cols: u32) -> Self {
        let size = (rows * cols + rows) as usize;
        Self { dev_id, rows, cols, partition: MemorySection::new("term", vec![0; size]), pending: None }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }
}

impl Peripheral for TerminalDevice {
    fn dev_id(&self) -> u32 {
        self.dev_id
    }

    fn defined_interrupts(&self) -> &'static [u32] {
        &[0, 1, 2]
    }

    fn partition(&self) -> &MemorySection {
        &self.partition
    }

    fn partition_mut(&mut self) -> &mut MemorySection {
        &mut self.partition
    }

    fn handle_interrupt(&mut self, iid: u32) -> EmuResult<()> {
        self.pending = Some(TerminalInterrupt::from_id(iid)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_sized_rows_cols_plus_rows() {
        let term = TerminalDevice::new(1, 5, 10);
        assert_eq!(term.partition().size(), 5 * 10 + 5);
    }

    #[test]
    fn unknown_interrupt_id_is_rejected() {
        let mut term = TerminalDevice::new(1, 1, 1);
        assert_eq!(term.handle_interrupt(99), Err(EmuError::InvalidSyscall));
    }

    #[test]
    fn known_interrupt_is_recorded_pending() {
        let mut term = TerminalDevice::new(1, 1, 1);
        term.handle_interrupt(1).unwrap();
        assert_eq!(term.pending, Some(TerminalInterrupt::ReadOneChar));
    }
}
