//! Host-facing terminal collaborator (spec.md §6): the shell's own view of
//! the host stdio, plus the "stealable" view-switching protocol a running
//! process uses to take over the screen.
//!
//! Distinct from `emos_core::device::TerminalDevice`, which is the
//! interrupt-driven in-emulator peripheral; this is the host-side sink
//! `TerminalHost` routes syscalls 1/2/3/4 through.

use std::collections::HashMap;
use std::io::{Read, Write};

use emos_core::kernel::TerminalHost;
use emos_core::{EmuError, EmuResult, Pid};

/// Apply `\b` (0x08) backspace semantics to a raw input buffer: each
/// backspace removes the byte before it (and itself), rather than passing
/// through literally. Grounded in the original `operatingsystem.py`'s
/// input loop, which does the same thing one keystroke at a time.
pub fn apply_backspaces(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        if b == 0x08 {
            out.pop();
        } else {
            out.push(b);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Term,
    Proc(Pid),
    Kern,
}

pub struct Terminal {
    mode: Mode,
    stealable: bool,
    proc_buffers: HashMap<Pid, Vec<u8>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self { mode: Mode::Term, stealable: true, proc_buffers: HashMap::new() }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn flush_to_host(bytes: &[u8]) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalHost for Terminal {
    fn write_stdout(&mut self, pid: Pid, bytes: &[u8]) {
        self.proc_buffers.entry(pid).or_default().extend_from_slice(bytes);
        if self.mode == Mode::Proc(pid) {
            Self::flush_to_host(bytes);
        }
    }

    fn read_stdin(&mut self, _pid: Pid, len: u32) -> Vec<u8> {
        let mut buf = vec![0u8; len as usize];
        let n = std::io::stdin().read(&mut buf).unwrap_or(0);
        buf.truncate(n);
        apply_backspaces(&buf)
    }

    fn read_line(&mut self, _pid: Pid) -> Vec<u8> {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return Vec::new();
        }
        while line.ends_with(['\n', '\r']) {
            line.pop();
        }
        apply_backspaces(line.as_bytes())
    }

    fn kernel_panic(&mut self, error: u32) {
        self.mode = Mode::Kern;
        Self::flush_to_host(format!("\n*** KERNEL PANIC: error {error} ***\nsystem halted\n").as_bytes());
    }

    fn write_host(&mut self, bytes: &[u8]) {
        if self.mode == Mode::Term {
            Self::flush_to_host(bytes);
        }
    }

    fn set_view(&mut self, pid: Option<Pid>) -> EmuResult<()> {
        if !self.stealable {
            return Err(EmuError::UnstealableShell);
        }
        match pid {
            Some(p) => {
                self.mode = Mode::Proc(p);
                if let Some(buffered) = self.proc_buffers.get(&p) {
                    Self::flush_to_host(buffered);
                }
            }
            None => self.mode = Mode::Term,
        }
        Ok(())
    }

    fn mark_stealable(&mut self, stealable: bool) {
        self.stealable = stealable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_switch_requires_stealable() {
        let mut term = Terminal::new();
        term.mark_stealable(false);
        assert_eq!(term.set_view(Some(Pid(1))), Err(EmuError::UnstealableShell));
        term.mark_stealable(true);
        assert!(term.set_view(Some(Pid(1))).is_ok());
        assert_eq!(term.mode(), Mode::Proc(Pid(1)));
    }

    #[test]
    fn kernel_panic_switches_to_kern_mode() {
        let mut term = Terminal::new();
        term.kernel_panic(26);
        assert_eq!(term.mode(), Mode::Kern);
    }

    #[test]
    fn backspace_removes_preceding_byte() {
        assert_eq!(apply_backspaces(b"abc\x08\x08d"), b"ad");
        assert_eq!(apply_backspaces(b"\x08\x08abc"), b"abc");
        assert_eq!(apply_backspaces(b"hello"), b"hello");
    }
}
