//! The kernel: process registry, global memory table, syscall dispatcher,
//! and the collaborator traits (filesystem, terminal) the dispatcher
//! delegates to (spec.md §4.7, §6).
//!
//! This is the `KernelCtx` spec.md §9 calls for: a single owner of
//! process/memory/device/library state that the CPU core only ever sees
//! through the narrow `GlobalAccess` trait, breaking the original's
//! CPU→computer→OS→memory reference cycle.

use std::collections::HashMap;

use crate::cpu::GlobalAccess;
use crate::device::Peripheral;
use crate::error::{EmuError, EmuResult};
use crate::library::{DynamicLibrary, LibraryCtx, WRITE_LIB_ID};
use crate::memory::{Memory, MemorySection, Partition, PartitionKey};
use crate::process::{Pid, Process, SecurityLevel, Tid};
use crate::register::RegName;

/// Filesystem collaborator (spec.md §6): implemented by the host-facing
/// crate (emos-daemon), injected here so the kernel stays host-agnostic.
pub trait FileSystemOps: Send {
    fn read_file(&mut self, cwd: &str, path: &str) -> EmuResult<Vec<u8>>;
    fn write_file(&mut self, cwd: &str, path: &str, data: &[u8]) -> EmuResult<()>;
    fn delete_file(&mut self, cwd: &str, path: &str) -> EmuResult<()>;
    fn rename_file(&mut self, cwd: &str, path: &str, new_name: &str) -> EmuResult<()>;
    fn create_dir(&mut self, cwd: &str, path: &str) -> EmuResult<()>;
    fn delete_dir(&mut self, cwd: &str, path: &str) -> EmuResult<()>;
    fn list_dir(&mut self, cwd: &str, path: &str) -> EmuResult<Vec<String>>;
}

/// Terminal collaborator (spec.md §6): owns the actual host stdout/stdin.
/// The first four methods serve running processes (routed through syscalls);
/// the last three serve the interactive shell's own view-switching protocol.
pub trait TerminalHost: Send {
    fn write_stdout(&mut self, pid: Pid, bytes: &[u8]);
    fn read_stdin(&mut self, pid: Pid, len: u32) -> Vec<u8>;
    fn read_line(&mut self, pid: Pid) -> Vec<u8>;
    fn kernel_panic(&mut self, error: u32);

    /// Write bytes as the shell itself, bypassing any process view.
    fn write_host(&mut self, bytes: &[u8]);
    /// Switch the terminal to viewing `pid`'s stdout, or back to `term` mode
    /// when `None`. Fails with `UnstealableShell` unless the shell has
    /// marked itself stealable first.
    fn set_view(&mut self, pid: Option<Pid>) -> EmuResult<()>;
    fn mark_stealable(&mut self, stealable: bool);
}

pub struct Kernel {
    pub processes: HashMap<Pid, Process>,
    pub memory: Memory,
    pub libraries: HashMap<u32, Box<dyn DynamicLibrary>>,
    pub devices: HashMap<u32, Box<dyn Peripheral>>,
    pub fs: Box<dyn FileSystemOps>,
    pub term: Box<dyn TerminalHost>,
    next_pid: u32,
    pub shutdown_requested: bool,
    pub panicked: bool,
}

impl Kernel {
    pub fn new(fs: Box<dyn FileSystemOps>, term: Box<dyn TerminalHost>) -> Self {
        Self {
            processes: HashMap::new(),
            memory: Memory::new(),
            libraries: HashMap::new(),
            devices: HashMap::new(),
            fs,
            term,
            next_pid: 0,
            shutdown_requested: false,
            panicked: false,
        }
    }

    pub fn spawn_process(&mut self, code: Vec<u8>, data: Vec<u8>, security_level: SecurityLevel, cwd: &str) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        let mut process = Process::new(code, data, security_level, cwd);
        process.pid = pid;
        self.memory
            .add(PartitionKey::Proc(pid.0), Partition::Proc(process.processmemory.clone()))
            .expect("fresh pid is always a free partition key");
        self.processes.insert(pid, process);
        pid
    }

    pub(crate) fn alloc_heap_id(&mut self) -> u32 {
        self.memory.next_free_mem_id()
    }

    /// Refresh the global `("proc", pid)` snapshot used for cross-process
    /// (`pmem`) reads, after a quantum commits a thread's image.
    pub fn resync_proc_snapshot(&mut self, pid: Pid) -> EmuResult<()> {
        let snapshot = self.processes.get(&pid).ok_or(EmuError::PidNotFound)?.processmemory.clone();
        match self.memory.get_mut(PartitionKey::Proc(pid.0))? {
            Partition::Proc(pm) => *pm = snapshot,
            _ => return Err(EmuError::PartitionMissing),
        }
        self.memory.recalc_used();
        Ok(())
    }

    pub(crate) fn reg(&self, pid: Pid, tid: Tid, reg: RegName) -> EmuResult<u32> {
        Ok(self
            .processes
            .get(&pid)
            .ok_or(EmuError::PidNotFound)?
            .threads
            .get(&tid)
            .ok_or(EmuError::TidNotFound)?
            .registers
            .low32(reg))
    }

    pub(crate) fn set_reg(&mut self, pid: Pid, tid: Tid, reg: RegName, value: u32) -> EmuResult<()> {
        let thread = self
            .processes
            .get_mut(&pid)
            .ok_or(EmuError::PidNotFound)?
            .threads
            .get_mut(&tid)
            .ok_or(EmuError::TidNotFound)?;
        thread.registers.set_low32(reg, value);
        Ok(())
    }

    /// Append `bytes` to `tid`'s stack outside the normal `PUSH`/`PUSHN`
    /// opcode path (syscalls 2/3/26/32/33 all return data this way), and
    /// bump `RES` by the same amount so it keeps tracking the real stack
    /// top. Without this, `RES` goes stale the moment a syscall grows the
    /// stack, and `CALL` (which derives `RBP` from `RES`) ends up framing
    /// against the wrong offset on the next quantum.
    pub(crate) fn push_thread_stack(&mut self, pid: Pid, tid: Tid, bytes: &[u8]) -> EmuResult<()> {
        let thread = self
            .processes
            .get_mut(&pid)
            .ok_or(EmuError::PidNotFound)?
            .threads
            .get_mut(&tid)
            .ok_or(EmuError::TidNotFound)?;
        thread.stack.push(bytes);
        let res = thread.registers.high32(RegName::Res);
        thread.registers.set_high32(RegName::Res, res + bytes.len() as u32);
        Ok(())
    }

    pub(crate) fn require_kernel(&self, pid: Pid) -> EmuResult<()> {
        self.processes.get(&pid).ok_or(EmuError::PidNotFound)?.security_level.require_kernel()
    }

    pub(crate) fn read_cstr(&self, pid: Pid, offset: u32) -> EmuResult<String> {
        let process = self.processes.get(&pid).ok_or(EmuError::PidNotFound)?;
        let mut bytes = Vec::new();
        let mut cur = offset;
        loop {
            let byte = process.processmemory.get_byte(cur)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cur += 1;
        }
        String::from_utf8(bytes).map_err(|_| EmuError::SizeMismatch)
    }

    /// Service the syscall currently parked in `(pid, tid)`'s `RAX` (spec.md
    /// §4.7). On failure, writes the error code back into `RAX`; on success
    /// `RAX` is left as the individual syscall set it. Returns
    /// `Ok(Some(exit_code))` if the syscall terminated the thread.
    pub fn dispatch_syscall(&mut self, pid: Pid, tid: Tid) -> EmuResult<Option<u8>> {
        let id = self.reg(pid, tid, RegName::Rax)?;
        match crate::syscall::service(self, id, pid, tid) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.set_reg(pid, tid, RegName::Rax, e.code() as u32)?;
                Ok(None)
            }
        }
    }

    pub(crate) fn fork_process(&mut self, parent: Pid) -> EmuResult<Pid> {
        let parent_process = self.processes.get(&parent).ok_or(EmuError::PidNotFound)?;
        let code = parent_process.processmemory.code.as_slice().to_vec();
        let data = parent_process.processmemory.data.as_slice().to_vec();
        let security_level = parent_process.security_level;
        let cwd = parent_process.cwd.clone();
        Ok(self.spawn_process(code, data, security_level, &cwd))
    }

    /// Dispatch a `LIB` call (spec.md §4.8). `WriteLib`'s editor reads a
    /// line from the terminal before the library runs; whatever it leaves
    /// in `stdin_line` afterward is stored into a freshly-allocated heap
    /// partition, with the heap id returned in `RBX`.
    pub(crate) fn call_library(&mut self, pid: Pid, tid: Tid, lid: u32, call: u32) -> EmuResult<()> {
        let stdin_line = (lid == WRITE_LIB_ID).then(|| self.term.read_line(pid));

        let process = self.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?;
        let thread = process.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
        if !thread.dynamic_libraries.contains(&lid) {
            return Err(EmuError::LibraryIdInvalid);
        }
        let library = self.libraries.get_mut(&lid).ok_or(EmuError::LibraryIdInvalid)?;
        if !library.defined_calls().contains(&call) {
            return Err(EmuError::LibraryCallInvalid);
        }
        let mut ctx = LibraryCtx { regs: &mut thread.registers, memory: &mut process.processmemory, stdin_line };
        library.handle(call, &mut ctx)?;
        let collected = ctx.stdin_line.take();

        if let Some(bytes) = collected {
            let heap_id = self.alloc_heap_id();
            self.memory.add(PartitionKey::Mem(heap_id), Partition::Mem(MemorySection::new("heap", bytes)))?;
            self.set_reg(pid, tid, RegName::Rbx, heap_id)?;
        }
        self.resync_proc_snapshot(pid)
    }
}

impl GlobalAccess for Kernel {
    fn heap_get(&self, heap_id: u32, offset: u32, len: u32) -> EmuResult<Vec<u8>> {
        match self.memory.get(PartitionKey::Mem(heap_id))? {
            Partition::Mem(section) => section.get(offset, len).map(|s| s.to_vec()),
            _ => Err(EmuError::PartitionMissing),
        }
    }

    fn heap_set(&mut self, heap_id: u32, offset: u32, data: &[u8]) -> EmuResult<()> {
        match self.memory.get_mut(PartitionKey::Mem(heap_id))? {
            Partition::Mem(section) => section.set(offset, data),
            _ => Err(EmuError::PartitionMissing),
        }
    }

    fn perp_get(&self, dev_id: u32, offset: u32, len: u32) -> EmuResult<Vec<u8>> {
        let device = self.devices.get(&dev_id).ok_or(EmuError::PartitionMissing)?;
        device.partition().get(offset, len).map(|s| s.to_vec())
    }

    fn perp_set(&mut self, dev_id: u32, offset: u32, data: &[u8]) -> EmuResult<()> {
        let device = self.devices.get_mut(&dev_id).ok_or(EmuError::PartitionMissing)?;
        device.partition_mut().set(offset, data)
    }

    fn pmem_get(&self, pid: u32, offset: u32, len: u32) -> EmuResult<Vec<u8>> {
        match self.memory.get(PartitionKey::Proc(pid))? {
            Partition::Proc(pm) => pm.get_bytes(offset, len),
            _ => Err(EmuError::PartitionMissing),
        }
    }

    fn pmem_set(&mut self, pid: u32, offset: u32, data: &[u8]) -> EmuResult<()> {
        match self.memory.get_mut(PartitionKey::Proc(pid))? {
            Partition::Proc(pm) => pm.set_bytes(offset, data),
            _ => Err(EmuError::PartitionMissing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFs;
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

    struct NullTerm {
        written: Vec<u8>,
    }
    impl TerminalHost for NullTerm {
        fn write_stdout(&mut self, _: Pid, bytes: &[u8]) {
            self.written.extend_from_slice(bytes);
        }
        fn read_stdin(&mut self, _: Pid, _: u32) -> Vec<u8> {
            vec![]
        }
        fn read_line(&mut self, _: Pid) -> Vec<u8> {
            vec![]
        }
        fn kernel_panic(&mut self, _: u32) {}
        fn write_host(&mut self, _: &[u8]) {}
        fn set_view(&mut self, _: Option<Pid>) -> EmuResult<()> {
            Ok(())
        }
        fn mark_stealable(&mut self, _: bool) {}
    }

    fn kernel() -> Kernel {
        Kernel::new(Box::new(NullFs), Box::new(NullTerm { written: vec![] }))
    }

    #[test]
    fn spawn_process_registers_proc_snapshot() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        assert!(k.memory.get(PartitionKey::Proc(pid.0)).is_ok());
    }

    #[test]
    fn exit_syscall_stops_the_thread() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        k.set_reg(pid, Tid(0), RegName::Rax, 0).unwrap();
        k.set_reg(pid, Tid(0), RegName::Rbx, 5).unwrap();
        let out = k.dispatch_syscall(pid, Tid(0)).unwrap();
        assert_eq!(out, Some(5));
        assert!(!k.processes[&pid].threads[&Tid(0)].running);
    }

    #[test]
    fn privileged_syscall_rejected_for_user_process() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::User, "/");
        k.set_reg(pid, Tid(0), RegName::Rax, 38).unwrap();
        k.dispatch_syscall(pid, Tid(0)).unwrap();
        assert_eq!(k.reg(pid, Tid(0), RegName::Rax).unwrap(), EmuError::SecurityViolation.code() as u32);
    }

    #[test]
    fn heap_alloc_then_free_round_trips() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        k.set_reg(pid, Tid(0), RegName::Rax, 15).unwrap();
        k.dispatch_syscall(pid, Tid(0)).unwrap();
        let heap_id = k.reg(pid, Tid(0), RegName::Rbx).unwrap();
        k.set_reg(pid, Tid(0), RegName::Rax, 16).unwrap();
        k.set_reg(pid, Tid(0), RegName::Rbx, heap_id).unwrap();
        k.dispatch_syscall(pid, Tid(0)).unwrap();
        assert!(k.memory.get(PartitionKey::Mem(heap_id)).is_err());
    }

    #[test]
    fn freed_heap_id_is_reissued_holes_first() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        let alloc = |k: &mut Kernel| {
            k.set_reg(pid, Tid(0), RegName::Rax, 15).unwrap();
            k.dispatch_syscall(pid, Tid(0)).unwrap();
            k.reg(pid, Tid(0), RegName::Rbx).unwrap()
        };
        let free = |k: &mut Kernel, id: u32| {
            k.set_reg(pid, Tid(0), RegName::Rax, 16).unwrap();
            k.set_reg(pid, Tid(0), RegName::Rbx, id).unwrap();
            k.dispatch_syscall(pid, Tid(0)).unwrap();
        };

        let a = alloc(&mut k);
        let b = alloc(&mut k);
        assert_eq!((a, b), (0, 1));
        free(&mut k, a);
        let c = alloc(&mut k);
        assert_eq!(c, a, "the freed id should be the smallest free one, not a new high id");
    }

    #[test]
    fn stdin_read_syscall_keeps_res_in_sync_with_stack_growth() {
        let mut k = kernel();
        let pid = k.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        struct FixedStdin(Vec<u8>);
        impl TerminalHost for FixedStdin {
            fn write_stdout(&mut self, _: Pid, _: &[u8]) {}
            fn read_stdin(&mut self, _: Pid, _: u32) -> Vec<u8> {
                self.0.clone()
            }
            fn read_line(&mut self, _: Pid) -> Vec<u8> {
                vec![]
            }
            fn kernel_panic(&mut self, _: u32) {}
            fn write_host(&mut self, _: &[u8]) {}
            fn set_view(&mut self, _: Option<Pid>) -> EmuResult<()> {
                Ok(())
            }
            fn mark_stealable(&mut self, _: bool) {}
        }
        k.term = Box::new(FixedStdin(vec![1, 2, 3, 4]));

        let res_before = k.processes[&pid].threads[&Tid(0)].registers.high32(RegName::Res);
        k.set_reg(pid, Tid(0), RegName::Rax, 2).unwrap();
        k.set_reg(pid, Tid(0), RegName::Rbx, 4).unwrap();
        k.dispatch_syscall(pid, Tid(0)).unwrap();

        let thread = &k.processes[&pid].threads[&Tid(0)];
        assert_eq!(thread.stack.size(), 4);
        assert_eq!(thread.registers.high32(RegName::Res), res_before + 4);
    }
}
