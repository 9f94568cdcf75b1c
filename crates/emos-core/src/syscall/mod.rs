//! Syscall dispatch table (spec.md §4.7): the ~20 services a thread reaches
//! by parking `SYS` with its request in `RAX`/`RBX`/`RCX`/`RDI`.
//!
//! Kept as a free function rather than a `Kernel` method so the giant match
//! doesn't crowd out the registry/collaborator machinery in `kernel.rs`.

use crate::error::{exit_code, EmuError, EmuResult};
use crate::kernel::Kernel;
use crate::memory::{Partition, PartitionKey};
use crate::process::{Pid, Tid};
use crate::register::RegName;

pub fn service(kernel: &mut Kernel, id: u32, pid: Pid, tid: Tid) -> EmuResult<Option<u8>> {
    match id {
        // 0: exit(code) — stop the calling thread.
        0 => {
            let code = kernel.reg(pid, tid, RegName::Rbx)? as u8;
            let thread = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
            thread.running = false;
            Ok(Some(code))
        }
        // 1: write(offset, len) — stdout.
        1 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let len = kernel.reg(pid, tid, RegName::Rcx)?;
            let bytes = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.processmemory.get_bytes(offset, len)?;
            kernel.term.write_stdout(pid, &bytes);
            Ok(None)
        }
        // 2: read(len) — stdin, pushed onto the caller's stack.
        2 => {
            let len = kernel.reg(pid, tid, RegName::Rbx)?;
            let data = kernel.term.read_stdin(pid, len);
            kernel.push_thread_stack(pid, tid, &data)?;
            Ok(None)
        }
        // 3: read_line() — stdin up to newline; length returned in RBX.
        3 => {
            let line = kernel.term.read_line(pid);
            let len = line.len() as u32;
            kernel.push_thread_stack(pid, tid, &line)?;
            kernel.set_reg(pid, tid, RegName::Rbx, len)?;
            Ok(None)
        }
        // 4: kernel panic — privileged. Halts every thread in the machine.
        4 => {
            kernel.require_kernel(pid)?;
            let error = kernel.reg(pid, tid, RegName::Rbx)?;
            kernel.term.kernel_panic(error);
            kernel.panicked = true;
            for process in kernel.processes.values_mut() {
                for thread in process.threads.values_mut() {
                    thread.running = false;
                }
            }
            Ok(Some(exit_code::KERNEL_PANIC))
        }
        // 5: fork process — RAX on the parent gets the child pid.
        5 => {
            let child_pid = kernel.fork_process(pid)?;
            kernel.set_reg(pid, tid, RegName::Rax, child_pid.0)?;
            Ok(None)
        }
        // 6: fork thread — RAX on the parent gets the child tid.
        6 => {
            let child_tid = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.spawn_thread();
            kernel.set_reg(pid, tid, RegName::Rax, child_tid.0)?;
            Ok(None)
        }
        // 7: getpid.
        7 => {
            kernel.set_reg(pid, tid, RegName::Rbx, pid.0)?;
            Ok(None)
        }
        // 8: gettid.
        8 => {
            kernel.set_reg(pid, tid, RegName::Rbx, tid.0)?;
            Ok(None)
        }
        // 9: terminate process (privileged); 11: delete process (privileged).
        9 | 11 => {
            kernel.require_kernel(pid)?;
            let target_pid = Pid(kernel.reg(pid, tid, RegName::Rbx)?);
            let process = kernel.processes.get_mut(&target_pid).ok_or(EmuError::PidNotFound)?;
            for thread in process.threads.values_mut() {
                thread.running = false;
            }
            if id == 11 {
                kernel.processes.remove(&target_pid);
            }
            Ok(None)
        }
        // 10: terminate thread (privileged); 12: delete thread (privileged).
        10 | 12 => {
            kernel.require_kernel(pid)?;
            let target_pid = Pid(kernel.reg(pid, tid, RegName::Rbx)?);
            let target_tid = Tid(kernel.reg(pid, tid, RegName::Rcx)?);
            let process = kernel.processes.get_mut(&target_pid).ok_or(EmuError::PidNotFound)?;
            if id == 12 {
                process.threads.remove(&target_tid);
            } else {
                process.threads.get_mut(&target_tid).ok_or(EmuError::TidNotFound)?.running = false;
            }
            Ok(None)
        }
        // 13: import dynamic library by id (privileged).
        13 => {
            kernel.require_kernel(pid)?;
            let lid = kernel.reg(pid, tid, RegName::Rbx)?;
            if !kernel.libraries.contains_key(&lid) {
                return Err(EmuError::LibraryIdInvalid);
            }
            let thread = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
            thread.dynamic_libraries.push(lid);
            Ok(None)
        }
        // 14: call into an imported dynamic library (privileged).
        14 => {
            kernel.require_kernel(pid)?;
            let lid = kernel.reg(pid, tid, RegName::Rbx)?;
            let call = kernel.reg(pid, tid, RegName::Rcx)?;
            kernel.call_library(pid, tid, lid, call)?;
            Ok(None)
        }
        // 15: heap alloc — allocate a fresh "mem" partition, id returned in RBX.
        15 => {
            let heap_id = kernel.alloc_heap_id();
            kernel.memory.add(PartitionKey::Mem(heap_id), Partition::Mem(crate::memory::MemorySection::new("heap", vec![])))?;
            kernel.set_reg(pid, tid, RegName::Rbx, heap_id)?;
            Ok(None)
        }
        // 16: heap free.
        16 => {
            let heap_id = kernel.reg(pid, tid, RegName::Rbx)?;
            kernel.memory.remove(PartitionKey::Mem(heap_id))?;
            Ok(None)
        }
        // 17: heap size.
        17 => {
            let heap_id = kernel.reg(pid, tid, RegName::Rbx)?;
            let size = match kernel.memory.get(PartitionKey::Mem(heap_id))? {
                Partition::Mem(section) => section.size(),
                _ => return Err(EmuError::PartitionMissing),
            };
            kernel.set_reg(pid, tid, RegName::Rbx, size)?;
            Ok(None)
        }
        // 19: PAwait(target_pid) — park until the target process is no
        // longer Running. The scheduler's `resolve_parked_threads` clears
        // `waiting` once that's true (spec.md §4.7, §5).
        19 => {
            let target_pid = Pid(kernel.reg(pid, tid, RegName::Rbx)?);
            let thread = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
            thread.waiting = true;
            thread.wait_target = Some((target_pid, None));
            Ok(None)
        }
        // 20: TAwait(target_pid, target_tid) — same, for one specific thread.
        20 => {
            let target_pid = Pid(kernel.reg(pid, tid, RegName::Rbx)?);
            let target_tid = Tid(kernel.reg(pid, tid, RegName::Rcx)?);
            let thread = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
            thread.waiting = true;
            thread.wait_target = Some((target_pid, Some(target_tid)));
            Ok(None)
        }
        // 25: sleep(ms) — park until a wall-clock deadline (spec.md §4.7).
        25 => {
            let ms = kernel.reg(pid, tid, RegName::Rbx)?;
            let thread = kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
            thread.sleep_until = Some(std::time::Instant::now() + std::time::Duration::from_millis(ms as u64));
            Ok(None)
        }
        // 26: read_file(path) -> bytes pushed onto the caller's stack.
        26 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            let data = kernel.fs.read_file(&cwd, &path)?;
            kernel.push_thread_stack(pid, tid, &data)?;
            Ok(None)
        }
        // 27: write_file(path, data_offset, data_len).
        27 => {
            let path_offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let data_offset = kernel.reg(pid, tid, RegName::Rcx)?;
            let data_len = kernel.reg(pid, tid, RegName::Rdi)?;
            let path = kernel.read_cstr(pid, path_offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            let data = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.processmemory.get_bytes(data_offset, data_len)?;
            kernel.fs.write_file(&cwd, &path, &data)?;
            Ok(None)
        }
        // 28: delete_file(path).
        28 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            kernel.fs.delete_file(&cwd, &path)?;
            Ok(None)
        }
        // 29: rename_file(path, new_name).
        29 => {
            let path_offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let name_offset = kernel.reg(pid, tid, RegName::Rcx)?;
            let path = kernel.read_cstr(pid, path_offset)?;
            let name = kernel.read_cstr(pid, name_offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            kernel.fs.rename_file(&cwd, &path, &name)?;
            Ok(None)
        }
        // 30: create_dir(path).
        30 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            kernel.fs.create_dir(&cwd, &path)?;
            Ok(None)
        }
        // 31: delete_dir(path).
        31 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            kernel.fs.delete_dir(&cwd, &path)?;
            Ok(None)
        }
        // 32: list_dir(path) -> newline-joined names pushed onto the stack.
        32 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            let entries = kernel.fs.list_dir(&cwd, &path)?;
            let joined = entries.join("\n").into_bytes();
            kernel.push_thread_stack(pid, tid, &joined)?;
            Ok(None)
        }
        // 33: getcwd() -> bytes pushed onto the stack.
        33 => {
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone().into_bytes();
            kernel.push_thread_stack(pid, tid, &cwd)?;
            Ok(None)
        }
        // 34: setcwd(path).
        34 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let new_cwd = kernel.read_cstr(pid, offset)?;
            kernel.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.cwd = new_cwd;
            Ok(None)
        }
        // 35: file_exists(path) -> bool in RBX.
        35 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let path = kernel.read_cstr(pid, offset)?;
            let cwd = kernel.processes.get(&pid).ok_or(EmuError::PidNotFound)?.cwd.clone();
            let exists = kernel.fs.read_file(&cwd, &path).is_ok();
            kernel.set_reg(pid, tid, RegName::Rbx, exists as u32)?;
            Ok(None)
        }
        // 37: time() -> unix seconds in RBX.
        37 => {
            let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
            kernel.set_reg(pid, tid, RegName::Rbx, now as u32)?;
            Ok(None)
        }
        // 38: shutdown (privileged).
        38 => {
            kernel.require_kernel(pid)?;
            kernel.shutdown_requested = true;
            Ok(None)
        }
        // 40: write a NUL-terminated string to stdout.
        40 => {
            let offset = kernel.reg(pid, tid, RegName::Rbx)?;
            let text = kernel.read_cstr(pid, offset)?;
            kernel.term.write_stdout(pid, text.as_bytes());
            Ok(None)
        }
        _ => Err(EmuError::InvalidSyscall),
    }
}
