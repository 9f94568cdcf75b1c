//! Processes and threads (spec.md §4.6, §5): a process owns one shared
//! `code`/`data` image; each thread owns its own stack and register file,
//! swapped onto the shared image for the duration of a quantum.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::{EmuError, EmuResult};
use crate::memory::{MemorySection, ProcessMemory};
use crate::register::RegisterFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Kernel = 0,
    User = 1,
}

impl SecurityLevel {
    pub fn require_kernel(self) -> EmuResult<()> {
        match self {
            SecurityLevel::Kernel => Ok(()),
            SecurityLevel::User => Err(EmuError::SecurityViolation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Terminated(u8),
}

/// What a parked thread (`waiting == true`) is waiting on: a whole process
/// (`PAwait`, target tid `None`) or one specific thread (`TAwait`).
pub type WaitTarget = (Pid, Option<Tid>);

/// One schedulable unit of execution within a process.
#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: Tid,
    pub stack: MemorySection,
    pub registers: RegisterFile,
    pub waiting: bool,
    pub wait_target: Option<WaitTarget>,
    pub sleep_until: Option<Instant>,
    pub running: bool,
    pub dynamic_libraries: Vec<u32>,
}

impl Thread {
    pub fn new(tid: Tid, cs: u32, ds: u32, ss: u32) -> Self {
        Self {
            tid,
            stack: MemorySection::new("stack", vec![]),
            registers: RegisterFile::init_for_process(cs, ds, ss, ss),
            waiting: false,
            wait_target: None,
            sleep_until: None,
            running: true,
            dynamic_libraries: Vec::new(),
        }
    }

    /// Runnable this round: not finished, not parked on `PAwait`/`TAwait`,
    /// and not still sleeping off a `SLEEP` syscall (spec.md §4.7, §5).
    pub fn is_schedulable(&self) -> bool {
        self.running && !self.waiting && self.sleep_until.map_or(true, |until| Instant::now() >= until)
    }
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    /// Shared `code`/`data` view; `stack` here is an empty placeholder —
    /// real stacks live per-thread and get swapped in at quantum start.
    pub processmemory: ProcessMemory,
    pub threads: HashMap<Tid, Thread>,
    pub state: ProcessState,
    pub security_level: SecurityLevel,
    pub cwd: String,
    pub next_tid: u32,
}

impl Process {
    pub fn new(code: Vec<u8>, data: Vec<u8>, security_level: SecurityLevel, cwd: impl Into<String>) -> Self {
        let pid = Pid(0); // assigned by the owning registry on insertion
        let processmemory = ProcessMemory::new(code, data, vec![]);
        let mut threads = HashMap::new();
        let main = Thread::new(Tid(0), processmemory.cs, processmemory.ds, processmemory.ss);
        threads.insert(Tid(0), main);
        Self { pid, processmemory, threads, state: ProcessState::Running, security_level, cwd: cwd.into(), next_tid: 1 }
    }

    pub fn spawn_thread(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        let thread = Thread::new(tid, self.processmemory.cs, self.processmemory.ds, self.processmemory.ss);
        self.threads.insert(tid, thread);
        tid
    }

    /// Build the executable memory image for `tid`: the process's shared
    /// code/data, with that thread's private stack swapped in.
    pub fn image_for_thread(&self, tid: Tid) -> EmuResult<ProcessMemory> {
        let thread = self.threads.get(&tid).ok_or(EmuError::TidNotFound)?;
        let mut image = self.processmemory.clone();
        image.stack = thread.stack.clone();
        image.es = image.ss + image.stack.size();
        Ok(image)
    }

    /// Write a quantum's results back: the thread's stack and registers,
    /// and the process's shared code/data view (data may have mutated).
    pub fn commit_thread_image(&mut self, tid: Tid, image: ProcessMemory, registers: RegisterFile) -> EmuResult<()> {
        self.processmemory.data = image.data;
        self.processmemory.ds = image.ds;
        self.processmemory.ss = image.ss;
        let thread = self.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?;
        thread.stack = image.stack;
        thread.registers = registers;
        Ok(())
    }

    pub fn all_threads_finished(&self) -> bool {
        self.threads.values().all(|t| !t.running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_process_has_one_runnable_main_thread() {
        let proc = Process::new(vec![0xAA], vec![0; 4], SecurityLevel::User, "/");
        let main = proc.threads.get(&Tid(0)).unwrap();
        assert!(main.is_schedulable());
    }

    #[test]
    fn spawn_thread_allocates_fresh_tid() {
        let mut proc = Process::new(vec![], vec![], SecurityLevel::Kernel, "/");
        let t1 = proc.spawn_thread();
        let t2 = proc.spawn_thread();
        assert_ne!(t1, t2);
        assert_eq!(proc.threads.len(), 3);
    }

    #[test]
    fn image_round_trips_stack_through_commit() {
        let mut proc = Process::new(vec![], vec![0; 4], SecurityLevel::Kernel, "/");
        let mut image = proc.image_for_thread(Tid(0)).unwrap();
        image.push_stack([1, 2, 3, 4]).unwrap();
        let registers = RegisterFile::init_for_process(0, 0, image.ss, image.es);
        proc.commit_thread_image(Tid(0), image, registers).unwrap();
        assert_eq!(proc.threads[&Tid(0)].stack.size(), 4);
    }

    #[test]
    fn kernel_only_check_rejects_user() {
        assert_eq!(SecurityLevel::User.require_kernel(), Err(EmuError::SecurityViolation));
        assert_eq!(SecurityLevel::Kernel.require_kernel(), Ok(()));
    }
}
