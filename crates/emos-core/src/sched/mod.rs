//! Cooperative round-robin scheduler (spec.md §4.6): partitions runnable
//! `(pid, tid)` pairs across `cores` lanes each round, runs each thread for
//! one quantum, and writes its image back before the next round.
//!
//! The original polls a single shared run-queue in a tight loop; here each
//! lane is a `tokio` task contending on one `Mutex<Kernel>`, replacing the
//! busy-poll with a per-thread state lock (spec.md §5, §9).

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cpu::{CpuCore, StepOutcome, Suspend};
use crate::device::TerminalInterrupt;
use crate::error::{exit_code, EmuError, EmuResult};
use crate::kernel::Kernel;
use crate::process::{Pid, ProcessState, Tid};
use crate::register::RegName;

pub struct Scheduler {
    pub kernel: Arc<Mutex<Kernel>>,
    cores: usize,
    quantum: u32,
}

impl Scheduler {
    pub fn new(kernel: Kernel, cores: usize, quantum: u32) -> Self {
        Self { kernel: Arc::new(Mutex::new(kernel)), cores: cores.max(1), quantum }
    }

    /// Run every currently-runnable thread for one quantum, partitioned
    /// round-robin across `cores` lanes. Returns whether any thread ran.
    pub async fn run_round(&self) -> EmuResult<bool> {
        let assignments = {
            let mut kernel = self.kernel.lock().await;
            resolve_parked_threads(&mut kernel);
            collect_runnable(&kernel)
        };
        if assignments.is_empty() {
            return Ok(false);
        }

        let lanes = partition_round_robin(assignments, self.cores);
        let mut handles = Vec::with_capacity(lanes.len());
        for lane in lanes {
            let kernel = Arc::clone(&self.kernel);
            let quantum = self.quantum;
            handles.push(tokio::spawn(async move { run_lane(kernel, lane, quantum).await }));
        }
        for handle in handles {
            handle.await.map_err(|_| EmuError::PanicInProgress)??;
        }
        Ok(true)
    }

    /// Run rounds until no thread is runnable or the kernel has asked to
    /// shut down / has panicked. A round with nothing runnable doesn't
    /// necessarily mean the machine is quiescent: a thread parked on
    /// `PAwait`/`TAwait` or sleeping off a `SLEEP` syscall is still alive and
    /// will become runnable again once its target finishes or its deadline
    /// passes, so those keep the loop going on a short poll interval instead
    /// of ending the run early.
    pub async fn run_until_quiescent(&self) -> EmuResult<()> {
        loop {
            {
                let kernel = self.kernel.lock().await;
                if kernel.shutdown_requested || kernel.panicked {
                    return Ok(());
                }
            }
            if self.run_round().await? {
                continue;
            }
            let still_parked = {
                let kernel = self.kernel.lock().await;
                any_thread_parked(&kernel)
            };
            if !still_parked {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

/// Clear `waiting` on any thread parked via `PAwait`/`TAwait` (syscalls
/// 19/20) whose target has left the `Running` state, so it rejoins
/// `collect_runnable` this round instead of busy-waiting forever (spec.md
/// §4.7, §5).
fn resolve_parked_threads(kernel: &mut Kernel) {
    let parked: Vec<(Pid, Tid, crate::process::WaitTarget)> = kernel
        .processes
        .iter()
        .flat_map(|(pid, process)| {
            process.threads.iter().filter_map(move |(tid, thread)| thread.wait_target.map(|target| (*pid, *tid, target)))
        })
        .collect();

    for (pid, tid, (target_pid, target_tid)) in parked {
        let resolved = match target_tid {
            None => !matches!(kernel.processes.get(&target_pid), Some(p) if p.state == ProcessState::Running),
            Some(target_tid) => kernel
                .processes
                .get(&target_pid)
                .and_then(|p| p.threads.get(&target_tid))
                .map(|t| !t.running)
                .unwrap_or(true),
        };
        if resolved {
            if let Some(thread) = kernel.processes.get_mut(&pid).and_then(|p| p.threads.get_mut(&tid)) {
                thread.waiting = false;
                thread.wait_target = None;
            }
        }
    }
}

/// Whether any still-running thread is parked (waiting or sleeping) rather
/// than finished, i.e. whether a quiet round might still be temporary.
fn any_thread_parked(kernel: &Kernel) -> bool {
    kernel.processes.values().any(|p| p.threads.values().any(|t| t.running && (t.waiting || t.sleep_until.is_some())))
}

fn collect_runnable(kernel: &Kernel) -> Vec<(Pid, Tid)> {
    let mut out = Vec::new();
    for (pid, process) in kernel.processes.iter() {
        for (tid, thread) in process.threads.iter() {
            if thread.is_schedulable() {
                out.push((*pid, *tid));
            }
        }
    }
    out
}

fn partition_round_robin(items: Vec<(Pid, Tid)>, cores: usize) -> Vec<Vec<(Pid, Tid)>> {
    let mut lanes: Vec<Vec<(Pid, Tid)>> = (0..cores).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        lanes[i % cores].push(item);
    }
    lanes
}

async fn run_lane(kernel: Arc<Mutex<Kernel>>, lane: Vec<(Pid, Tid)>, quantum: u32) -> EmuResult<()> {
    for (pid, tid) in lane {
        run_one_quantum(&kernel, pid, tid, quantum).await?;
    }
    Ok(())
}

async fn run_one_quantum(kernel: &Arc<Mutex<Kernel>>, pid: Pid, tid: Tid, quantum: u32) -> EmuResult<()> {
    let mut guard = kernel.lock().await;

    let schedulable = guard
        .processes
        .get(&pid)
        .and_then(|p| p.threads.get(&tid))
        .map(|t| t.is_schedulable())
        .unwrap_or(false);
    if !schedulable {
        return Ok(());
    }

    let process = guard.processes.get(&pid).ok_or(EmuError::PidNotFound)?;
    let image = process.image_for_thread(tid)?;
    let registers = process.threads.get(&tid).ok_or(EmuError::TidNotFound)?.registers.clone();

    let mut core = CpuCore::new(image);
    core.regs = registers;
    core.running = true;

    // A step that returns `Err` (e.g. DivideByZero) still stops the thread
    // rather than aborting the whole round: the error code is recorded in
    // the thread's last two stack bytes, matching the convention `HLT` and
    // natural fall-off already use (spec.md §7-§8).
    let outcome = match core.execute_num(quantum, &mut *guard) {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = core.memory.set_bytes(core.memory.es.saturating_sub(2), &e.code().to_le_bytes());
            core.running = false;
            StepOutcome::Terminated(exit_code::UNCAUGHT_HOST_ERROR)
        }
    };

    guard.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?.commit_thread_image(tid, core.memory, core.regs)?;
    guard.resync_proc_snapshot(pid)?;

    match outcome {
        StepOutcome::Continue => {}
        StepOutcome::Terminated(code) => {
            let process = guard.processes.get_mut(&pid).ok_or(EmuError::PidNotFound)?;
            process.threads.get_mut(&tid).ok_or(EmuError::TidNotFound)?.running = false;
            if process.all_threads_finished() {
                process.state = ProcessState::Terminated(code);
            }
        }
        StepOutcome::Suspended(Suspend::Syscall) => {
            guard.dispatch_syscall(pid, tid)?;
        }
        StepOutcome::Suspended(Suspend::Interrupt { iid }) => {
            dispatch_interrupt(&mut guard, pid, tid, iid)?;
        }
        StepOutcome::Suspended(Suspend::Library { lid, call }) => {
            guard.call_library(pid, tid, lid, call)?;
        }
    }
    Ok(())
}

/// Route an `INT iid` to whichever device defines it (spec.md §4.9). The
/// terminal's two read interrupts have an actual data effect on the calling
/// thread — read-one-char lands the byte in `RAX`, read-n-chars (length in
/// `RBX`) pushes onto the caller's stack — rather than leaving `pending` as
/// the only trace that the interrupt ran.
fn dispatch_interrupt(kernel: &mut Kernel, pid: Pid, tid: Tid, iid: u32) -> EmuResult<()> {
    let dev_id = kernel
        .devices
        .iter()
        .find(|(_, device)| device.defined_interrupts().contains(&iid))
        .map(|(id, _)| *id)
        .ok_or(EmuError::InvalidSyscall)?;
    kernel.devices.get_mut(&dev_id).ok_or(EmuError::InvalidSyscall)?.handle_interrupt(iid)?;

    match TerminalInterrupt::from_id(iid) {
        Ok(TerminalInterrupt::ReadOneChar) => {
            let byte = kernel.term.read_stdin(pid, 1).first().copied().unwrap_or(0);
            kernel.set_reg(pid, tid, RegName::Rax, byte as u32)?;
        }
        Ok(TerminalInterrupt::ReadNChars) => {
            let len = kernel.reg(pid, tid, RegName::Rbx)?;
            let data = kernel.term.read_stdin(pid, len);
            kernel.push_thread_stack(pid, tid, &data)?;
        }
        // UpdateScreen and any non-terminal device's own interrupts have no
        // register/stack effect; `pending`/device state is enough.
        Ok(TerminalInterrupt::UpdateScreen) | Err(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{FileSystemOps, TerminalHost};
    use crate::process::SecurityLevel;

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

    struct NullTerm;
    impl TerminalHost for NullTerm {
        fn write_stdout(&mut self, _: Pid, _: &[u8]) {}
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

    /// `PUSH 0` (so the exit-code write below the stack top has somewhere
    /// to land), then `HLT code`.
    fn hlt_program(code: u8) -> Vec<u8> {
        use crate::cpu::Opcode;
        let mut out = vec![Opcode::Push as u8, 0x02];
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(Opcode::Hlt as u8);
        out.push(0x02);
        out.extend_from_slice(&1u16.to_le_bytes());
        out.push(code);
        out
    }

    #[tokio::test]
    async fn a_halting_thread_runs_to_completion_in_one_round() {
        let mut kernel = Kernel::new(Box::new(NullFs), Box::new(NullTerm));
        let pid = kernel.spawn_process(hlt_program(9), vec![], SecurityLevel::Kernel, "/");
        let scheduler = Scheduler::new(kernel, 2, 64);
        scheduler.run_until_quiescent().await.unwrap();
        let kernel = scheduler.kernel.lock().await;
        assert_eq!(kernel.processes.get(&pid).unwrap().state, ProcessState::Terminated(9));
    }

    #[test]
    fn partitioning_is_round_robin_across_lanes() {
        let items: Vec<(Pid, Tid)> = (0..5).map(|i| (Pid(i), Tid(0))).collect();
        let lanes = partition_round_robin(items, 2);
        assert_eq!(lanes[0].len(), 3);
        assert_eq!(lanes[1].len(), 2);
    }

    #[tokio::test]
    async fn pawait_resumes_once_target_process_terminates() {
        let mut kernel = Kernel::new(Box::new(NullFs), Box::new(NullTerm));
        let target = kernel.spawn_process(hlt_program(0), vec![], SecurityLevel::Kernel, "/");
        let waiter = kernel.spawn_process(hlt_program(7), vec![], SecurityLevel::Kernel, "/");
        {
            let thread = kernel.processes.get_mut(&waiter).unwrap().threads.get_mut(&Tid(0)).unwrap();
            thread.waiting = true;
            thread.wait_target = Some((target, None));
        }

        let scheduler = Scheduler::new(kernel, 2, 64);
        scheduler.run_until_quiescent().await.unwrap();

        let kernel = scheduler.kernel.lock().await;
        assert_eq!(kernel.processes[&target].state, ProcessState::Terminated(0));
        assert_eq!(kernel.processes[&waiter].state, ProcessState::Terminated(7));
    }

    #[tokio::test]
    async fn sleeping_thread_resumes_once_its_deadline_passes() {
        let mut kernel = Kernel::new(Box::new(NullFs), Box::new(NullTerm));
        let pid = kernel.spawn_process(hlt_program(3), vec![], SecurityLevel::Kernel, "/");
        {
            let thread = kernel.processes.get_mut(&pid).unwrap().threads.get_mut(&Tid(0)).unwrap();
            thread.sleep_until = Some(std::time::Instant::now() + std::time::Duration::from_millis(5));
        }

        let scheduler = Scheduler::new(kernel, 1, 64);
        scheduler.run_until_quiescent().await.unwrap();

        let kernel = scheduler.kernel.lock().await;
        assert_eq!(kernel.processes[&pid].state, ProcessState::Terminated(3));
    }

    struct StdinTerm(Vec<u8>);
    impl TerminalHost for StdinTerm {
        fn write_stdout(&mut self, _: Pid, _: &[u8]) {}
        fn read_stdin(&mut self, _: Pid, len: u32) -> Vec<u8> {
            self.0.iter().take(len as usize).copied().collect()
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

    #[test]
    fn read_one_char_interrupt_lands_byte_in_rax() {
        use crate::device::TerminalDevice;
        let mut kernel = Kernel::new(Box::new(NullFs), Box::new(StdinTerm(vec![65])));
        kernel.devices.insert(0, Box::new(TerminalDevice::new(0, 1, 1)));
        let pid = kernel.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");

        dispatch_interrupt(&mut kernel, pid, Tid(0), 1).unwrap();

        assert_eq!(kernel.reg(pid, Tid(0), RegName::Rax).unwrap(), 65);
    }

    #[test]
    fn read_n_chars_interrupt_pushes_onto_stack_and_bumps_res() {
        use crate::device::TerminalDevice;
        let mut kernel = Kernel::new(Box::new(NullFs), Box::new(StdinTerm(vec![1, 2, 3])));
        kernel.devices.insert(0, Box::new(TerminalDevice::new(0, 1, 1)));
        let pid = kernel.spawn_process(vec![], vec![], SecurityLevel::Kernel, "/");
        kernel.set_reg(pid, Tid(0), RegName::Rbx, 3).unwrap();
        let res_before = kernel.processes[&pid].threads[&Tid(0)].registers.high32(RegName::Res);

        dispatch_interrupt(&mut kernel, pid, Tid(0), 2).unwrap();

        let thread = &kernel.processes[&pid].threads[&Tid(0)];
        assert_eq!(thread.stack.as_slice(), &[1, 2, 3]);
        assert_eq!(thread.registers.high32(RegName::Res), res_before + 3);
    }
}
