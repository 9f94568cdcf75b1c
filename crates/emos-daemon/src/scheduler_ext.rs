//! Helper for driving the scheduler from an interactive context (the shell
//! waiting on `run`/`sec`, or startup/shutdown executables) rather than a
//! long-lived service loop.

use std::sync::Arc;

use emos_core::process::{Pid, ProcessState};
use emos_core::{EmuError, EmuResult, Scheduler};

/// Run scheduler rounds until `pid` has terminated, returning its exit
/// code. A round with nothing runnable isn't necessarily stuck: a thread
/// parked on `PAwait`/`TAwait` or sleeping off a `SLEEP` syscall is still
/// alive and will free up once its target finishes or its deadline passes,
/// so those keep this loop going on a short poll interval. Fails with
/// `ProcessNotFinished` only once nothing in the system is runnable *or*
/// parked while `pid` is still outstanding.
pub async fn run_to_completion(scheduler: &Arc<Scheduler>, pid: Pid) -> EmuResult<u8> {
    loop {
        {
            let kernel = scheduler.kernel.lock().await;
            match kernel.processes.get(&pid) {
                Some(process) => {
                    if let ProcessState::Terminated(code) = process.state {
                        return Ok(code);
                    }
                }
                None => return Err(EmuError::PidNotFound),
            }
        }
        if scheduler.run_round().await? {
            continue;
        }
        let still_parked = {
            let kernel = scheduler.kernel.lock().await;
            kernel.processes.values().any(|p| p.threads.values().any(|t| t.running && (t.waiting || t.sleep_until.is_some())))
        };
        if !still_parked {
            return Err(EmuError::ProcessNotFinished);
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
}
