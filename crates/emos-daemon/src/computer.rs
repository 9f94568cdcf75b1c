//! The `Computer` façade (spec.md component L): wires filesystem, terminal,
//! kernel, and scheduler together, and owns startup/shutdown (SPEC_FULL.md
//! supplement #1-#2).

use std::sync::Arc;

use emos_core::device::TerminalDevice;
use emos_core::library::{IntStrLib, WriteLib, INT_STR_LIB_ID, WRITE_LIB_ID};
use emos_core::process::SecurityLevel;
use emos_core::{EmuError, Kernel, Scheduler};
use tracing::{info, warn};

use crate::config::Config;
use crate::filesystem::HostFileSystem;
use crate::scheduler_ext::run_to_completion;
use crate::terminal::{apply_backspaces, Terminal};

const STARTUP_BINARY: &str = "/__startup.cbf";
const SHUTDOWN_BINARY: &str = "/__shutdown.cbf";

pub struct Daemon {
    pub scheduler: Arc<Scheduler>,
}

impl Daemon {
    pub async fn bootstrap(config: &Config) -> anyhow::Result<Arc<Self>> {
        let fs = HostFileSystem::open(&config.disk)?;
        if !config.no_password && fs.has_password() {
            if !prompt_password(&fs)? {
                anyhow::bail!("boot password mismatch");
            }
        }

        let mut kernel = Kernel::new(Box::new(fs), Box::new(Terminal::new()));
        kernel.libraries.insert(INT_STR_LIB_ID, Box::new(IntStrLib));
        kernel.libraries.insert(WRITE_LIB_ID, Box::new(WriteLib));
        kernel.devices.insert(0, Box::new(TerminalDevice::new(0, 25, 80)));

        let scheduler = Arc::new(Scheduler::new(kernel, config.cores, config.quantum));
        Ok(Arc::new(Self { scheduler }))
    }

    /// Run `/__startup.cbf` to completion, if present, before the shell
    /// starts taking input.
    pub async fn run_startup(&self) -> anyhow::Result<()> {
        self.run_lifecycle_binary(STARTUP_BINARY, "startup").await
    }

    /// Run `/__shutdown.cbf` to completion, if present, before tearing down
    /// any remaining processes.
    pub async fn run_shutdown(&self) -> anyhow::Result<()> {
        self.run_lifecycle_binary(SHUTDOWN_BINARY, "shutdown").await
    }

    async fn run_lifecycle_binary(&self, path: &str, label: &str) -> anyhow::Result<()> {
        let pid = {
            let mut kernel = self.scheduler.kernel.lock().await;
            let bytes = match kernel.fs.read_file("/", path) {
                Ok(bytes) => bytes,
                Err(EmuError::FileNotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let code_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])) as usize;
            let code = bytes.get(4..4 + code_size).unwrap_or(&[]).to_vec();
            let data = bytes.get(4 + code_size..).unwrap_or(&[]).to_vec();
            kernel.spawn_process(code, data, SecurityLevel::Kernel, "/")
        };
        info!(label, "running lifecycle executable");
        let code = run_to_completion(&self.scheduler, pid).await?;
        if code != 0 {
            warn!(label, code, "lifecycle executable exited non-zero");
        }
        Ok(())
    }
}

/// Prompt for the boot password on stdin, honoring `\b` backspace within
/// the buffered line (spec.md §6's password protocol).
fn prompt_password(fs: &HostFileSystem) -> anyhow::Result<bool> {
    use std::io::Write;
    print!("PASSWORD: ");
    std::io::stdout().flush().ok();
    let mut raw = String::new();
    std::io::stdin().read_line(&mut raw)?;
    let trimmed = raw.trim_end_matches(['\n', '\r']);
    let entered = apply_backspaces(trimmed.as_bytes());
    Ok(fs.check_password(&entered)?)
}
