//! Environment-variable configuration, mirroring the teacher daemon's
//! `SISCTL_BIND` pattern (one var per knob, sane defaults, no config file).

use std::path::PathBuf;

const DEFAULT_DISK: &str = "emos.disk";
const DEFAULT_CORES: usize = 4;
const DEFAULT_QUANTUM: u32 = 64;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the persisted filesystem image.
    pub disk: PathBuf,
    /// Number of scheduler lanes (spec.md §4.6's N).
    pub cores: usize,
    /// Instructions granted per thread per scheduling round (K).
    pub quantum: u32,
    /// Skip the boot password prompt (headless/test runs).
    pub no_password: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let disk = std::env::var("EMOS_DISK").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(DEFAULT_DISK));
        let cores = std::env::var("EMOS_CORES").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_CORES);
        let quantum = std::env::var("EMOS_QUANTUM").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_QUANTUM);
        let no_password = std::env::var("EMOS_NO_PASSWORD").map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
        Self { disk, cores, quantum, no_password }
    }
}
