//! emos control daemon: boots the filesystem/terminal/kernel/scheduler
//! stack and drives an interactive shell against host stdin.

mod computer;
mod config;
mod filesystem;
mod scheduler_ext;
mod shell;
mod terminal;

use std::io::{self, BufRead, Write};

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use computer::Daemon;
use config::Config;
use shell::Shell;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,emosd=debug")))
        .init();

    info!("starting emos");
    info!(version = env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let daemon = Daemon::bootstrap(&config).await?;
    daemon.run_startup().await?;

    let mut shell = Shell::new(daemon.clone());
    let stdin = io::stdin();
    print!("{}> ", shell.cwd);
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line?;
        match shell.execute_line(&line).await {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            Err(err) => error!(?err, "command failed"),
        }

        if daemon.scheduler.kernel.lock().await.shutdown_requested {
            break;
        }
        print!("{}> ", shell.cwd);
        io::stdout().flush().ok();
    }

    daemon.run_shutdown().await?;
    info!("emos halted");
    Ok(())
}
