//! The interactive shell / `CMDHandler` collaborator (spec.md §6,
//! SPEC_FULL.md supplement #4-#6): tokenization, `%VAR%` expansion,
//! `>`/`<`/`|` redirection, PATH resolution, and the builtin command table.
//!
//! Grounded on `original_source/emos/operatingsystem.py`'s `CMDHandler`
//! (line-oriented dispatch over a fixed builtin table, environment map
//! loaded from the `__enviro` file) but restructured around `Result`
//! instead of the original's `(code, msg)` tuples.

use std::collections::BTreeMap;
use std::sync::Arc;

use emos_core::process::SecurityLevel;
use emos_core::{EmuError, EmuResult};
use tracing::{debug, info};

use crate::computer::Daemon;
use crate::scheduler_ext::run_to_completion;

const BUILTINS: &[&str] = &[
    "cd", "ldir", "echo", "del", "rname", "mkdir", "compile", "time", "shutdown", "clear", "read", "edit", "help",
    "run", "sec", "copy", "env", "move",
];

pub struct Shell {
    daemon: Arc<Daemon>,
    pub cwd: String,
}

impl Shell {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon, cwd: "/".to_string() }
    }

    /// Run one line of input, returning the text it produced (used both for
    /// direct display and as the captured output of a `|`-piped sub-command).
    pub async fn execute_line(&mut self, line: &str) -> EmuResult<String> {
        let expanded = self.expand_vars(line).await?;
        let (main, redirect_to) = split_redirect(&expanded);
        let (main, piped) = split_pipe(main);

        let mut argv = tokenize(main)?;
        if argv.is_empty() {
            return Ok(String::new());
        }

        argv = self.inject_argfile(argv).await?;

        if let Some(piped_line) = piped {
            let piped_output = Box::pin(self.execute_line(piped_line)).await?;
            argv.extend(tokenize(piped_output.trim())?);
        }

        let cmd = argv.remove(0);
        let output = self.dispatch(&cmd, &argv).await?;

        if let Some(path) = redirect_to {
            let cwd = self.cwd.clone();
            let mut kernel = self.daemon.scheduler.kernel.lock().await;
            kernel.fs.write_file(&cwd, path.trim(), output.as_bytes())?;
            Ok(String::new())
        } else {
            Ok(output)
        }
    }

    async fn expand_vars(&self, line: &str) -> EmuResult<String> {
        let env = self.read_enviro().await?;
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            if let Some(end) = after.find('%') {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            } else {
                out.push('%');
                rest = after;
                break;
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    async fn inject_argfile(&self, argv: Vec<String>) -> EmuResult<Vec<String>> {
        let mut out = Vec::with_capacity(argv.len());
        let mut kernel = self.daemon.scheduler.kernel.lock().await;
        for arg in argv {
            if let Some(path) = arg.strip_prefix('<') {
                let bytes = kernel.fs.read_file(&self.cwd, path)?;
                let text = String::from_utf8(bytes).map_err(|_| EmuError::ParseError)?;
                out.extend(tokenize(&text)?);
            } else {
                out.push(arg);
            }
        }
        Ok(out)
    }

    async fn read_enviro(&self) -> EmuResult<BTreeMap<String, String>> {
        let mut kernel = self.daemon.scheduler.kernel.lock().await;
        let bytes = kernel.fs.read_file("/", crate::filesystem::ENVIRO_FILE)?;
        serde_json::from_slice(&bytes).map_err(|_| EmuError::EnvVarInvalid)
    }

    async fn write_enviro(&self, env: &BTreeMap<String, String>) -> EmuResult<()> {
        let bytes = serde_json::to_vec(env).map_err(|_| EmuError::EnvVarInvalid)?;
        let mut kernel = self.daemon.scheduler.kernel.lock().await;
        kernel.fs.write_file("/", crate::filesystem::ENVIRO_FILE, &bytes)
    }

    async fn dispatch(&mut self, cmd: &str, args: &[String]) -> EmuResult<String> {
        debug!(cmd, ?args, "dispatching shell command");
        match cmd {
            "cd" => {
                let target = args.first().ok_or(EmuError::ParseError)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.fs.list_dir(&self.cwd, target)?;
                self.cwd = resolve_cwd(&self.cwd, target);
                Ok(String::new())
            }
            "ldir" => {
                let target = args.first().map(String::as_str).unwrap_or(".");
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                Ok(kernel.fs.list_dir(&self.cwd, target)?.join("\n"))
            }
            "echo" => Ok(args.join(" ")),
            "del" => {
                let target = args.first().ok_or(EmuError::ParseError)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.fs.delete_file(&self.cwd, target)?;
                Ok(String::new())
            }
            "rname" => {
                let (path, name) = two_args(args)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.fs.rename_file(&self.cwd, path, name)?;
                Ok(String::new())
            }
            "mkdir" => {
                let target = args.first().ok_or(EmuError::ParseError)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.fs.create_dir(&self.cwd, target)?;
                Ok(String::new())
            }
            "compile" => {
                // No in-scope assembler: promotes an already-assembled
                // bytecode file to an executable path unchanged.
                let (src, dst) = two_args(args)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                let bytes = kernel.fs.read_file(&self.cwd, src)?;
                kernel.fs.write_file(&self.cwd, dst, &bytes)?;
                Ok(String::new())
            }
            "time" => {
                let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                Ok(now.to_string())
            }
            "shutdown" => {
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.shutdown_requested = true;
                info!("shutdown requested from shell");
                Ok(String::new())
            }
            "clear" => {
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.term.write_host(b"\x1b[2J\x1b[H");
                Ok(String::new())
            }
            "read" => {
                let target = args.first().ok_or(EmuError::ParseError)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                let bytes = kernel.fs.read_file(&self.cwd, target)?;
                String::from_utf8(bytes).map_err(|_| EmuError::ParseError)
            }
            "edit" => {
                let target = args.first().ok_or(EmuError::ParseError)?;
                let lines = self.collect_edit_lines().await;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                kernel.fs.write_file(&self.cwd, target, lines.as_bytes())?;
                Ok(String::new())
            }
            "help" => Ok(BUILTINS.join(" ")),
            "run" => self.run_binary(args, SecurityLevel::Kernel).await,
            "sec" => {
                let level = match args.first().map(String::as_str) {
                    Some("user") => SecurityLevel::User,
                    Some("kernel") => SecurityLevel::Kernel,
                    _ => return Err(EmuError::ParseError),
                };
                self.run_binary(&args[1..], level).await
            }
            "copy" => {
                let (src, dst) = two_args(args)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                let bytes = kernel.fs.read_file(&self.cwd, src)?;
                kernel.fs.write_file(&self.cwd, dst, &bytes)?;
                Ok(String::new())
            }
            "move" => {
                let (src, dst) = two_args(args)?;
                let mut kernel = self.daemon.scheduler.kernel.lock().await;
                let bytes = kernel.fs.read_file(&self.cwd, src)?;
                kernel.fs.write_file(&self.cwd, dst, &bytes)?;
                kernel.fs.delete_file(&self.cwd, src)?;
                Ok(String::new())
            }
            "env" => self.env_builtin(args).await,
            other => self.resolve_and_run(other, args).await,
        }
    }

    async fn env_builtin(&self, args: &[String]) -> EmuResult<String> {
        match args.first().map(String::as_str) {
            Some("get") => {
                let name = args.get(1).ok_or(EmuError::ParseError)?;
                let env = self.read_enviro().await?;
                Ok(env.get(name).cloned().unwrap_or_default())
            }
            Some("set") => {
                let name = args.get(1).ok_or(EmuError::ParseError)?;
                let value = args.get(2).ok_or(EmuError::ParseError)?;
                let mut env = self.read_enviro().await?;
                env.insert(name.clone(), value.clone());
                self.write_enviro(&env).await?;
                Ok(String::new())
            }
            Some("del") => {
                let name = args.get(1).ok_or(EmuError::ParseError)?;
                let mut env = self.read_enviro().await?;
                env.remove(name);
                self.write_enviro(&env).await?;
                Ok(String::new())
            }
            _ => Err(EmuError::ParseError),
        }
    }

    /// Line-oriented editor (spec.md §4.8's `WriteLib`, at the shell's
    /// scope): reads host stdin lines until one is empty.
    async fn collect_edit_lines(&self) -> String {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() || line.trim_end_matches(['\n', '\r']).is_empty() {
                break;
            }
            out.push_str(&line);
        }
        out
    }

    async fn resolve_and_run(&mut self, name: &str, args: &[String]) -> EmuResult<String> {
        let candidates = self.candidate_paths(name).await?;
        let mut kernel = self.daemon.scheduler.kernel.lock().await;
        for candidate in &candidates {
            if kernel.fs.read_file(&self.cwd, candidate).is_ok() {
                drop(kernel);
                let mut full_args = vec![candidate.clone()];
                full_args.extend_from_slice(args);
                return self.run_binary(&full_args, SecurityLevel::User).await;
            }
        }
        Err(EmuError::IllegalCommand)
    }

    async fn candidate_paths(&self, name: &str) -> EmuResult<Vec<String>> {
        let with_ext = if name.ends_with(".cbf") { name.to_string() } else { format!("{name}.cbf") };
        let mut candidates = vec![with_ext.clone()];
        let env = self.read_enviro().await?;
        if let Some(path_var) = env.get("PATH") {
            for entry in path_var.split(':').filter(|s| !s.is_empty()) {
                candidates.push(format!("{entry}/{with_ext}"));
            }
        }
        Ok(candidates)
    }

    /// Load a `.cbf` binary (spec.md §6: `code_size:u32 LE || code || data`)
    /// and run it on the scheduler to completion.
    async fn run_binary(&mut self, args: &[String], security_level: SecurityLevel) -> EmuResult<String> {
        let path = args.first().ok_or(EmuError::ParseError)?;
        let pid = {
            let mut kernel = self.daemon.scheduler.kernel.lock().await;
            let bytes = kernel.fs.read_file(&self.cwd, path)?;
            if bytes.len() < 4 {
                return Err(EmuError::ParseError);
            }
            let code_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
            let code = bytes.get(4..4 + code_size).ok_or(EmuError::ParseError)?.to_vec();
            let data = bytes.get(4 + code_size..).unwrap_or(&[]).to_vec();
            kernel.spawn_process(code, data, security_level, &self.cwd)
        };
        let exit = run_to_completion(&self.daemon.scheduler, pid).await?;
        Ok(exit.to_string())
    }
}

fn two_args(args: &[String]) -> EmuResult<(&str, &str)> {
    match (args.first(), args.get(1)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EmuError::ParseError),
    }
}

fn resolve_cwd(cwd: &str, target: &str) -> String {
    if let Some(rest) = target.strip_prefix('/') {
        format!("/{rest}")
    } else if target == ".." {
        let trimmed = cwd.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => trimmed[..pos].to_string(),
        }
    } else {
        let base = cwd.trim_end_matches('/');
        format!("{base}/{target}")
    }
}

fn split_redirect(line: &str) -> (&str, Option<&str>) {
    match line.rsplit_once('>') {
        Some((main, target)) if !target.trim().is_empty() => (main, Some(target)),
        _ => (line, None),
    }
}

fn split_pipe(line: &str) -> (&str, Option<&str>) {
    match line.split_once('|') {
        Some((main, rest)) => (main, Some(rest)),
        None => (line, None),
    }
}

/// POSIX-ish tokenizer: whitespace separated, `'...'`/`"..."` quote bare a
/// literal run, backslash escapes the next character.
fn tokenize(line: &str) -> EmuResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(EmuError::ParseError);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
