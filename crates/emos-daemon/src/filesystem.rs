//! Host-file-backed filesystem collaborator (spec.md §6).
//!
//! Grounded on the original `emos/computer.py::FileSystem`: a nested
//! dict-of-dicts tree where a leaf is a file's bytes and everything else is
//! a directory, pickled to a single output file after every mutation. Here
//! the tree is a `Node` enum persisted as JSON (the teacher reaches for
//! `serde_json` for exactly this kind of on-disk state, e.g. its replay
//! manager's session snapshots).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use emos_core::kernel::FileSystemOps;
use emos_core::{EmuError, EmuResult};
use serde::{Deserialize, Serialize};

pub const ENVIRO_FILE: &str = "__enviro";
const INVALID_FILENAME_CHARS: &[char] = &['\n', '\u{8}', '\t', '\r', '"', '\''];

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn new_root() -> Self {
        let mut root = BTreeMap::new();
        root.insert(ENVIRO_FILE.to_string(), Node::File(b"{}".to_vec()));
        Node::Dir(root)
    }

    fn as_dir(&self) -> EmuResult<&BTreeMap<String, Node>> {
        match self {
            Node::Dir(map) => Ok(map),
            Node::File(_) => Err(EmuError::PathInvalid),
        }
    }

    fn as_dir_mut(&mut self) -> EmuResult<&mut BTreeMap<String, Node>> {
        match self {
            Node::Dir(map) => Ok(map),
            Node::File(_) => Err(EmuError::PathInvalid),
        }
    }
}

/// Splits a path into (directory components, final component), resolving
/// `cwd` for relative paths and rejecting `..` above the root.
fn split_path(cwd: &str, path: &str) -> EmuResult<Vec<String>> {
    let absolute = path.starts_with('/') || path.starts_with('\\');
    let base: Vec<&str> = if absolute { Vec::new() } else { cwd.split(['/', '\\']).filter(|s| !s.is_empty()).collect() };
    let mut components: Vec<String> = base.into_iter().map(str::to_string).collect();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                if components.is_empty() {
                    return Err(EmuError::AboveRoot);
                }
                components.pop();
            }
            other => components.push(other.to_string()),
        }
    }
    Ok(components)
}

fn check_filename(name: &str) -> EmuResult<()> {
    if name.is_empty() || name.chars().any(|c| INVALID_FILENAME_CHARS.contains(&c)) {
        return Err(EmuError::NameInvalid);
    }
    Ok(())
}

pub struct HostFileSystem {
    root: Node,
    disk_path: PathBuf,
}

impl HostFileSystem {
    /// Loads the persisted tree from `disk_path`, or creates a fresh one
    /// (with the reserved `__enviro` file) if it doesn't exist yet.
    pub fn open(disk_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let disk_path = disk_path.as_ref().to_path_buf();
        let root = match std::fs::read(&disk_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(_) => Node::new_root(),
        };
        let mut fs = Self { root, disk_path };
        fs.persist()?;
        Ok(fs)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&self.root)?;
        std::fs::write(&self.disk_path, bytes)?;
        Ok(())
    }

    fn traverse(&self, dirs: &[String]) -> EmuResult<&BTreeMap<String, Node>> {
        let mut cur = self.root.as_dir()?;
        for dir in dirs {
            cur = cur.get(dir).ok_or(EmuError::PathInvalid)?.as_dir()?;
        }
        Ok(cur)
    }

    fn traverse_mut(&mut self, dirs: &[String]) -> EmuResult<&mut BTreeMap<String, Node>> {
        let mut cur = self.root.as_dir_mut()?;
        for dir in dirs {
            cur = cur.get_mut(dir).ok_or(EmuError::PathInvalid)?.as_dir_mut()?;
        }
        Ok(cur)
    }

    /// Does the boot password (if any) stored at the root `__password`
    /// sentinel match `attempt`'s SHA-256 digest? `None` means no password
    /// is set.
    pub fn check_password(&self, attempt: &[u8]) -> EmuResult<bool> {
        use sha2::{Digest, Sha256};
        match self.traverse(&[]).ok().and_then(|d| d.get("__password")) {
            Some(Node::File(hash)) => Ok(Sha256::digest(attempt).as_slice() == hash.as_slice()),
            _ => Ok(true),
        }
    }

    pub fn has_password(&self) -> bool {
        matches!(self.traverse(&[]).ok().and_then(|d| d.get("__password")), Some(Node::File(_)))
    }
}

impl FileSystemOps for HostFileSystem {
    fn read_file(&mut self, cwd: &str, path: &str) -> EmuResult<Vec<u8>> {
        let mut components = split_path(cwd, path)?;
        let name = components.pop().ok_or(EmuError::PathInvalid)?;
        let dir = self.traverse(&components)?;
        match dir.get(&name) {
            Some(Node::File(bytes)) => Ok(bytes.clone()),
            Some(Node::Dir(_)) => Err(EmuError::IsADirectory),
            None => Err(EmuError::FileNotFound),
        }
    }

    fn write_file(&mut self, cwd: &str, path: &str, data: &[u8]) -> EmuResult<()> {
        let mut components = split_path(cwd, path)?;
        let name = components.pop().ok_or(EmuError::PathInvalid)?;
        check_filename(&name)?;
        let dir = self.traverse_mut(&components)?;
        if matches!(dir.get(&name), Some(Node::Dir(_))) {
            return Err(EmuError::IsADirectory);
        }
        dir.insert(name, Node::File(data.to_vec()));
        self.persist().map_err(|_| EmuError::PathInvalid)
    }

    fn delete_file(&mut self, cwd: &str, path: &str) -> EmuResult<()> {
        let mut components = split_path(cwd, path)?;
        let name = components.pop().ok_or(EmuError::PathInvalid)?;
        if name == ENVIRO_FILE {
            return Err(EmuError::EnviroUndeletable);
        }
        let dir = self.traverse_mut(&components)?;
        match dir.get(&name) {
            Some(Node::File(_)) => {
                dir.remove(&name);
                self.persist().map_err(|_| EmuError::PathInvalid)
            }
            Some(Node::Dir(_)) => Err(EmuError::IsADirectory),
            None => Err(EmuError::FileNotFound),
        }
    }

    fn rename_file(&mut self, cwd: &str, path: &str, new_name: &str) -> EmuResult<()> {
        let mut components = split_path(cwd, path)?;
        let old_name = components.pop().ok_or(EmuError::PathInvalid)?;
        if old_name == ENVIRO_FILE {
            return Err(EmuError::EnviroUndeletable);
        }
        check_filename(new_name)?;
        let dir = self.traverse_mut(&components)?;
        let node = dir.remove(&old_name).ok_or(EmuError::FileNotFound)?;
        dir.insert(new_name.to_string(), node);
        self.persist().map_err(|_| EmuError::PathInvalid)
    }

    fn create_dir(&mut self, cwd: &str, path: &str) -> EmuResult<()> {
        let mut components = split_path(cwd, path)?;
        let name = components.pop().ok_or(EmuError::PathInvalid)?;
        check_filename(&name)?;
        let dir = self.traverse_mut(&components)?;
        match dir.get(&name) {
            Some(Node::Dir(_)) => Err(EmuError::FolderExists),
            Some(Node::File(_)) => Err(EmuError::PathInvalid),
            None => {
                dir.insert(name, Node::Dir(BTreeMap::new()));
                self.persist().map_err(|_| EmuError::PathInvalid)
            }
        }
    }

    fn delete_dir(&mut self, cwd: &str, path: &str) -> EmuResult<()> {
        let mut components = split_path(cwd, path)?;
        let name = components.pop().ok_or(EmuError::PathInvalid)?;
        let dir = self.traverse_mut(&components)?;
        match dir.get(&name) {
            Some(Node::Dir(_)) => {
                dir.remove(&name);
                self.persist().map_err(|_| EmuError::PathInvalid)
            }
            Some(Node::File(_)) => Err(EmuError::NotADirectory),
            None => Err(EmuError::FileNotFound),
        }
    }

    fn list_dir(&mut self, cwd: &str, path: &str) -> EmuResult<Vec<String>> {
        let components = split_path(cwd, path)?;
        let dir = self.traverse(&components)?;
        Ok(dir.keys().cloned().collect())
    }
}
