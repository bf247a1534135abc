//! Operator status-file overrides
//!
//! An operator forces a node or a whole cluster up or down by dropping a
//! file named after the flag under `<root>/<scope>/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub trait StatusFiles: Send + Sync {
    fn exists(&self, flag: &str, scope: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct StatusFileDir {
    root: PathBuf,
}

impl StatusFileDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, flag: &str, scope: &str) -> PathBuf {
        self.root.join(scope).join(flag)
    }

    /// Raise `flag` for `scope`, recording `reason` as the file content
    pub fn create(&self, flag: &str, scope: &str, reason: &str) -> io::Result<()> {
        let path = self.path(flag, scope);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, reason)
    }

    pub fn remove(&self, flag: &str, scope: &str) -> io::Result<()> {
        match fs::remove_file(self.path(flag, scope)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl StatusFiles for StatusFileDir {
    fn exists(&self, flag: &str, scope: &str) -> bool {
        self.path(flag, scope).is_file()
    }
}
