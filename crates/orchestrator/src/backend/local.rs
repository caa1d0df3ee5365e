//! Local filesystem backend

use super::{Backend, remote_state_name, required_str};
use crate::error::{Error, Result};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    state_path: PathBuf,
    lock_path: PathBuf,
    tfstate_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, state_path: PathBuf, lock_path: PathBuf, tfstate_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            state_path,
            lock_path,
            tfstate_dir,
        }
    }

    /// Backend from a manifest spec with a `path` directory.
    ///
    /// Relative paths are resolved against the project directory.
    pub fn from_spec(name: &str, spec: &Value, working_dir: &Path) -> Result<Self> {
        let path = PathBuf::from(required_str(name, spec, "path")?);
        let root = if path.is_absolute() {
            path
        } else {
            working_dir.join(path)
        };
        Ok(Self::new(
            name,
            root.join("stackwork.state"),
            root.join("stackwork.state.lock"),
            root,
        ))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn tfstate_path(&self, stack: &str, unit: &str) -> PathBuf {
        self.tfstate_dir.join(stack).join(format!("{unit}.tfstate"))
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
    }
    Ok(())
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &'static str {
        "local"
    }

    fn lock_state(&self) -> Result<()> {
        ensure_parent(&self.lock_path)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::Locked),
            Err(e) => return Err(Error::path(&self.lock_path, e)),
        };
        writeln!(file, "pid={}", std::process::id()).map_err(|e| Error::path(&self.lock_path, e))?;
        log::debug!("Locked state at {}", self.lock_path.display());
        Ok(())
    }

    fn unlock_state(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                log::debug!("Unlocked state at {}", self.lock_path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::path(&self.lock_path, e)),
        }
    }

    fn write_state(&self, blob: &str) -> Result<()> {
        ensure_parent(&self.state_path)?;
        let tmp = self.state_path.with_extension("state.tmp");
        fs::write(&tmp, blob).map_err(|e| Error::path(&tmp, e))?;
        fs::rename(&tmp, &self.state_path).map_err(|e| Error::path(&self.state_path, e))?;
        log::debug!("Saved state to {}", self.state_path.display());
        Ok(())
    }

    fn read_state(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.state_path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::path(&self.state_path, e)),
        }
    }

    fn backend_block(&self, stack: &str, unit: &str) -> String {
        format!(
            "terraform {{\n  backend \"local\" {{\n    path = \"{}\"\n  }}\n}}\n",
            self.tfstate_path(stack, unit).display()
        )
    }

    fn remote_state_block(&self, stack: &str, unit: &str) -> String {
        format!(
            "data \"terraform_remote_state\" \"{}\" {{\n  backend = \"local\"\n  config = {{\n    path = \"{}\"\n  }}\n}}\n",
            remote_state_name(stack, unit),
            self.tfstate_path(stack, unit).display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> LocalBackend {
        LocalBackend::from_spec("local", &json!({ "path": "state" }), dir.path()).unwrap()
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        backend.lock_state().unwrap();
        let err = backend.lock_state().unwrap_err();
        assert_eq!(err.to_string(), "state is locked by another process");

        backend.unlock_state().unwrap();
        backend.lock_state().unwrap();
        backend.unlock_state().unwrap();
    }

    #[test]
    fn test_unlock_without_lock_is_ok() {
        let dir = TempDir::new().unwrap();
        backend(&dir).unlock_state().unwrap();
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        assert!(backend.read_state().unwrap().is_none());
        backend.write_state("{\"version\":\"1\"}").unwrap();
        assert_eq!(backend.read_state().unwrap().unwrap(), "{\"version\":\"1\"}");
        assert!(dir.path().join("state").join("stackwork.state").exists());
    }

    #[test]
    fn test_generated_blocks() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let block = backend.backend_block("net", "vpc");
        assert!(block.contains("backend \"local\""));
        assert!(block.contains("net/vpc.tfstate"));

        let remote = backend.remote_state_block("net", "vpc");
        assert!(remote.starts_with("data \"terraform_remote_state\" \"net-vpc\""));
    }

    #[test]
    fn test_missing_path() {
        let dir = TempDir::new().unwrap();
        let err = LocalBackend::from_spec("local", &json!({}), dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing required field 'path'"));
    }
}
