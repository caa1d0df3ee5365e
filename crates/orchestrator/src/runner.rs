//! External process execution for drivers and hooks

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A command run inside a unit's code directory
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, dir: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: dir.to_path_buf(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human-readable command line
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run and capture stdout.
    ///
    /// On failure the error carries stderr, or stdout when stderr is empty,
    /// so tools that report on stdout are still diagnosable.
    pub fn capture(&self) -> Result<String> {
        log::debug!("Running `{}` in {}", self.display(), self.dir.display());

        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Tool {
                message: format!("failed to execute `{}`: {e}", self.display()),
                output: String::new(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            log::trace!("`{}` output:\n{}", self.display(), stdout);
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(Error::Tool {
            message: format!("`{}` failed: {}", self.display(), output.status),
            output: if stderr.trim().is_empty() { stdout } else { stderr },
        })
    }

    /// Run, discarding stdout
    pub fn run(&self) -> Result<()> {
        self.capture().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_display() {
        let dir = TempDir::new().unwrap();
        let cmd = ToolCommand::new("terraform", dir.path()).args(["apply", "-auto-approve"]);
        assert_eq!(cmd.display(), "terraform apply -auto-approve");
    }

    #[test]
    fn test_capture_runs_in_dir_with_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let out = ToolCommand::new("sh", dir.path())
            .arg("-c")
            .arg("cat marker.txt; printf \" $GREETING\"")
            .env("GREETING", "hello")
            .capture()
            .unwrap();

        assert_eq!(out, "here hello");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let err = ToolCommand::new("sh", dir.path())
            .arg("-c")
            .arg("echo boom >&2; exit 3")
            .run()
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("error output:"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let err = ToolCommand::new("definitely-not-a-real-binary-xyz", dir.path())
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("failed to execute"));
    }
}
