//! Run settings
//!
//! Settings come from an optional `stackwork.toml` in the project directory,
//! then environment overrides, then whatever the caller sets explicitly.
//!
//! # Environment Variables
//!
//! - `STACKWORK_TF_BINARY` - Terraform-compatible binary to run (default `terraform`)
//! - `STACKWORK_JOBS` - Worker pool size for unit operations

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings file looked up in the project directory
pub const SETTINGS_FILE: &str = "stackwork.toml";

/// Environment variable for the terraform binary override
pub const ENV_TF_BINARY: &str = "STACKWORK_TF_BINARY";

/// Environment variable for the worker pool size
pub const ENV_JOBS: &str = "STACKWORK_JOBS";

/// Version written into persisted state documents
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Project directory containing the manifests
    #[serde(skip)]
    pub working_dir: PathBuf,
    /// Directory for generated unit code, relative to `working_dir`
    pub cache_dir: PathBuf,
    /// Local state file name, relative to `working_dir`
    pub state_file: String,
    /// Local lock file name, relative to `working_dir`
    pub lock_file: String,
    /// Shared provider plugin cache handed to terraform init
    pub plugins_cache_dir: Option<PathBuf>,
    /// Terraform-compatible binary
    pub terraform_bin: String,
    /// Parallel unit operations per wave
    pub jobs: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            cache_dir: PathBuf::from(".stackwork"),
            state_file: "stackwork.state".to_string(),
            lock_file: "stackwork.state.lock".to_string(),
            plugins_cache_dir: None,
            terraform_bin: "terraform".to_string(),
            jobs: 4,
        }
    }
}

impl Settings {
    /// Load settings for a project directory.
    ///
    /// A missing settings file is not an error. Environment overrides are
    /// applied on top.
    pub fn load(working_dir: &Path) -> Result<Self> {
        let path = working_dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| Error::path(&path, e))?;
            toml::from_str::<Self>(&content)
                .map_err(|e| Error::config(format!("{}: {e}", path.display())))?
        } else {
            log::debug!("No {} in {}, using defaults", SETTINGS_FILE, working_dir.display());
            Self::default()
        };
        settings.working_dir = working_dir.to_path_buf();
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bin) = lookup(ENV_TF_BINARY).filter(|b| !b.is_empty()) {
            log::debug!("Using terraform binary from {ENV_TF_BINARY}: {bin}");
            self.terraform_bin = bin;
        }
        if let Some(jobs) = lookup(ENV_JOBS) {
            match jobs.parse::<usize>() {
                Ok(n) if n > 0 => self.jobs = n,
                _ => log::warn!("Ignoring invalid {ENV_JOBS}={jobs}"),
            }
        }
    }

    /// Absolute-ish directory holding generated unit code
    pub fn cache_path(&self) -> PathBuf {
        self.working_dir.join(&self.cache_dir)
    }

    /// Local state file path
    pub fn state_path(&self) -> PathBuf {
        self.working_dir.join(&self.state_file)
    }

    /// Local lock file path
    pub fn lock_path(&self) -> PathBuf {
        self.working_dir.join(&self.lock_file)
    }

    /// Code directory of one unit
    pub fn unit_dir(&self, stack: &str, unit: &str) -> PathBuf {
        self.cache_path().join(format!("{stack}.{unit}"))
    }
}
