//! State backends
//!
//! A backend stores the orchestration state blob, guards it with a lock, and
//! generates the terraform syntax units use to find each other's state.
//!
//! Adapters:
//! - [`LocalBackend`] - files on the local filesystem
//! - [`S3Backend`] - code generation only; state storage is not supported

mod local;
mod s3;

pub use local::LocalBackend;
pub use s3::S3Backend;

use crate::error::{Error, Result};
use crate::marker::OutputRef;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Name of the implicit local backend every project has
pub const DEFAULT_BACKEND: &str = "default";

/// Durable, lockable storage for the orchestration state
pub trait Backend: Send + Sync + Debug {
    /// Name the backend is registered under
    fn name(&self) -> &str;

    /// Provider type, e.g. "local" or "s3"
    fn provider(&self) -> &'static str;

    /// Take the state lock. Fails immediately if it is already held.
    fn lock_state(&self) -> Result<()>;

    /// Release the state lock
    fn unlock_state(&self) -> Result<()>;

    /// Persist the serialized state document
    fn write_state(&self, blob: &str) -> Result<()>;

    /// Read the serialized state document, `None` if nothing was saved yet
    fn read_state(&self) -> Result<Option<String>>;

    /// `terraform { backend ... }` block for one unit
    fn backend_block(&self, stack: &str, unit: &str) -> String;

    /// `data "terraform_remote_state"` block reading one unit's state
    fn remote_state_block(&self, stack: &str, unit: &str) -> String;

    /// Expression evaluating to an output of another unit at tool run time
    fn remote_state_ref(&self, target: &OutputRef) -> String {
        format!(
            "${{data.terraform_remote_state.{}.outputs.{}}}",
            remote_state_name(&target.stack, &target.unit),
            target.output
        )
    }
}

/// Data source name used for a unit's remote state
pub fn remote_state_name(stack: &str, unit: &str) -> String {
    format!("{stack}-{unit}")
}

/// Build a backend from a `kind: backend` manifest entry
pub fn from_spec(name: &str, provider: &str, spec: &Value, working_dir: &Path) -> Result<Box<dyn Backend>> {
    match provider {
        "local" => Ok(Box::new(LocalBackend::from_spec(name, spec, working_dir)?)),
        "s3" => Ok(Box::new(S3Backend::from_spec(name, spec)?)),
        other => Err(Error::config(format!(
            "backend '{name}': unknown provider '{other}'"
        ))),
    }
}

/// Backends by name
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Names must be unique.
    pub fn register(&mut self, backend: Box<dyn Backend>) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(Error::config(format!("duplicate backend '{name}'")));
        }
        log::debug!("Registered {} backend '{}'", backend.provider(), name);
        self.backends.insert(name, Arc::from(backend));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Backend> {
        self.backends
            .get(name)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::config(format!("backend '{name}' not found")))
    }

    /// Owned handle to a backend, for guards that outlive a borrow of the registry
    pub fn shared(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("backend '{name}' not found")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

/// Read a required string field from a backend spec
fn required_str<'a>(backend: &str, spec: &'a Value, field: &str) -> Result<&'a str> {
    spec.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::config(format!("backend '{backend}': missing required field '{field}'")))
}
