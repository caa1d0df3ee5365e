//! S3 backend
//!
//! Generates `backend "s3"` and remote-state blocks for terraform units.
//! Storing the orchestration state itself in S3 needs an object store client,
//! which this crate does not ship, so the state operations report
//! [`Error::Unsupported`].

use super::{Backend, remote_state_name, required_str};
use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    bucket: String,
    region: String,
    key_prefix: String,
}

impl S3Backend {
    pub fn from_spec(name: &str, spec: &Value) -> Result<Self> {
        let key_prefix = spec
            .get("key_prefix")
            .and_then(Value::as_str)
            .unwrap_or("stackwork")
            .trim_matches('/')
            .to_string();
        Ok(Self {
            name: name.to_string(),
            bucket: required_str(name, spec, "bucket")?.to_string(),
            region: required_str(name, spec, "region")?.to_string(),
            key_prefix,
        })
    }

    fn key(&self, stack: &str, unit: &str) -> String {
        format!("{}/{stack}-{unit}.state", self.key_prefix)
    }

    fn unsupported(&self, op: &str) -> Error {
        Error::Unsupported(format!(
            "stackwork state {op} not supported by s3 backend '{}'",
            self.name
        ))
    }
}

impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &'static str {
        "s3"
    }

    fn lock_state(&self) -> Result<()> {
        Err(self.unsupported("lock"))
    }

    fn unlock_state(&self) -> Result<()> {
        Err(self.unsupported("unlock"))
    }

    fn write_state(&self, _blob: &str) -> Result<()> {
        Err(self.unsupported("write"))
    }

    fn read_state(&self) -> Result<Option<String>> {
        Err(self.unsupported("read"))
    }

    fn backend_block(&self, stack: &str, unit: &str) -> String {
        format!(
            "terraform {{\n  backend \"s3\" {{\n    bucket = \"{}\"\n    key    = \"{}\"\n    region = \"{}\"\n  }}\n}}\n",
            self.bucket,
            self.key(stack, unit),
            self.region
        )
    }

    fn remote_state_block(&self, stack: &str, unit: &str) -> String {
        format!(
            "data \"terraform_remote_state\" \"{}\" {{\n  backend = \"s3\"\n  config = {{\n    bucket = \"{}\"\n    key    = \"{}\"\n    region = \"{}\"\n  }}\n}}\n",
            remote_state_name(stack, unit),
            self.bucket,
            self.key(stack, unit),
            self.region
        )
    }
}
