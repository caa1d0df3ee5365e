//! Shell units
//!
//! Runs user-supplied bash snippets for apply, plan and destroy. The optional
//! `output` snippet must print a JSON object on stdout; its fields become the
//! unit outputs.

use super::{UnitCore, UnitFactory, parse_spec};
use crate::context::{BuildContext, RunContext};
use crate::error::{Error, Result};
use crate::runner::ToolCommand;
use crate::scan::{Scan, Substitute};
use crate::unit::Unit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

const KIND: &str = "shell";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellSpec {
    pub apply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Scan for ShellSpec {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.apply.scan(f)?;
        self.plan.scan(f)?;
        self.destroy.scan(f)?;
        self.output.scan(f)?;
        self.env.scan(f)
    }
}

#[derive(Debug)]
pub struct ShellUnit {
    core: UnitCore,
    spec: ShellSpec,
    /// Environment after resolution
    env: BTreeMap<String, String>,
}

impl ShellUnit {
    pub fn new(core: UnitCore, spec: ShellSpec) -> Self {
        Self {
            core,
            spec,
            env: BTreeMap::new(),
        }
    }

    fn script_name(step: &str) -> String {
        format!("{step}.sh")
    }

    fn run_script(&self, step: &str) -> Result<String> {
        let file = Self::script_name(step);
        if !self.core.code_dir.join(&file).exists() {
            return Err(Error::internal(format!(
                "unit '{}': {file} missing, unit not built",
                self.core.key()
            )));
        }
        ToolCommand::new("bash", &self.core.code_dir)
            .arg(file)
            .envs(&self.env)
            .capture()
    }
}

fn script(body: &str) -> String {
    format!("#!/usr/bin/env bash\nset -e\n\n{body}\n")
}

impl Unit for ShellUnit {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn scan_spec(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.spec.scan(f)
    }

    fn spec_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.spec)?)
    }

    fn build(&mut self, ctx: &BuildContext<'_>) -> Result<()> {
        self.core.ensure_code_dir()?;
        self.core.remote_states.clear();

        let mut resolved = self.spec.clone();
        ctx.resolve(&mut resolved, &mut self.core.remote_states)?;
        self.core.write_hooks(ctx)?;

        let steps = [
            ("apply", Some(&resolved.apply)),
            ("plan", resolved.plan.as_ref()),
            ("destroy", resolved.destroy.as_ref()),
            ("output", resolved.output.as_ref()),
        ];
        for (step, body) in steps {
            let path = self.core.code_dir.join(Self::script_name(step));
            match body {
                Some(body) => fs::write(&path, script(body)).map_err(|e| Error::path(&path, e))?,
                None if path.exists() => fs::remove_file(&path).map_err(|e| Error::path(&path, e))?,
                None => {}
            }
        }

        self.env = resolved.env;
        Ok(())
    }

    fn apply(&self, _ctx: &RunContext) -> Result<()> {
        let out = self.run_script("apply")?;
        log::debug!("{} apply output:\n{}", self.core.key(), out);
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> Result<String> {
        if self.spec.plan.is_none() {
            return Ok(format!("{}: no plan command", self.core.key()));
        }
        self.run_script("plan")
    }

    fn destroy(&self, _ctx: &RunContext) -> Result<()> {
        if self.spec.destroy.is_none() {
            log::warn!("{}: no destroy command, nothing to do", self.core.key());
            return Ok(());
        }
        self.run_script("destroy").map(|_| ())
    }

    fn output(&self, _ctx: &RunContext) -> Result<BTreeMap<String, Value>> {
        if self.spec.output.is_none() {
            return Ok(BTreeMap::new());
        }
        let stdout = self.run_script("output")?;
        match serde_json::from_str::<Value>(stdout.trim())? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::Tool {
                message: format!(
                    "unit '{}': output command must print a JSON object",
                    self.core.key()
                ),
                output: other.to_string(),
            }),
        }
    }

    fn needs_literal_inputs(&self) -> bool {
        true
    }
}

/// Factory for `type: shell`
#[derive(Debug, Default)]
pub struct ShellFactory;

impl UnitFactory for ShellFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn new_unit(&self, core: UnitCore, spec: &Value) -> Result<Box<dyn Unit>> {
        let spec: ShellSpec = parse_spec(&core, KIND, spec)?;
        Ok(Box::new(ShellUnit::new(core, spec)))
    }
}
