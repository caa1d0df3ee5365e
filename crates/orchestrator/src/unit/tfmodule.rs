//! Terraform module units
//!
//! Each unit wraps one terraform module in its own root configuration:
//!
//! - `backend.tf` - state location from the stack's backend
//! - `main.tf` - the module block with resolved inputs
//! - `outputs.tf` - outputs other units reference
//! - `remote_state.tf` - data sources for dependencies not applied in this run

use super::{UnitCore, UnitFactory, parse_spec};
use crate::context::{BuildContext, RunContext};
use crate::error::{Error, Result};
use crate::hcl;
use crate::runner::ToolCommand;
use crate::scan::{Scan, Substitute};
use crate::unit::Unit;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;

const KIND: &str = "tfmodule";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TfModuleSpec {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl Scan for TfModuleSpec {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.source.scan(f)?;
        self.version.scan(f)?;
        self.inputs.scan(f)
    }
}

#[derive(Debug)]
pub struct TfModuleUnit {
    core: UnitCore,
    spec: TfModuleSpec,
}

impl TfModuleUnit {
    pub fn new(core: UnitCore, spec: TfModuleSpec) -> Self {
        Self { core, spec }
    }

    fn command(&self, ctx: &RunContext) -> ToolCommand {
        let mut cmd = ToolCommand::new(&ctx.settings.terraform_bin, &self.core.code_dir)
            .env("TF_IN_AUTOMATION", "1");
        if let Some(cache) = &ctx.settings.plugins_cache_dir {
            cmd = cmd.env("TF_PLUGIN_CACHE_DIR", cache.display().to_string());
        }
        cmd
    }

    fn init(&self, ctx: &RunContext) -> Result<()> {
        let _guard = ctx.init_guard();
        log::debug!("{}: terraform init", self.core.key());
        self.command(ctx).args(["init", "-input=false"]).run()
    }

    fn main_tf(&self, spec: &TfModuleSpec) -> String {
        let mut out = format!("module \"{}\" {{\n", self.core.name);
        out.push_str(&hcl::attribute("source", &Value::String(spec.source.clone()), 1));
        if let Some(version) = &spec.version {
            out.push_str(&hcl::attribute("version", &Value::String(version.clone()), 1));
        }
        for (name, value) in &spec.inputs {
            out.push_str(&hcl::attribute(name, value, 1));
        }
        out.push_str("}\n");
        out
    }

    fn outputs_tf(&self) -> String {
        self.core
            .expected_outputs
            .iter()
            .map(|output| {
                format!(
                    "output \"{output}\" {{\n  value = module.{}.{output}\n}}\n",
                    self.core.name
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn write(&self, file: &str, content: &str) -> Result<()> {
        let path = self.core.code_dir.join(file);
        fs::write(&path, content).map_err(|e| Error::path(&path, e))
    }
}

impl Unit for TfModuleUnit {
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

    fn uses_expected_outputs(&self) -> bool {
        true
    }

    fn build(&mut self, ctx: &BuildContext<'_>) -> Result<()> {
        self.core.ensure_code_dir()?;
        self.core.remote_states.clear();

        let mut resolved = self.spec.clone();
        ctx.resolve(&mut resolved, &mut self.core.remote_states)?;
        self.core.write_hooks(ctx)?;

        let backend = ctx.backend(&self.core.backend)?;
        self.write("backend.tf", &backend.backend_block(&self.core.stack, &self.core.name))?;
        self.write("main.tf", &self.main_tf(&resolved))?;
        self.write("outputs.tf", &self.outputs_tf())?;

        let mut remote = String::new();
        for target in &self.core.remote_states {
            let target_backend = ctx.stack_backend(&target.stack)?;
            remote.push_str(&target_backend.remote_state_block(&target.stack, &target.unit));
            remote.push('\n');
        }
        self.write("remote_state.tf", &remote)?;
        Ok(())
    }

    fn apply(&self, ctx: &RunContext) -> Result<()> {
        self.init(ctx)?;
        self.command(ctx)
            .args(["apply", "-auto-approve", "-input=false"])
            .run()
    }

    fn plan(&self, ctx: &RunContext) -> Result<String> {
        self.init(ctx)?;
        self.command(ctx).args(["plan", "-input=false"]).capture()
    }

    fn destroy(&self, ctx: &RunContext) -> Result<()> {
        self.init(ctx)?;
        self.command(ctx)
            .args(["destroy", "-auto-approve", "-input=false"])
            .run()
    }

    fn output(&self, ctx: &RunContext) -> Result<BTreeMap<String, Value>> {
        let stdout = self.command(ctx).args(["output", "-json"]).capture()?;
        parse_outputs(&stdout)
    }
}

/// Parse `terraform output -json`, keeping only the values
fn parse_outputs(stdout: &str) -> Result<BTreeMap<String, Value>> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(stdout.trim())?;
    Ok(raw
        .into_iter()
        .map(|(name, mut entry)| {
            let value = entry.get_mut("value").map(Value::take).unwrap_or(Value::Null);
            (name, value)
        })
        .collect())
}

/// Factory for `type: tfmodule`
#[derive(Debug, Default)]
pub struct TfModuleFactory;

impl UnitFactory for TfModuleFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn new_unit(&self, core: UnitCore, spec: &Value) -> Result<Box<dyn Unit>> {
        let spec: TfModuleSpec = parse_spec(&core, KIND, spec)?;
        if spec.source.is_empty() {
            return Err(Error::config(format!(
                "unit '{}': tfmodule requires 'source'",
                core.key()
            )));
        }
        Ok(Box::new(TfModuleUnit::new(core, spec)))
    }
}
