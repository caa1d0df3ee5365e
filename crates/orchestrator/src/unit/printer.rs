//! Printer units
//!
//! A printer runs no external tool: its outputs are the values declared in
//! its `outputs` mapping, after references to other units are resolved.
//! Useful for exposing values computed from other stacks, and for dry runs
//! of a project's wiring.

use super::{UnitCore, UnitFactory, parse_spec};
use crate::context::{BuildContext, RunContext};
use crate::error::{Error, Result};
use crate::scan::{Scan, Substitute};
use crate::unit::Unit;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;

const KIND: &str = "printer";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrinterSpec {
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl Scan for PrinterSpec {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.outputs.scan(f)
    }
}

#[derive(Debug)]
pub struct PrinterUnit {
    core: UnitCore,
    spec: PrinterSpec,
    resolved: Option<Map<String, Value>>,
}

impl PrinterUnit {
    pub fn new(core: UnitCore, spec: PrinterSpec) -> Self {
        Self {
            core,
            spec,
            resolved: None,
        }
    }

    fn resolved(&self) -> Result<&Map<String, Value>> {
        self.resolved
            .as_ref()
            .ok_or_else(|| Error::internal(format!("unit '{}' used before build", self.core.key())))
    }
}

impl Unit for PrinterUnit {
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

        let mut outputs = self.spec.outputs.clone();
        ctx.resolve(&mut outputs, &mut self.core.remote_states)?;
        self.core.write_hooks(ctx)?;

        let path = self.core.code_dir.join("outputs.json");
        fs::write(&path, serde_json::to_string_pretty(&outputs)?).map_err(|e| Error::path(&path, e))?;
        self.resolved = Some(outputs);
        Ok(())
    }

    fn apply(&self, _ctx: &RunContext) -> Result<()> {
        for (name, value) in self.resolved()? {
            log::info!("{}: {name} = {value}", self.core.key());
        }
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> Result<String> {
        Ok(serde_json::to_string_pretty(self.resolved()?)?)
    }

    fn destroy(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    fn output(&self, _ctx: &RunContext) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .resolved()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn needs_literal_inputs(&self) -> bool {
        true
    }
}

/// Factory for `type: printer`
#[derive(Debug, Default)]
pub struct PrinterFactory;

impl UnitFactory for PrinterFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn new_unit(&self, core: UnitCore, spec: &Value) -> Result<Box<dyn Unit>> {
        let spec: PrinterSpec = parse_spec(&core, KIND, spec)?;
        Ok(Box::new(PrinterUnit::new(core, spec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::marker::{MarkerTable, OutputRef, OutputStore, Resolver};
    use crate::settings::Settings;
    use crate::unit::UnitKey;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_outputs_follow_resolution() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            working_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let mut markers = MarkerTable::new();
        let marker = markers.register(&OutputRef::new("net", "vpc", "id")).unwrap();
        let core = UnitCore::new("net", "subnet", "default", &settings);
        let mut unit = PrinterFactory
            .new_unit(core, &json!({ "outputs": { "vpc": marker, "cidr": "10.0.1.0/24" } }))
            .unwrap();

        let mut outputs = OutputStore::new();
        outputs.insert(
            UnitKey::new("net", "vpc"),
            BTreeMap::from([("id".to_string(), json!("vpc-1"))]),
        );
        let backends = BackendRegistry::new();
        let stacks = BTreeMap::new();
        let ctx = BuildContext::new(
            &settings,
            &backends,
            Resolver::new(&markers, &outputs, &backends, &stacks),
        );
        unit.build(&ctx).unwrap();

        let run = RunContext::new(settings.clone());
        let out = unit.output(&run).unwrap();
        assert_eq!(out["vpc"], json!("vpc-1"));
        assert_eq!(out["cidr"], json!("10.0.1.0/24"));
        assert!(unit.core().code_dir.join("outputs.json").exists());
        assert_eq!(unit.spec_value().unwrap()["outputs"]["vpc"], json!(marker));
    }

    #[test]
    fn test_output_before_build_is_internal_error() {
        let settings = Settings::default();
        let unit = PrinterUnit::new(
            UnitCore::new("a", "b", "default", &settings),
            PrinterSpec::default(),
        );
        assert!(unit.output(&RunContext::new(settings)).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let settings = Settings::default();
        let core = UnitCore::new("a", "b", "default", &settings);
        assert!(PrinterFactory.new_unit(core, &json!({ "outptus": {} })).is_err());
    }
}
