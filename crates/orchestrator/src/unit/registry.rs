//! Driver registry
//!
//! Maps a unit `type` to the factory building it. A registry is an explicit
//! value handed to the project, so tests can run with their own driver set.

use super::{PrinterFactory, ShellFactory, TfModuleFactory, Unit, UnitCore};
use crate::error::{Error, Result};
use crate::settings::Settings;
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds units of one driver type
pub trait UnitFactory: Send + Sync {
    /// Type name matched against the template `type` field
    fn kind(&self) -> &'static str;

    /// Build a unit from its template entry
    fn new_unit(&self, core: UnitCore, spec: &Value) -> Result<Box<dyn Unit>>;

    /// Rebuild a unit from its persisted spec
    fn from_state(&self, core: UnitCore, spec: &Value) -> Result<Box<dyn Unit>> {
        self.new_unit(core, spec)
    }
}

#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, Box<dyn UnitFactory>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the drivers shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for factory in [
            Box::new(TfModuleFactory) as Box<dyn UnitFactory>,
            Box::new(ShellFactory),
            Box::new(PrinterFactory),
        ] {
            // Built-in kinds are distinct.
            let _ = registry.register(factory);
        }
        registry
    }

    pub fn register(&mut self, factory: Box<dyn UnitFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(kind) {
            return Err(Error::config(format!("unit type '{kind}' registered twice")));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    fn factory(&self, unit: &str, kind: &str) -> Result<&dyn UnitFactory> {
        self.factories
            .get(kind)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::UnknownDriver {
                unit: unit.to_string(),
                kind: kind.to_string(),
            })
    }

    /// Build a unit from a stack template entry
    pub fn create(
        &self,
        stack: &str,
        backend: &str,
        spec: &Value,
        settings: &Settings,
    ) -> Result<Box<dyn Unit>> {
        let (core, kind, driver_spec) = UnitCore::from_spec(stack, backend, spec, settings)?;
        let key = core.key().to_string();
        self.factory(&key, &kind)?.new_unit(core, &driver_spec)
    }

    /// Rebuild a unit from a persisted record
    pub fn restore(&self, record: &Value, settings: &Settings) -> Result<Box<dyn Unit>> {
        let (core, kind, spec) = UnitCore::from_record(record, settings)?;
        let key = core.key().to_string();
        self.factory(&key, &kind)?.from_state(core, &spec)
    }
}
