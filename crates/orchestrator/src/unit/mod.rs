//! Units - the atomic provisioning items
//!
//! Every unit has a [`UnitCore`] holding what the engine needs regardless of
//! driver: identity, dependencies, hooks, markers, lifecycle status. Drivers
//! implement [`Unit`] on top of it for a concrete external tool.

mod printer;
pub mod registry;
mod shell;
mod tfmodule;

pub use printer::{PrinterFactory, PrinterUnit};
pub use registry::{DriverRegistry, UnitFactory};
pub use shell::{ShellFactory, ShellUnit};
pub use tfmodule::{TfModuleFactory, TfModuleUnit};

use crate::context::{BuildContext, RunContext};
use crate::error::{Error, Result};
use crate::marker::{self, OutputRef, THIS_STACK};
use crate::runner::ToolCommand;
use crate::scan::{Scan, Substitute};
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Index of a unit in its owning registry
pub type UnitId = usize;

/// Composite `stack.unit` identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub stack: String,
    pub unit: String,
}

impl UnitKey {
    pub fn new(stack: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            unit: unit.into(),
        }
    }

    /// Parse `stack.unit`
    pub fn parse(s: &str) -> Option<Self> {
        let (stack, unit) = s.split_once('.')?;
        (is_valid_name(stack) && is_valid_name(unit)).then(|| Self::new(stack, unit))
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack, self.unit)
    }
}

/// Stack and unit names are restricted so keys and markers stay unambiguous
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Edge to another unit, resolved lazily to an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub stack: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip)]
    pub target: Option<UnitId>,
}

impl Dependency {
    pub fn new(stack: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            unit: unit.into(),
            output: None,
            target: None,
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.stack, &self.unit)
    }

    /// Parse a `depends_on` entry, `stack.unit` or `this.unit`
    fn parse(unit: &str, own_stack: &str, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config(format!("Empty dependency in unit '{unit}'")));
        }
        let key = UnitKey::parse(raw).ok_or_else(|| {
            Error::config(format!(
                "Incorrect dependency '{raw}' in unit '{unit}', expected <stack>.<unit>"
            ))
        })?;
        let stack = if key.stack == THIS_STACK {
            own_stack.to_string()
        } else {
            key.stack
        };
        Ok(Self::new(stack, key.unit))
    }
}

/// Operations a unit can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Plan,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Apply => "apply",
            Self::Plan => "plan",
            Self::Destroy => "destroy",
        })
    }
}

/// Script run before or after a unit operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Full script text
    pub script: String,
    pub on_apply: bool,
    pub on_plan: bool,
    pub on_destroy: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHook {
    command: Option<String>,
    script: Option<String>,
    #[serde(default = "default_true")]
    on_apply: bool,
    #[serde(default)]
    on_plan: bool,
    #[serde(default)]
    on_destroy: bool,
}

fn default_true() -> bool {
    true
}

impl HookSpec {
    /// Parse a hook definition.
    ///
    /// Exactly one of `command` (inline bash) or `script` (file relative to
    /// the project directory) must be set.
    pub fn parse(unit: &str, value: &Value, working_dir: &Path) -> Result<Self> {
        let hook_err = |message: String| Error::Hook {
            unit: unit.to_string(),
            message,
        };
        let raw: RawHook =
            serde_json::from_value(value.clone()).map_err(|e| hook_err(e.to_string()))?;

        let script = match (raw.command, raw.script) {
            (Some(_), Some(_)) => {
                return Err(hook_err("set either 'command' or 'script', not both".into()));
            }
            (None, None) => return Err(hook_err("one of 'command' or 'script' is required".into())),
            (Some(command), None) => format!("#!/usr/bin/env bash\nset -e\n\n{command}"),
            (None, Some(path)) => {
                let path = working_dir.join(path);
                fs::read_to_string(&path)
                    .map_err(|e| hook_err(format!("read {}: {e}", path.display())))?
            }
        };

        Ok(Self {
            script,
            on_apply: raw.on_apply,
            on_plan: raw.on_plan,
            on_destroy: raw.on_destroy,
        })
    }

    pub fn runs_on(&self, op: Operation) -> bool {
        match op {
            Operation::Apply => self.on_apply,
            Operation::Plan => self.on_plan,
            Operation::Destroy => self.on_destroy,
        }
    }
}

impl Scan for HookSpec {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.script.scan(f)
    }
}

/// Lifecycle of a unit within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    Prepared,
    Built,
    Applied,
    Planned,
    Destroyed,
    /// Cancelled because a dependency failed
    Skipped,
    Failed,
}

impl UnitStatus {
    fn can_move_to(self, next: Self) -> bool {
        use UnitStatus::{Applied, Built, Destroyed, Failed, Pending, Planned, Prepared, Skipped};

        matches!(
            (self, next),
            (_, Failed)
                | (Pending, Prepared)
                | (Prepared | Built | Planned, Built)
                | (Built, Applied | Planned | Destroyed)
                | (Prepared | Built | Planned, Skipped)
        )
    }
}

/// Driver-independent part of a unit
#[derive(Debug, Clone)]
pub struct UnitCore {
    pub name: String,
    pub stack: String,
    /// Backend of the owning stack, by name
    pub backend: String,
    pub dependencies: Vec<Dependency>,
    pub pre_hook: Option<HookSpec>,
    pub post_hook: Option<HookSpec>,
    /// Outputs other units reference
    pub expected_outputs: BTreeSet<String>,
    /// Generated artifacts, exclusive to this unit
    pub code_dir: PathBuf,
    /// Markers this unit introduced, by hash
    pub markers: BTreeMap<String, OutputRef>,
    /// Units whose outputs were resolved through remote state in the last build
    pub remote_states: BTreeSet<UnitKey>,
    pub status: UnitStatus,
    /// Applied during this run
    pub applied: bool,
}

/// Fields shared by every unit entry in a stack template
const COMMON_FIELDS: [&str; 5] = ["name", "type", "depends_on", "pre_hook", "post_hook"];

/// Persisted form of a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnitRecord {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    stack: String,
    backend: String,
    #[serde(default)]
    depends_on: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pre_hook: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    post_hook: Option<HookSpec>,
    #[serde(default)]
    expected_outputs: BTreeSet<String>,
    #[serde(default)]
    spec: Value,
}

impl UnitCore {
    pub fn new(stack: &str, name: &str, backend: &str, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            stack: stack.to_string(),
            backend: backend.to_string(),
            dependencies: Vec::new(),
            pre_hook: None,
            post_hook: None,
            expected_outputs: BTreeSet::new(),
            code_dir: settings.unit_dir(stack, name),
            markers: BTreeMap::new(),
            remote_states: BTreeSet::new(),
            status: UnitStatus::Pending,
            applied: false,
        }
    }

    /// Parse the common fields of a template unit entry.
    ///
    /// Returns the core, the driver type and the remaining driver fields.
    pub fn from_spec(
        stack: &str,
        backend: &str,
        spec: &Value,
        settings: &Settings,
    ) -> Result<(Self, String, Value)> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Error::config(format!("stack '{stack}': unit entry must be a mapping")))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config(format!("stack '{stack}': unit without 'name'")))?;
        if !is_valid_name(name) {
            return Err(Error::config(format!(
                "stack '{stack}': invalid unit name '{name}', use letters, digits, '-' and '_'"
            )));
        }
        let key = UnitKey::new(stack, name);
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config(format!("unit '{key}': missing 'type'")))?
            .to_string();

        let mut core = Self::new(stack, name, backend, settings);
        let deps: Vec<&str> = match obj.get("depends_on") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => s.split(',').collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        Error::config(format!("unit '{key}': depends_on entries must be strings"))
                    })
                })
                .collect::<Result<_>>()?,
            Some(_) => {
                return Err(Error::config(format!(
                    "unit '{key}': depends_on must be a string or a list"
                )));
            }
        };
        for dep in deps {
            core.add_dependency(Dependency::parse(&key.to_string(), stack, dep)?);
        }

        let hook = |field: &str| -> Result<Option<HookSpec>> {
            match obj.get(field) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => HookSpec::parse(&key.to_string(), v, &settings.working_dir).map(Some),
            }
        };
        core.pre_hook = hook("pre_hook")?;
        core.post_hook = hook("post_hook")?;

        let driver_spec: serde_json::Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !COMMON_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok((core, kind, Value::Object(driver_spec)))
    }

    /// Rebuild a core from a persisted record.
    ///
    /// Returns the core, the driver type and the persisted driver spec.
    pub fn from_record(record: &Value, settings: &Settings) -> Result<(Self, String, Value)> {
        let record: UnitRecord = serde_json::from_value(record.clone())
            .map_err(|e| Error::StateLoad(format!("invalid unit record: {e}")))?;

        let mut core = Self::new(&record.stack, &record.name, &record.backend, settings);
        core.dependencies = record.depends_on;
        core.pre_hook = record.pre_hook;
        core.post_hook = record.post_hook;
        core.expected_outputs = record.expected_outputs;
        core.status = UnitStatus::Prepared;
        Ok((core, record.kind, record.spec))
    }

    /// Persisted form of this unit with the given driver spec
    pub fn record(&self, kind: &str, spec: Value) -> Result<Value> {
        let record = UnitRecord {
            kind: kind.to_string(),
            name: self.name.clone(),
            stack: self.stack.clone(),
            backend: self.backend.clone(),
            depends_on: self.dependencies.clone(),
            pre_hook: self.pre_hook.clone(),
            post_hook: self.post_hook.clone(),
            expected_outputs: self.expected_outputs.clone(),
            spec,
        };
        Ok(serde_json::to_value(record)?)
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.stack, &self.name)
    }

    /// Add a dependency unless one on the same unit already exists
    pub fn add_dependency(&mut self, dep: Dependency) -> bool {
        if self
            .dependencies
            .iter()
            .any(|d| d.stack == dep.stack && d.unit == dep.unit)
        {
            return false;
        }
        self.dependencies.push(dep);
        true
    }

    /// Move to the next lifecycle state
    pub fn transition(&mut self, next: UnitStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            return Err(Error::internal(format!(
                "unit '{}': invalid status transition {:?} -> {:?}",
                self.key(),
                self.status,
                next
            )));
        }
        log::trace!("{}: {:?} -> {:?}", self.key(), self.status, next);
        self.status = next;
        Ok(())
    }

    pub fn scan_hooks(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.pre_hook.scan(f)?;
        self.post_hook.scan(f)
    }

    /// Create the code directory
    pub fn ensure_code_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.code_dir).map_err(|e| Error::path(&self.code_dir, e))
    }

    /// Resolve hook scripts and write them into the code directory
    pub fn write_hooks(&mut self, ctx: &BuildContext<'_>) -> Result<()> {
        for (file, hook) in [("pre_hook.sh", &self.pre_hook), ("post_hook.sh", &self.post_hook)] {
            let path = self.code_dir.join(file);
            match hook {
                Some(hook) => {
                    let mut resolved = hook.clone();
                    ctx.resolve(&mut resolved, &mut self.remote_states)?;
                    fs::write(&path, resolved.script).map_err(|e| Error::path(&path, e))?;
                }
                None if path.exists() => {
                    fs::remove_file(&path).map_err(|e| Error::path(&path, e))?;
                }
                None => {}
            }
        }
        Ok(())
    }

    fn run_hook(&self, op: Operation, pre: bool) -> Result<()> {
        let (hook, file) = if pre {
            (&self.pre_hook, "pre_hook.sh")
        } else {
            (&self.post_hook, "post_hook.sh")
        };
        let Some(hook) = hook else { return Ok(()) };
        if !hook.runs_on(op) {
            return Ok(());
        }

        log::info!("{}: running {file} ({op})", self.key());
        ToolCommand::new("bash", &self.code_dir)
            .arg(file)
            .run()
            .map_err(|e| match e {
                Error::Tool { message, output } => Error::Tool {
                    message: format!("unit '{}': {file}: {message}", self.key()),
                    output,
                },
                other => other,
            })
    }
}

/// A provisioning unit backed by some external tool
pub trait Unit: Send + Sync + fmt::Debug {
    /// Driver type name, as written in templates
    fn kind(&self) -> &'static str;

    fn core(&self) -> &UnitCore;

    fn core_mut(&mut self) -> &mut UnitCore;

    /// Visit every string of the driver specification
    fn scan_spec(&mut self, f: &mut Substitute<'_>) -> Result<()>;

    /// Driver specification with markers still in place
    fn spec_value(&self) -> Result<Value>;

    /// Resolve markers and generate artifacts in the code directory
    fn build(&mut self, ctx: &BuildContext<'_>) -> Result<()>;

    fn apply(&self, ctx: &RunContext) -> Result<()>;

    /// Run the tool's dry-run and return its report
    fn plan(&self, ctx: &RunContext) -> Result<String>;

    fn destroy(&self, ctx: &RunContext) -> Result<()>;

    /// Outputs produced by the last apply
    fn output(&self, ctx: &RunContext) -> Result<BTreeMap<String, Value>>;

    /// Whether this unit needs literal dependency outputs rather than
    /// remote-state expressions
    fn needs_literal_inputs(&self) -> bool {
        false
    }

    fn key(&self) -> UnitKey {
        self.core().key()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.core().dependencies
    }

    fn markers(&self) -> &BTreeMap<String, OutputRef> {
        &self.core().markers
    }

    /// Visit every string of the unit, hooks included
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        self.scan_spec(f)?;
        self.core_mut().scan_hooks(f)
    }

    /// Whether generated code depends on the outputs other units read
    fn uses_expected_outputs(&self) -> bool {
        false
    }

    /// Opaque payload persisted in the state document
    fn get_state(&self) -> Result<Value> {
        self.core().record(self.kind(), self.spec_value()?)
    }

    /// Semantic fingerprint used for change detection
    fn diff_data(&self) -> Result<Value> {
        fingerprint(&self.get_state()?, self.uses_expected_outputs())
    }
}

/// Fingerprint of a persisted payload: markers humanized, and
/// `expected_outputs` dropped unless the driver generates code from them.
pub fn fingerprint(payload: &Value, keep_expected_outputs: bool) -> Result<Value> {
    let mut data = payload.clone();
    crate::scan::scan_with(&mut data, |s| Ok(marker::humanize(s)))?;
    if !keep_expected_outputs && let Value::Object(map) = &mut data {
        map.remove("expected_outputs");
    }
    Ok(data)
}

/// Run an operation with its enabled hooks around it
pub fn run_operation(unit: &dyn Unit, op: Operation, ctx: &RunContext) -> Result<Option<String>> {
    let core = unit.core();
    core.run_hook(op, true)?;
    let report = match op {
        Operation::Apply => {
            unit.apply(ctx)?;
            None
        }
        Operation::Plan => Some(unit.plan(ctx)?),
        Operation::Destroy => {
            unit.destroy(ctx)?;
            None
        }
    };
    core.run_hook(op, false)?;
    Ok(report)
}

/// Parse a typed driver spec, naming the unit on error
pub(crate) fn parse_spec<T: serde::de::DeserializeOwned>(core: &UnitCore, kind: &str, spec: &Value) -> Result<T> {
    serde_json::from_value(spec.clone())
        .map_err(|e| Error::config(format!("unit '{}' ({kind}): {e}", core.key())))
}
