//! End-to-end runs over projects loaded from manifests on disk.

use orchestrator::context::{BuildContext, RunContext};
use orchestrator::reconcile::DEPENDENCY_CHANGES;
use orchestrator::scan::{Scan, Substitute};
use orchestrator::unit::{Unit, UnitCore, UnitFactory};
use orchestrator::{
    AutoConfirm, Classification, DriverRegistry, Error, ExecuteOptions, NoProgress, Project,
    Settings, StateProject, UnitKey, UnitOutcome, executor, lock_state,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// Recording driver
// ============================================================================

type Calls = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecorderSpec {
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    fail: bool,
}

#[derive(Debug)]
struct RecorderUnit {
    core: UnitCore,
    spec: RecorderSpec,
    resolved: Map<String, Value>,
    calls: Calls,
}

impl RecorderUnit {
    fn log(&self, op: &str) {
        self.calls.lock().unwrap().push(format!("{op} {}", self.core.key()));
    }
}

impl Unit for RecorderUnit {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn scan_spec(&mut self, f: &mut Substitute<'_>) -> orchestrator::Result<()> {
        self.spec.outputs.scan(f)
    }

    fn spec_value(&self) -> orchestrator::Result<Value> {
        Ok(serde_json::to_value(&self.spec)?)
    }

    fn build(&mut self, ctx: &BuildContext<'_>) -> orchestrator::Result<()> {
        self.core.ensure_code_dir()?;
        self.core.remote_states.clear();
        let mut outputs = self.spec.outputs.clone();
        ctx.resolve(&mut outputs, &mut self.core.remote_states)?;
        self.resolved = outputs;
        Ok(())
    }

    fn apply(&self, _ctx: &RunContext) -> orchestrator::Result<()> {
        self.log("apply");
        if self.spec.fail {
            return Err(Error::Tool {
                message: format!("{} refused to apply", self.core.key()),
                output: String::new(),
            });
        }
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> orchestrator::Result<String> {
        self.log("plan");
        Ok(format!("{} output(s)", self.resolved.len()))
    }

    fn destroy(&self, _ctx: &RunContext) -> orchestrator::Result<()> {
        self.log("destroy");
        Ok(())
    }

    fn output(&self, _ctx: &RunContext) -> orchestrator::Result<BTreeMap<String, Value>> {
        Ok(self
            .resolved
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn needs_literal_inputs(&self) -> bool {
        true
    }
}

struct RecorderFactory {
    calls: Calls,
}

impl UnitFactory for RecorderFactory {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    fn new_unit(&self, core: UnitCore, spec: &Value) -> orchestrator::Result<Box<dyn Unit>> {
        let spec: RecorderSpec =
            serde_json::from_value(spec.clone()).map_err(|e| Error::config(e.to_string()))?;
        Ok(Box::new(RecorderUnit {
            core,
            spec,
            resolved: Map::new(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn network(dir: &Path, cidr: &str) {
    write(
        dir,
        "project.yaml",
        "kind: project\nname: demo\n---\nkind: stack\nname: net\ntemplate: templates/net\nvariables:\n  cidr: CIDR\n"
            .replace("CIDR", cidr)
            .as_str(),
    );
    write(
        dir,
        "templates/net/units.yaml",
        r#"units:
  - name: vpc
    type: recorder
    outputs:
      vpc_id: "vpc-{{variables.cidr}}"
  - name: subnet
    type: recorder
    outputs:
      vpc: "{{output "net.vpc.vpc_id"}}"
      zone: a
"#,
    );
}

fn load(dir: &Path, calls: &Calls) -> Project {
    let mut drivers = DriverRegistry::with_builtin();
    drivers
        .register(Box::new(RecorderFactory {
            calls: Arc::clone(calls),
        }))
        .unwrap();
    let settings = Settings {
        working_dir: dir.to_path_buf(),
        ..Settings::default()
    };
    Project::load(settings, drivers).unwrap()
}

fn plan(project: &mut Project) -> orchestrator::PlanSummary {
    let mut state = StateProject::load(project).unwrap();
    executor::plan(project, &mut state, &ExecuteOptions::default(), &mut NoProgress)
        .unwrap()
        .plan
}

fn apply(project: &mut Project) -> orchestrator::RunReport {
    let mut state = StateProject::load(project).unwrap();
    executor::apply(
        project,
        &mut state,
        &ExecuteOptions::default(),
        &mut NoProgress,
        &mut AutoConfirm,
    )
    .unwrap()
}

fn vpc() -> UnitKey {
    UnitKey::new("net", "vpc")
}

fn subnet() -> UnitKey {
    UnitKey::new("net", "subnet")
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_deploy_then_unchanged_then_update() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();
    network(dir.path(), "10.0.0.0/16");

    let mut project = load(dir.path(), &calls);
    let first = plan(&mut project);
    assert_eq!(first.classification(&vpc()), Some(Classification::Deploy));
    assert_eq!(first.classification(&subnet()), Some(Classification::Deploy));

    let report = apply(&mut project);
    assert_eq!(report.summary.deployed, 2);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["apply net.vpc".to_string(), "apply net.subnet".to_string()]
    );
    assert_eq!(
        project.outputs()[&subnet()]["vpc"],
        Value::String("vpc-10.0.0.0/16".into())
    );

    let mut project = load(dir.path(), &calls);
    let second = plan(&mut project);
    assert!(!second.has_changes());
    assert_eq!(second.unchanged.len(), 2);

    network(dir.path(), "10.1.0.0/16");
    let mut project = load(dir.path(), &calls);
    let third = plan(&mut project);
    assert_eq!(third.classification(&vpc()), Some(Classification::Update));
    let dependent = third.get(&subnet()).unwrap();
    assert_eq!(dependent.classification, Classification::Update);
    assert_eq!(dependent.diff, DEPENDENCY_CHANGES);
}

#[test]
fn test_replan_does_not_dirty_dependents() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();
    network(dir.path(), "10.0.0.0/16");
    apply(&mut load(dir.path(), &calls));

    let mut project = load(dir.path(), &calls);
    assert!(!plan(&mut project).has_changes());
    assert!(!plan(&mut project).has_changes());

    let report = apply(&mut project);
    assert!(report.outcomes.is_empty());
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn test_cycle_is_rejected() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "project.yaml",
        "kind: project\nname: demo\n---\nkind: stack\nname: net\ntemplate: t\n",
    );
    write(
        dir.path(),
        "t/units.yaml",
        "units:\n  - name: a\n    type: recorder\n    depends_on: this.b\n  - name: b\n    type: recorder\n    depends_on: this.a\n",
    );

    let settings = Settings {
        working_dir: dir.path().to_path_buf(),
        ..Settings::default()
    };
    let mut drivers = DriverRegistry::new();
    drivers
        .register(Box::new(RecorderFactory {
            calls: Calls::default(),
        }))
        .unwrap();
    let err = Project::load(settings, drivers).unwrap_err();
    assert!(matches!(err, Error::DependencyCycle { .. }), "{err}");
    assert!(err.category().is_configuration());
}

#[test]
fn test_lock_is_exclusive_and_released_after_failure() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();
    network(dir.path(), "10.0.0.0/16");
    write(
        dir.path(),
        "templates/net/broken.yaml",
        "units:\n  - name: broken\n    type: recorder\n    fail: true\n",
    );
    let mut project = load(dir.path(), &calls);

    let lock = lock_state(&project).unwrap();
    assert!(matches!(lock_state(&project), Err(Error::Locked)));

    let report = apply(&mut project);
    assert!(matches!(
        report.outcome(&UnitKey::new("net", "broken")),
        Some(UnitOutcome::Failed { .. })
    ));
    assert!(!report.summary.is_success());
    lock.release().unwrap();

    let again = lock_state(&project).unwrap();
    drop(again);
    lock_state(&project).unwrap().release().unwrap();
}

#[test]
fn test_removed_unit_is_destroyed_on_apply() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();
    network(dir.path(), "10.0.0.0/16");
    write(
        dir.path(),
        "templates/net/extra.yaml",
        "units:\n  - name: extra\n    type: recorder\n",
    );
    apply(&mut load(dir.path(), &calls));

    fs::remove_file(dir.path().join("templates/net/extra.yaml")).unwrap();
    let mut project = load(dir.path(), &calls);
    let extra = UnitKey::new("net", "extra");
    assert_eq!(plan(&mut project).classification(&extra), Some(Classification::Destroy));

    let report = apply(&mut project);
    assert_eq!(report.outcome(&extra), Some(&UnitOutcome::Destroyed));
    assert!(calls.lock().unwrap().contains(&"destroy net.extra".to_string()));
    assert!(!StateProject::load(&project).unwrap().contains(&extra));
}
