//! The project aggregate
//!
//! A [`Project`] owns every stack, the flat unit registry, the backend
//! registry, the marker table and the outputs gathered during a run. Units
//! refer to each other by [`UnitId`] (an index into the registry) and to
//! their stack and backend by name.
//!
//! Loading a project from disk:
//!
//! 1. read `stackwork.toml` settings
//! 2. read every `*.yaml` / `*.yml` manifest in the project directory
//!    (`kind: project`, `kind: backend`, `kind: stack`)
//! 3. expand stack templates into units
//! 4. [`Project::prepare`] - inject markers
//! 5. [`Project::build_dependencies`] - resolve edges, reject cycles

use crate::backend::{self, Backend, BackendRegistry, DEFAULT_BACKEND, LocalBackend};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::marker::{self, MarkerTable, OutputStore, Resolver};
use crate::settings::Settings;
use crate::stack::{Stack, StackManifest};
use crate::unit::{Dependency, DriverRegistry, Unit, UnitId, UnitKey, UnitStatus};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectManifest {
    #[serde(default)]
    kind: Option<String>,
    name: String,
    #[serde(default)]
    variables: Value,
    #[serde(default)]
    state_backend: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendManifest {
    #[serde(default)]
    kind: Option<String>,
    name: String,
    provider: String,
    #[serde(default)]
    spec: Value,
}

#[derive(Debug)]
pub struct Project {
    pub name: String,
    pub settings: Settings,
    pub variables: Value,
    stacks: BTreeMap<String, Stack>,
    /// Stack name to backend name
    stack_backends: BTreeMap<String, String>,
    units: Vec<Box<dyn Unit>>,
    index: BTreeMap<UnitKey, UnitId>,
    backends: BackendRegistry,
    markers: MarkerTable,
    outputs: OutputStore,
    drivers: DriverRegistry,
    state_backend: String,
    graph: Option<DependencyGraph>,
}

impl Project {
    /// Empty project with the implicit local backend
    pub fn new(name: impl Into<String>, settings: Settings, drivers: DriverRegistry) -> Result<Self> {
        let mut backends = BackendRegistry::new();
        backends.register(Box::new(LocalBackend::new(
            DEFAULT_BACKEND,
            settings.state_path(),
            settings.lock_path(),
            settings.cache_path().join("tfstate"),
        )))?;

        Ok(Self {
            name: name.into(),
            settings,
            variables: Value::Null,
            stacks: BTreeMap::new(),
            stack_backends: BTreeMap::new(),
            units: Vec::new(),
            index: BTreeMap::new(),
            backends,
            markers: MarkerTable::new(),
            outputs: OutputStore::new(),
            drivers,
            state_backend: DEFAULT_BACKEND.to_string(),
            graph: None,
        })
    }

    /// Load, expand, prepare and resolve a project from its manifests
    pub fn load(settings: Settings, drivers: DriverRegistry) -> Result<Self> {
        let docs = read_manifests(&settings.working_dir)?;

        let mut project_doc = None;
        let mut backend_docs = Vec::new();
        let mut stack_docs = Vec::new();
        for (file, doc) in docs {
            let kind = doc
                .get("kind")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::config(format!("{}: document without 'kind'", file.display())))?
                .to_string();
            let invalid = |e: serde_json::Error| Error::config(format!("{}: {kind}: {e}", file.display()));
            match kind.as_str() {
                "project" => {
                    if project_doc.is_some() {
                        return Err(Error::config("more than one project manifest"));
                    }
                    project_doc = Some(serde_json::from_value::<ProjectManifest>(doc).map_err(invalid)?);
                }
                "backend" => backend_docs.push(serde_json::from_value::<BackendManifest>(doc).map_err(invalid)?),
                "stack" => stack_docs.push(serde_json::from_value::<StackManifest>(doc).map_err(invalid)?),
                other => {
                    return Err(Error::config(format!(
                        "{}: unknown kind '{other}'",
                        file.display()
                    )));
                }
            }
        }

        let manifest = project_doc.ok_or_else(|| {
            Error::config(format!(
                "no project manifest (kind: project) in {}",
                settings.working_dir.display()
            ))
        })?;
        log::debug!("Loading project '{}' ({:?})", manifest.name, manifest.kind);

        let working_dir = settings.working_dir.clone();
        let mut project = Self::new(manifest.name, settings, drivers)?;
        project.variables = manifest.variables;

        for doc in backend_docs {
            log::debug!("Backend '{}' ({:?})", doc.name, doc.kind);
            project.add_backend(backend::from_spec(&doc.name, &doc.provider, &doc.spec, &working_dir)?)?;
        }
        if let Some(name) = manifest.state_backend {
            project.set_state_backend(&name)?;
        }
        for doc in stack_docs {
            let stack = Stack::from_manifest(doc, &working_dir, DEFAULT_BACKEND)?;
            project.add_stack(stack)?;
        }

        project.prepare()?;
        project.build_dependencies()?;
        log::info!(
            "Project '{}': {} stack(s), {} unit(s)",
            project.name,
            project.stacks.len(),
            project.units.len()
        );
        Ok(project)
    }

    pub fn add_backend(&mut self, backend: Box<dyn Backend>) -> Result<()> {
        self.backends.register(backend)
    }

    /// Store orchestration state through the named backend
    pub fn set_state_backend(&mut self, name: &str) -> Result<()> {
        self.backends.get(name)?;
        self.state_backend = name.to_string();
        Ok(())
    }

    /// Expand a stack and register its units
    pub fn add_stack(&mut self, mut stack: Stack) -> Result<()> {
        if self.stacks.contains_key(&stack.name) {
            return Err(Error::config(format!("duplicate stack '{}'", stack.name)));
        }
        if !self.backends.contains(&stack.backend) {
            return Err(Error::config(format!(
                "stack '{}': backend '{}' not found",
                stack.name, stack.backend
            )));
        }

        let specs = stack.expand(&self.variables)?;
        self.stack_backends
            .insert(stack.name.clone(), stack.backend.clone());
        for spec in &specs {
            let unit = self
                .drivers
                .create(&stack.name, &stack.backend, spec, &self.settings)?;
            self.register_unit(unit)?;
        }
        self.stacks.insert(stack.name.clone(), stack);
        Ok(())
    }

    /// Add a unit to the registry. Keys must be unique.
    pub fn register_unit(&mut self, unit: Box<dyn Unit>) -> Result<UnitId> {
        let key = unit.key();
        if self.index.contains_key(&key) {
            return Err(Error::DuplicateUnit(key.to_string()));
        }
        let stack = &unit.core().stack;
        if !self.stack_backends.contains_key(stack) {
            self.stack_backends
                .insert(stack.clone(), unit.core().backend.clone());
        }
        let id = self.units.len();
        self.index.insert(key, id);
        self.units.push(unit);
        self.graph = None;
        Ok(id)
    }

    /// Inject markers into every pending unit.
    ///
    /// Each reference adds an implicit dependency on its target and records
    /// the output on the target's expected outputs.
    pub fn prepare(&mut self) -> Result<()> {
        let mut expected: Vec<(UnitKey, String)> = Vec::new();

        for unit in &mut self.units {
            if unit.core().status != UnitStatus::Pending {
                continue;
            }
            let stack = unit.core().stack.clone();
            let mut found = Vec::new();
            let markers = &mut self.markers;
            unit.scan(&mut |s| marker::inject(s, &stack, markers, &mut found))?;

            let core = unit.core_mut();
            for target in found {
                core.markers.insert(target.hash(), target.clone());
                core.add_dependency(Dependency {
                    stack: target.stack.clone(),
                    unit: target.unit.clone(),
                    output: Some(target.output.clone()),
                    target: None,
                });
                expected.push((target.unit_key(), target.output));
            }
            core.transition(UnitStatus::Prepared)?;
        }

        for (key, output) in expected {
            if let Some(&id) = self.index.get(&key) {
                self.units[id].core_mut().expected_outputs.insert(output);
            }
        }
        Ok(())
    }

    /// Resolve every dependency to a unit id and reject cycles
    pub fn build_dependencies(&mut self) -> Result<()> {
        for unit in &mut self.units {
            let source = unit.key();
            for dep in &mut unit.core_mut().dependencies {
                if dep.target.is_some() {
                    continue;
                }
                let id = self.index.get(&dep.key()).ok_or_else(|| Error::MissingDependency {
                    source_unit: source.to_string(),
                    target: dep.key().to_string(),
                })?;
                dep.target = Some(*id);
            }
        }

        let edges: Vec<(UnitId, Vec<UnitId>)> = self
            .units
            .iter()
            .enumerate()
            .map(|(id, unit)| (id, unit.dependencies().iter().filter_map(|d| d.target).collect()))
            .collect();
        let units = &self.units;
        let graph = DependencyGraph::build(edges, |id| units[id].key().to_string())?;
        self.graph = Some(graph);
        Ok(())
    }

    pub fn graph(&self) -> Result<&DependencyGraph> {
        self.graph
            .as_ref()
            .ok_or_else(|| Error::internal("dependencies not built"))
    }

    pub fn units(&self) -> &[Box<dyn Unit>] {
        &self.units
    }

    pub fn unit(&self, id: UnitId) -> &dyn Unit {
        self.units[id].as_ref()
    }

    pub fn unit_mut(&mut self, id: UnitId) -> &mut dyn Unit {
        self.units[id].as_mut()
    }

    pub fn unit_id(&self, key: &UnitKey) -> Option<UnitId> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.values()
    }

    pub fn markers(&self) -> &MarkerTable {
        &self.markers
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn stack_backends(&self) -> &BTreeMap<String, String> {
        &self.stack_backends
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn state_backend(&self) -> Result<&dyn Backend> {
        self.backends.get(&self.state_backend)
    }

    pub(crate) fn shared_state_backend(&self) -> Result<Arc<dyn Backend>> {
        self.backends.shared(&self.state_backend)
    }

    pub fn outputs(&self) -> &OutputStore {
        &self.outputs
    }

    /// Make a unit restored from state resolvable: the markers persisted
    /// with it and the backend of its stack, which may no longer be declared.
    pub(crate) fn adopt_orphan(&mut self, unit: &dyn Unit, state_markers: &MarkerTable) {
        self.markers.merge(state_markers);
        let core = unit.core();
        self.stack_backends
            .entry(core.stack.clone())
            .or_insert_with(|| core.backend.clone());
    }

    /// Record outputs a unit produced in this run
    pub fn record_outputs(&mut self, key: UnitKey, outputs: BTreeMap<String, Value>) {
        self.outputs.insert(key, outputs);
    }

    /// Resolver over the current outputs
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.markers, &self.outputs, &self.backends, &self.stack_backends)
    }

    pub fn build_context(&self) -> BuildContext<'_> {
        BuildContext::new(&self.settings, &self.backends, self.resolver())
    }

    /// Mutable unit registry alongside a build context over everything else
    pub(crate) fn split_build(&mut self) -> (&mut [Box<dyn Unit>], BuildContext<'_>) {
        let resolver = Resolver::new(&self.markers, &self.outputs, &self.backends, &self.stack_backends);
        let ctx = BuildContext::new(&self.settings, &self.backends, resolver);
        (&mut self.units, ctx)
    }

    /// Build a unit that is not part of the registry, such as one restored
    /// from state
    pub fn build_detached(&self, unit: &mut dyn Unit) -> Result<()> {
        unit.build(&self.build_context())?;
        unit.core_mut().transition(UnitStatus::Built)
    }

    /// Build one unit against current knowledge
    pub fn build_unit(&mut self, id: UnitId) -> Result<()> {
        let (units, ctx) = self.split_build();
        let unit = &mut units[id];
        unit.build(&ctx)?;
        unit.core_mut().transition(UnitStatus::Built)
    }

    /// Build every unit in dependency order
    pub fn build_all(&mut self) -> Result<()> {
        let waves = self.graph()?.waves();
        for id in waves.into_iter().flatten() {
            self.build_unit(id)?;
        }
        Ok(())
    }
}

/// Every document of every manifest file in `dir`, in file order
fn read_manifests(dir: &Path) -> Result<Vec<(PathBuf, Value)>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::path(dir, e))?;
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::path(dir, e))?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();

    let mut docs = Vec::new();
    for path in files {
        let content = fs::read_to_string(&path).map_err(|e| Error::path(&path, e))?;
        for doc in serde_yaml::Deserializer::from_str(&content) {
            let value = Value::deserialize(doc)
                .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
            if !value.is_null() {
                docs.push((path.clone(), value));
            }
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            working_dir: dir.path().to_path_buf(),
            ..Settings::default()
        }
    }

    fn project_dir(units_yaml: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "project.yaml",
            "kind: project\nname: demo\nvariables:\n  env: dev\n---\nkind: stack\nname: net\ntemplate: templates/net\n",
        );
        write(dir.path(), "templates/net/units.yaml", units_yaml);
        dir
    }

    #[test]
    fn test_load_wires_references() {
        let dir = project_dir(
            "units:\n  - name: vpc\n    type: printer\n    outputs:\n      vpc_id: vpc-{{project.env}}\n  - name: subnet\n    type: printer\n    outputs:\n      vpc: '{{output \"this.vpc.vpc_id\"}}'\n",
        );
        let project = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap();

        let vpc = project.unit_id(&UnitKey::new("net", "vpc")).unwrap();
        let subnet = project.unit_id(&UnitKey::new("net", "subnet")).unwrap();
        let subnet_unit = project.unit(subnet);

        assert_eq!(subnet_unit.dependencies().len(), 1);
        assert_eq!(subnet_unit.dependencies()[0].target, Some(vpc));
        assert_eq!(subnet_unit.markers().len(), 1);
        assert!(project.unit(vpc).core().expected_outputs.contains("vpc_id"));
        assert_eq!(project.markers().len(), 1);
        assert_eq!(project.graph().unwrap().waves(), vec![vec![vpc], vec![subnet]]);
    }

    #[test]
    fn test_duplicate_unit_key_rejected() {
        let dir = project_dir(
            "units:\n  - name: vpc\n    type: printer\n  - name: vpc\n    type: printer\n",
        );
        let err = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap_err();
        assert_eq!(err.to_string(), "duplicate unit 'net.vpc'");
    }

    #[test]
    fn test_missing_dependency_names_both_units() {
        let dir = project_dir(
            "units:\n  - name: subnet\n    type: printer\n    depends_on: net.vpc\n",
        );
        let err = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error in unit 'net.subnet' dependency, target 'net.vpc' does not exist"
        );
    }

    #[test]
    fn test_cycle_rejected_before_execution() {
        let dir = project_dir(
            "units:\n  - name: a\n    type: printer\n    depends_on: this.b\n  - name: b\n    type: printer\n    outputs:\n      x: '{{output \"net.a.y\"}}'\n",
        );
        let err = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: net.a -> net.b -> net.a");
    }

    #[test]
    fn test_build_dependencies_is_idempotent() {
        let dir = project_dir(
            "units:\n  - name: vpc\n    type: printer\n  - name: subnet\n    type: printer\n    depends_on: [this.vpc]\n",
        );
        let mut project = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap();
        project.build_dependencies().unwrap();
        project.prepare().unwrap();
        let subnet = project.unit_id(&UnitKey::new("net", "subnet")).unwrap();
        assert_eq!(project.unit(subnet).dependencies().len(), 1);
    }

    #[test]
    fn test_missing_project_manifest() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "stack.yaml", "kind: stack\nname: net\ntemplate: t\n");
        let err = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap_err();
        assert!(err.to_string().contains("no project manifest"));
    }

    #[test]
    fn test_unknown_stack_backend() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "project.yaml",
            "kind: project\nname: demo\n---\nkind: stack\nname: net\ntemplate: t\nbackend: remote\n",
        );
        write(dir.path(), "t/u.yaml", "units: []\n");
        let err = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap_err();
        assert!(err.to_string().contains("backend 'remote' not found"));
    }

    #[test]
    fn test_declared_backend_used_for_state() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "project.yaml",
            "kind: project\nname: demo\nstate_backend: shared\n---\nkind: backend\nname: shared\nprovider: local\nspec:\n  path: shared-state\n",
        );
        let project = Project::load(settings(&dir), DriverRegistry::with_builtin()).unwrap();
        let backend = project.state_backend().unwrap();
        assert_eq!(backend.name(), "shared");
        backend.write_state("{}").unwrap();
        assert!(dir.path().join("shared-state").join("stackwork.state").exists());
    }

    #[test]
    fn test_register_unit_directly() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let drivers = DriverRegistry::with_builtin();
        let unit = drivers
            .create("ops", DEFAULT_BACKEND, &json!({ "name": "a", "type": "printer" }), &settings)
            .unwrap();
        let again = drivers
            .create("ops", DEFAULT_BACKEND, &json!({ "name": "a", "type": "printer" }), &settings)
            .unwrap();

        let mut project = Project::new("p", settings, drivers).unwrap();
        assert_eq!(project.register_unit(unit).unwrap(), 0);
        assert!(matches!(project.register_unit(again), Err(Error::DuplicateUnit(_))));
    }
}
