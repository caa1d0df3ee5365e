//! Change detection against the persisted state
//!
//! A unit's fingerprint is its [`crate::unit::Unit::diff_data`]: the persisted payload
//! with markers turned back into `${output:...}` references. A unit is
//! changed when its fingerprint differs from the one in state, or when
//! something it depends on is dirty:
//!
//! - applied during this run
//! - not in state yet
//! - its own fingerprint changed
//! - one of its dependencies is in the changed set, or dirty itself

use crate::error::Result;
use crate::project::Project;
use crate::state::StateProject;
use crate::unit::{UnitId, UnitKey, fingerprint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Message used when only dependencies changed
pub const DEPENDENCY_CHANGES: &str = "+/- There are changes in the unit dependencies.";

/// What a run will do with a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Deploy,
    Update,
    Destroy,
    Unchanged,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deploy => "deploy",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitChange {
    pub key: UnitKey,
    pub classification: Classification,
    /// Human readable diff, empty when unchanged
    pub diff: String,
}

/// Every unit of the project and the state, each classified once
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub deploy: Vec<UnitChange>,
    pub update: Vec<UnitChange>,
    pub destroy: Vec<UnitChange>,
    pub unchanged: Vec<UnitChange>,
}

impl PlanSummary {
    fn push(&mut self, change: UnitChange) {
        match change.classification {
            Classification::Deploy => self.deploy.push(change),
            Classification::Update => self.update.push(change),
            Classification::Destroy => self.destroy.push(change),
            Classification::Unchanged => self.unchanged.push(change),
        }
    }

    pub fn has_changes(&self) -> bool {
        !(self.deploy.is_empty() && self.update.is_empty() && self.destroy.is_empty())
    }

    pub fn len(&self) -> usize {
        self.deploy.len() + self.update.len() + self.destroy.len() + self.unchanged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitChange> {
        self.deploy
            .iter()
            .chain(&self.update)
            .chain(&self.destroy)
            .chain(&self.unchanged)
    }

    pub fn get(&self, key: &UnitKey) -> Option<&UnitChange> {
        self.iter().find(|c| &c.key == key)
    }

    pub fn classification(&self, key: &UnitKey) -> Option<Classification> {
        self.get(key).map(|c| c.classification)
    }
}

impl StateProject {
    /// Compare a live unit with its persisted fingerprint.
    ///
    /// Returns the human diff (empty when unchanged) and whether the unit
    /// exists in state.
    pub fn check_unit_changes(&self, project: &Project, id: UnitId) -> Result<(String, bool)> {
        let unit = project.unit(id);
        let live = unit.diff_data()?;
        let Some(record) = self.record(&unit.key()) else {
            return Ok((json_diff(None, &live)?, false));
        };

        let diff = json_diff(Some(&fingerprint(record, unit.uses_expected_outputs())?), &live)?;
        if !diff.is_empty() {
            return Ok((diff, true));
        }

        let mut memo = BTreeMap::new();
        for dep in unit.dependencies() {
            let Some(target) = dep.target else { continue };
            if self.is_dirty(project, target, &mut memo)? {
                return Ok((DEPENDENCY_CHANGES.to_string(), true));
            }
        }
        Ok((String::new(), true))
    }

    fn is_dirty(&self, project: &Project, id: UnitId, memo: &mut BTreeMap<UnitId, bool>) -> Result<bool> {
        if let Some(&dirty) = memo.get(&id) {
            return Ok(dirty);
        }
        memo.insert(id, false);

        let dirty = self.dirty_uncached(project, id, memo)?;
        memo.insert(id, dirty);
        Ok(dirty)
    }

    fn dirty_uncached(&self, project: &Project, id: UnitId, memo: &mut BTreeMap<UnitId, bool>) -> Result<bool> {
        let unit = project.unit(id);
        if unit.core().applied {
            return Ok(true);
        }
        let Some(record) = self.record(&unit.key()) else {
            return Ok(true);
        };
        if fingerprint(record, unit.uses_expected_outputs())? != unit.diff_data()? {
            return Ok(true);
        }
        for dep in unit.dependencies() {
            let Some(target) = dep.target else { continue };
            if self.changed.contains(&dep.key()) || self.is_dirty(project, target, memo)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Classify every unit of the project and every unit left only in state.
///
/// With `ignore_state` every live unit counts as changed.
pub fn reconcile(project: &Project, state: &mut StateProject, ignore_state: bool) -> Result<PlanSummary> {
    let mut summary = PlanSummary::default();
    state.changed.clear();

    for id in project.graph()?.waves().into_iter().flatten() {
        let key = project.unit(id).key();
        let (diff, in_state) = state.check_unit_changes(project, id)?;

        let classification = match (diff.is_empty() && !ignore_state, in_state) {
            (true, _) => Classification::Unchanged,
            (false, true) => Classification::Update,
            (false, false) => Classification::Deploy,
        };
        if classification != Classification::Unchanged {
            state.changed.insert(key.clone());
        }
        summary.push(UnitChange {
            key,
            classification,
            diff,
        });
    }

    for key in state.keys() {
        if project.contains(&key) {
            continue;
        }
        let diff = match state.record(&key) {
            Some(record) => json_diff(Some(&fingerprint(record, true)?), &Value::Null)?,
            None => String::new(),
        };
        summary.push(UnitChange {
            key,
            classification: Classification::Destroy,
            diff,
        });
    }

    log::debug!(
        "Plan: {} to deploy, {} to update, {} to destroy, {} unchanged",
        summary.deploy.len(),
        summary.update.len(),
        summary.destroy.len(),
        summary.unchanged.len()
    );
    Ok(summary)
}

/// Line diff of two pretty-printed values; `-` lines are state, `+` lines the project
fn json_diff(old: Option<&Value>, new: &Value) -> Result<String> {
    let old = match old {
        Some(v) => format!("{}\n", serde_json::to_string_pretty(v)?),
        None => String::new(),
    };
    let new = match new {
        Value::Null => String::new(),
        v => format!("{}\n", serde_json::to_string_pretty(v)?),
    };
    if old == new {
        return Ok(String::new());
    }

    let diff = similar::TextDiff::from_lines(&old, &new);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => out.push_str(&format!("- {change}")),
            similar::ChangeTag::Insert => out.push_str(&format!("+ {change}")),
            similar::ChangeTag::Equal => out.push_str(&format!("  {change}")),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::unit::DriverRegistry;
    use serde_json::json;
    use tempfile::TempDir;

    fn project(dir: &TempDir, vpc_id: &str) -> Project {
        project_of(
            dir,
            &[
                json!({ "name": "vpc", "type": "printer", "outputs": { "vpc_id": vpc_id } }),
                json!({ "name": "subnet", "type": "printer", "outputs": { "vpc": "${output:net.vpc.vpc_id}" } }),
                json!({ "name": "dns", "type": "printer", "outputs": { "zone": "example.com" } }),
            ],
        )
    }

    fn project_of(dir: &TempDir, units: &[Value]) -> Project {
        let settings = Settings {
            working_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let drivers = DriverRegistry::with_builtin();
        let created: Vec<_> = units
            .iter()
            .map(|u| drivers.create("net", "default", u, &settings).unwrap())
            .collect();

        let mut project = Project::new("demo", settings, drivers).unwrap();
        for unit in created {
            project.register_unit(unit).unwrap();
        }
        project.prepare().unwrap();
        project.build_dependencies().unwrap();
        project
    }

    fn save_all(project: &Project, state: &mut StateProject) {
        for unit in project.units() {
            state.update_unit(unit.as_ref()).unwrap();
        }
        state.save(project).unwrap();
    }

    fn classes(summary: &PlanSummary) -> Vec<(String, Classification)> {
        let mut out: Vec<_> = summary
            .iter()
            .map(|c| (c.key.to_string(), c.classification))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_empty_state_deploys_everything() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, "vpc-1");
        let mut state = StateProject::load(&project).unwrap();

        let summary = reconcile(&project, &mut state, false).unwrap();
        assert_eq!(summary.deploy.len(), 3);
        assert_eq!(summary.len(), 3);
        assert!(summary.deploy[0].diff.starts_with("+ {"));
    }

    #[test]
    fn test_saved_state_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, "vpc-1");
        let mut state = StateProject::load(&project).unwrap();
        save_all(&project, &mut state);

        let mut state = StateProject::load(&project).unwrap();
        let summary = reconcile(&project, &mut state, false).unwrap();
        assert!(!summary.has_changes());
        assert_eq!(summary.unchanged.len(), 3);
    }

    #[test]
    fn test_change_propagates_to_dependents_only() {
        let dir = TempDir::new().unwrap();
        let old = project(&dir, "vpc-1");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = project(&dir, "vpc-2");
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(
            classes(&summary),
            vec![
                ("net.dns".to_string(), Classification::Unchanged),
                ("net.subnet".to_string(), Classification::Update),
                ("net.vpc".to_string(), Classification::Update),
            ]
        );
        let vpc = summary.get(&UnitKey::new("net", "vpc")).unwrap();
        assert!(vpc.diff.contains("-       \"vpc_id\": \"vpc-1\""));
        assert!(vpc.diff.contains("+       \"vpc_id\": \"vpc-2\""));
        let subnet = summary.get(&UnitKey::new("net", "subnet")).unwrap();
        assert_eq!(subnet.diff, DEPENDENCY_CHANGES);
    }

    #[test]
    fn test_applied_dependency_dirties_dependent() {
        let dir = TempDir::new().unwrap();
        let mut project = project(&dir, "vpc-1");
        let mut state = StateProject::load(&project).unwrap();
        save_all(&project, &mut state);

        let vpc = project.unit_id(&UnitKey::new("net", "vpc")).unwrap();
        let subnet = project.unit_id(&UnitKey::new("net", "subnet")).unwrap();
        assert_eq!(state.check_unit_changes(&project, subnet).unwrap().0, "");

        project.unit_mut(vpc).core_mut().applied = true;
        let (diff, in_state) = state.check_unit_changes(&project, subnet).unwrap();
        assert_eq!(diff, DEPENDENCY_CHANGES);
        assert!(in_state);
    }

    #[test]
    fn test_units_only_in_state_are_destroyed() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, "vpc-1");
        let mut state = StateProject::load(&project).unwrap();
        save_all(&project, &mut state);
        let mut record = state.record(&UnitKey::new("net", "dns")).unwrap().clone();
        record["name"] = json!("old");
        state.document_mut().units.insert("net.old".into(), record);

        let summary = reconcile(&project, &mut state, false).unwrap();
        assert_eq!(summary.destroy.len(), 1);
        assert_eq!(summary.destroy[0].key, UnitKey::new("net", "old"));
        assert!(summary.destroy[0].diff.starts_with("- {"));
        assert_eq!(summary.len(), 4);
    }

    #[test]
    fn test_ignore_state_marks_everything_changed() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir, "vpc-1");
        let mut state = StateProject::load(&project).unwrap();
        state.update_unit(project.unit(0)).unwrap();
        let summary = reconcile(&project, &mut state, true).unwrap();
        assert_eq!(summary.update.len(), 1);
        assert_eq!(summary.deploy.len(), 2);
        assert!(summary.unchanged.is_empty());
    }

    fn diamond(dir: &TempDir, base: &str) -> Project {
        project_of(
            dir,
            &[
                json!({ "name": "base", "type": "printer", "outputs": { "x": base } }),
                json!({ "name": "left", "type": "printer", "outputs": { "l": "${output:this.base.x}" } }),
                json!({ "name": "right", "type": "printer", "outputs": { "r": "${output:this.base.x}" } }),
                json!({
                    "name": "top",
                    "type": "printer",
                    "outputs": { "a": "${output:this.left.l}", "b": "${output:this.right.r}" }
                }),
            ],
        )
    }

    #[test]
    fn test_diamond_unchanged_terminates() {
        let dir = TempDir::new().unwrap();
        let old = diamond(&dir, "1");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = diamond(&dir, "1");
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(summary.unchanged.len(), 4);
        assert!(!summary.has_changes());
    }

    #[test]
    fn test_diamond_base_change_reaches_top_once() {
        let dir = TempDir::new().unwrap();
        let old = diamond(&dir, "1");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = diamond(&dir, "2");
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(summary.update.len(), 4);
        assert_eq!(summary.len(), 4);
        for name in ["left", "right", "top"] {
            let change = summary.get(&UnitKey::new("net", name)).unwrap();
            assert_eq!(change.diff, DEPENDENCY_CHANGES, "{name}");
        }
    }

    fn chain(dir: &TempDir, a: &str, c: &str) -> Project {
        project_of(
            dir,
            &[
                json!({ "name": "a", "type": "printer", "outputs": { "v": a } }),
                json!({ "name": "b", "type": "printer", "outputs": { "v": "${output:this.a.v}" } }),
                json!({ "name": "c", "type": "printer", "outputs": { "v": "${output:this.b.v}", "tag": c } }),
            ],
        )
    }

    #[test]
    fn test_chain_change_at_root_crosses_unchanged_middle() {
        let dir = TempDir::new().unwrap();
        let old = chain(&dir, "1", "x");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = chain(&dir, "2", "x");
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(
            classes(&summary),
            vec![
                ("net.a".to_string(), Classification::Update),
                ("net.b".to_string(), Classification::Update),
                ("net.c".to_string(), Classification::Update),
            ]
        );
        assert_eq!(summary.get(&UnitKey::new("net", "c")).unwrap().diff, DEPENDENCY_CHANGES);
    }

    #[test]
    fn test_chain_change_at_leaf_leaves_ancestors_unchanged() {
        let dir = TempDir::new().unwrap();
        let old = chain(&dir, "1", "x");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = chain(&dir, "1", "y");
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(
            classes(&summary),
            vec![
                ("net.a".to_string(), Classification::Unchanged),
                ("net.b".to_string(), Classification::Unchanged),
                ("net.c".to_string(), Classification::Update),
            ]
        );
        let c = summary.get(&UnitKey::new("net", "c")).unwrap();
        assert!(c.diff.contains("\"tag\": \"y\""));
    }

    #[test]
    fn test_removing_consumer_keeps_producer_unchanged() {
        let dir = TempDir::new().unwrap();
        let old = project(&dir, "vpc-1");
        let mut state = StateProject::load(&old).unwrap();
        save_all(&old, &mut state);

        let new = project_of(
            &dir,
            &[json!({ "name": "vpc", "type": "printer", "outputs": { "vpc_id": "vpc-1" } })],
        );
        let mut state = StateProject::load(&new).unwrap();
        let summary = reconcile(&new, &mut state, false).unwrap();
        assert_eq!(summary.classification(&UnitKey::new("net", "vpc")), Some(Classification::Unchanged));
        assert_eq!(summary.destroy.len(), 2);
    }
}
