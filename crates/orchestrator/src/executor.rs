//! Execution driver - runs units wave by wave on a bounded worker pool
//!
//! Every command builds all units first so their artifacts reflect the
//! current project, then reconciles against the state. Units of one wave have
//! no dependencies on each other and run in parallel; between waves the
//! outputs store and the state are updated from a single thread.

use crate::context::{BuildContext, ConfirmCallback, ProgressCallback, RunContext};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::project::Project;
use crate::reconcile::{Classification, PlanSummary, reconcile};
use crate::state::StateProject;
use crate::types::{ExecuteOptions, ExecuteSummary, UnitOutcome};
use crate::unit::{Operation, Unit, UnitId, UnitKey, UnitStatus, run_operation};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// What a command did, unit by unit
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub plan: PlanSummary,
    pub summary: ExecuteSummary,
    pub outcomes: Vec<(UnitKey, UnitOutcome)>,
}

impl RunReport {
    fn new(plan: PlanSummary) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    fn record<P: ProgressCallback + ?Sized>(&mut self, progress: &mut P, key: UnitKey, outcome: UnitOutcome) {
        progress.on_unit_complete(&key, &outcome);
        self.summary.add_outcome(&outcome);
        self.outcomes.push((key, outcome));
    }

    pub fn outcome(&self, key: &UnitKey) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }
}

/// Build every unit and classify changes.
///
/// With `opts.tool_plan` the drivers' own dry-run runs for every changed
/// unit. Planning never marks a unit as applied.
pub fn plan<P: ProgressCallback + ?Sized>(
    project: &mut Project,
    state: &mut StateProject,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport> {
    project.build_all()?;
    let summary = reconcile(project, state, opts.ignore_state)?;
    progress.on_plan(&summary);
    let mut report = RunReport::new(summary);
    if !opts.tool_plan {
        return Ok(report);
    }

    let ctx = RunContext::new(project.settings.clone());
    let pool = thread_pool(opts.jobs)?;
    let mut blocked: BTreeSet<UnitId> = BTreeSet::new();

    let waves = project.graph()?.waves();
    for (n, wave) in waves.into_iter().enumerate() {
        let mut selected = Vec::new();
        for id in wave {
            let key = project.unit(id).key();
            if !matches!(
                report.plan.classification(&key),
                Some(Classification::Deploy | Classification::Update)
            ) {
                continue;
            }
            if let Some(reason) = blocked_reason(project, id, &blocked) {
                project.unit_mut(id).core_mut().transition(UnitStatus::Skipped)?;
                blocked.insert(id);
                report.record(progress, key, UnitOutcome::Skipped { reason });
                continue;
            }
            selected.push(id);
        }
        if selected.is_empty() {
            continue;
        }

        progress.on_wave_start(n + 1, selected.len());
        for id in &selected {
            progress.on_unit_start(&project.unit(*id).key(), "plan");
        }
        let results = {
            let (units, _) = project.split_build();
            run_parallel(&pool, pick(units, &selected), |unit| {
                run_operation(unit, Operation::Plan, &ctx)
                    .map(Option::unwrap_or_default)
            })?
        };

        for (id, result) in results {
            let unit = project.unit_mut(id);
            let key = unit.key();
            let outcome = match result {
                Ok(text) => {
                    unit.core_mut().transition(UnitStatus::Planned)?;
                    UnitOutcome::Planned { report: text }
                }
                Err(e) => {
                    unit.core_mut().transition(UnitStatus::Failed)?;
                    blocked.insert(id);
                    UnitOutcome::Failed { error: e.to_string() }
                }
            };
            report.record(progress, key, outcome);
        }
        progress.on_wave_complete();
    }
    Ok(report)
}

/// Plan, confirm, destroy units removed from the project, then apply
/// changed units wave by wave.
///
/// State is saved after every wave. A failed unit cancels its dependents;
/// independent branches continue.
pub fn apply<P, C>(
    project: &mut Project,
    state: &mut StateProject,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
    C: ConfirmCallback + ?Sized,
{
    project.build_all()?;
    let summary = reconcile(project, state, opts.ignore_state)?;
    progress.on_plan(&summary);
    let mut report = RunReport::new(summary);

    if !report.plan.has_changes() {
        log::info!("No changes, nothing to do");
        return Ok(report);
    }
    if opts.dry_run {
        return Ok(report);
    }
    if !confirm.confirm("Continue?")? {
        report.summary.skipped = report.plan.len() - report.plan.unchanged.len();
        return Ok(report);
    }

    let ctx = RunContext::new(project.settings.clone());
    let pool = thread_pool(opts.jobs)?;

    let removed: Vec<UnitKey> = report.plan.destroy.iter().map(|c| c.key.clone()).collect();
    destroy_orphans(project, state, &removed, &ctx, progress, &mut report)?;

    let mut blocked: BTreeSet<UnitId> = BTreeSet::new();
    let waves = project.graph()?.waves();
    for (n, wave) in waves.into_iter().enumerate() {
        let mut selected: BTreeMap<UnitId, bool> = BTreeMap::new();
        for id in wave {
            let key = project.unit(id).key();
            if let Some(reason) = blocked_reason(project, id, &blocked) {
                project.unit_mut(id).core_mut().transition(UnitStatus::Skipped)?;
                blocked.insert(id);
                report.record(progress, key, UnitOutcome::Skipped { reason });
                continue;
            }

            let (diff, in_state) = state.check_unit_changes(project, id)?;
            if diff.is_empty() && !opts.ignore_state {
                log::debug!("{key}: unchanged");
                report.record(progress, key, UnitOutcome::Unchanged);
                continue;
            }

            if let Err(e) = fetch_literal_inputs(project, id, &ctx) {
                project.unit_mut(id).core_mut().transition(UnitStatus::Failed)?;
                blocked.insert(id);
                report.record(progress, key, UnitOutcome::Failed { error: e.to_string() });
                continue;
            }
            selected.insert(id, in_state);
        }
        if selected.is_empty() {
            continue;
        }

        let ids: Vec<UnitId> = selected.keys().copied().collect();
        progress.on_wave_start(n + 1, ids.len());
        for id in &ids {
            progress.on_unit_start(&project.unit(*id).key(), "apply");
        }
        let results = {
            let (units, build) = project.split_build();
            run_parallel(&pool, pick(units, &ids), |unit| apply_unit(unit, &build, &ctx))?
        };

        for (id, result) in results {
            let key = project.unit(id).key();
            let in_state = selected.get(&id).copied().unwrap_or(false);
            let outcome = match result {
                Ok(outputs) => {
                    project.record_outputs(key.clone(), outputs);
                    let unit = project.unit_mut(id);
                    unit.core_mut().applied = true;
                    unit.core_mut().transition(UnitStatus::Applied)?;
                    state.update_unit(&*unit)?;
                    if in_state {
                        UnitOutcome::Updated
                    } else {
                        UnitOutcome::Deployed
                    }
                }
                Err(e) => {
                    log::error!("{key}: {e}");
                    project.unit_mut(id).core_mut().transition(UnitStatus::Failed)?;
                    blocked.insert(id);
                    UnitOutcome::Failed { error: e.to_string() }
                }
            };
            report.record(progress, key, outcome);
        }
        state.save(project)?;
        progress.on_wave_complete();
    }
    Ok(report)
}

/// Destroy units in reverse dependency order.
///
/// Only units present in state are destroyed, unless `opts.ignore_state`.
/// Units left in state but gone from the project are destroyed first.
pub fn destroy<P, C>(
    project: &mut Project,
    state: &mut StateProject,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
    C: ConfirmCallback + ?Sized,
{
    project.build_all()?;
    let mut plan = PlanSummary::default();
    for unit in project.units() {
        let key = unit.key();
        let classification = if opts.ignore_state || state.contains(&key) {
            Classification::Destroy
        } else {
            Classification::Unchanged
        };
        plan_push(&mut plan, key, classification);
    }
    for key in state.keys() {
        if !project.contains(&key) {
            plan_push(&mut plan, key, Classification::Destroy);
        }
    }
    progress.on_plan(&plan);
    let mut report = RunReport::new(plan);

    if report.plan.destroy.is_empty() {
        log::info!("Nothing to destroy");
        return Ok(report);
    }
    if opts.dry_run {
        return Ok(report);
    }
    if !confirm.confirm("Continue?")? {
        report.summary.skipped = report.plan.destroy.len();
        return Ok(report);
    }

    let ctx = RunContext::new(project.settings.clone());
    let pool = thread_pool(opts.jobs)?;

    let orphans: Vec<UnitKey> = report
        .plan
        .destroy
        .iter()
        .filter(|c| !project.contains(&c.key))
        .map(|c| c.key.clone())
        .collect();
    destroy_orphans(project, state, &orphans, &ctx, progress, &mut report)?;

    let targets: BTreeSet<UnitKey> = report.plan.destroy.iter().map(|c| c.key.clone()).collect();
    let graph = project.graph()?;
    let waves = graph.waves();
    let dependents: BTreeMap<UnitId, BTreeSet<UnitId>> = waves
        .iter()
        .flatten()
        .map(|id| (*id, graph.dependents(*id)))
        .collect();

    let mut blocked: BTreeSet<UnitId> = BTreeSet::new();
    for (n, wave) in waves.into_iter().rev().enumerate() {
        let mut selected = Vec::new();
        for id in wave {
            let key = project.unit(id).key();
            if !targets.contains(&key) {
                continue;
            }
            if let Some(dep) = dependents[&id].iter().find(|d| blocked.contains(*d)) {
                let reason = format!("dependent unit '{}' was not destroyed", project.unit(*dep).key());
                project.unit_mut(id).core_mut().transition(UnitStatus::Skipped)?;
                blocked.insert(id);
                report.record(progress, key, UnitOutcome::Skipped { reason });
                continue;
            }
            selected.push(id);
        }
        if selected.is_empty() {
            continue;
        }

        progress.on_wave_start(n + 1, selected.len());
        for id in &selected {
            progress.on_unit_start(&project.unit(*id).key(), "destroy");
        }
        let results = {
            let (units, _) = project.split_build();
            run_parallel(&pool, pick(units, &selected), |unit| {
                run_operation(unit, Operation::Destroy, &ctx).map(|_| ())
            })?
        };

        for (id, result) in results {
            let unit = project.unit_mut(id);
            let key = unit.key();
            let outcome = match result {
                Ok(()) => {
                    unit.core_mut().transition(UnitStatus::Destroyed)?;
                    state.remove_unit(&key);
                    UnitOutcome::Destroyed
                }
                Err(e) => {
                    log::error!("{key}: {e}");
                    unit.core_mut().transition(UnitStatus::Failed)?;
                    blocked.insert(id);
                    UnitOutcome::Failed { error: e.to_string() }
                }
            };
            report.record(progress, key, outcome);
        }
        state.save(project)?;
        progress.on_wave_complete();
    }
    Ok(report)
}

/// Generate every unit's artifacts without running any tool
pub fn build(project: &mut Project) -> Result<usize> {
    project.build_all()?;
    Ok(project.units().len())
}

fn plan_push(plan: &mut PlanSummary, key: UnitKey, classification: Classification) {
    let change = crate::reconcile::UnitChange {
        key,
        classification,
        diff: String::new(),
    };
    match classification {
        Classification::Destroy => plan.destroy.push(change),
        _ => plan.unchanged.push(change),
    }
}

/// Destroy units that only exist in state, dependents first
fn destroy_orphans<P: ProgressCallback + ?Sized>(
    project: &mut Project,
    state: &mut StateProject,
    keys: &[UnitKey],
    ctx: &RunContext,
    progress: &mut P,
    report: &mut RunReport,
) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }

    let mut orphans: Vec<Box<dyn Unit>> = keys
        .iter()
        .map(|key| state.restore_unit(project, key))
        .collect::<Result<_>>()?;
    for orphan in &orphans {
        project.adopt_orphan(orphan.as_ref(), state.markers());
    }

    let index: BTreeMap<UnitKey, usize> = orphans.iter().enumerate().map(|(i, o)| (o.key(), i)).collect();
    let edges: Vec<(usize, Vec<usize>)> = orphans
        .iter()
        .enumerate()
        .map(|(i, o)| {
            let deps = o.dependencies().iter().filter_map(|d| index.get(&d.key()).copied()).collect();
            (i, deps)
        })
        .collect();
    let graph = DependencyGraph::build(edges, |i| orphans[i].key().to_string())?;

    let mut failed: BTreeSet<usize> = BTreeSet::new();
    for wave in graph.waves().into_iter().rev() {
        for i in wave {
            let key = orphans[i].key();
            if let Some(dep) = graph.dependents(i).iter().find(|d| failed.contains(*d)) {
                let reason = format!("dependent unit '{}' was not destroyed", orphans[*dep].key());
                failed.insert(i);
                report.record(progress, key, UnitOutcome::Skipped { reason });
                continue;
            }

            progress.on_unit_start(&key, "destroy");
            let orphan = orphans[i].as_mut();
            let result = project
                .build_detached(orphan)
                .and_then(|()| run_operation(orphan, Operation::Destroy, ctx).map(|_| ()));
            let outcome = match result {
                Ok(()) => {
                    orphan.core_mut().transition(UnitStatus::Destroyed)?;
                    state.remove_unit(&key);
                    UnitOutcome::Destroyed
                }
                Err(e) => {
                    log::error!("{key}: {e}");
                    failed.insert(i);
                    UnitOutcome::Failed { error: e.to_string() }
                }
            };
            report.record(progress, key, outcome);
        }
        state.save(project)?;
    }
    Ok(())
}

/// Rebuild against the outputs known now, apply, read outputs
fn apply_unit(unit: &mut dyn Unit, build: &BuildContext<'_>, ctx: &RunContext) -> Result<BTreeMap<String, Value>> {
    unit.build(build)?;
    unit.core_mut().transition(UnitStatus::Built)?;
    run_operation(unit, Operation::Apply, ctx)?;
    unit.output(ctx)
}

/// Units needing literal values get the outputs of unchanged dependencies
/// read up front.
fn fetch_literal_inputs(project: &mut Project, id: UnitId, ctx: &RunContext) -> Result<()> {
    if !project.unit(id).needs_literal_inputs() {
        return Ok(());
    }
    for target in dependency_targets(project, id) {
        read_outputs(project, target, ctx)?;
    }
    Ok(())
}

/// Record the outputs of a unit not applied in this run.
///
/// A unit whose outputs come from its own resolved inputs is rebuilt first,
/// once its dependencies' outputs are known.
fn read_outputs(project: &mut Project, id: UnitId, ctx: &RunContext) -> Result<()> {
    let key = project.unit(id).key();
    if project.outputs().contains_key(&key) {
        return Ok(());
    }
    if project.unit(id).needs_literal_inputs() {
        for target in dependency_targets(project, id) {
            read_outputs(project, target, ctx)?;
        }
        project.build_unit(id)?;
    }
    log::debug!("Reading outputs of unchanged unit '{key}'");
    let outputs = project.unit(id).output(ctx)?;
    project.record_outputs(key, outputs);
    Ok(())
}

fn dependency_targets(project: &Project, id: UnitId) -> Vec<UnitId> {
    project
        .unit(id)
        .dependencies()
        .iter()
        .filter_map(|d| d.target)
        .collect()
}

/// Reason a unit can't run, if one of its dependencies failed or was skipped
fn blocked_reason(project: &Project, id: UnitId, blocked: &BTreeSet<UnitId>) -> Option<String> {
    project
        .unit(id)
        .dependencies()
        .iter()
        .find(|d| d.target.is_some_and(|t| blocked.contains(&t)))
        .map(|d| format!("dependency '{}' did not complete", d.key()))
}

fn thread_pool(jobs: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .map_err(|e| Error::internal(format!("failed to create thread pool: {e}")))
}

/// Mutable references to the selected units, in id order
fn pick<'a>(units: &'a mut [Box<dyn Unit>], ids: &[UnitId]) -> Vec<(UnitId, &'a mut Box<dyn Unit>)> {
    units
        .iter_mut()
        .enumerate()
        .filter(|(id, _)| ids.contains(id))
        .collect()
}

type UnitResults<T> = Arc<Mutex<Vec<(UnitId, Result<T>)>>>;

/// Run `op` on every unit on the pool. Results come back in id order.
fn run_parallel<T, F>(pool: &ThreadPool, units: Vec<(UnitId, &mut Box<dyn Unit>)>, op: F) -> Result<Vec<(UnitId, Result<T>)>>
where
    T: Send,
    F: Fn(&mut dyn Unit) -> Result<T> + Sync,
{
    let results: UnitResults<T> = Arc::new(Mutex::new(Vec::with_capacity(units.len())));

    pool.install(|| {
        units.into_par_iter().for_each(|(id, unit)| {
            let result = op(unit.as_mut());
            push_result(&results, (id, result));
        });
    });

    let mut results = into_results(results)?;
    results.sort_by_key(|(id, _)| *id);
    Ok(results)
}

fn push_result<T>(results: &UnitResults<T>, result: (UnitId, Result<T>)) {
    match results.lock() {
        Ok(mut locked) => locked.push(result),
        Err(poisoned) => poisoned.into_inner().push(result),
    }
}

fn into_results<T>(results: UnitResults<T>) -> Result<Vec<(UnitId, Result<T>)>> {
    let mutex = Arc::try_unwrap(results)
        .map_err(|_| Error::internal("failed to collect unit results: shared result state"))?;

    match mutex.into_inner() {
        Ok(collected) => Ok(collected),
        Err(poisoned) => Ok(poisoned.into_inner()),
    }
}
