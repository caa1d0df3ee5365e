//! Run context and caller-provided callbacks
//!
//! The callback traits keep the engine free of any terminal UI: the CLI
//! plugs in spinners and prompts, tests plug in [`NoProgress`] and
//! [`AutoConfirm`].

use crate::backend::{Backend, BackendRegistry};
use crate::error::{Error, Result};
use crate::marker::Resolver;
use crate::reconcile::PlanSummary;
use crate::scan::{Scan, scan_with};
use crate::settings::Settings;
use crate::types::UnitOutcome;
use crate::unit::UnitKey;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// Progress callback for execution operations
pub trait ProgressCallback: Send {
    /// Called once changes are classified, before anything runs
    fn on_plan(&mut self, _plan: &PlanSummary) {}

    /// Called when a wave of independent units starts
    fn on_wave_start(&mut self, wave: usize, count: usize);

    /// Called when starting an operation on a single unit
    fn on_unit_start(&mut self, key: &UnitKey, operation: &str);

    /// Called when a unit finishes, successfully or not
    fn on_unit_complete(&mut self, key: &UnitKey, outcome: &UnitOutcome);

    /// Called when a wave completes
    fn on_wave_complete(&mut self);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    ///
    /// # Returns
    /// `true` if the user confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_wave_start(&mut self, _wave: usize, _count: usize) {}
    fn on_unit_start(&mut self, _key: &UnitKey, _operation: &str) {}
    fn on_unit_complete(&mut self, _key: &UnitKey, _outcome: &UnitOutcome) {}
    fn on_wave_complete(&mut self) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Shared by every unit operation of one run
#[derive(Debug)]
pub struct RunContext {
    pub settings: Settings,
    init_lock: Mutex<()>,
}

impl RunContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            init_lock: Mutex::new(()),
        }
    }

    /// Serializes tool initialization across workers.
    ///
    /// Provider downloads share one plugin cache, and concurrent inits corrupt it.
    pub fn init_guard(&self) -> MutexGuard<'_, ()> {
        match self.init_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Everything a unit needs to resolve markers and generate artifacts
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub settings: &'a Settings,
    pub backends: &'a BackendRegistry,
    resolver: Resolver<'a>,
}

impl<'a> BuildContext<'a> {
    pub fn new(settings: &'a Settings, backends: &'a BackendRegistry, resolver: Resolver<'a>) -> Self {
        Self {
            settings,
            backends,
            resolver,
        }
    }

    /// Resolve every marker inside `value`, recording remote-state targets
    pub fn resolve<T: Scan + ?Sized>(&self, value: &mut T, remote: &mut BTreeSet<UnitKey>) -> Result<()> {
        scan_with(value, |s| self.resolver.resolve(s, remote))
    }

    /// Backend of the stack owning a unit
    pub fn stack_backend(&self, stack: &str) -> Result<&'a dyn Backend> {
        self.resolver.stack_backend(stack)
    }

    pub fn backend(&self, name: &str) -> Result<&'a dyn Backend> {
        self.backends.get(name).map_err(|_| {
            Error::config(format!("backend '{name}' is not defined"))
        })
    }
}
