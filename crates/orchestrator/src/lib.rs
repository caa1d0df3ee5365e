//! # Orchestrator
//!
//! Dependency-aware orchestration of infrastructure provisioning units.
//!
//! A project is a set of stacks; every stack expands a template into units,
//! each handled by a driver for some external tool. Units reference each
//! other's outputs with `${output:<stack>.<unit>.<output>}`.
//!
//! ## Core Concepts
//!
//! - **Marker**: opaque token replacing a reference until its value is known
//! - **Unit**: atomic provisioning item with dependencies and hooks
//! - **Backend**: lockable storage for the orchestration state
//! - **StateProject**: the persisted snapshot used for change detection
//! - **Executor**: runs units in topological waves on a bounded pool
//!
//! ## Example
//!
//! ```ignore
//! use orchestrator::{
//!     AutoConfirm, DriverRegistry, ExecuteOptions, NoProgress, Project, Settings,
//!     StateProject, executor, lock_state,
//! };
//!
//! let settings = Settings::load(std::path::Path::new("."))?;
//! let mut project = Project::load(settings, DriverRegistry::with_builtin())?;
//!
//! let lock = lock_state(&project)?;
//! let mut state = StateProject::load(&project)?;
//! let report = executor::apply(
//!     &mut project,
//!     &mut state,
//!     &ExecuteOptions::default(),
//!     &mut NoProgress,
//!     &mut AutoConfirm,
//! )?;
//! lock.release()?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`Unit`] / [`UnitFactory`]: drivers, registered in a [`DriverRegistry`]
//! - [`Backend`]: state storage and tool backend syntax
//! - [`ProgressCallback`]: receives progress updates
//! - [`ConfirmCallback`]: handles user confirmations

pub mod backend;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod hcl;
pub mod marker;
pub mod project;
pub mod reconcile;
pub mod runner;
pub mod scan;
pub mod settings;
pub mod stack;
pub mod state;
pub mod types;
pub mod unit;

// Re-export main types at crate root
pub use backend::{Backend, BackendRegistry, DEFAULT_BACKEND, LocalBackend, S3Backend};
pub use context::{AutoConfirm, AutoDecline, BuildContext, ConfirmCallback, NoProgress, ProgressCallback, RunContext};
pub use error::{Error, ErrorCategory, Result};
pub use executor::RunReport;
pub use graph::DependencyGraph;
pub use marker::{MarkerTable, OutputRef, OutputStore};
pub use project::Project;
pub use reconcile::{Classification, PlanSummary, UnitChange, reconcile};
pub use settings::Settings;
pub use stack::Stack;
pub use state::{StateDocument, StateLock, StateProject, backup_state, lock_state, pull_state, unlock_state};
pub use types::{ExecuteOptions, ExecuteSummary, UnitOutcome};
pub use unit::{DriverRegistry, Unit, UnitCore, UnitFactory, UnitId, UnitKey, UnitStatus};
