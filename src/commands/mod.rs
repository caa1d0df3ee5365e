//! Subcommand implementations

pub mod apply;
pub mod build;
pub mod destroy;
pub mod plan;
pub mod state;

use anyhow::{Context as _, Result};
use orchestrator::{DriverRegistry, ExecuteOptions, Project, Settings};

use crate::Context;

/// Load settings and manifests from the project directory
pub fn load_project(ctx: &Context) -> Result<Project> {
    let settings = Settings::load(&ctx.dir)
        .with_context(|| format!("Failed to load settings from {}", ctx.dir.display()))?;
    let project = Project::load(settings, DriverRegistry::with_builtin())
        .with_context(|| format!("Failed to load project in {}", ctx.dir.display()))?;
    log::info!(
        "Loaded project '{}' with {} units",
        project.name,
        project.units().len()
    );
    Ok(project)
}

/// Execution options with `--jobs` falling back to the settings
pub fn execute_options(project: &Project, jobs: Option<usize>, ignore_state: bool) -> ExecuteOptions {
    ExecuteOptions {
        jobs: jobs.unwrap_or(project.settings.jobs).max(1),
        ignore_state,
        ..ExecuteOptions::default()
    }
}

/// Combine a locked run with the lock release, keeping both errors
pub fn release_after<T>(result: orchestrator::Result<T>, released: orchestrator::Result<()>) -> Result<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e.into()),
        (Ok(_), Err(unlock)) => Err(anyhow::Error::new(unlock).context("Failed to release the state lock")),
        (Err(e), Err(unlock)) => {
            Err(anyhow::Error::new(e).context(format!("Failed to release the state lock: {unlock}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        Context {
            verbose: 0,
            quiet: true,
            dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn test_load_project_from_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("t")).unwrap();
        fs::write(
            dir.path().join("project.yaml"),
            "kind: project\nname: demo\n---\nkind: stack\nname: net\ntemplate: t\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("t/units.yaml"),
            "units:\n  - name: vpc\n    type: printer\n    outputs:\n      id: vpc-1\n",
        )
        .unwrap();

        let project = load_project(&context(&dir)).unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(project.units().len(), 1);

        let opts = execute_options(&project, None, false);
        assert_eq!(opts.jobs, project.settings.jobs);
        assert_eq!(execute_options(&project, Some(0), true).jobs, 1);
    }

    #[test]
    fn test_missing_manifest_has_context() {
        let dir = TempDir::new().unwrap();
        let err = load_project(&context(&dir)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to load project"));
        assert!(err.downcast_ref::<orchestrator::Error>().is_some());
    }

    #[test]
    fn test_release_failure_keeps_run_error() {
        let err = release_after::<()>(
            Err(orchestrator::Error::config("bad manifest")),
            Err(orchestrator::Error::Locked),
        )
        .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("bad manifest"), "{msg}");
        assert!(msg.contains("state is locked by another process"), "{msg}");
        assert!(err.downcast_ref::<orchestrator::Error>().is_some());
    }

    #[test]
    fn test_release_failure_after_success() {
        let err = release_after(Ok(1), Err(orchestrator::Error::Locked)).unwrap_err();
        assert!(format!("{err:#}").starts_with("Failed to release the state lock"));
        assert_eq!(release_after(Ok(2), Ok(())).unwrap(), 2);
    }
}
