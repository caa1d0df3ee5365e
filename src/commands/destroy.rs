use anyhow::Result;

use crate::Context;
use crate::cli::DestroyArgs;
use crate::progress::{CliProgress, DialogConfirm};
use crate::ui;
use orchestrator::{AutoConfirm, ConfirmCallback, StateProject, executor, lock_state};

pub fn run(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let mut project = super::load_project(ctx)?;
    let opts = super::execute_options(&project, args.jobs, args.ignore_state);

    let lock = lock_state(&project)?;
    let mut state = StateProject::load(&project)?;
    let mut progress = CliProgress::new(ctx.quiet, false);
    let mut confirm: Box<dyn ConfirmCallback> = if args.force {
        Box::new(AutoConfirm)
    } else {
        Box::new(DialogConfirm)
    };

    let result = executor::destroy(
        &mut project,
        &mut state,
        &opts,
        &mut progress,
        confirm.as_mut(),
    );
    let report = super::release_after(result, lock.release())?;

    if report.plan.destroy.is_empty() {
        ui::info("Nothing to destroy");
        return Ok(());
    }
    if report.outcomes.is_empty() && report.summary.skipped > 0 {
        ui::warn("Destroy cancelled");
        return Ok(());
    }
    ui::print_summary(&report.summary);

    if !report.summary.is_success() {
        anyhow::bail!("{} unit(s) failed to destroy", report.summary.failed);
    }
    Ok(())
}
