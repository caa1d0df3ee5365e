use anyhow::Result;
use colored::Colorize;

use crate::Context;
use crate::cli::PlanArgs;
use crate::progress::CliProgress;
use crate::ui;
use orchestrator::{StateProject, UnitOutcome, executor};

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<()> {
    let mut project = super::load_project(ctx)?;
    let mut opts = super::execute_options(&project, args.jobs, args.ignore_state);
    opts.tool_plan = args.tool_plan;

    // Plan reads state without taking the lock
    let mut state = StateProject::load(&project)?;
    let mut progress = CliProgress::new(ctx.quiet, true);
    let report = executor::plan(&mut project, &mut state, &opts, &mut progress)?;

    for (key, outcome) in &report.outcomes {
        if let UnitOutcome::Planned { report: text } = outcome {
            ui::section(&format!("Tool plan for {}", key.to_string().bold()));
            for line in text.lines() {
                println!("    {line}");
            }
        }
    }

    if !report.summary.is_success() {
        anyhow::bail!("{} unit plan(s) failed", report.summary.failed);
    }
    Ok(())
}
