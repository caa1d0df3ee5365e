use anyhow::Result;

use crate::Context;
use crate::ui;
use orchestrator::executor;

pub fn run(ctx: &Context) -> Result<()> {
    let mut project = super::load_project(ctx)?;
    let count = executor::build(&mut project)?;
    if !ctx.quiet {
        ui::success(&format!(
            "Built {count} unit(s) into {}",
            project.settings.cache_path().display()
        ));
    }
    Ok(())
}
