use anyhow::Result;
use colored::Colorize;

use crate::Context;
use crate::cli::StateCommand;
use crate::ui;
use orchestrator::{StateProject, backup_state, pull_state, unlock_state};

pub fn run(ctx: &Context, cmd: &StateCommand) -> Result<()> {
    let project = super::load_project(ctx)?;
    match cmd {
        StateCommand::Pull => {
            let path = pull_state(&project)?;
            ui::success(&format!("State written to {}", path.display()));
        }
        StateCommand::Backup => {
            let path = backup_state(&project)?;
            ui::success(&format!("Backup written to {}", path.display()));
        }
        StateCommand::Unlock => {
            unlock_state(&project)?;
            ui::success("State unlocked");
        }
        StateCommand::Show => show(&project, ctx.verbose > 0)?,
    }
    Ok(())
}

fn show(project: &orchestrator::Project, detailed: bool) -> Result<()> {
    let state = StateProject::load(project)?;
    let keys = state.keys();

    ui::header(&format!("State of '{}'", project.name));
    ui::kv("Backend", project.state_backend()?.name());
    ui::kv("Version", &state.document().version);
    ui::kv("Markers", &state.markers().len().to_string());

    if keys.is_empty() {
        ui::dim("No units in state");
        return Ok(());
    }

    ui::section(&format!("Units ({})", keys.len()));
    for key in keys {
        let marker = if project.contains(&key) {
            "●".green()
        } else {
            "○".yellow()
        };
        println!("  {marker} {key}");
        if detailed && let Some(record) = state.record(&key) {
            let kind = record.get("type").and_then(|v| v.as_str()).unwrap_or("?");
            ui::kv("  type", kind);
        }
    }
    Ok(())
}
