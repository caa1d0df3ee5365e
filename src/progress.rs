//! Terminal progress and confirmation for orchestration runs.

use crate::ui;
use colored::Colorize;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use orchestrator::{ConfirmCallback, PlanSummary, ProgressCallback, UnitKey, UnitOutcome};

/// Prints the plan, then a progress bar per wave
pub struct CliProgress {
    quiet: bool,
    show_diffs: bool,
    bar: Option<ProgressBar>,
}

impl CliProgress {
    pub fn new(quiet: bool, show_diffs: bool) -> Self {
        Self {
            quiet,
            show_diffs,
            bar: None,
        }
    }

    fn println(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_plan(&mut self, plan: &PlanSummary) {
        if !self.quiet {
            ui::print_plan(plan, self.show_diffs);
        }
    }

    fn on_wave_start(&mut self, wave: usize, count: usize) {
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new(count as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_prefix(format!("wave {wave}"));
        self.bar = Some(bar);
    }

    fn on_unit_start(&mut self, key: &UnitKey, operation: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{operation} {key}"));
        }
    }

    fn on_unit_complete(&mut self, key: &UnitKey, outcome: &UnitOutcome) {
        if self.quiet && outcome.is_success() {
            return;
        }
        let mark = if outcome.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        self.println(&format!("  {mark} {key}: {}", ui::outcome_label(outcome)));
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_wave_complete(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Asks on the terminal
pub struct DialogConfirm;

impl ConfirmCallback for DialogConfirm {
    fn confirm(&mut self, prompt: &str) -> orchestrator::Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .map_err(|e| orchestrator::Error::Io(std::io::Error::other(e.to_string())))
    }
}
