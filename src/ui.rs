use colored::Colorize;
use orchestrator::{ErrorCategory, ExecuteSummary, OutputStore, PlanSummary, UnitChange, UnitOutcome};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Plans and results
// ============================================================================

/// Print the plan table, with per-unit diffs when `diffs` is set
pub fn print_plan(plan: &PlanSummary, diffs: bool) {
    if !plan.has_changes() {
        success("No changes, nothing to do.");
        return;
    }

    print_group("Will be deployed", &plan.deploy, diffs);
    print_group("Will be updated", &plan.update, diffs);
    print_group("Will be destroyed", &plan.destroy, diffs);
    print_group("Unchanged", &plan.unchanged, false);
    println!();
}

fn print_group(title: &str, changes: &[UnitChange], diffs: bool) {
    if changes.is_empty() {
        return;
    }
    section(&format!("{title} ({})", changes.len()));
    for change in changes {
        println!("  {}", change.key.to_string().bold());
        if diffs && !change.diff.is_empty() {
            for line in change.diff.lines() {
                println!("    {}", diff_line(line));
            }
        }
    }
}

/// Color one line of a unit diff
pub fn diff_line(line: &str) -> String {
    if line.starts_with("+/-") {
        line.yellow().to_string()
    } else if line.starts_with('+') {
        line.green().to_string()
    } else if line.starts_with('-') {
        line.red().to_string()
    } else {
        line.dimmed().to_string()
    }
}

/// One-line description of a unit outcome
pub fn outcome_label(outcome: &UnitOutcome) -> String {
    match outcome {
        UnitOutcome::Unchanged => "unchanged".dimmed().to_string(),
        UnitOutcome::Deployed => "deployed".green().to_string(),
        UnitOutcome::Updated => "updated".green().to_string(),
        UnitOutcome::Destroyed => "destroyed".yellow().to_string(),
        UnitOutcome::Planned { .. } => "planned".cyan().to_string(),
        UnitOutcome::Failed { error } => format!("{} ({error})", "failed".red()),
        UnitOutcome::Skipped { reason } => format!("{} ({reason})", "skipped".yellow()),
    }
}

/// Print the counts of a finished run
pub fn print_summary(summary: &ExecuteSummary) {
    section("Summary");
    let mut parts = Vec::new();
    if summary.deployed > 0 {
        parts.push(format!("{} deployed", summary.deployed).green().to_string());
    }
    if summary.updated > 0 {
        parts.push(format!("{} updated", summary.updated).green().to_string());
    }
    if summary.destroyed > 0 {
        parts.push(format!("{} destroyed", summary.destroyed).yellow().to_string());
    }
    if summary.unchanged > 0 {
        parts.push(format!("{} unchanged", summary.unchanged).dimmed().to_string());
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped).yellow().to_string());
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed).red().to_string());
    }
    if parts.is_empty() {
        dim("Nothing was run");
    } else {
        println!("  {}", parts.join(", "));
    }
}

/// Print the outputs of every unit that produced some
pub fn print_outputs(outputs: &OutputStore) {
    let non_empty: Vec<_> = outputs.iter().filter(|(_, o)| !o.is_empty()).collect();
    if non_empty.is_empty() {
        return;
    }
    section("Outputs");
    for (key, values) in non_empty {
        println!("  {}", key.to_string().bold());
        for (name, value) in values {
            let shown = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            kv(&format!("  {name}"), &shown);
        }
    }
}

/// Print an error with its causes and category advice
pub fn report_error(err: &anyhow::Error) {
    error(&format!("{err:#}"));
    let category = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<orchestrator::Error>())
        .map(orchestrator::Error::category);
    if let Some(category) = category {
        if category == ErrorCategory::Internal {
            eprintln!("  {}", "internal error".red().bold());
        }
        eprintln!("  {}", category.advice().dimmed());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_diff_line_keeps_text() {
        plain();
        assert_eq!(diff_line("+ added"), "+ added");
        assert_eq!(diff_line("- removed"), "- removed");
        assert_eq!(diff_line("  \"same\": 1"), "  \"same\": 1");
    }

    #[test]
    fn test_outcome_labels() {
        plain();
        assert_eq!(outcome_label(&UnitOutcome::Deployed), "deployed");
        assert_eq!(
            outcome_label(&UnitOutcome::Failed {
                error: "exit status 1".into()
            }),
            "failed (exit status 1)"
        );
        assert_eq!(
            outcome_label(&UnitOutcome::Skipped {
                reason: "dependency 'net.vpc' did not complete".into()
            }),
            "skipped (dependency 'net.vpc' did not complete)"
        );
    }
}
