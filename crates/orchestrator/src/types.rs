//! Core types for plan and execution results

use serde::{Deserialize, Serialize};

/// Result of running one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    /// Unit had no changes
    Unchanged,
    /// New unit was applied
    Deployed,
    /// Existing unit was re-applied
    Updated,
    /// Unit resources were destroyed
    Destroyed,
    /// Tool plan ran
    Planned { report: String },
    /// Operation failed
    Failed { error: String },
    /// Not run because an upstream unit failed
    Skipped { reason: String },
}

impl UnitOutcome {
    /// Check if the outcome represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Deployed | Self::Updated | Self::Destroyed)
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub deployed: usize,
    pub updated: usize,
    pub destroyed: usize,
    pub unchanged: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.deployed + self.updated + self.destroyed
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of units processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.unchanged + self.planned + self.skipped + self.failed
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &ExecuteSummary) {
        self.deployed += other.deployed;
        self.updated += other.updated;
        self.destroyed += other.destroyed;
        self.unchanged += other.unchanged;
        self.planned += other.planned;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    /// Add a result to the summary
    pub fn add_outcome(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Unchanged => self.unchanged += 1,
            UnitOutcome::Deployed => self.deployed += 1,
            UnitOutcome::Updated => self.updated += 1,
            UnitOutcome::Destroyed => self.destroyed += 1,
            UnitOutcome::Planned { .. } => self.planned += 1,
            UnitOutcome::Failed { .. } => self.failed += 1,
            UnitOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Number of parallel unit operations per wave
    pub jobs: usize,
    /// Treat every unit as changed
    pub ignore_state: bool,
    /// Run the drivers' own plan for changed units
    pub tool_plan: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            ignore_state: false,
            tool_plan: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        summary.add_outcome(&UnitOutcome::Deployed);
        summary.add_outcome(&UnitOutcome::Updated);
        summary.add_outcome(&UnitOutcome::Unchanged);
        summary.add_outcome(&UnitOutcome::Skipped {
            reason: "upstream failed".into(),
        });
        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.total(), 4);
        assert!(summary.is_success());

        let mut other = ExecuteSummary::default();
        other.add_outcome(&UnitOutcome::Failed {
            error: "boom".into(),
        });
        summary.merge(&other);
        assert!(!summary.is_success());
    }
}
