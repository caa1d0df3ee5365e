use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackwork")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Orchestrate infrastructure units across stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project directory
    #[arg(short = 'C', long = "chdir", global = true, default_value = ".")]
    pub chdir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),

    /// Deploy and update changed units, destroy removed ones
    Apply(ApplyArgs),

    /// Destroy every deployed unit
    Destroy(DestroyArgs),

    /// Generate unit code without running any tool
    Build,

    /// Inspect and manage the saved state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct PlanArgs {
    /// Also run each changed unit's own plan (e.g. terraform plan)
    #[arg(long)]
    pub tool_plan: bool,

    /// Treat every unit as changed
    #[arg(long)]
    pub ignore_state: bool,

    /// Parallel unit operations per wave
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Don't ask for confirmation
    #[arg(short, long)]
    pub force: bool,

    /// Treat every unit as changed
    #[arg(long)]
    pub ignore_state: bool,

    /// Parallel unit operations per wave
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Don't ask for confirmation
    #[arg(short, long)]
    pub force: bool,

    /// Destroy units even if they are not in state
    #[arg(long)]
    pub ignore_state: bool,

    /// Parallel unit operations per wave
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// Copy the saved state into the project directory
    Pull,

    /// Write a timestamped copy of the saved state
    Backup,

    /// Remove a stale state lock
    Unlock,

    /// List units in the saved state
    Show,
}
