//! stackspin cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory of the stack
    #[clap(short = 'r', long = "root", global(true), default_value = ".")]
    pub root: PathBuf,

    /// Run configuration file (YAML)
    #[clap(short = 'c', long = "config", global(true), env = "STACKSPIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum number of modules executing at once
    #[clap(short = 'p', long = "parallelism", global(true))]
    pub parallelism: Option<usize>,

    /// Run the provisioning tool without prompting for input
    #[clap(long = "non-interactive", global(true))]
    pub non_interactive: bool,

    /// Lease database shared by every process running against the same state
    ///
    /// Defaults to .stackspin/locks.db under the stack root. Relative paths
    /// are taken from the stack root.
    #[clap(long = "lock-db", global(true), conflicts_with("memory_locks"))]
    pub lock_db: Option<PathBuf>,

    /// Keep locks in memory; only excludes modules within this one run
    #[clap(long = "memory-locks", global(true))]
    pub memory_locks: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the execution order of the stack
    Plan(PlanCommand),

    /// Print every module with its resolved dependencies
    Graph,

    /// Run the provisioning tool in every module, in dependency order
    Run(RunCommand),
}

#[derive(Parser, Debug)]
pub struct PlanCommand {
    /// Print the order used for tearing the stack down
    #[clap(long = "reverse")]
    pub reverse: bool,

    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct RunCommand {
    /// Walk the stack from dependents to dependencies (e.g. for destroy)
    #[clap(long = "reverse")]
    pub reverse: bool,

    /// Arguments passed to the provisioning tool
    #[arg(last = true)]
    pub tool_args: Vec<String>,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => f.write_str("text"),
            OutputFormat::Json => f.write_str("json"),
        }
    }
}
