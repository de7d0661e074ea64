//! CLI command definitions for the `bloom` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod job;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect batch jobs.
#[derive(Parser)]
#[command(name = "bloom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Database URL (`sqlite://...`) or file path. Defaults to
    /// `batchloom.db` in the data directory.
    #[arg(long, global = true, env = "BATCHLOOM_DATABASE")]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a job file and follow it until it ends. Ctrl+C kills the job.
    Run {
        /// Path to the job description (JSON).
        file: PathBuf,
    },

    /// Show one job's tasks, or list jobs when no id is given.
    #[command(alias = "ls")]
    Status {
        /// Job id.
        job: Option<u64>,

        /// Only list jobs that have not ended.
        #[arg(long)]
        unfinished: bool,
    },

    /// Print the result of one task.
    Result {
        /// Job id.
        job: u64,

        /// Task name, with `#iteration` and `*replica` suffixes for copies
        /// (e.g. `transform#2*1`).
        task: String,
    },

    /// Resume every unfinished job found in the database and follow them.
    Resume,

    /// Kill a job: running tasks are interrupted, the rest are aborted.
    Kill {
        /// Job id.
        job: u64,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_global_flags() {
        let cli = Cli::try_parse_from(["bloom", "run", "job.json", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn parses_result_task_name() {
        let cli = Cli::try_parse_from(["bloom", "result", "7", "transform#2*1"]).unwrap();
        match cli.command {
            Commands::Result { job, task } => {
                assert_eq!(job, 7);
                assert_eq!(task, "transform#2*1");
            }
            _ => panic!("expected result command"),
        }
    }
}
