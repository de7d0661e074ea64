//! batchloom command-line entry point.
//!
//! Binary name: `bloom`
//!
//! Parses CLI arguments, sets up tracing, opens the job database, then
//! dispatches to the command handler. The exit code reflects how the job
//! ended, or the kind of error that stopped the command.

mod cli;
mod state;

use std::process::ExitCode;

use batchloom_observe::attrs;
use batchloom_observe::tracing_setup::{init_tracing, shutdown_tracing};
use batchloom_types::error::SchedulerError;
use clap::Parser;
use clap_complete::generate;
use console::style;
use tracing::Instrument;

use cli::job::{self, Output};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,batchloom=debug",
        _ => "trace",
    };
    if let Err(err) = init_tracing(filter, cli.otel) {
        eprintln!("{} failed to set up tracing: {err}", style("error:").red().bold());
        return ExitCode::FAILURE;
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "bloom", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let span = tracing::info_span!("bloom", { attrs::COMMAND } = command_name(&cli.command));
    let code = match dispatch(cli).instrument(span).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            err.downcast_ref::<SchedulerError>()
                .map(|e| ExitCode::from(job::error_code(e)))
                .unwrap_or(ExitCode::FAILURE)
        }
    };

    shutdown_tracing();
    code
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let state = AppState::init(cli.database.as_deref()).await?;
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    let code = match cli.command {
        Commands::Run { file } => job::run_job(&state, &file, out).await?,
        Commands::Status { job, unfinished } => {
            job::show_status(&state, job, unfinished, cli.json).await?;
            ExitCode::SUCCESS
        }
        Commands::Result { job, task } => {
            job::show_result(&state, job, &task, cli.json).await?;
            ExitCode::SUCCESS
        }
        Commands::Resume => job::resume(&state, out).await?,
        Commands::Kill { job } => {
            job::kill(&state, job, cli.json).await?;
            ExitCode::SUCCESS
        }
        // Handled before state init
        Commands::Completions { .. } => ExitCode::SUCCESS,
    };

    state.db_pool.close().await;
    Ok(code)
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Run { .. } => "run",
        Commands::Status { .. } => "status",
        Commands::Result { .. } => "result",
        Commands::Resume => "resume",
        Commands::Kill { .. } => "kill",
        Commands::Completions { .. } => "completions",
    }
}
