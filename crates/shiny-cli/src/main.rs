mod cli;
mod commands;
mod config;
mod error;
mod logging;
mod utils;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Completion, FATAL_EXIT_CODE, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

fn main() {
    match run_app() {
        Ok(completion) => std::process::exit(completion.exit_code()),
        Err(e) => {
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}

fn run_app() -> Result<Completion> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.clone())?;

    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default().into_hooks();
    eyre_hook.install().map_err(|e| CliError::Other(e.into()))?;
    std::panic::set_hook(Box::new(move |pi| {
        error!("{}", panic_hook.panic_report(pi));
    }));

    info!("🚀 shiny CLI v{} starting up.", env!("CARGO_PKG_VERSION"));
    debug!("Full CLI arguments parsed: {:?}", &cli);

    if let Some(num_threads) = cli.threads {
        info!("Setting Rayon global thread pool to {} threads.", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to build global thread pool: {}", e)))?;
    }

    let command_result = match cli.command {
        Commands::Polish(args) => {
            info!("Dispatching to 'polish' command.");
            commands::polish::run(args)
        }
        Commands::Weights(args) => {
            info!("Dispatching to 'weights' command.");
            commands::weights::run(args)
        }
    };

    match &command_result {
        Ok(Completion::Clean) => {
            info!("✅ Command completed successfully.");
            println!("✅ Command completed successfully.");
        }
        Ok(Completion::WithIssues(count)) => {
            warn!("Command completed with {} recoverable issue(s).", count);
            println!("⚠ Command completed with {} recoverable issue(s).", count);
        }
        Err(e) => {
            error!("❌ Command failed: {}", e);
        }
    }

    command_result
}
