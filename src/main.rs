use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use duo_review::cli::Cli;
use duo_review::{config, init_telemetry, DuoError};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = config()?;

    let mut observability = config.observability.clone();
    if cli.verbose {
        observability.log_level = "debug".to_string();
    }
    init_telemetry(&observability)?;

    tokio::runtime::Runtime::new()?.block_on(async { cli.run(config).await })
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<DuoError>() {
        // Expected outcomes: the message says it all.
        Some(duo_err) if duo_err.is_reportable_outcome() => eprintln!("Error: {duo_err}"),
        Some(duo_err) if duo_err.committed_remote_id().is_some() => {
            eprintln!("Error: {duo_err}");
            eprintln!("The review thread was already changed; check 'duo comment list' before retrying.");
        }
        Some(duo_err) => {
            eprintln!("Error: {duo_err}");
            if duo_err.is_retryable() {
                eprintln!("No changes were made; it is safe to retry.");
            } else {
                eprintln!("No changes were made.");
            }
        }
        None => eprintln!("Error: {err:#}"),
    }
}
