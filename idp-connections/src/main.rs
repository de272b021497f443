use aggregator::app::{App, StartupError};
use aggregator::errors::AppError;
use aggregator::mediator::ColleagueOperation;
use aggregator::run_state::Domain;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod telemetry;

use config::{Config, ConfigError};

/// Sender name for operations started from the command line.
const CLI_SENDER: &str = "cli";

#[derive(Parser)]
#[command(name = "idp-connections", version, about)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the API, the admin endpoints and the configured schedules.
    Serve(ConfigArgs),
    /// Mirror one domain now and exit.
    Aggregate {
        #[command(flatten)]
        args: ConfigArgs,
        domain: Domain,
    },
    /// Empty one domain's mirror and exit.
    Purge {
        #[command(flatten)]
        args: ConfigArgs,
        domain: Domain,
    },
}

impl CliCommand {
    fn config_path(&self) -> &PathBuf {
        match self {
            CliCommand::Serve(args)
            | CliCommand::Aggregate { args, .. }
            | CliCommand::Purge { args, .. } => &args.config,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Run(#[from] AppError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(cli.command.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return exit_code(&e);
        }
    };

    let _sentry = telemetry::init_logging(config.common.logging.as_ref());
    if let Some(metrics) = &config.common.metrics
        && let Err(e) = telemetry::init_metrics(metrics)
    {
        tracing::error!(error = %e, "metrics disabled");
    }

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn exit_code(error: &ConfigError) -> ExitCode {
    match error {
        ConfigError::LoadError(_) => ExitCode::from(66),
        ConfigError::ParseError(_) | ConfigError::Invalid(_) => ExitCode::from(78),
    }
}

fn run(command: CliCommand, config: Config) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(execute(command, config))
}

async fn execute(command: CliCommand, config: Config) -> Result<(), CliError> {
    let app = App::from_config(&config.aggregator).await?;

    let operation = match command {
        CliCommand::Serve(_) => {
            tracing::info!("starting idp-connections");
            app.serve(&config.aggregator, shutdown_signal()).await?;
            return Ok(());
        }
        CliCommand::Aggregate { domain, .. } => ColleagueOperation::Aggregate(domain),
        CliCommand::Purge { domain, .. } => ColleagueOperation::Purge(domain),
    };

    let report = app.run_once(CLI_SENDER, operation).await?;
    tracing::info!(%operation, records = report.records, "run finished");
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_default()
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
