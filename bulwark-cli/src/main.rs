use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use bulwark_cli::checks::{report, run_checks};
use bulwark_cli::{replay, session, telemetry};
use bulwark_config::{load_config, AppConfig};
use bulwark_journal::JournalError;
use bulwark_risk::BreakerState;
use clap::{Parser, Subcommand};
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_RECOVERABLE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CORRUPTION: u8 = 3;

#[derive(Parser)]
#[command(author, version, about = "Bulwark trading engine operator CLI")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the nine-point safety audit; exit 0 iff all checks pass
    PreTradingCheck,
    /// Reset the circuit breaker; only legal when the audit passes
    BreakerReset {
        /// Recorded alongside the persisted reset record
        #[arg(long, default_value = "operator reset")]
        note: String,
    },
    /// Reconstruct event bus history from a WAL directory or segment
    Replay {
        /// Path to the WAL directory (or a single wal-*.log file)
        wal: PathBuf,
    },
    /// Start a paper trading session (recovery, reconciler, idle loop)
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(Some(&cli.env)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    if let Err(err) = telemetry::init_tracing(&filter, config.log_path.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    if let Err(err) = config.validate() {
        error!(error = %err, "configuration rejected");
        return ExitCode::from(EXIT_CONFIG);
    }

    let code = match cli.command {
        Commands::PreTradingCheck => pre_trading_check(&config).await,
        Commands::BreakerReset { note } => breaker_reset(&config, &note).await,
        Commands::Replay { wal } => replay_wal(&wal),
        Commands::Run => run_session(&config).await,
    };
    ExitCode::from(code)
}

async fn pre_trading_check(config: &AppConfig) -> u8 {
    let system = match session::build_system(config).await {
        Ok(system) => system,
        Err(err) => {
            error!(error = %err, "failed to assemble system");
            return exit_code_for(&err);
        }
    };
    let results = run_checks(&system, config).await;
    if report(&results) {
        EXIT_OK
    } else {
        EXIT_RECOVERABLE
    }
}

async fn breaker_reset(config: &AppConfig, note: &str) -> u8 {
    let system = match session::build_system(config).await {
        Ok(system) => system,
        Err(err) => {
            error!(error = %err, "failed to assemble system");
            return exit_code_for(&err);
        }
    };

    // The audit gates the reset; the breaker-state check itself is the
    // thing being reset, so it alone may fail.
    let results = run_checks(&system, config).await;
    report(&results);
    let blocking: Vec<_> = results
        .iter()
        .filter(|result| !result.passed && result.name != "circuit breaker state")
        .collect();
    if !blocking.is_empty() {
        error!(
            failed = blocking.len(),
            "audit failures block the breaker reset"
        );
        return EXIT_RECOVERABLE;
    }

    match system.breaker.reset(note) {
        Ok(()) => {
            info!(state = ?system.breaker.state(), "breaker reset recorded");
            println!("breaker is now {:?}", system.breaker.state());
            EXIT_OK
        }
        Err(err) => {
            error!(error = %err, "breaker reset refused");
            EXIT_RECOVERABLE
        }
    }
}

fn replay_wal(path: &PathBuf) -> u8 {
    match replay::load(path) {
        Ok(records) => {
            replay::print(&records);
            EXIT_OK
        }
        Err(err) => {
            error!(error = %err, "replay failed");
            exit_code_for(&err)
        }
    }
}

async fn run_session(config: &AppConfig) -> u8 {
    let system = match session::build_system(config).await {
        Ok(system) => system,
        Err(err) => {
            error!(error = %err, "failed to assemble system");
            return exit_code_for(&err);
        }
    };

    match system.recover().await {
        Ok(recovery) => {
            info!(?recovery, "startup recovery complete");
        }
        Err(err) => {
            error!(error = %err, "startup recovery failed; trading stays refused");
            return EXIT_RECOVERABLE;
        }
    }
    if system.breaker.state() == BreakerState::Open {
        error!("circuit breaker is OPEN; run breaker-reset after the audit passes");
        return EXIT_RECOVERABLE;
    }

    let reconciler = system.spawn_reconciler();
    info!("paper session running; press ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    reconciler.abort();
    system.shutdown(Duration::from_secs(10)).await;
    EXIT_OK
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        match cause.downcast_ref::<JournalError>() {
            Some(JournalError::Corrupt(_)) | Some(JournalError::Serialization(_)) => {
                return EXIT_CORRUPTION
            }
            _ => {}
        }
    }
    EXIT_RECOVERABLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
