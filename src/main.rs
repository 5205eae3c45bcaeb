//! Binary entry point: parses the CLI, loads configuration, sets up logging,
//! and runs the supervisor to completion.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;

use can_telemetry_agent::cli::Cli;
use can_telemetry_agent::config::Config;
use can_telemetry_agent::supervisor::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_tracing(&config.logging);

    let mode = cli.mode();
    let supervisor = Supervisor::new(config, mode);

    match can_telemetry_agent::run_with_shutdown(supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "edge agent exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Configure the global tracing subscriber per `logging.*`. Returns the
/// optional non-blocking file-appender guard, which must be held for the
/// lifetime of the process if log file output is enabled.
fn init_tracing(logging: &can_telemetry_agent::config::LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = logging.format.eq_ignore_ascii_case("json");

    let (file_writer, guard) = match &logging.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("can-telemetry-agent.log");
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);

    match (file_writer, json) {
        (Some(writer), true) => {
            registry.with(tracing_subscriber::fmt::layer().json().with_writer(writer)).init();
        }
        (Some(writer), false) => {
            registry.with(tracing_subscriber::fmt::layer().with_writer(writer)).init();
        }
        (None, true) => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        (None, false) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    guard
}
