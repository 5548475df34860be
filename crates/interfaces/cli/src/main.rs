use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tinymem_config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "tinymem",
    version,
    about = "Transactional state-ledger proxy for stateless LLM backends"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/tinymem.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Configuration errors are fatal before anything else starts; exit 1
    // with the offending field in the message.
    let config = AppConfig::load_from(&cli.config)?;

    let _log_guard = init_logging(&config)?;
    tracing::info!(
        config = %cli.config,
        listen = %config.proxy.listen_address,
        model = %config.llm.llm_model,
        "tinymem starting"
    );

    tinymem_server::run(config, shutdown_signal()).await?;
    tracing::info!("tinymem stopped");
    Ok(())
}

/// File logging per `logging.log_path`; `logging.debug` lowers the default
/// filter. `RUST_LOG` still wins when set.
fn init_logging(config: &AppConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = Path::new(&config.logging.log_path);
    let directory = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(directory) = directory {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating log directory {}", directory.display()))?;
    }
    let filename = log_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "tinymem.log".to_string());
    let appender = tracing_appender::rolling::never(
        directory.unwrap_or_else(|| Path::new(".")),
        filename,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let default_filter = if config.logging.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

/// SIGINT or SIGTERM starts the graceful shutdown.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = sigint.recv() => tracing::info!("SIGINT received"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to wait for ctrl-c");
        }
    }
}
