mod command;
mod config;
mod connection;
mod exerciser;
mod transport;

use command::FixedCommandSource;
use config::CommanderConfig;
use exerciser::{Exerciser, ExerciserSettings, LogReporter};
use std::sync::Arc;
use transport::TcpTransport;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let config = CommanderConfig::from_env()?;

    info!("Command exerciser starting");
    info!("  Device: {}:{}", config.tenant_id, config.device_id);
    info!("  Endpoint: {}", config.server_addr);
    info!("  Command: {}", config.command.name);

    let transport = Arc::new(TcpTransport::new(config.connection()));
    let source = Arc::new(FixedCommandSource::from(&config.command));
    let exerciser = Exerciser::new(transport, source, ExerciserSettings::from(&config))
        .with_reporter(Arc::new(LogReporter));
    info!(
        "  Worker pool: {} ({} workers)",
        exerciser.pool().name(),
        exerciser.pool().size()
    );

    let result = tokio::select! {
        result = exerciser.run() => result.map(Some),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Ok(None)
        }
    };
    exerciser.close().await;

    match result {
        Ok(Some(stats)) => {
            info!(
                "Finished: {} dispatched, {} succeeded, {} failed, {} stale across {} epoch(s)",
                stats.dispatched, stats.succeeded, stats.failed, stats.stale, stats.epochs
            );
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            error!("Exerciser stopped: {}", e);
            Err(e.into())
        }
    }
}

/// `RUST_LOG` directives when present and valid, `info` otherwise
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
