use anyhow::{Context, Result};
use flume::unbounded;
use stallwatch::config::WatchConfig;
use stallwatch::runtime::WatchRuntime;
use stallwatch::server::serve;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stallwatch=debug")),
        )
        .init();

    let config = WatchConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = WatchRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap stallwatch runtime")?;

    tracing::info!(
        "Starting stallwatch (bind via STALLWATCH_BIND or PORT; config via STALLWATCH_CONFIG)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve(runtime, event_rx))
}
