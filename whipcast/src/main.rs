mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use whipcast_core::{logging, Config, EventPublisher};
use whipcast_sfu::engine::local::LocalEngine;
use whipcast_sfu::{StreamManager, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "whipcast")]
#[command(
    about = "WHIP ingest and WebSocket fan-out SFU",
    long_about = "WHIP ingest and WebSocket fan-out SFU.\n\n\
                  Runs on the in-process local media engine: signaling, SDP negotiation and \
                  stream lifecycle are complete, but its DTLS fingerprints are synthetic, so \
                  real WebRTC peers never finish the handshake and no media is forwarded."
)]
struct Args {
    /// Configuration file (YAML or TOML); missing files fall back to defaults
    #[arg(long, env = "WHIPCAST_CONFIG_PATH", default_value = "config.yaml")]
    config: String,

    /// Override `server.http_port`
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(Some(&args.config))?;
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("whipcast starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Media workers
    let shutdown = CancellationToken::new();
    let engine = Arc::new(LocalEngine::new(&(&config.media).into()));
    warn!(
        engine = "local",
        "Local media engine negotiates sessions but moves no media; real peers cannot complete DTLS"
    );
    let pool = WorkerPool::start(
        engine,
        config.media.worker_count(),
        config.media.on_worker_death,
        shutdown.clone(),
    )
    .await?;

    // 5. Downstream events and the stream manager
    let (events, event_task) = EventPublisher::from_config(&config.events)?;
    let manager = StreamManager::new(config.media.clone(), pool, events.clone());

    // 6. Serve until a signal or a fatal worker death
    server::serve_http(&config, Arc::clone(&manager), shutdown.clone()).await?;

    // 7. Tear everything down and flush pending events
    info!("Starting graceful shutdown...");
    shutdown.cancel();
    manager.shutdown();
    drop(manager);
    drop(events);

    let flush_timeout = Duration::from_secs(config.events.timeout_secs.saturating_add(1));
    if tokio::time::timeout(flush_timeout, event_task).await.is_err() {
        warn!("Timed out flushing domain events");
    }

    info!("whipcast stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_help_states_local_engine_moves_no_media() {
        let command = Args::command();
        let long_about = command.get_long_about().unwrap().to_string();
        assert!(long_about.contains("local media engine"));
        assert!(long_about.contains("no media is forwarded"));
        command.debug_assert();
    }
}
