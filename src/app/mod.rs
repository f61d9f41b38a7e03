pub mod cli;
pub mod config;
pub mod logging;

pub use cli::Cli;
pub use config::{ConfigError, LogFormat, LogLevel, ShipperConfig};
pub use logging::{LoggingError, init_logging};

use crate::domain::Event;
use crate::sender::{HttpTransport, HttpTransportConfig, StaticTokenProvider, TokenProvider};
use crate::shipper::{Capabilities, EventShipper, ShutdownSummary};
use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Turns one input line into an event. Lines that are not event JSON are
/// wrapped as a `line` event carrying the raw text.
pub fn parse_line(line: &str) -> Option<Event> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Event>(trimmed) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Input line is not an event ({}); wrapping it", e);
            Some(Event::new(
                "line",
                serde_json::json!({
                    "message": trimmed,
                    "host": hostname::get().ok().and_then(|h| h.into_string().ok()),
                }),
            ))
        }
    }
}

/// Feeds every line of `reader` to the shipper until EOF or until the
/// shipper stops accepting events. Returns `(read, accepted)`.
pub async fn pump<R>(reader: R, shipper: &EventShipper) -> std::io::Result<(u64, u64)>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut read = 0u64;
    let mut accepted = 0u64;

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_line(&line) else {
            continue;
        };
        read += 1;
        if shipper.log(event) {
            accepted += 1;
        } else if shipper.lifecycle() != crate::shipper::Lifecycle::Running {
            break;
        }
    }

    Ok((read, accepted))
}

async fn replay_previous_spills(shipper: &EventShipper) {
    let Some(reader) = shipper.spill_reader() else {
        warn!("--replay-spill given but spillover is not configured");
        return;
    };

    let files = match reader.list_files().await {
        Ok(files) => files,
        Err(e) => {
            warn!("Could not list spill files: {}", e);
            return;
        }
    };

    for path in files {
        match shipper.replay_spill_file(&path).await {
            Ok(count) => debug!("Replayed {} events from {}", count, path.display()),
            Err(e) => warn!("Failed to replay {}: {}", path.display(), e),
        }
    }
}

async fn pump_input(input: Option<&Path>, shipper: &EventShipper) -> anyhow::Result<(u64, u64)> {
    let counts = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            pump(BufReader::new(file), shipper).await?
        }
        None => pump(BufReader::new(tokio::io::stdin()), shipper).await?,
    };
    Ok(counts)
}

pub async fn run(cli: Cli) -> anyhow::Result<ShutdownSummary> {
    cli.validate()?;
    let config = cli.shipper_config()?;

    let token_provider: Option<Arc<dyn TokenProvider>> = cli
        .token
        .as_ref()
        .map(|token| Arc::new(StaticTokenProvider::new(token.clone())) as Arc<dyn TokenProvider>);
    let transport = HttpTransport::new(
        HttpTransportConfig {
            endpoint: cli.endpoint.clone(),
            timeout: cli.request_timeout(),
            compress_above: Some(cli.compress_above),
            ..Default::default()
        },
        token_provider,
    )?;

    let shipper = EventShipper::start(
        config,
        Capabilities::new()
            .transport(Arc::new(transport))
            .on_event_loss(|event, reason| {
                debug!(event_id = %event.event_id, %reason, "Event left the delivery path");
            }),
    )?;

    #[cfg(feature = "metrics")]
    if let Some(port) = cli.metrics_port {
        let exporter = crate::reliability::PrometheusExporter::new(port, shipper.clone());
        tokio::spawn(exporter.serve());
    }
    #[cfg(not(feature = "metrics"))]
    if cli.metrics_port.is_some() {
        warn!("Built without the metrics feature; ignoring --metrics-port");
    }

    if cli.replay_spill {
        replay_previous_spills(&shipper).await;
    }

    info!("Starting rask-event-shipper v{}", crate::VERSION);

    ship_input(&shipper, cli.input.as_deref()).await
}

/// Resolves on SIGINT or SIGTERM. Never resolves if no listener could be
/// installed.
async fn shutdown_signal() {
    if !crate::shipper::signal::wait_for_signal().await {
        std::future::pending::<()>().await;
    }
}

/// Pumps `input` (stdin when `None`) into the shipper until EOF or a
/// shutdown signal, then shuts the shipper down. The shutdown runs even when
/// reading the input fails; the read error is returned afterwards.
pub async fn ship_input(
    shipper: &EventShipper,
    input: Option<&Path>,
) -> anyhow::Result<ShutdownSummary> {
    let pumped = pump_input(input, shipper);

    let pumped = tokio::select! {
        result = pumped => Some(result),
        _ = shutdown_signal() => None,
    };

    match &pumped {
        Some(Ok((read, accepted))) => info!(read, accepted, "Input exhausted"),
        Some(Err(e)) => warn!("Reading input failed, shutting down: {:#}", e),
        None => {}
    }

    let summary = shipper.shutdown().await;
    if let Some(Err(e)) = pumped {
        return Err(e);
    }
    Ok(summary)
}

pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_level, cli.log_format) {
        eprintln!("Warning: {e}");
    }

    let summary = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
