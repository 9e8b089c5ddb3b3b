//! The Relay CLI.

mod cmd;
mod config;
mod handler;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay::{JetStreamService, LogService};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// The Relay CLI.
#[derive(StructOpt)]
#[structopt(name = "relay")]
pub struct Relay {
    #[structopt(subcommand)]
    action: RelaySubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    /// Set the URL of the NATS server, overriding RELAY_NATS_URL.
    #[structopt(long)]
    url: Option<String>,
}

impl Relay {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config, falling back to RUST_LOG.
        let fmt_layer = fmt::layer().with_target(true);
        let (filter_layer, level_filter) = if self.verbose {
            (EnvFilter::new("debug"), LevelFilter::DEBUG)
        } else {
            (EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")), LevelFilter::TRACE)
        };
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(level_filter)
            .try_init()
            .context("error initializing logging/tracing system")?;
        relay::register_metrics();

        let config = Config::new()?;
        match &self.action {
            RelaySubcommands::Provision(inner) => inner.run(&self, &config).await,
            RelaySubcommands::Pub(inner) => inner.run(&self, &config).await,
            RelaySubcommands::Sub(inner) => inner.run(&self, &config).await,
            RelaySubcommands::Demo(inner) => inner.run(&self, &config).await,
        }
    }

    /// Connect to the log service based on runtime config.
    pub async fn service(&self, config: &Config) -> Result<Arc<dyn LogService>> {
        let url = self.url.as_deref().unwrap_or(&config.nats_url);
        tracing::debug!(url, "connecting to NATS");
        let service = JetStreamService::connect(url).await?;
        Ok(Arc::new(service))
    }
}

#[derive(StructOpt)]
enum RelaySubcommands {
    /// Ensure the configured stream exists.
    Provision(cmd::provision::Provision),
    /// Publish data to the configured subject.
    Pub(cmd::r#pub::Pub),
    /// Consume the configured stream with a bounded worker pool.
    Sub(cmd::sub::Sub),
    /// Provision, publish and consume against an in-process log service.
    Demo(cmd::demo::Demo),
}

/// Build a stream of the signals which request a graceful shutdown.
pub(crate) fn signals() -> Result<StreamMap<&'static str, SignalStream>> {
    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
    Ok(signals)
}

/// Spawn a task which broadcasts on `shutdown` once a shutdown signal is received.
pub(crate) fn spawn_signal_listener(shutdown: broadcast::Sender<()>) -> Result<JoinHandle<()>> {
    let mut signals = signals()?;
    Ok(tokio::spawn(async move {
        if let Some((name, _)) = signals.next().await {
            tracing::info!(signal = name, "signal received, beginning graceful shutdown");
            let _ = shutdown.send(());
        }
    }))
}
