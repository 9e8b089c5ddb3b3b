//! Consume the configured stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay::ConsumerConfig;
use structopt::StructOpt;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::handler::LogHandler;
use crate::Relay;

/// Consume the configured stream with a bounded worker pool.
#[derive(StructOpt)]
#[structopt(name = "sub")]
pub struct Sub {
    /// The number of concurrent workers.
    #[structopt(long, default_value = "10")]
    workers: usize,
    /// The capacity of the dispatch channel, defaults to the number of workers.
    #[structopt(long)]
    capacity: Option<usize>,
    /// The maximum number of messages requested per fetch.
    #[structopt(long, default_value = "10")]
    batch: usize,
    /// The maximum time a fetch waits for messages, in milliseconds.
    #[structopt(long, default_value = "5000")]
    max_wait_ms: u64,
    /// The maximum time to wait for in-flight messages on shutdown, defaults to no limit.
    #[structopt(long)]
    drain_timeout_secs: Option<u64>,
    /// Simulate processing work by pausing up to this many milliseconds per message.
    #[structopt(long)]
    work_ms: Option<u64>,
}

impl Sub {
    pub async fn run(&self, base: &Relay, config: &Config) -> Result<()> {
        let service = base.service(config).await?;
        let consumer_config = ConsumerConfig {
            worker_count: self.workers,
            channel_capacity: self.capacity,
            max_batch: self.batch,
            max_wait: Duration::from_millis(self.max_wait_ms),
            consumer_name: config.consumer.clone(),
            filter_subject: config.subject.clone(),
            drain_timeout: self.drain_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        };
        let handler = Arc::new(LogHandler { max_work_ms: self.work_ms });

        tracing::info!(stream = %config.stream_name, workers = self.workers, "subscribing to stream");
        let handle = relay::start(service, config.descriptor(), consumer_config, handler);
        let mut signals = crate::signals()?;
        tokio::select! {
            Some((name, _)) = signals.next() => tracing::info!(signal = name, "signal received, beginning graceful shutdown"),
            _ = handle.stopped() => (),
        }

        let summary = handle.stop().await.context("consumer run failed")?;
        tracing::info!(
            dispatched = summary.dispatched,
            processed = summary.processed,
            peak_occupancy = summary.peak_occupancy,
            drained = summary.drained,
            "subscriber shutdown complete"
        );
        Ok(())
    }
}
