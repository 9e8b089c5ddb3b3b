//! Run the whole pipeline in-process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay::{ConsumerConfig, LogService, MemoryLogService, Producer, StreamProvisioner};
use structopt::StructOpt;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::handler::LogHandler;
use crate::Relay;

/// The interval at which demo progress is checked.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

/// Provision, publish and consume against an in-process log service.
#[derive(StructOpt)]
#[structopt(name = "demo")]
pub struct Demo {
    /// The number of messages to publish.
    #[structopt(long, default_value = "25")]
    messages: u64,
    /// The number of concurrent workers.
    #[structopt(long, default_value = "3")]
    workers: usize,
    /// The capacity of the dispatch channel.
    #[structopt(long, default_value = "10")]
    capacity: usize,
    /// Simulate processing work by pausing up to this many milliseconds per message.
    #[structopt(long, default_value = "20")]
    work_ms: u64,
}

impl Demo {
    pub async fn run(&self, _base: &Relay, config: &Config) -> Result<()> {
        let memory = MemoryLogService::new();
        let service: Arc<dyn LogService> = Arc::new(memory.clone());
        let descriptor = config.descriptor();
        StreamProvisioner::new(service.clone())
            .ensure(&descriptor)
            .await
            .context("error provisioning demo stream")?;

        let mut producer = Producer::new(service.clone(), &config.subject);
        for n in 1..=self.messages {
            producer
                .publish(format!("Message content {}", n))
                .await
                .context("error publishing demo message")?;
        }
        tracing::info!(messages = self.messages, "demo messages published");

        let consumer_config = ConsumerConfig {
            worker_count: self.workers,
            channel_capacity: Some(self.capacity),
            max_wait: Duration::from_millis(500),
            consumer_name: config.consumer.clone(),
            ..Default::default()
        };
        let handler = Arc::new(LogHandler { max_work_ms: Some(self.work_ms) });
        let handle = relay::start(service, descriptor.clone(), consumer_config, handler);

        let mut signals = crate::signals()?;
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        loop {
            tokio::select! {
                Some((name, _)) = signals.next() => {
                    tracing::info!(signal = name, "signal received, stopping demo early");
                    break;
                }
                _ = handle.stopped() => break,
                _ = progress.tick() => {
                    let acked = memory.stream_state(&descriptor.name).await.map(|state| state.acked.len()).unwrap_or(0);
                    if acked as u64 >= self.messages {
                        break;
                    }
                }
            }
        }

        let summary = handle.stop().await.context("demo consumer run failed")?;
        let acked = memory.stream_state(&descriptor.name).await.map(|state| state.acked.len()).unwrap_or(0);
        tracing::info!(
            acked,
            processed = summary.processed,
            peak_occupancy = summary.peak_occupancy,
            capacity = self.capacity,
            "demo complete"
        );
        Ok(())
    }
}
