//! Publish data to the configured subject.

use std::time::Duration;

use anyhow::{Context, Result};
use relay::{IdScheme, Message, Producer, RetryPolicy, StreamProvisioner};
use structopt::StructOpt;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::Relay;

/// Publish data to the configured subject.
///
/// With a data payload, a single message is published. Without one, a new message is published
/// on every interval until `--count` messages have been published or a shutdown signal arrives.
#[derive(StructOpt)]
#[structopt(name = "pub")]
pub struct Pub {
    /// The interval between timed publications, in milliseconds.
    #[structopt(long, default_value = "2000")]
    interval_ms: u64,
    /// Stop the timed producer after this many messages.
    #[structopt(long)]
    count: Option<u64>,
    /// The ID of the message, used as its deduplication key.
    ///
    /// Defaults to a hash of the payload, so that publishing the same data again within the
    /// duplicate window of the stream stores a single copy.
    #[structopt(long, requires = "data")]
    id: Option<String>,
    /// The total number of attempts made per message; retries reuse the message ID.
    #[structopt(long, default_value = "3")]
    attempts: u32,
    /// If true, treat the data payload as a base64 encoded binary blob.
    #[structopt(short, long, requires = "data")]
    binary: bool,
    /// The data payload to be published.
    data: Option<String>,
}

impl Pub {
    pub async fn run(&self, base: &Relay, config: &Config) -> Result<()> {
        let service = base.service(config).await?;
        StreamProvisioner::new(service.clone())
            .ensure(&config.descriptor())
            .await
            .context("error provisioning stream")?;
        let retry = RetryPolicy {
            max_attempts: self.attempts.max(1),
            ..Default::default()
        };
        let mut producer = Producer::new(service, &config.subject).with_retry_policy(retry);

        let data = match &self.data {
            Some(data) => data,
            None => return self.run_timed(producer).await,
        };

        // If the given payload is binary, base64 decode it before publishing.
        let payload = if self.binary {
            base64::decode(data.as_str()).context("error base64 decoding given payload, controlled by -b/--binary")?
        } else {
            data.as_bytes().to_vec()
        };
        let msg = match &self.id {
            Some(id) => Message::new(id.as_str(), payload),
            None => {
                producer = producer.with_id_scheme(IdScheme::ContentHash);
                producer.next_message(payload)
            }
        };
        let ack = producer.publish_message(&msg).await.context("error publishing data")?;
        tracing::info!(id = %msg.id, stream = %ack.stream, sequence = ack.sequence, duplicate = ack.duplicate, "message published");
        Ok(())
    }

    async fn run_timed(&self, mut producer: Producer) -> Result<()> {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let listener = crate::spawn_signal_listener(shutdown)?;
        tracing::info!(subject = %producer.subject(), interval_ms = self.interval_ms, "starting timed producer");
        let published = producer
            .run(Duration::from_millis(self.interval_ms), self.count, shutdown_rx, |n| {
                format!("Message content {}", n).into_bytes()
            })
            .await;
        listener.abort();
        tracing::info!(published, "producer shutdown complete");
        Ok(())
    }
}
