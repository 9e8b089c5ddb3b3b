//! Idempotent message producer.

use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::{ConnectionClosed, PublishError};
use crate::metrics::{METRIC_PUBLISHED, METRIC_PUBLISH_DUPLICATES, METRIC_PUBLISH_FAILURES};
use crate::model::Message;
use crate::service::{LogService, PublishAck};

/// The default interval of a timed producer.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(2);
/// The shortest interval of a timed producer.
pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_millis(1);

/// The scheme used to assign IDs to new logical messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdScheme {
    /// IDs of the form `{prefix}-{n}`, where `n` counts logical messages from 1.
    Sequence { prefix: String },
    /// IDs derived from a hash of the payload, so identical payloads share an ID.
    ContentHash,
}

impl Default for IdScheme {
    fn default() -> Self {
        Self::Sequence { prefix: "msg".into() }
    }
}

/// The retry behavior of a producer when a publication fails.
///
/// Every retry reuses the ID of the original attempt, so the log service stores at most one
/// copy of the logical message regardless of which attempt actually landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of attempts made, including the first.
    pub max_attempts: u32,
    /// The pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A policy which makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// A producer of messages on a single subject.
pub struct Producer {
    service: Arc<dyn LogService>,
    subject: String,
    ids: IdScheme,
    retry: RetryPolicy,
    /// The number of logical messages created so far.
    created: u64,
}

impl Producer {
    /// Create a new instance publishing on the given subject.
    pub fn new(service: Arc<dyn LogService>, subject: impl Into<String>) -> Self {
        Self {
            service,
            subject: subject.into(),
            ids: IdScheme::default(),
            retry: RetryPolicy::default(),
            created: 0,
        }
    }

    /// Use the given ID scheme for new messages.
    pub fn with_id_scheme(mut self, ids: IdScheme) -> Self {
        self.ids = ids;
        self
    }

    /// Use the given retry policy for failed publications.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The subject this producer publishes on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Create the next logical message, assigning it an ID.
    pub fn next_message(&mut self, payload: impl Into<Vec<u8>>) -> Message {
        self.created += 1;
        let payload = payload.into();
        let id = match &self.ids {
            IdScheme::Sequence { prefix } => format!("{}-{}", prefix, self.created),
            IdScheme::ContentHash => {
                let mut hasher = seahash::SeaHasher::new();
                hasher.write(&payload);
                format!("{:016x}", hasher.finish())
            }
        };
        Message::new(id, payload)
    }

    /// Publish the given content as a new logical message.
    pub async fn publish(&mut self, content: impl Into<Vec<u8>>) -> Result<PublishAck, PublishError> {
        let msg = self.next_message(content);
        self.publish_message(&msg).await
    }

    /// Publish an already identified message.
    ///
    /// Failed attempts are retried according to the retry policy of this producer, always with
    /// the ID of the given message.
    pub async fn publish_message(&self, msg: &Message) -> Result<PublishAck, PublishError> {
        let res = self.publish_with_retry(msg, None).await?;
        res.ok_or_else(|| PublishError {
            id: msg.id.clone(),
            source: anyhow!("publication interrupted"),
        })
    }

    /// Publish with retries. Returns `None` if shutdown was signalled during a retry backoff.
    #[tracing::instrument(level = "debug", skip(self, msg, shutdown), fields(id = %msg.id, subject = %self.subject))]
    async fn publish_with_retry(
        &self, msg: &Message, mut shutdown: Option<&mut BroadcastStream<()>>,
    ) -> Result<Option<PublishAck>, PublishError> {
        let payload = msg.encode().map_err(|source| PublishError { id: msg.id.clone(), source })?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.service.publish(&self.subject, payload.clone(), &msg.id).await {
                Ok(ack) => {
                    if ack.duplicate {
                        tracing::debug!(id = %msg.id, sequence = ack.sequence, "publication suppressed as duplicate");
                        metrics::increment_counter!(METRIC_PUBLISH_DUPLICATES);
                    } else {
                        tracing::debug!(id = %msg.id, sequence = ack.sequence, stream = %ack.stream, "message published");
                        metrics::increment_counter!(METRIC_PUBLISHED);
                    }
                    return Ok(Some(ack));
                }
                Err(source) => {
                    metrics::increment_counter!(METRIC_PUBLISH_FAILURES);
                    let closed = source.downcast_ref::<ConnectionClosed>().is_some();
                    if closed || attempt >= max_attempts {
                        return Err(PublishError { id: msg.id.clone(), source });
                    }
                    tracing::warn!(error = ?source, id = %msg.id, attempt, "error publishing message, retrying with the same id");
                    attempt += 1;
                    match shutdown.as_deref_mut() {
                        Some(shutdown) => tokio::select! {
                            _ = tokio::time::sleep(self.retry.backoff) => (),
                            _ = shutdown.next() => return Ok(None),
                        },
                        None => tokio::time::sleep(self.retry.backoff).await,
                    }
                }
            }
        }
    }

    /// Publish a new logical message every `interval` until shutdown is signalled or `limit`
    /// messages have been published.
    ///
    /// The content of each message is built by `content`, given the 1-based cycle number. A
    /// cycle whose publication fails is logged and skipped. An interval shorter than
    /// `MIN_PUBLISH_INTERVAL` is raised to it. Returns the number of messages acknowledged by
    /// the log service.
    #[tracing::instrument(level = "debug", skip(self, shutdown, content), fields(subject = %self.subject))]
    pub async fn run<F>(&mut self, interval: Duration, limit: Option<u64>, shutdown: broadcast::Receiver<()>, mut content: F) -> u64
    where
        F: FnMut(u64) -> Vec<u8> + Send,
    {
        let interval = interval.max(MIN_PUBLISH_INTERVAL);
        let mut shutdown = BroadcastStream::new(shutdown);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let (mut cycle, mut published) = (0u64, 0u64);
        while limit.map_or(true, |limit| published < limit) {
            tokio::select! {
                _ = ticker.tick() => (),
                _ = shutdown.next() => break,
            }
            cycle += 1;
            let msg = self.next_message(content(cycle));
            match self.publish_with_retry(&msg, Some(&mut shutdown)).await {
                Ok(Some(ack)) => {
                    published += 1;
                    tracing::info!(id = %msg.id, sequence = ack.sequence, duplicate = ack.duplicate, "published message");
                }
                Ok(None) => {
                    tracing::debug!(id = %msg.id, "shutdown signalled while retrying publication");
                    break;
                }
                Err(err) => tracing::error!(error = %err, "skipping publish cycle"),
            }
        }
        tracing::debug!(published, "producer stopped");
        published
    }
}
