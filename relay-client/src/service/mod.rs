//! The durable log service consumed by Relay.
//!
//! A log service owns streams, consumer positions, duplicate detection and redelivery. Relay
//! only ever talks to it through the traits here.

pub mod jetstream;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{AckError, DecodeError};
use crate::model::{Message, StreamDescriptor};

pub use self::jetstream::JetStreamService;
pub use self::memory::MemoryLogService;

/// A durable, append-only, replayable message store.
///
/// Implementations must tolerate concurrent use by the fetch loop and all workers.
#[async_trait]
pub trait LogService: Send + Sync + 'static {
    /// Get the descriptor of the named stream, or `None` if it does not exist.
    async fn stream_info(&self, name: &str) -> Result<Option<StreamDescriptor>>;

    /// Create a stream from the given descriptor.
    async fn create_stream(&self, descriptor: &StreamDescriptor) -> Result<StreamCreated>;

    /// Publish a payload on the given subject, tagged with the given deduplication key.
    async fn publish(&self, subject: &str, payload: Bytes, dedup_key: &str) -> Result<PublishAck>;

    /// Bind a durable pull consumer on the named stream, creating it if needed.
    async fn consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Arc<dyn PullConsumer>>;
}

/// A durable pull consumer bound to a stream.
#[async_trait]
pub trait PullConsumer: Send + Sync + 'static {
    /// Request up to `max_batch` undelivered occurrences, waiting at most `max_wait`.
    ///
    /// An empty batch is the normal outcome of a wait which elapsed with nothing to deliver.
    async fn fetch(&self, max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>>;

    /// Release this consumer binding. Durable consumer state stays with the log service.
    async fn release(&self) -> Result<()>;
}

/// The log service side of acknowledging one delivered occurrence.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Mark the occurrence as durably consumed.
    async fn ack(&self, info: &DeliveryInfo) -> Result<()>;

    /// Ask the log service to redeliver the occurrence.
    async fn nak(&self, info: &DeliveryInfo) -> Result<()>;
}

/// The outcome of a stream creation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCreated {
    Created,
    AlreadyExists,
}

/// The log service's acknowledgement of a publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// The stream which stored the message.
    pub stream: String,
    /// The stream sequence of the stored message.
    pub sequence: u64,
    /// `true` if the message was suppressed as a duplicate of an earlier publication.
    pub duplicate: bool,
}

/// The configuration of a durable pull consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// The durable name of the consumer.
    pub durable_name: String,
    /// Only deliver messages published on subjects matching this filter; empty for all.
    pub filter_subject: String,
    /// The amount of time after which an unacknowledged delivery becomes eligible for redelivery.
    pub ack_wait: Duration,
    /// The maximum number of delivery attempts per message; `-1` for unlimited.
    pub max_deliver: i64,
    /// The maximum number of outstanding unacknowledged deliveries; `0` for the service default.
    pub max_ack_pending: i64,
}

/// Metadata describing one delivery of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// The sequence of the message in its stream.
    pub stream_sequence: u64,
    /// The sequence of this delivery for its consumer.
    pub consumer_sequence: u64,
    /// The number of times this message has been delivered, including this delivery.
    pub delivered: i64,
}

/// A delivered but not yet acknowledged occurrence of a message.
///
/// `ack` and `nak` consume the handle, so an occurrence is resolved at most once. A handle
/// dropped without either is redelivered by the log service once its ack wait elapses.
pub struct DeliveryHandle {
    payload: Bytes,
    info: DeliveryInfo,
    acker: Box<dyn Acknowledger>,
}

impl DeliveryHandle {
    /// Create a new instance.
    pub fn new(payload: Bytes, info: DeliveryInfo, acker: Box<dyn Acknowledger>) -> Self {
        Self { payload, info, acker }
    }

    /// The raw payload of this delivery.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The delivery metadata of this occurrence.
    pub fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    /// Decode the payload of this delivery.
    pub fn decode(&self) -> Result<Message, DecodeError> {
        Message::decode(&self.payload)
    }

    /// Acknowledge this occurrence.
    pub async fn ack(self) -> Result<(), AckError> {
        let sequence = self.info.stream_sequence;
        self.acker
            .ack(&self.info)
            .await
            .map_err(|source| AckError::Ack { sequence, source })
    }

    /// Negatively acknowledge this occurrence, requesting redelivery.
    pub async fn nak(self) -> Result<(), AckError> {
        let sequence = self.info.stream_sequence;
        self.acker
            .nak(&self.info)
            .await
            .map_err(|source| AckError::Nak { sequence, source })
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("info", &self.info)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
