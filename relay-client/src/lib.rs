//! Relay: a bounded-concurrency pull consumer and idempotent producer for durable message streams.
//!
//! The consumer pulls batches from a durable log service and hands each delivery through a
//! bounded dispatch channel to a fixed pool of workers. The channel capacity is the single point
//! of backpressure: a slow pool throttles how fast new work is pulled.

mod dispatch;
mod error;
mod fetcher;
mod handler;
mod lifecycle;
mod metrics;
mod model;
mod producer;
mod provisioner;
pub mod service;
mod worker;

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod lifecycle_test;
#[cfg(test)]
mod provisioner_test;

pub use crate::dispatch::{channel as dispatch_channel, DispatchReceiver, DispatchSender, Dispatched};
pub use crate::error::{AckError, ConnectionClosed, DecodeError, FetchError, ProvisionError, PublishError, RunError};
pub use crate::fetcher::{Fetcher, DEFAULT_ERROR_BACKOFF, DEFAULT_MAX_BATCH, DEFAULT_MAX_WAIT, MIN_EMPTY_FETCH_INTERVAL};
pub use crate::handler::MessageHandler;
pub use crate::lifecycle::{start, ConsumerConfig, RunHandle, RunState, RunSummary};
pub use crate::metrics::register_metrics;
pub use crate::model::{subject_matches, Message, RetentionPolicy, StorageType, StreamDescriptor};
pub use crate::producer::{IdScheme, Producer, RetryPolicy, DEFAULT_PUBLISH_INTERVAL, MIN_PUBLISH_INTERVAL};
pub use crate::provisioner::{Provisioned, StreamProvisioner};
pub use crate::service::{DeliveryHandle, DeliveryInfo, JetStreamService, LogService, MemoryLogService, PublishAck};
pub use crate::worker::{WorkerPool, DEFAULT_WORKER_COUNT};
pub use async_trait::async_trait;
