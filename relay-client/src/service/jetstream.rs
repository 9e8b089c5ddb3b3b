//! NATS JetStream log service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer as NatsPullConsumer};
use async_nats::jetstream::context::{CreateStreamErrorKind, GetStreamErrorKind};
use async_nats::jetstream::{self, stream, AckKind, ErrorCode};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::prelude::*;

use crate::error::ConnectionClosed;
use crate::model::{RetentionPolicy, StorageType, StreamDescriptor};
use crate::service::{Acknowledger, ConsumerSpec, DeliveryHandle, DeliveryInfo, LogService, PublishAck, PullConsumer, StreamCreated};

/// The number of consecutive failed reconnect attempts after which the connection is considered lost.
const MAX_RECONNECTS: usize = 5;
/// The delay between reconnect attempts.
const RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// A log service backed by NATS JetStream.
///
/// Reconnection is handled by the NATS client itself; transport errors surface from individual
/// calls and are retried by the callers. Once `MAX_RECONNECTS` consecutive reconnect attempts
/// have failed, every call fails with `ConnectionClosed`.
#[derive(Clone)]
pub struct JetStreamService {
    context: jetstream::Context,
    monitor: ConnectionMonitor,
}

impl JetStreamService {
    /// Connect to the NATS server at the given URL.
    #[tracing::instrument(level = "debug")]
    pub async fn connect(url: &str) -> Result<Self> {
        let monitor = ConnectionMonitor::default();
        let delays = monitor.clone();
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(move |attempts| delays.reconnect_delay(attempts))
            .connect(url)
            .await
            .with_context(|| format!("error connecting to NATS at {}", url))?;
        Ok(Self::with_monitor(client, monitor))
    }

    /// Create a new instance from an established client.
    ///
    /// The connection of a client built this way is never considered lost by this service.
    pub fn new(client: Client) -> Self {
        Self::with_monitor(client, ConnectionMonitor::default())
    }

    fn with_monitor(client: Client, monitor: ConnectionMonitor) -> Self {
        Self {
            context: jetstream::new(client),
            monitor,
        }
    }
}

/// Tracks reconnect attempts of a NATS client, and marks its connection lost once they run out.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionMonitor {
    closed: Arc<AtomicBool>,
}

impl ConnectionMonitor {
    /// Compute the delay before the given reconnect attempt. `attempts` resets on reconnect.
    pub(crate) fn reconnect_delay(&self, attempts: usize) -> Duration {
        if attempts > MAX_RECONNECTS && !self.closed.swap(true, Ordering::SeqCst) {
            tracing::error!(attempts, "NATS reconnect attempts exhausted, treating connection as closed");
        }
        RECONNECT_WAIT
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail fast once the connection has been lost.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!(ConnectionClosed));
        }
        Ok(())
    }

    /// Tag the given error as a closed connection if the connection has been lost.
    pub(crate) fn classify(&self, err: anyhow::Error) -> anyhow::Error {
        if self.is_closed() {
            err.context(ConnectionClosed)
        } else {
            err
        }
    }
}

#[async_trait]
impl LogService for JetStreamService {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamDescriptor>> {
        self.monitor.check()?;
        match self.context.get_stream(name).await {
            Ok(stream) => Ok(Some(descriptor_from_config(&stream.cached_info().config))),
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(inner) if inner.error_code() == ErrorCode::STREAM_NOT_FOUND => Ok(None),
                _ => Err(self.monitor.classify(anyhow!(err).context(format!("error fetching info of stream {}", name)))),
            },
        }
    }

    async fn create_stream(&self, descriptor: &StreamDescriptor) -> Result<StreamCreated> {
        self.monitor.check()?;
        match self.context.create_stream(config_from_descriptor(descriptor)).await {
            Ok(_) => Ok(StreamCreated::Created),
            Err(err) => match err.kind() {
                CreateStreamErrorKind::JetStream(inner) if inner.error_code() == ErrorCode::STREAM_NAME_EXIST => Ok(StreamCreated::AlreadyExists),
                _ => Err(self.monitor.classify(anyhow!(err).context(format!("error creating stream {}", descriptor.name)))),
            },
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes, dedup_key: &str) -> Result<PublishAck> {
        self.monitor.check()?;
        let mut headers = HeaderMap::new();
        if !dedup_key.is_empty() {
            headers.insert(async_nats::header::NATS_MESSAGE_ID, dedup_key);
        }
        let ack = async {
            self.context
                .publish_with_headers(subject.to_string(), headers, payload)
                .await
                .context("error submitting publication")?
                .await
                .context("error awaiting publication ack")
        }
        .await
        .map_err(|err| self.monitor.classify(err))?;
        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Arc<dyn PullConsumer>> {
        self.monitor.check()?;
        let target = self
            .context
            .get_stream(stream)
            .await
            .with_context(|| format!("error fetching stream {}", stream))
            .map_err(|err| self.monitor.classify(err))?;
        let config = PullConfig {
            durable_name: Some(spec.durable_name.clone()),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            max_ack_pending: spec.max_ack_pending,
            filter_subject: spec.filter_subject.clone(),
            ..Default::default()
        };
        let consumer: NatsPullConsumer = target
            .get_or_create_consumer(&spec.durable_name, config)
            .await
            .with_context(|| format!("error binding durable consumer {}", spec.durable_name))
            .map_err(|err| self.monitor.classify(err))?;
        Ok(Arc::new(JetStreamConsumer {
            consumer,
            name: spec.durable_name.clone(),
            monitor: self.monitor.clone(),
        }))
    }
}

/// A durable JetStream pull consumer.
struct JetStreamConsumer {
    consumer: NatsPullConsumer,
    name: String,
    monitor: ConnectionMonitor,
}

impl JetStreamConsumer {
    async fn fetch_batch(&self, max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|err| anyhow!(err).context("error requesting batch"))?;

        let mut handles = Vec::with_capacity(max_batch);
        while let Some(msg_res) = batch.next().await {
            let msg = msg_res.map_err(|err| anyhow!(err).context("error receiving batch"))?;
            let info = match msg.info() {
                Ok(info) => DeliveryInfo {
                    stream_sequence: info.stream_sequence,
                    consumer_sequence: info.consumer_sequence,
                    delivered: info.delivered,
                },
                Err(err) => {
                    tracing::warn!(error = ?err, subject = ?msg.subject, "delivery without JetStream metadata, skipping");
                    continue;
                }
            };
            let payload = msg.payload.clone();
            let acker = JetStreamAcker {
                msg,
                monitor: self.monitor.clone(),
            };
            handles.push(DeliveryHandle::new(payload, info, Box::new(acker)));
        }
        Ok(handles)
    }
}

#[async_trait]
impl PullConsumer for JetStreamConsumer {
    async fn fetch(&self, max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        self.monitor.check()?;
        self.fetch_batch(max_batch, max_wait).await.map_err(|err| self.monitor.classify(err))
    }

    async fn release(&self) -> Result<()> {
        tracing::debug!(consumer = %self.name, "releasing durable consumer binding, position is retained by the server");
        Ok(())
    }
}

/// Acknowledges a single JetStream delivery.
struct JetStreamAcker {
    msg: jetstream::Message,
    monitor: ConnectionMonitor,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self, _info: &DeliveryInfo) -> Result<()> {
        self.monitor.check()?;
        self.msg.ack().await.map_err(|err| self.monitor.classify(anyhow!(err)))
    }

    async fn nak(&self, _info: &DeliveryInfo) -> Result<()> {
        self.monitor.check()?;
        self.msg
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|err| self.monitor.classify(anyhow!(err)))
    }
}

/// Build a JetStream stream config from the given descriptor.
fn config_from_descriptor(descriptor: &StreamDescriptor) -> stream::Config {
    stream::Config {
        name: descriptor.name.clone(),
        subjects: descriptor.subjects.clone(),
        retention: match descriptor.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        storage: match descriptor.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        max_age: descriptor.max_age,
        num_replicas: descriptor.replicas,
        discard: stream::DiscardPolicy::Old,
        max_messages: -1,
        max_bytes: -1,
        duplicate_window: descriptor.duplicate_window,
        ..Default::default()
    }
}

/// Build a descriptor from the config of an existing JetStream stream.
fn descriptor_from_config(config: &stream::Config) -> StreamDescriptor {
    StreamDescriptor {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        },
        storage: match config.storage {
            stream::StorageType::File => StorageType::File,
            stream::StorageType::Memory => StorageType::Memory,
        },
        max_age: config.max_age,
        replicas: config.num_replicas,
        duplicate_window: config.duplicate_window,
    }
}
