//! An in-process log service.
//!
//! This service keeps streams entirely in memory. It honors subject wildcards, the duplicate
//! window of each stream, explicit ack with ack-wait based redelivery, and nak based immediate
//! redelivery. It is used for tests and for local demos; it is not durable across restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::ConnectionClosed;
use crate::model::{subject_matches, RetentionPolicy, StreamDescriptor};
use crate::service::{Acknowledger, ConsumerSpec, DeliveryHandle, DeliveryInfo, LogService, PublishAck, PullConsumer, StreamCreated};

/// An in-memory log service.
///
/// Instances can be cheaply cloned; all clones share the same streams.
#[derive(Clone, Default)]
pub struct MemoryLogService {
    shared: Arc<Shared>,
}

/// A point-in-time view of a stream held by a `MemoryLogService`.
#[derive(Clone, Debug, Default)]
pub struct StreamState {
    /// The number of messages currently retained by the stream.
    pub messages: usize,
    /// The sequence of the last message stored, which is also the number of messages ever stored.
    pub last_sequence: u64,
    /// The payloads of all acknowledged deliveries, in ack order.
    pub acked: Vec<Bytes>,
    /// The number of naks received.
    pub naks: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    /// Woken whenever new work may be available to consumers.
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, MemoryStream>,
}

struct MemoryStream {
    descriptor: StreamDescriptor,
    last_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    /// Dedup keys to the sequence & time of their first publication.
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
    acked: Vec<Bytes>,
    naks: u64,
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    stored_at: Instant,
}

struct ConsumerState {
    spec: ConsumerSpec,
    /// The next stream sequence to consider for first delivery.
    next_sequence: u64,
    /// The last consumer sequence handed out.
    consumer_sequence: u64,
    /// Delivered but unacknowledged messages, by stream sequence.
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    deliveries: i64,
    /// When the current delivery expires; `None` when redelivery has been requested.
    deadline: Option<Instant>,
}

impl MemoryLogService {
    /// Create a new instance with no streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close this service; every subsequent call fails with `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Get a view of the state of the named stream.
    pub async fn stream_state(&self, name: &str) -> Option<StreamState> {
        let state = self.shared.state.lock().await;
        state.streams.get(name).map(|stream| StreamState {
            messages: stream.messages.len(),
            last_sequence: stream.last_sequence,
            acked: stream.acked.clone(),
            naks: stream.naks,
        })
    }
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!(ConnectionClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl LogService for MemoryLogService {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamDescriptor>> {
        self.shared.check_open()?;
        let state = self.shared.state.lock().await;
        Ok(state.streams.get(name).map(|stream| stream.descriptor.clone()))
    }

    async fn create_stream(&self, descriptor: &StreamDescriptor) -> Result<StreamCreated> {
        self.shared.check_open()?;
        let mut state = self.shared.state.lock().await;
        if state.streams.contains_key(&descriptor.name) {
            return Ok(StreamCreated::AlreadyExists);
        }
        if let Some(overlap) = state
            .streams
            .values()
            .find(|stream| descriptor.subjects.iter().any(|subject| stream.descriptor.captures(subject)))
        {
            bail!("subjects of stream {} overlap with existing stream {}", descriptor.name, overlap.descriptor.name);
        }
        state.streams.insert(
            descriptor.name.clone(),
            MemoryStream {
                descriptor: descriptor.clone(),
                last_sequence: 0,
                messages: BTreeMap::new(),
                dedup: HashMap::new(),
                consumers: HashMap::new(),
                acked: Vec::new(),
                naks: 0,
            },
        );
        Ok(StreamCreated::Created)
    }

    async fn publish(&self, subject: &str, payload: Bytes, dedup_key: &str) -> Result<PublishAck> {
        self.shared.check_open()?;
        let mut state = self.shared.state.lock().await;
        let stream = state
            .streams
            .values_mut()
            .find(|stream| stream.descriptor.captures(subject))
            .with_context(|| format!("no stream captures subject {}", subject))?;

        let now = Instant::now();
        let window = stream.descriptor.duplicate_window;
        stream.dedup.retain(|_, (_, at)| now.duration_since(*at) < window);
        if !dedup_key.is_empty() {
            if let Some((sequence, _)) = stream.dedup.get(dedup_key) {
                return Ok(PublishAck {
                    stream: stream.descriptor.name.clone(),
                    sequence: *sequence,
                    duplicate: true,
                });
            }
        }

        let max_age = stream.descriptor.max_age;
        if !max_age.is_zero() {
            stream.messages.retain(|_, msg| now.duration_since(msg.stored_at) < max_age);
        }
        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: subject.to_string(),
                payload,
                stored_at: now,
            },
        );
        if !dedup_key.is_empty() {
            stream.dedup.insert(dedup_key.to_string(), (sequence, now));
        }
        let ack = PublishAck {
            stream: stream.descriptor.name.clone(),
            sequence,
            duplicate: false,
        };
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(ack)
    }

    async fn consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Arc<dyn PullConsumer>> {
        self.shared.check_open()?;
        let mut state = self.shared.state.lock().await;
        let target = state
            .streams
            .get_mut(stream)
            .with_context(|| format!("stream {} not found", stream))?;
        target
            .consumers
            .entry(spec.durable_name.clone())
            .or_insert_with(|| ConsumerState {
                spec: spec.clone(),
                next_sequence: 1,
                consumer_sequence: 0,
                pending: BTreeMap::new(),
            });
        Ok(Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            stream: stream.to_string(),
            name: spec.durable_name.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

/// A pull consumer bound to a stream of a `MemoryLogService`.
struct MemoryConsumer {
    shared: Arc<Shared>,
    stream: String,
    name: String,
    released: AtomicBool,
}

impl MemoryConsumer {
    /// Take up to `max_batch` deliverable occurrences, returning the next redelivery deadline.
    async fn take_batch(&self, max_batch: usize) -> Result<(Vec<DeliveryHandle>, Option<Instant>)> {
        let mut state = self.shared.state.lock().await;
        let stream = state
            .streams
            .get_mut(&self.stream)
            .with_context(|| format!("stream {} not found", self.stream))?;
        let MemoryStream { messages, consumers, .. } = stream;
        let consumer = consumers
            .get_mut(&self.name)
            .with_context(|| format!("consumer {} not found", self.name))?;

        let now = Instant::now();
        let ack_wait = consumer.spec.ack_wait;
        let max_deliver = consumer.spec.max_deliver;
        let mut batch = Vec::new();

        // Redeliveries go first, in stream order.
        let mut exhausted = Vec::new();
        for (sequence, pending) in consumer.pending.iter_mut() {
            if batch.len() >= max_batch {
                break;
            }
            if pending.deadline.map_or(false, |deadline| deadline > now) {
                continue;
            }
            let payload = match messages.get(sequence) {
                Some(msg) => msg.payload.clone(),
                None => {
                    exhausted.push(*sequence);
                    continue;
                }
            };
            if max_deliver > 0 && pending.deliveries >= max_deliver {
                tracing::debug!(sequence, deliveries = pending.deliveries, "max deliveries reached, dropping message from consumer");
                exhausted.push(*sequence);
                continue;
            }
            pending.deliveries += 1;
            pending.deadline = Some(now + ack_wait);
            consumer.consumer_sequence += 1;
            batch.push(self.new_handle(payload, *sequence, consumer.consumer_sequence, pending.deliveries));
        }
        for sequence in exhausted {
            consumer.pending.remove(&sequence);
        }

        // Then first deliveries.
        for (sequence, msg) in messages.range(consumer.next_sequence..) {
            if batch.len() >= max_batch {
                break;
            }
            if consumer.spec.max_ack_pending > 0 && consumer.pending.len() as i64 >= consumer.spec.max_ack_pending {
                break;
            }
            consumer.next_sequence = sequence + 1;
            if !consumer.spec.filter_subject.is_empty() && !subject_matches(&consumer.spec.filter_subject, &msg.subject) {
                continue;
            }
            consumer.pending.insert(
                *sequence,
                Pending {
                    deliveries: 1,
                    deadline: Some(now + ack_wait),
                },
            );
            consumer.consumer_sequence += 1;
            batch.push(self.new_handle(msg.payload.clone(), *sequence, consumer.consumer_sequence, 1));
        }

        let next_deadline = consumer.pending.values().filter_map(|pending| pending.deadline).min();
        Ok((batch, next_deadline))
    }

    fn new_handle(&self, payload: Bytes, stream_sequence: u64, consumer_sequence: u64, delivered: i64) -> DeliveryHandle {
        let info = DeliveryInfo {
            stream_sequence,
            consumer_sequence,
            delivered,
        };
        let acker = MemoryAcker {
            shared: self.shared.clone(),
            stream: self.stream.clone(),
            consumer: self.name.clone(),
        };
        DeliveryHandle::new(payload, info, Box::new(acker))
    }
}

#[async_trait]
impl PullConsumer for MemoryConsumer {
    async fn fetch(&self, max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        let deadline = Instant::now() + max_wait;
        loop {
            self.shared.check_open()?;
            if self.released.load(Ordering::SeqCst) {
                return Err(anyhow!(ConnectionClosed).context("consumer has been released"));
            }

            // Register interest before inspecting state so that no publication is missed.
            let notified = self.shared.notify.notified();
            let (batch, next_deadline) = self.take_batch(max_batch).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_deadline.map_or(deadline, |next| next.min(deadline));
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(wake_at) => continue,
            }
        }
    }

    async fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Acknowledges deliveries of a `MemoryConsumer`.
struct MemoryAcker {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
}

impl MemoryAcker {
    /// Resolve the pending delivery described by `info`, calling `f` on the owning stream.
    async fn resolve<F>(&self, info: &DeliveryInfo, f: F) -> Result<()>
    where
        F: FnOnce(&mut MemoryStream, u64),
    {
        self.shared.check_open()?;
        let mut state = self.shared.state.lock().await;
        let stream = state
            .streams
            .get_mut(&self.stream)
            .with_context(|| format!("stream {} not found", self.stream))?;
        let consumer = stream
            .consumers
            .get(&self.consumer)
            .with_context(|| format!("consumer {} not found", self.consumer))?;
        match consumer.pending.get(&info.stream_sequence) {
            Some(pending) if pending.deliveries == info.delivered => (),
            Some(_) => bail!("delivery {} has been superseded by a redelivery", info.stream_sequence),
            None => bail!("delivery {} is not pending", info.stream_sequence),
        }
        f(stream, info.stream_sequence);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, info: &DeliveryInfo) -> Result<()> {
        let consumer = self.consumer.clone();
        self.resolve(info, move |stream, sequence| {
            if let Some(state) = stream.consumers.get_mut(&consumer) {
                state.pending.remove(&sequence);
            }
            let payload = match stream.descriptor.retention {
                RetentionPolicy::WorkQueue | RetentionPolicy::Interest => stream.messages.remove(&sequence).map(|msg| msg.payload),
                RetentionPolicy::Limits => stream.messages.get(&sequence).map(|msg| msg.payload.clone()),
            };
            if let Some(payload) = payload {
                stream.acked.push(payload);
            }
        })
        .await
    }

    async fn nak(&self, info: &DeliveryInfo) -> Result<()> {
        let consumer = self.consumer.clone();
        self.resolve(info, move |stream, sequence| {
            if let Some(pending) = stream.consumers.get_mut(&consumer).and_then(|state| state.pending.get_mut(&sequence)) {
                pending.deadline = None;
            }
            stream.naks += 1;
        })
        .await?;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
