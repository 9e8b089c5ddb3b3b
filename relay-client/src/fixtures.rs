use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ConnectionClosed;
use crate::handler::MessageHandler;
use crate::model::{Message, StreamDescriptor};
use crate::service::{Acknowledger, ConsumerSpec, DeliveryHandle, DeliveryInfo, LogService, MemoryLogService, PublishAck, PullConsumer, StreamCreated};

pub const STREAM: &str = "ORDERS";
pub const SUBJECT: &str = "ORDERS.received";

/// A descriptor for the test stream.
pub fn descriptor() -> StreamDescriptor {
    StreamDescriptor::new(STREAM, vec!["ORDERS.*".into()])
}

/// Setup a memory service with the test stream already provisioned.
pub async fn setup_service() -> Result<MemoryLogService> {
    let service = MemoryLogService::new();
    service.create_stream(&descriptor()).await?;
    Ok(service)
}

/// Publish `count` messages with IDs `msg-1..msg-{count}` to the given service.
pub async fn publish_messages(service: &dyn LogService, count: u64) -> Result<Vec<String>> {
    let mut ids = Vec::with_capacity(count as usize);
    for n in 1..=count {
        let msg = Message::new(format!("msg-{}", n), format!("Message content {}", n));
        service.publish(SUBJECT, msg.encode()?, &msg.id).await?;
        ids.push(msg.id);
    }
    Ok(ids)
}

/// Decode the IDs of all messages acked on the test stream.
pub async fn acked_ids(service: &MemoryLogService) -> Result<Vec<String>> {
    let state = service.stream_state(STREAM).await.ok_or_else(|| anyhow!("test stream not found"))?;
    state
        .acked
        .iter()
        .map(|payload| Message::decode(payload).map(|msg| msg.id).map_err(anyhow::Error::from))
        .collect()
}

/// Build a delivery handle for the given message whose acks and naks go nowhere.
pub fn handle(sequence: u64, payload: impl Into<Bytes>) -> DeliveryHandle {
    let info = DeliveryInfo {
        stream_sequence: sequence,
        consumer_sequence: sequence,
        delivered: 1,
    };
    DeliveryHandle::new(payload.into(), info, Box::new(NoopAcker))
}

/// Build a delivery handle carrying an encoded message with the given ID.
pub fn message_handle(sequence: u64, id: &str) -> Result<DeliveryHandle> {
    Ok(handle(sequence, Message::new(id, "data").encode()?))
}

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self, _info: &DeliveryInfo) -> Result<()> {
        Ok(())
    }

    async fn nak(&self, _info: &DeliveryInfo) -> Result<()> {
        Ok(())
    }
}

/// A handler which records every message it handles.
///
/// Optionally sleeps for `delay` per message, and tracks the peak number of concurrent calls.
#[derive(Default)]
pub struct RecordingHandler {
    pub delay: Option<Duration>,
    /// A message ID whose handling never completes.
    pub stall_on: Option<String>,
    pub handled: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn stalling_on(id: &str) -> Self {
        Self {
            stall_on: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn handled(&self) -> Vec<String> {
        self.handled.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, msg: &Message, _info: &DeliveryInfo) -> Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.stall_on.as_deref() == Some(msg.id.as_str()) {
            futures::future::pending::<()>().await;
        }
        if let Ok(mut handled) = self.handled.lock() {
            handled.push(msg.id.clone());
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A handler which fails the first delivery of every message, and succeeds on redelivery.
#[derive(Default)]
pub struct FailFirstHandler {
    pub attempts: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl MessageHandler for FailFirstHandler {
    async fn handle(&self, msg: &Message, info: &DeliveryInfo) -> Result<()> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(msg.id.clone()).or_default() += 1;
        }
        if info.delivered == 1 {
            bail!("simulated failure handling {}", msg.id);
        }
        Ok(())
    }
}

/// A handler which panics on the message with the given ID, and succeeds for all others.
pub struct PanicHandler {
    pub poison: String,
    pub handled: AtomicUsize,
}

#[async_trait]
impl MessageHandler for PanicHandler {
    async fn handle(&self, msg: &Message, info: &DeliveryInfo) -> Result<()> {
        if msg.id == self.poison && info.delivered == 1 {
            panic!("simulated panic handling {}", msg.id);
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A log service wrapping a `MemoryLogService` which injects faults on demand.
#[derive(Clone, Default)]
pub struct FaultyService {
    pub inner: MemoryLogService,
    pub faults: Arc<Faults>,
}

/// The faults injected by a `FaultyService`.
#[derive(Default)]
pub struct Faults {
    /// Fail this many publish calls before letting them through.
    pub publish_failures: AtomicU32,
    /// Fail every stream info call.
    pub stream_info_fails: AtomicBool,
    /// Fail every create stream call.
    pub create_fails: AtomicBool,
    /// Fail this many fetch calls with a transport error before letting them through.
    pub fetch_failures: AtomicU32,
    pub publish_calls: AtomicU32,
    pub create_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    /// Every dedup key submitted, in order.
    pub dedup_keys: Mutex<Vec<String>>,
}

impl FaultyService {
    pub fn new(inner: MemoryLogService) -> Self {
        Self {
            inner,
            faults: Default::default(),
        }
    }
}

/// Consume one unit of the given failure budget, returning `true` if the call should fail.
fn take_failure(budget: &AtomicU32) -> bool {
    budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl LogService for FaultyService {
    async fn stream_info(&self, name: &str) -> Result<Option<StreamDescriptor>> {
        if self.faults.stream_info_fails.load(Ordering::SeqCst) {
            bail!("simulated permission denied");
        }
        self.inner.stream_info(name).await
    }

    async fn create_stream(&self, descriptor: &StreamDescriptor) -> Result<StreamCreated> {
        self.faults.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.create_fails.load(Ordering::SeqCst) {
            bail!("simulated connectivity failure");
        }
        self.inner.create_stream(descriptor).await
    }

    async fn publish(&self, subject: &str, payload: Bytes, dedup_key: &str) -> Result<PublishAck> {
        self.faults.publish_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut keys) = self.faults.dedup_keys.lock() {
            keys.push(dedup_key.to_string());
        }
        if take_failure(&self.faults.publish_failures) {
            bail!("simulated publish failure");
        }
        self.inner.publish(subject, payload, dedup_key).await
    }

    async fn consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Arc<dyn PullConsumer>> {
        let inner = self.inner.consumer(stream, spec).await?;
        Ok(Arc::new(FaultyConsumer {
            inner,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyConsumer {
    inner: Arc<dyn PullConsumer>,
    faults: Arc<Faults>,
}

#[async_trait]
impl PullConsumer for FaultyConsumer {
    async fn fetch(&self, max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        self.faults.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.faults.fetch_failures) {
            bail!("simulated transport failure");
        }
        self.inner.fetch(max_batch, max_wait).await
    }

    async fn release(&self) -> Result<()> {
        self.inner.release().await
    }
}

/// A pull consumer which always times out with an empty batch, counting its calls.
#[derive(Default)]
pub struct IdleConsumer {
    pub calls: AtomicU32,
}

#[async_trait]
impl PullConsumer for IdleConsumer {
    async fn fetch(&self, _max_batch: usize, max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(max_wait).await;
        Ok(vec![])
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// A pull consumer whose connection is gone.
pub struct ClosedConsumer;

#[async_trait]
impl PullConsumer for ClosedConsumer {
    async fn fetch(&self, _max_batch: usize, _max_wait: Duration) -> Result<Vec<DeliveryHandle>> {
        Err(anyhow!(ConnectionClosed))
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}
