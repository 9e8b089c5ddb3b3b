//! The consumer lifecycle controller.
//!
//! A run moves through `Init -> Provisioning -> Running -> Draining -> Stopped`. Provisioning or
//! consumer binding failures go straight to `Stopped`. Once running, only a shutdown request or
//! an unrecoverable connection loss ends the fetch loop; either way the run drains the workers
//! and releases its consumer before stopping.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::dispatch;
use crate::error::RunError;
use crate::fetcher::{Fetcher, DEFAULT_ERROR_BACKOFF, DEFAULT_MAX_BATCH, DEFAULT_MAX_WAIT};
use crate::handler::MessageHandler;
use crate::model::StreamDescriptor;
use crate::provisioner::StreamProvisioner;
use crate::service::{ConsumerSpec, LogService};
use crate::worker::{WorkerPool, DEFAULT_WORKER_COUNT};

/// The state of a consumer run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Init,
    Provisioning,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Consumer run configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// The number of workers processing messages concurrently.
    pub worker_count: usize,
    /// The capacity of the dispatch channel; defaults to the worker count.
    pub channel_capacity: Option<usize>,
    /// The maximum number of messages requested per fetch.
    pub max_batch: usize,
    /// The maximum amount of time a fetch waits for messages.
    pub max_wait: Duration,
    /// The pause after a failed fetch.
    pub error_backoff: Duration,
    /// The durable consumer name; defaults to `{stream}-consumer`.
    pub consumer_name: Option<String>,
    /// Only consume messages with subjects matching this filter; empty for all.
    pub filter_subject: String,
    /// The amount of time after which an unacknowledged delivery is redelivered.
    pub ack_wait: Duration,
    /// The maximum number of deliveries per message; `-1` for unlimited.
    pub max_deliver: i64,
    /// The maximum amount of time to wait for workers to drain; `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            channel_capacity: None,
            max_batch: DEFAULT_MAX_BATCH,
            max_wait: DEFAULT_MAX_WAIT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            consumer_name: None,
            filter_subject: String::new(),
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            drain_timeout: None,
        }
    }
}

impl ConsumerConfig {
    /// The effective capacity of the dispatch channel.
    pub fn capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(self.worker_count).max(1)
    }

    /// The effective durable consumer name for the given stream.
    pub fn consumer_name(&self, stream: &str) -> String {
        self.consumer_name.clone().unwrap_or_else(|| format!("{}-consumer", stream))
    }

    /// Build the configuration of the durable consumer bound by a run on the given stream.
    pub fn consumer_spec(&self, stream: &str) -> ConsumerSpec {
        ConsumerSpec {
            durable_name: self.consumer_name(stream),
            filter_subject: self.filter_subject.clone(),
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            max_ack_pending: 0,
        }
    }
}

/// Statistics of a completed run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// The number of deliveries handed to the worker pool.
    pub dispatched: u64,
    /// The number of deliveries processed by workers.
    pub processed: u64,
    /// The highest dispatch channel occupancy observed.
    pub peak_occupancy: usize,
    /// `false` if the drain timeout elapsed and workers were abandoned.
    pub drained: bool,
}

/// Start a consumer run in the background.
///
/// The returned handle observes the state of the run and is used to stop it. Dropping the
/// handle also stops the run.
pub fn start(
    service: Arc<dyn LogService>, descriptor: StreamDescriptor, config: ConsumerConfig, handler: Arc<dyn MessageHandler>,
) -> RunHandle {
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let (state_tx, state) = watch::channel(RunState::Init);
    let run = Run {
        service,
        descriptor,
        config,
        handler,
        state: state_tx,
    };
    let task = tokio::spawn(run.run(shutdown_rx));
    RunHandle { shutdown, state, task }
}

/// A handle to a running consumer.
pub struct RunHandle {
    shutdown: broadcast::Sender<()>,
    state: watch::Receiver<RunState>,
    task: JoinHandle<Result<RunSummary, RunError>>,
}

impl RunHandle {
    /// The current state of the run.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Subscribe to state changes of the run.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Wait until the run has stopped, without consuming this handle.
    pub async fn stopped(&self) {
        let mut states = self.state.clone();
        while *states.borrow_and_update() != RunState::Stopped {
            if states.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal the run to stop, and wait until every worker has drained and the run is stopped.
    pub async fn stop(self) -> Result<RunSummary, RunError> {
        tracing::debug!("stopping consumer run");
        let _ = self.shutdown.send(());
        self.task.await?
    }

    /// Wait for the run to stop on its own, without signalling it.
    pub async fn wait(self) -> Result<RunSummary, RunError> {
        let Self { shutdown, task, .. } = self;
        let res = task.await;
        drop(shutdown);
        res?
    }
}

/// The task driving a single consumer run.
struct Run {
    service: Arc<dyn LogService>,
    descriptor: StreamDescriptor,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<RunState>,
}

impl Run {
    #[tracing::instrument(level = "debug", skip(self, shutdown), fields(stream = %self.descriptor.name))]
    async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<RunSummary, RunError> {
        let res = self.execute(shutdown).await;
        if let Err(err) = &res {
            tracing::error!(error = %err, "consumer run terminated with error");
        }
        self.transition(RunState::Stopped);
        res
    }

    async fn execute(&self, shutdown: broadcast::Receiver<()>) -> Result<RunSummary, RunError> {
        self.transition(RunState::Provisioning);
        StreamProvisioner::new(self.service.clone()).ensure(&self.descriptor).await?;

        let spec = self.config.consumer_spec(&self.descriptor.name);
        let consumer = self
            .service
            .consumer(&self.descriptor.name, &spec)
            .await
            .map_err(|source| RunError::Consumer {
                consumer: spec.durable_name.clone(),
                source,
            })?;

        let (tx, rx) = dispatch::channel(self.config.capacity());
        let pool = WorkerPool::spawn(self.config.worker_count, rx.clone(), self.handler.clone());
        self.transition(RunState::Running);
        tracing::info!(
            consumer = %spec.durable_name,
            workers = self.config.worker_count,
            capacity = self.config.capacity(),
            "consumer running"
        );

        let fetcher = Fetcher::new(
            consumer.clone(),
            tx,
            self.config.max_batch,
            self.config.max_wait,
            self.config.error_backoff,
            shutdown,
        );
        // The fetcher owns the dispatch sender, so once it returns the channel is closed.
        let fetched = fetcher.run().await;

        self.transition(RunState::Draining);
        let (processed, drained) = match self.config.drain_timeout {
            Some(timeout) => {
                let (processed, drained) = pool.join_timeout(timeout).await;
                if !drained {
                    tracing::warn!(
                        ?timeout,
                        "drain timeout elapsed, abandoning in-flight messages; they will be redelivered after their ack wait"
                    );
                }
                (processed, drained)
            }
            None => (pool.join().await, true),
        };
        if let Err(err) = consumer.release().await {
            tracing::error!(error = ?err, consumer = %spec.durable_name, "error releasing consumer");
        }

        let dispatched = fetched?;
        let summary = RunSummary {
            dispatched,
            processed,
            peak_occupancy: rx.peak_occupancy(),
            drained,
        };
        tracing::info!(dispatched, processed, peak_occupancy = summary.peak_occupancy, "consumer drained");
        Ok(summary)
    }

    fn transition(&self, next: RunState) {
        tracing::debug!(state = %next, "consumer run state change");
        let _ = self.state.send(next);
    }
}
