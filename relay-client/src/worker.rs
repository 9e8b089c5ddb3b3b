//! The worker pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};

use crate::dispatch::DispatchReceiver;
use crate::handler::MessageHandler;
use crate::metrics::{METRIC_ACKED, METRIC_ACK_FAILURES, METRIC_DECODE_FAILURES, METRIC_NACKED};
use crate::service::DeliveryHandle;

/// The default number of workers in a pool.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// A fixed size pool of workers sharing one dispatch channel.
///
/// Workers run until the channel is closed and drained; they are never cancelled mid-message.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    processed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawn `count` workers, each taking deliveries from the given receiver.
    pub fn spawn(count: usize, rx: DispatchReceiver, handler: Arc<dyn MessageHandler>) -> Self {
        let processed = Arc::new(AtomicU64::new(0));
        let workers = (0..count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    rx: rx.clone(),
                    handler: handler.clone(),
                    processed: processed.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { workers, processed }
    }

    /// Await every worker, returning the total number of deliveries processed.
    pub async fn join(mut self) -> u64 {
        Self::log_join_errors(futures::future::join_all(self.workers.iter_mut()).await);
        self.processed.load(Ordering::SeqCst)
    }

    /// Await every worker, aborting the remainder if they do not finish within `timeout`.
    ///
    /// Returns the number of deliveries processed, and `false` if the timeout elapsed. Deliveries
    /// held by aborted workers stay unacknowledged and will be redelivered.
    pub async fn join_timeout(mut self, timeout: Duration) -> (u64, bool) {
        let res = tokio::time::timeout(timeout, futures::future::join_all(self.workers.iter_mut())).await;
        let drained = match res {
            Ok(results) => {
                Self::log_join_errors(results);
                true
            }
            Err(_elapsed) => {
                self.workers.iter().for_each(|worker| worker.abort());
                false
            }
        };
        (self.processed.load(Ordering::SeqCst), drained)
    }

    fn log_join_errors(results: Vec<Result<(), JoinError>>) {
        for err in results.into_iter().filter_map(Result::err) {
            tracing::error!(error = ?err, "error joining worker");
        }
    }
}

/// A single worker of a pool.
struct Worker {
    id: usize,
    rx: DispatchReceiver,
    handler: Arc<dyn MessageHandler>,
    /// Deliveries resolved by all workers of the pool.
    processed: Arc<AtomicU64>,
}

impl Worker {
    #[tracing::instrument(level = "debug", skip(self), fields(worker = self.id))]
    async fn run(self) {
        tracing::debug!("worker started");
        let mut processed = 0u64;
        while let Some(dispatched) = self.rx.recv().await {
            let (handle, _permit) = dispatched.into_parts();
            self.process(handle).await;
            self.processed.fetch_add(1, Ordering::SeqCst);
            processed += 1;
        }
        tracing::debug!(processed, "worker stopped");
    }

    /// Process a single delivery, resolving it with exactly one ack or nak.
    async fn process(&self, handle: DeliveryHandle) {
        let info = *handle.info();
        let msg = match handle.decode() {
            Ok(msg) => msg,
            Err(err) => {
                tracing::error!(error = %err, sequence = info.stream_sequence, "malformed payload, requesting redelivery");
                metrics::increment_counter!(METRIC_DECODE_FAILURES);
                Self::nak(handle).await;
                return;
            }
        };

        let res = AssertUnwindSafe(self.handler.handle(&msg, &info)).catch_unwind().await;
        match res {
            Ok(Ok(())) => {
                tracing::debug!(id = %msg.id, sequence = info.stream_sequence, delivered = info.delivered, "message handled");
                Self::ack(handle).await;
            }
            Ok(Err(err)) => {
                tracing::error!(error = ?err, id = %msg.id, sequence = info.stream_sequence, "error handling message, requesting redelivery");
                Self::nak(handle).await;
            }
            Err(_panic) => {
                tracing::error!(id = %msg.id, sequence = info.stream_sequence, "handler panicked, requesting redelivery");
                Self::nak(handle).await;
            }
        }
    }

    async fn ack(handle: DeliveryHandle) {
        match handle.ack().await {
            Ok(()) => metrics::increment_counter!(METRIC_ACKED),
            Err(err) => {
                tracing::error!(error = %err, "ack failed, delivery will be redelivered after its ack wait");
                metrics::increment_counter!(METRIC_ACK_FAILURES);
            }
        }
    }

    async fn nak(handle: DeliveryHandle) {
        match handle.nak().await {
            Ok(()) => metrics::increment_counter!(METRIC_NACKED),
            Err(err) => {
                tracing::error!(error = %err, "nak failed, delivery will be redelivered after its ack wait");
                metrics::increment_counter!(METRIC_ACK_FAILURES);
            }
        }
    }
}
