//! The pull fetch loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::dispatch::DispatchSender;
use crate::error::{ConnectionClosed, FetchError};
use crate::metrics::{METRIC_FETCHED, METRIC_FETCH_ERRORS};
use crate::service::{DeliveryHandle, PullConsumer};

/// The default maximum number of messages requested per fetch.
pub const DEFAULT_MAX_BATCH: usize = 10;
/// The default maximum amount of time a fetch waits for messages.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);
/// The default pause after a failed fetch before fetching again.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// The minimum spacing between fetches which come back empty.
pub const MIN_EMPTY_FETCH_INTERVAL: Duration = Duration::from_millis(10);

/// Repeatedly pulls batches from a durable consumer and hands each delivery to the dispatch channel.
///
/// The fetcher only stops on shutdown or on a fatal fetch error. Dropping the fetcher drops its
/// dispatch sender, which lets the workers drain and exit.
pub struct Fetcher {
    consumer: Arc<dyn PullConsumer>,
    dispatch: DispatchSender,
    max_batch: usize,
    max_wait: Duration,
    error_backoff: Duration,
    shutdown: BroadcastStream<()>,
}

impl Fetcher {
    /// Create a new instance.
    pub fn new(
        consumer: Arc<dyn PullConsumer>, dispatch: DispatchSender, max_batch: usize, max_wait: Duration, error_backoff: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            consumer,
            dispatch,
            max_batch: max_batch.max(1),
            max_wait,
            error_backoff,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    /// Run the fetch loop until shutdown is signalled or the connection is closed.
    ///
    /// Returns the number of deliveries dispatched.
    #[tracing::instrument(level = "debug", skip(self), fields(max_batch = self.max_batch))]
    pub async fn run(mut self) -> Result<u64, FetchError> {
        tracing::debug!("fetcher started");
        let mut dispatched = 0u64;
        loop {
            let started = Instant::now();
            let res = tokio::select! {
                res = self.consumer.fetch(self.max_batch, self.max_wait) => res,
                _ = self.shutdown.next() => break,
            };
            let batch = match res {
                Ok(batch) => batch,
                Err(err) if err.downcast_ref::<ConnectionClosed>().is_some() => {
                    tracing::error!(error = ?err, "log service connection closed, stopping fetcher");
                    return Err(FetchError::Closed(err));
                }
                Err(err) => {
                    let err = FetchError::Transport(err);
                    tracing::error!(error = %err, "error fetching batch, backing off");
                    metrics::increment_counter!(METRIC_FETCH_ERRORS);
                    if self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tracing::trace!("fetch elapsed with no messages");
                if self.pause_until(started + MIN_EMPTY_FETCH_INTERVAL).await {
                    break;
                }
                continue;
            }
            tracing::debug!(len = batch.len(), "fetched batch");
            metrics::counter!(METRIC_FETCHED, batch.len() as u64);
            if self.dispatch_batch(batch, &mut dispatched).await {
                break;
            }
        }
        tracing::debug!(dispatched, "fetcher stopped");
        Ok(dispatched)
    }

    /// Hand each delivery of the batch to the dispatch channel, in fetch order, counting each
    /// one into `dispatched`.
    ///
    /// Returns `true` if shutdown was signalled or the workers went away first. Undispatched
    /// deliveries are dropped unresolved, and will be redelivered by the log service.
    async fn dispatch_batch(&mut self, batch: Vec<DeliveryHandle>, dispatched: &mut u64) -> bool {
        for handle in batch {
            let res = tokio::select! {
                res = self.dispatch.send(handle) => res,
                _ = self.shutdown.next() => return true,
            };
            if let Err(handle) = res {
                tracing::warn!(sequence = handle.info().stream_sequence, "dispatch channel closed, dropping delivery");
                return true;
            }
            *dispatched += 1;
        }
        false
    }

    /// Pause after a failed fetch. Returns `true` if shutdown was signalled during the pause.
    async fn backoff(&mut self) -> bool {
        let deadline = Instant::now() + self.error_backoff;
        self.pause_until(deadline).await
    }

    /// Pause until the given deadline. Returns `true` if shutdown was signalled during the pause.
    async fn pause_until(&mut self, deadline: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => false,
            _ = self.shutdown.next() => true,
        }
    }
}
