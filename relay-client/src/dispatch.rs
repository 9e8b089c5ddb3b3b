//! The bounded handoff between the fetcher and the worker pool.
//!
//! Capacity is enforced with a semaphore rather than by the channel alone. A permit is taken
//! before a handle is enqueued and only returned once a worker has resolved the handle, so the
//! number of handles queued plus the number held by workers never exceeds the capacity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::metrics::METRIC_DISPATCH_OCCUPANCY;
use crate::service::DeliveryHandle;

/// Create a new dispatch channel with the given capacity.
pub fn channel(capacity: usize) -> (DispatchSender, DispatchReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let occupancy = Arc::new(Occupancy {
        permits: Arc::new(Semaphore::new(capacity)),
        capacity,
        peak: AtomicUsize::new(0),
    });
    (
        DispatchSender { tx, occupancy: occupancy.clone() },
        DispatchReceiver {
            rx: Arc::new(Mutex::new(rx)),
            occupancy,
        },
    )
}

/// Occupancy tracking shared by both halves of a dispatch channel.
#[derive(Debug)]
struct Occupancy {
    permits: Arc<Semaphore>,
    capacity: usize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn current(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    fn record(&self) {
        let current = self.current();
        self.peak.fetch_max(current, Ordering::SeqCst);
        metrics::gauge!(METRIC_DISPATCH_OCCUPANCY, current as f64);
    }
}

/// The sending half of a dispatch channel, owned by the fetcher.
///
/// Dropping the sender closes the channel; workers drain what is queued and then exit.
pub struct DispatchSender {
    tx: mpsc::Sender<Dispatched>,
    occupancy: Arc<Occupancy>,
}

impl DispatchSender {
    /// Enqueue a handle, waiting while the channel is at capacity.
    ///
    /// Returns the handle back if the receiving side has gone away.
    pub async fn send(&self, handle: DeliveryHandle) -> Result<(), DeliveryHandle> {
        let permit = match self.occupancy.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_closed) => return Err(handle),
        };
        self.occupancy.record();
        self.tx
            .send(Dispatched { handle, _permit: permit })
            .await
            .map_err(|err| err.0.handle)
    }

    /// The number of handles currently queued or held by workers.
    pub fn occupancy(&self) -> usize {
        self.occupancy.current()
    }

    /// The highest occupancy observed so far.
    pub fn peak_occupancy(&self) -> usize {
        self.occupancy.peak.load(Ordering::SeqCst)
    }
}

/// The receiving half of a dispatch channel, shared by all workers of a pool.
#[derive(Clone)]
pub struct DispatchReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Dispatched>>>,
    occupancy: Arc<Occupancy>,
}

impl DispatchReceiver {
    /// Take the next handle, waiting while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Dispatched> {
        self.rx.lock().await.recv().await
    }

    /// The highest occupancy observed so far.
    pub fn peak_occupancy(&self) -> usize {
        self.occupancy.peak.load(Ordering::SeqCst)
    }
}

/// A handle in flight between the fetcher and a worker.
///
/// Holds one unit of channel capacity until dropped.
#[derive(Debug)]
pub struct Dispatched {
    pub handle: DeliveryHandle,
    _permit: OwnedSemaphorePermit,
}

impl Dispatched {
    /// Split into the handle and the capacity permit it holds.
    ///
    /// The permit must be kept alive until the handle has been resolved.
    pub fn into_parts(self) -> (DeliveryHandle, OwnedSemaphorePermit) {
        (self.handle, self._permit)
    }
}
