use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::{FetchError, RunError};
use crate::fixtures::{self, FailFirstHandler, FaultyService, RecordingHandler};
use crate::lifecycle::{self, ConsumerConfig, RunHandle, RunState};
use crate::service::MemoryLogService;

fn config(worker_count: usize, capacity: usize) -> ConsumerConfig {
    ConsumerConfig {
        worker_count,
        channel_capacity: Some(capacity),
        max_wait: Duration::from_millis(50),
        error_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn wait_for_state(handle: &RunHandle, target: RunState) -> Result<()> {
    let mut states = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(10), async move {
        while *states.borrow() != target {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timeout waiting for run state {}", target))
}

async fn eventually(mut cond: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async move {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timeout waiting for condition"))
}

fn sorted_ids(range: std::ops::RangeInclusive<u64>) -> Vec<String> {
    let mut ids: Vec<_> = range.map(|n| format!("msg-{}", n)).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn all_messages_are_acked_once_with_bounded_occupancy() -> Result<()> {
    let service = fixtures::setup_service().await?;
    fixtures::publish_messages(&service, 25).await?;
    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(2)));

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config(3, 10), handler.clone());
    eventually(|| handler.handled().len() >= 25).await?;
    let summary = tokio::time::timeout(Duration::from_secs(10), handle.stop()).await??;

    let mut acked = fixtures::acked_ids(&service).await?;
    acked.sort();
    let state = service.stream_state(fixtures::STREAM).await.unwrap_or_default();
    assert!(acked == sorted_ids(1..=25), "expected msg-1..msg-25 acked exactly once, got {:?}", acked);
    assert!(state.messages == 0, "expected the work queue to be empty, got {} messages", state.messages);
    assert!(summary.peak_occupancy <= 10, "expected peak occupancy <= 10, got {}", summary.peak_occupancy);
    assert!(summary.processed == 25, "expected 25 processed, got {}", summary.processed);
    assert!(handler.peak_active.load(Ordering::SeqCst) <= 3, "expected at most 3 concurrent handler calls");
    Ok(())
}

#[tokio::test]
async fn run_reaches_running_and_stops() -> Result<()> {
    let service = MemoryLogService::new();
    let handler = Arc::new(RecordingHandler::default());

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config(2, 2), handler);
    wait_for_state(&handle, RunState::Running).await?;
    let mut states = handle.subscribe_state();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await??;

    assert!(*states.borrow_and_update() == RunState::Stopped, "expected run to be stopped");
    assert!(summary.drained, "expected a complete drain");
    assert!(service.stream_state(fixtures::STREAM).await.is_some(), "expected the run to provision its stream");
    Ok(())
}

#[tokio::test]
async fn stop_waits_for_in_flight_messages() -> Result<()> {
    let service = fixtures::setup_service().await?;
    fixtures::publish_messages(&service, 6).await?;
    let handler = Arc::new(RecordingHandler::with_delay(Duration::from_millis(200)));

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config(3, 3), handler.clone());
    eventually(|| handler.peak_active.load(Ordering::SeqCst) > 0).await?;
    let summary = tokio::time::timeout(Duration::from_secs(10), handle.stop()).await??;
    let acked = fixtures::acked_ids(&service).await?;

    assert!(summary.dispatched > 0, "expected messages to be dispatched before stop");
    assert!(
        summary.processed == summary.dispatched,
        "expected every dispatched message to be processed before stop returned, dispatched {} processed {}",
        summary.dispatched,
        summary.processed
    );
    assert!(
        handler.handled().len() as u64 == summary.processed,
        "expected handler to have finished {} messages, got {}",
        summary.processed,
        handler.handled().len()
    );
    assert!(acked.len() as u64 == summary.processed, "expected {} acks, got {}", summary.processed, acked.len());
    Ok(())
}

#[tokio::test]
async fn provisioning_failure_stops_the_run() -> Result<()> {
    let service = FaultyService::new(MemoryLogService::new());
    service.faults.stream_info_fails.store(true, Ordering::SeqCst);
    let handler = Arc::new(RecordingHandler::default());

    let handle = lifecycle::start(Arc::new(service), fixtures::descriptor(), config(2, 2), handler);
    let states = handle.subscribe_state();
    let res = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await?;

    assert!(matches!(res, Err(RunError::Provision(_))), "expected provisioning error, got {:?}", res);
    assert!(*states.borrow() == RunState::Stopped, "expected run to be stopped, got {}", *states.borrow());
    Ok(())
}

#[tokio::test]
async fn closed_connection_terminates_the_run() -> Result<()> {
    let service = fixtures::setup_service().await?;
    let handler = Arc::new(RecordingHandler::default());

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config(2, 2), handler);
    wait_for_state(&handle, RunState::Running).await?;
    let states = handle.subscribe_state();
    service.close();
    let res = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await?;

    assert!(matches!(res, Err(RunError::Fetch(FetchError::Closed(_)))), "expected closed connection error, got {:?}", res);
    assert!(*states.borrow() == RunState::Stopped, "expected run to be stopped, got {}", *states.borrow());
    Ok(())
}

#[tokio::test]
async fn drain_timeout_abandons_stuck_workers() -> Result<()> {
    let service = fixtures::setup_service().await?;
    fixtures::publish_messages(&service, 2).await?;
    let handler = Arc::new(RecordingHandler::stalling_on("msg-2"));
    let config = ConsumerConfig {
        drain_timeout: Some(Duration::from_millis(100)),
        ..config(1, 1)
    };

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config, handler.clone());
    eventually(|| handler.handled().len() == 1).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await??;
    let acked = fixtures::acked_ids(&service).await?;

    assert!(!summary.drained, "expected the drain to be abandoned");
    assert!(summary.processed == 1, "expected the message finished before the timeout to be counted, got {}", summary.processed);
    assert!(acked == vec!["msg-1"], "expected only msg-1 acked, got {:?}", acked);
    Ok(())
}

#[tokio::test]
async fn failed_messages_are_redelivered_until_acked() -> Result<()> {
    let service = fixtures::setup_service().await?;
    fixtures::publish_messages(&service, 5).await?;
    let handler = Arc::new(FailFirstHandler::default());

    let handle = lifecycle::start(Arc::new(service.clone()), fixtures::descriptor(), config(2, 4), handler.clone());
    let observer = service.clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            let acked = observer.stream_state(fixtures::STREAM).await.map(|state| state.acked.len()).unwrap_or(0);
            if acked >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    tokio::time::timeout(Duration::from_secs(5), handle.stop()).await??;

    let state = service.stream_state(fixtures::STREAM).await.unwrap_or_default();
    let mut acked = fixtures::acked_ids(&service).await?;
    acked.sort();
    assert!(acked == sorted_ids(1..=5), "expected each message acked once, got {:?}", acked);
    assert!(state.naks == 5, "expected one nak per message, got {}", state.naks);
    Ok(())
}
