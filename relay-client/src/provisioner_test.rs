use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::fixtures::{self, FaultyService};
use crate::model::{RetentionPolicy, StorageType};
use crate::provisioner::{Provisioned, StreamProvisioner};
use crate::service::{LogService, MemoryLogService};

#[tokio::test]
async fn ensure_creates_absent_stream() -> Result<()> {
    let service = MemoryLogService::new();
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));

    let outcome = provisioner.ensure(&fixtures::descriptor()).await?;
    let info = service.stream_info(fixtures::STREAM).await?;

    assert!(outcome == Provisioned::Created, "expected stream to be created, got {:?}", outcome);
    assert!(info == Some(fixtures::descriptor()), "expected stream to match descriptor, got {:?}", info);
    Ok(())
}

#[tokio::test]
async fn ensure_is_idempotent() -> Result<()> {
    let service = FaultyService::new(MemoryLogService::new());
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));

    let first = provisioner.ensure(&fixtures::descriptor()).await?;
    let second = provisioner.ensure(&fixtures::descriptor()).await?;
    let third = provisioner.ensure(&fixtures::descriptor()).await?;
    let creates = service.faults.create_calls.load(Ordering::SeqCst);

    assert!(first == Provisioned::Created, "expected first call to create, got {:?}", first);
    assert!(second == Provisioned::Existing, "expected second call to find the stream, got {:?}", second);
    assert!(third == Provisioned::Existing, "expected third call to find the stream, got {:?}", third);
    assert!(creates == 1, "expected exactly 1 create call, got {}", creates);
    Ok(())
}

#[tokio::test]
async fn ensure_does_not_reconcile_divergent_stream() -> Result<()> {
    let service = MemoryLogService::new();
    let mut existing = fixtures::descriptor();
    existing.retention = RetentionPolicy::Limits;
    existing.storage = StorageType::Memory;
    existing.max_age = Duration::from_secs(60);
    service.create_stream(&existing).await?;
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));

    let outcome = provisioner.ensure(&fixtures::descriptor()).await?;
    let info = service.stream_info(fixtures::STREAM).await?;

    assert!(outcome == Provisioned::Existing, "expected stream to be left as is, got {:?}", outcome);
    assert!(info == Some(existing), "expected existing config to be kept, got {:?}", info);
    Ok(())
}

#[tokio::test]
async fn ensure_fails_on_lookup_error() -> Result<()> {
    let service = FaultyService::new(MemoryLogService::new());
    service.faults.stream_info_fails.store(true, Ordering::SeqCst);
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));

    let res = provisioner.ensure(&fixtures::descriptor()).await;

    assert!(res.is_err(), "expected provisioning to fail, got {:?}", res);
    assert!(service.faults.create_calls.load(Ordering::SeqCst) == 0, "expected no create call after failed lookup");
    Ok(())
}

#[tokio::test]
async fn ensure_fails_on_create_error() -> Result<()> {
    let service = FaultyService::new(MemoryLogService::new());
    service.faults.create_fails.store(true, Ordering::SeqCst);
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));

    let res = provisioner.ensure(&fixtures::descriptor()).await;

    assert!(res.is_err(), "expected provisioning to fail, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn ensure_rejects_invalid_descriptor() -> Result<()> {
    let service = FaultyService::new(MemoryLogService::new());
    let provisioner = StreamProvisioner::new(Arc::new(service.clone()));
    let mut descriptor = fixtures::descriptor();
    descriptor.subjects.clear();

    let res = provisioner.ensure(&descriptor).await;

    assert!(res.is_err(), "expected invalid descriptor to be rejected, got {:?}", res);
    assert!(service.faults.create_calls.load(Ordering::SeqCst) == 0, "expected no create call for invalid descriptor");
    Ok(())
}
