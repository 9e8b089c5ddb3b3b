//! Stream provisioning.

use std::sync::Arc;

use crate::error::ProvisionError;
use crate::model::StreamDescriptor;
use crate::service::{LogService, StreamCreated};

/// The outcome of a successful provisioning call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provisioned {
    /// The stream was created by this call.
    Created,
    /// The stream already existed and was left untouched.
    Existing,
}

/// Ensures that a durable stream exists before any publishing or consuming begins.
pub struct StreamProvisioner {
    service: Arc<dyn LogService>,
}

impl StreamProvisioner {
    /// Create a new instance.
    pub fn new(service: Arc<dyn LogService>) -> Self {
        Self { service }
    }

    /// Ensure the described stream exists, creating it if absent.
    ///
    /// An existing stream is never modified, even when its configuration differs from the
    /// given descriptor. Calling this any number of times yields the same stream.
    #[tracing::instrument(level = "debug", skip(self, descriptor), fields(stream = %descriptor.name))]
    pub async fn ensure(&self, descriptor: &StreamDescriptor) -> Result<Provisioned, ProvisionError> {
        descriptor.validate()?;

        let existing = self
            .service
            .stream_info(&descriptor.name)
            .await
            .map_err(|err| err.context(format!("error looking up stream {}", descriptor.name)))?;
        if let Some(existing) = existing {
            Self::warn_on_divergence(descriptor, &existing);
            tracing::info!(stream = %descriptor.name, "stream already exists");
            return Ok(Provisioned::Existing);
        }

        match self.service.create_stream(descriptor).await? {
            StreamCreated::Created => {
                tracing::info!(
                    stream = %descriptor.name,
                    subjects = ?descriptor.subjects,
                    retention = %descriptor.retention,
                    storage = %descriptor.storage,
                    "stream created"
                );
                Ok(Provisioned::Created)
            }
            // Lost a creation race with another provisioner.
            StreamCreated::AlreadyExists => {
                tracing::info!(stream = %descriptor.name, "stream already exists");
                Ok(Provisioned::Existing)
            }
        }
    }

    fn warn_on_divergence(desired: &StreamDescriptor, existing: &StreamDescriptor) {
        if desired != existing {
            tracing::warn!(
                stream = %desired.name,
                ?desired,
                ?existing,
                "existing stream configuration differs from the requested configuration, leaving it as is"
            );
        }
    }
}
