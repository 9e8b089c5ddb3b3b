//! Relay error abstractions.
//!
//! Collaborators propagate `anyhow::Error` with context. The core surfaces the typed errors
//! below, each wrapping the underlying cause.

/// The error returned when a stream could not be provisioned. This is fatal to a run.
#[derive(Debug, thiserror::Error)]
#[error("error provisioning stream: {0:#}")]
pub struct ProvisionError(#[from] pub anyhow::Error);

/// The error returned when a message could not be published.
///
/// Publishing is recoverable: the producer logs the error and moves on to its next cycle.
#[derive(Debug, thiserror::Error)]
#[error("error publishing message {id}: {source:#}")]
pub struct PublishError {
    /// The ID of the message which failed to publish.
    pub id: String,
    /// The underlying cause.
    pub source: anyhow::Error,
}

/// The error returned from a pull fetch.
///
/// A fetch which times out with no messages is not an error.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The connection to the log service is gone; this ends the run.
    #[error("connection to the log service has been closed: {0:#}")]
    Closed(anyhow::Error),
    /// A transport level error, the fetch loop will retry.
    #[error("error fetching messages: {0:#}")]
    Transport(anyhow::Error),
}

impl FetchError {
    /// Check if this error should terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// The error returned when a delivered payload is not a valid message.
///
/// This is resolved per message by a nak and is never fatal to the worker pool.
#[derive(Debug, thiserror::Error)]
#[error("error decoding message payload: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// The error returned when an ack or nak could not be delivered to the log service.
///
/// The occurrence will be redelivered once its ack wait elapses, so this is only logged.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("error acknowledging delivery {sequence}: {source:#}")]
    Ack { sequence: u64, source: anyhow::Error },
    #[error("error negatively acknowledging delivery {sequence}: {source:#}")]
    Nak { sequence: u64, source: anyhow::Error },
}

/// The error which terminated a consumer run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// The durable consumer could not be bound.
    #[error("error binding consumer {consumer}: {source:#}")]
    Consumer { consumer: String, source: anyhow::Error },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The run task itself failed to complete.
    #[error("error joining consumer run task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A marker error used by log services to indicate that the connection is unrecoverably closed.
///
/// Services return this inside of an `anyhow::Error`; it is detected via `downcast_ref`.
#[derive(Debug, thiserror::Error)]
#[error("log service connection closed")]
pub struct ConnectionClosed;
