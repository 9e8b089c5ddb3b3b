//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use relay::{RetentionPolicy, StorageType, StreamDescriptor};
use serde::Deserialize;

/// The prefix of all environment variables read by the CLI.
pub const ENV_PREFIX: &str = "RELAY_";

/// Runtime configuration data, read from `RELAY_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The URL of the NATS server.
    #[serde(default = "Config::default_nats_url")]
    pub nats_url: String,
    /// The name of the stream to provision and consume.
    #[serde(default = "Config::default_stream_name")]
    pub stream_name: String,
    /// The subjects captured by the stream, comma separated in the environment.
    #[serde(default = "Config::default_stream_subjects")]
    pub stream_subjects: Vec<String>,
    /// The subject messages are published on.
    #[serde(default = "Config::default_subject")]
    pub subject: String,
    /// The retention policy of the stream.
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// The storage backend of the stream.
    #[serde(default)]
    pub storage: StorageType,
    /// The maximum age of messages in the stream.
    #[serde(default = "Config::default_max_age_seconds")]
    pub max_age_seconds: u64,
    /// The number of replicas of the stream.
    #[serde(default = "Config::default_replicas")]
    pub replicas: usize,
    /// The window within which messages with the same ID are deduplicated.
    #[serde(default = "Config::default_duplicate_window_seconds")]
    pub duplicate_window_seconds: u64,
    /// The durable consumer name; defaults to `{stream_name}-consumer`.
    #[serde(default)]
    pub consumer: Option<String>,
}

impl Config {
    /// Create a new config instance from the process environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Create a new config instance from the given variables.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .context("error building config from env")
    }

    /// The descriptor of the configured stream.
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: self.stream_name.clone(),
            subjects: self.stream_subjects.clone(),
            retention: self.retention,
            storage: self.storage,
            max_age: Duration::from_secs(self.max_age_seconds),
            replicas: self.replicas,
            duplicate_window: Duration::from_secs(self.duplicate_window_seconds),
        }
    }

    fn default_nats_url() -> String {
        "nats://localhost:4222".into()
    }

    fn default_stream_name() -> String {
        "ORDERS".into()
    }

    fn default_stream_subjects() -> Vec<String> {
        vec!["ORDERS.*".into()]
    }

    fn default_subject() -> String {
        "ORDERS.received".into()
    }

    fn default_max_age_seconds() -> u64 {
        86_400
    }

    fn default_replicas() -> usize {
        1
    }

    fn default_duplicate_window_seconds() -> u64 {
        StreamDescriptor::duplicate_window_default().as_secs()
    }
}
