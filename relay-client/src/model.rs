//! Stream and message data model.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::error::DecodeError;

/// The maximum number of replicas a stream may request.
const MAX_REPLICAS: usize = 5;

/// An application message as it travels through the stream.
///
/// The `id` is assigned by the caller and is the deduplication key of the message. It must stay
/// the same across retransmissions of the same logical message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    /// The caller assigned ID of this message.
    pub id: String,
    /// The opaque payload of this message.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// The time at which this message was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Create a new message with the given ID, stamped with the current time.
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Encode this message for submission to the log service.
    pub fn encode(&self) -> Result<Bytes> {
        let data = serde_json::to_vec(self)?;
        Ok(Bytes::from(data))
    }

    /// Decode a message from a delivered payload.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(data).map_err(DecodeError::from)
    }
}

/// (De)serialize message payloads as base64 strings.
mod payload_base64 {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<u8>, D::Error> {
        let b64: String = Deserialize::deserialize(val)?;
        base64::decode(&b64).map_err(|err| DeError::custom(err.to_string()))
    }
}

/// The description of a durable stream, as created by the provisioner.
///
/// Once created, the stream is owned by the log service. A descriptor is never used to
/// reconcile the configuration of a stream which already exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// The name of the stream.
    pub name: String,
    /// The subjects captured by the stream; may contain `*` and `>` wildcards.
    pub subjects: Vec<String>,
    /// The retention policy of the stream.
    pub retention: RetentionPolicy,
    /// The storage backend of the stream.
    pub storage: StorageType,
    /// The maximum age of messages in the stream. A zero duration means unlimited.
    pub max_age: Duration,
    /// The number of replicas of the stream.
    pub replicas: usize,
    /// The window within which published messages with the same ID are deduplicated.
    pub duplicate_window: Duration,
}

impl StreamDescriptor {
    /// The default duplicate detection window, which is 1 minute.
    pub fn duplicate_window_default() -> Duration {
        Duration::from_secs(60)
    }

    /// Create a new descriptor with default policies for the given name and subjects.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::default(),
            storage: StorageType::default(),
            max_age: Duration::from_secs(86_400),
            replicas: 1,
            duplicate_window: Self::duplicate_window_default(),
        }
    }

    /// Validate the contents of this descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("stream name may not be an empty string");
        }
        if self.name.chars().any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>')) {
            bail!("stream name `{}` may not contain whitespace, `.`, `*` or `>`", self.name);
        }
        if self.subjects.is_empty() || self.subjects.iter().any(|subject| subject.is_empty()) {
            bail!("stream `{}` must capture at least one non-empty subject", self.name);
        }
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            bail!("stream replicas must be between 1 and {}, got {}", MAX_REPLICAS, self.replicas);
        }
        Ok(())
    }

    /// Check if the given subject is captured by this stream.
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|pattern| subject_matches(pattern, subject))
    }
}

/// Check if the given subject matches the given pattern.
///
/// Subjects are `.` delimited tokens. A `*` token matches exactly one token, a trailing `>`
/// matches one or more remaining tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for pattern_token in pattern.split('.') {
        match (pattern_token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            (_, None) => return false,
            ("*", Some(_)) => continue,
            (expected, Some(token)) if expected == token => continue,
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

/// The retention policy of a stream.
///
/// Deserialized through `FromStr`, so any casing is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Retain messages until the stream limits are reached.
    Limits,
    /// Retain messages while there are consumers interested in them.
    Interest,
    /// Retain messages until they are acknowledged by a consumer.
    WorkQueue,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::WorkQueue
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Limits => "limits",
                Self::Interest => "interest",
                Self::WorkQueue => "workqueue",
            }
        )
    }
}

impl FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        match val.to_lowercase().as_str() {
            "limits" => Ok(Self::Limits),
            "interest" => Ok(Self::Interest),
            "workqueue" | "work-queue" => Ok(Self::WorkQueue),
            other => bail!("unknown retention policy `{}`, expected one of limits, interest, workqueue", other),
        }
    }
}

/// The storage backend of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    File,
    Memory,
}

impl Default for StorageType {
    fn default() -> Self {
        Self::File
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::File => "file",
                Self::Memory => "memory",
            }
        )
    }
}

impl FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        match val.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown storage type `{}`, expected one of file, memory", other),
        }
    }
}

impl<'de> Deserialize<'de> for RetentionPolicy {
    fn deserialize<D: Deserializer<'de>>(val: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(val)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for StorageType {
    fn deserialize<D: Deserializer<'de>>(val: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(val)?;
        raw.parse().map_err(de::Error::custom)
    }
}
