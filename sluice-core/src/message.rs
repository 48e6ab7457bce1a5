//! Message and topic types shared by the harness and the messaging client.

use crate::types::{Sequence, Timestamp};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a message ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage domain of a topic, rendered as the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TopicDomain {
    /// Durable topic (`persistent://`)
    #[default]
    Persistent,
    /// Memory-only topic (`non-persistent://`)
    NonPersistent,
}

impl TopicDomain {
    /// URI scheme for this domain.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::NonPersistent => "non-persistent",
        }
    }
}

impl fmt::Display for TopicDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Fully-qualified topic identifier: `<scheme>://<tenant>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Build a topic identifier from its parts.
    ///
    /// # Errors
    /// Returns an error if any part is empty or contains a `/`.
    pub fn new(
        domain: TopicDomain,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> crate::Result<Self> {
        for (label, part) in [("tenant", tenant), ("namespace", namespace), ("topic", name)] {
            if part.is_empty() {
                return Err(crate::Error::configuration(format!("{label} cannot be empty")));
            }
            if part.contains('/') {
                return Err(crate::Error::configuration(format!(
                    "{label} '{part}' cannot contain '/'"
                )));
            }
        }

        Ok(Self(format!("{}://{tenant}/{namespace}/{name}", domain.scheme())))
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same identifier with `suffix` appended to the name segment.
    #[must_use]
    pub fn with_suffix(&self, suffix: impl fmt::Display) -> Self {
        Self(format!("{}{suffix}", self.0))
    }

    /// The trailing name segment.
    #[must_use]
    pub fn local_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl FromStr for TopicName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::configuration(format!("invalid topic identifier '{s}'"));
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let domain = match scheme {
            "persistent" => TopicDomain::Persistent,
            "non-persistent" => TopicDomain::NonPersistent,
            _ => return Err(invalid()),
        };
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(namespace), Some(name)) => {
                Self::new(domain, tenant, namespace, name)
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A message delivered to a consumer handle.
///
/// The harness never interprets the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Topic the message was published to
    pub topic: TopicName,

    /// Opaque payload
    pub payload: Bytes,

    /// Position within the topic
    pub sequence: Sequence,

    /// Publish timestamp
    pub published_at: Timestamp,

    /// Number of times this message was delivered before
    pub redelivery_count: u32,
}

impl Message {
    /// Create a new message for the given topic.
    #[must_use]
    pub fn new(topic: TopicName, sequence: Sequence, payload: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            topic,
            payload,
            sequence,
            published_at: Utc::now(),
            redelivery_count: 0,
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Time since the message was published, clamped at zero.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.published_at).to_std().unwrap_or_default()
    }
}
