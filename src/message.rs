//! Message, envelope, and stream-name types shared by every other module.
//!
//! No I/O happens here. Stream naming follows Message DB conventions: a
//! stream is `<category>-<identity>`, and a name without `-` addresses a
//! whole category.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Separator between a stream's category and its identity.
pub const CATEGORY_SEPARATOR: char = '-';

/// Subscription stream name that selects the whole log.
pub const ALL_STREAMS: &str = "$all";

/// Return the category of a stream name: everything before the first `-`.
///
/// A name without a separator is its own category.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::category;
///
/// assert_eq!(category("account-a1"), "account");
/// assert_eq!(category("account-a1-b2"), "account");
/// assert_eq!(category("account"), "account");
/// ```
pub fn category(stream_name: &str) -> &str {
    stream_name
        .split_once(CATEGORY_SEPARATOR)
        .map_or(stream_name, |(category, _)| category)
}

/// Returns `true` if `name` addresses a category rather than a single stream.
pub fn is_category(name: &str) -> bool {
    !name.contains(CATEGORY_SEPARATOR)
}

/// Build `"<category>-<identity>"`.
pub fn stream_name(category: &str, identity: &str) -> String {
    format!("{category}{CATEGORY_SEPARATOR}{identity}")
}

/// A message as recorded in the log. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Writer-assigned message id.
    pub id: Uuid,
    /// Stream the message belongs to.
    pub stream_name: String,
    /// Message type tag (e.g. `"Deposited"`).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Zero-based position within the stream.
    pub position: u64,
    /// Position in the whole log, monotonically increasing.
    pub global_position: u64,
    /// Message payload.
    pub data: Value,
    /// Optional metadata payload.
    pub metadata: Option<Value>,
    /// When the store recorded the message.
    pub time: SystemTime,
}

impl Message {
    /// Category of the stream this message was written to.
    pub fn category(&self) -> &str {
        category(&self.stream_name)
    }
}

/// A `{type, data}` pair: what a command carries in, and what a command
/// handler emits.
///
/// Usually built through [`MessageType::envelope`](crate::MessageType::envelope),
/// which validates the payload against the type's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Payload.
    pub data: Value,
}

impl Envelope {
    /// Build an envelope from an already-encoded payload.
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
        }
    }
}

/// Expected stream version for optimistic concurrency on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    #[default]
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream's last message must be at exactly this position.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expected version matching a stream whose last position is `last`.
    pub fn from_last_position(last: Option<u64>) -> Self {
        match last {
            Some(position) => Self::Exact(position),
            None => Self::NoStream,
        }
    }

    /// Message DB encoding: `-1` for no stream, `None` for any.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Any => None,
            Self::NoStream => Some(-1),
            Self::Exact(v) => Some(i64::try_from(v).unwrap_or(i64::MAX)),
        }
    }

    /// Returns `true` if a stream whose last position is `current` satisfies this expectation.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current.is_none(),
            Self::Exact(v) => current == Some(v),
        }
    }
}

/// Arguments to [`MessageStore::write_message`](crate::MessageStore::write_message).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteMessage {
    /// Message id; must be unique across the store.
    pub id: Uuid,
    /// Target stream.
    pub stream_name: String,
    /// Message type tag.
    pub message_type: String,
    /// Payload.
    pub data: Value,
    /// Optional metadata payload.
    pub metadata: Option<Value>,
    /// Optimistic concurrency expectation.
    pub expected_version: ExpectedVersion,
}

impl WriteMessage {
    /// Write `envelope` to `stream_name` with no concurrency expectation.
    pub fn new(id: Uuid, stream_name: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            id,
            stream_name: stream_name.into(),
            message_type: envelope.message_type,
            data: envelope.data,
            metadata: None,
            expected_version: ExpectedVersion::Any,
        }
    }

    /// Set the expected version.
    pub fn with_expected_version(mut self, expected: ExpectedVersion) -> Self {
        self.expected_version = expected;
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
