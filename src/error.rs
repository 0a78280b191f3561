//! Crate-level error types for command dispatch, subscriptions, and the
//! message store boundary.
//!
//! Every variant carries a stable [`code`](Error::code) string and a
//! [`details`](Error::details) object naming the offending identifiers, so
//! callers can match failures programmatically without parsing messages.

use serde_json::{Value, json};
use uuid::Uuid;

/// Boxed error used for handler rejections and opaque backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a [`MessageStore`](crate::MessageStore) implementation.
///
/// The first three variants are the store-level write rejections every
/// backend must report with these exact kinds. Anything else (connection
/// loss, driver errors) is wrapped in [`StoreError::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream's current version did not match the writer's expectation.
    ///
    /// `stream_version` is `None` when the stream does not exist yet.
    #[error(
        "wrong expected version: {expected_version} (stream: {stream_name}, stream version: {})",
        display_version(.stream_version)
    )]
    WrongExpectedVersion {
        /// Stream the write targeted.
        stream_name: String,
        /// Version the stream is actually at.
        stream_version: Option<u64>,
        /// Version the writer supplied, rendered Message DB style (`-1` = no stream).
        expected_version: i64,
    },

    /// A message with this id was already written.
    #[error("duplicate message id: {id}")]
    DuplicateMessageId {
        /// The rejected message id.
        id: Uuid,
    },

    /// The backend rejected the message id as malformed.
    #[error("invalid message id: {id}")]
    InvalidId {
        /// The id as the backend saw it.
        id: String,
    },

    /// Any other backend failure.
    #[error("message store failure: {0}")]
    Backend(#[source] BoxError),
}

fn display_version(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "-1".to_owned(),
    }
}

impl StoreError {
    /// Wrap an arbitrary backend error.
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WrongExpectedVersion { .. } => "WRONG_EXPECTED_VERSION",
            Self::DuplicateMessageId { .. } => "DUPLICATE_MESSAGE_ID",
            Self::InvalidId { .. } => "INVALID_ID",
            Self::Backend(_) => "MESSAGE_STORE_FAILURE",
        }
    }

    /// Identifiers involved in the failure.
    pub fn details(&self) -> Value {
        match self {
            Self::WrongExpectedVersion {
                stream_name,
                stream_version,
                expected_version,
            } => json!({
                "stream": stream_name,
                "streamVersion": stream_version,
                "expectedVersion": expected_version,
            }),
            Self::DuplicateMessageId { id } => json!({ "id": id }),
            Self::InvalidId { id } => json!({ "id": id }),
            Self::Backend(source) => json!({ "message": source.to_string() }),
        }
    }
}

/// Error returned by aggregates, the application router, and subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No registered aggregate owns this command type.
    #[error("command type \"{message_type}\" cannot be handled by any registered aggregates")]
    UnhandledCommand {
        /// The unrouted command type.
        message_type: String,
    },

    /// A command was routed to an aggregate that has no handler for it.
    #[error("command type \"{message_type}\" cannot be handled by aggregate \"{aggregate}\"")]
    UnhandledAggregateCommand {
        /// The command type.
        message_type: String,
        /// Aggregate the command reached.
        aggregate: String,
    },

    /// The command payload lacks a usable value in the aggregate's identity field.
    #[error(
        "command type \"{message_type}\" not able to identify stream in aggregate \"{aggregate}\" (missing \"{identify_by}\")"
    )]
    UnableToIdentifyAggregateStream {
        /// The command type.
        message_type: String,
        /// Aggregate the command reached.
        aggregate: String,
        /// Payload field the aggregate identifies streams by.
        identify_by: String,
    },

    /// Two aggregates registered a handler for the same command type.
    #[error("command type \"{message_type}\" is being handled by multiple aggregates ({first}, {second})")]
    DuplicateCommandHandler {
        /// The contested command type.
        message_type: String,
        /// Aggregate registered first.
        first: String,
        /// Aggregate that tried to claim it again.
        second: String,
    },

    /// Aggregate names must not contain the category separator.
    #[error("aggregate name \"{name}\" must not contain '-'")]
    InvalidAggregateName {
        /// The rejected name.
        name: String,
    },

    /// A payload did not match the schema of its message type.
    #[error("invalid payload for message type \"{message_type}\": {source}")]
    InvalidPayload {
        /// Message type whose schema rejected the payload.
        message_type: String,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },

    /// A checkpoint message could not be interpreted as a position.
    #[error("invalid checkpoint in stream \"{stream_name}\": {reason}")]
    InvalidCheckpoint {
        /// Checkpoint stream that was read.
        stream_name: String,
        /// What was wrong with the stored message.
        reason: String,
    },

    /// A command handler rejected the command, or a subscription handler failed.
    ///
    /// Forwards the handler's own `Display` and `Error` impls.
    #[error(transparent)]
    Rejected(BoxError),

    /// The message store refused or failed an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Wrap an application-level rejection.
    pub fn rejected(err: impl Into<BoxError>) -> Self {
        Self::Rejected(err.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnhandledCommand { .. } => "UNHANDLED_COMMAND",
            Self::UnhandledAggregateCommand { .. } => "UNHANDLED_AGGREGATE_COMMAND",
            Self::UnableToIdentifyAggregateStream { .. } => "UNABLE_TO_IDENTIFY_AGGREGATE_STREAM",
            Self::DuplicateCommandHandler { .. } => "DUPLICATE_COMMAND_HANDLER",
            Self::InvalidAggregateName { .. } => "INVALID_AGGREGATE_NAME",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::InvalidCheckpoint { .. } => "INVALID_CHECKPOINT",
            Self::Rejected(_) => "REJECTED",
            Self::Store(inner) => inner.code(),
        }
    }

    /// Identifiers involved in the failure.
    pub fn details(&self) -> Value {
        match self {
            Self::UnhandledCommand { message_type } => json!({ "type": message_type }),
            Self::UnhandledAggregateCommand {
                message_type,
                aggregate,
            } => json!({ "type": message_type, "aggregate": aggregate }),
            Self::UnableToIdentifyAggregateStream {
                message_type,
                aggregate,
                identify_by,
            } => json!({
                "type": message_type,
                "aggregate": aggregate,
                "identifyBy": identify_by,
            }),
            Self::DuplicateCommandHandler {
                message_type,
                first,
                second,
            } => json!({ "type": message_type, "aggregates": [first, second] }),
            Self::InvalidAggregateName { name } => json!({ "name": name }),
            Self::InvalidPayload {
                message_type,
                source,
            } => json!({ "type": message_type, "message": source.to_string() }),
            Self::InvalidCheckpoint {
                stream_name,
                reason,
            } => json!({ "stream": stream_name, "reason": reason }),
            Self::Rejected(source) => json!({ "message": source.to_string() }),
            Self::Store(inner) => inner.details(),
        }
    }

    /// Returns the handler's rejection if this error is one, for downcasting.
    pub fn as_rejection(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Rejected(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}
