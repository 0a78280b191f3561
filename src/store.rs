//! The message store boundary.
//!
//! The runtime never talks to storage directly. Everything it needs is the
//! five operations of [`MessageStore`], which a Message DB adapter (or the
//! bundled [`InMemoryMessageStore`](crate::InMemoryMessageStore)) provides.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{Message, WriteMessage};

/// Batch cap applied by stores when a read does not specify one.
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Position and batch bounds for a read.
///
/// `position` is inclusive: the read returns messages at or after it. For
/// stream reads it is a stream position; for category and log-wide reads it
/// is a global position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// First position to return. `None` reads from the beginning.
    pub position: Option<u64>,
    /// Maximum number of messages. `None` uses the store's default cap.
    pub batch_size: Option<u64>,
}

impl ReadOptions {
    /// Read from `position` onwards.
    pub fn from_position(position: u64) -> Self {
        Self {
            position: Some(position),
            batch_size: None,
        }
    }

    /// Cap the read at `batch_size` messages.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Effective start position.
    pub fn start(&self) -> u64 {
        self.position.unwrap_or(0)
    }

    /// Effective batch cap.
    pub fn limit(&self) -> u64 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

/// Append-only message log with optimistic concurrency.
///
/// Implementations must be safe for concurrent use: aggregates, checkpoint
/// writers, and every subscription loop share one instance.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message and return the stream version it was written at.
    ///
    /// # Errors
    ///
    /// - [`StoreError::WrongExpectedVersion`] if `expected_version` is not met.
    /// - [`StoreError::DuplicateMessageId`] if `id` was already written.
    /// - [`StoreError::InvalidId`] if the backend rejects the id.
    async fn write_message(&self, message: WriteMessage) -> Result<u64, StoreError>;

    /// Messages of one stream in ascending stream position.
    async fn get_stream_messages(
        &self,
        stream_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages of every stream in a category, in ascending global position.
    async fn get_category_messages(
        &self,
        category_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages of the whole log in ascending global position.
    async fn get_all_messages(&self, options: ReadOptions) -> Result<Vec<Message>, StoreError>;

    /// The last message of a stream, if the stream exists.
    async fn get_last_stream_message(
        &self,
        stream_name: &str,
    ) -> Result<Option<Message>, StoreError>;
}
