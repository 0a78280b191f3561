//! In-memory [`MessageStore`] for tests, demos, and local development.
//!
//! Follows Message DB semantics: stream positions start at 0, global
//! positions start at 1 and increase across the whole log, categories are
//! derived from the stream name, and message ids are unique store-wide.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Message, WriteMessage, category};
use crate::store::{MessageStore, ReadOptions};

#[derive(Debug, Default)]
struct Log {
    messages: Vec<Message>,
    // Indices into `messages`, per stream, in stream order.
    streams: HashMap<String, Vec<usize>>,
    ids: HashSet<Uuid>,
}

impl Log {
    fn stream_version(&self, stream_name: &str) -> Option<u64> {
        self.streams
            .get(stream_name)
            .and_then(|indices| indices.len().checked_sub(1))
            .map(|v| v as u64)
    }
}

/// A [`MessageStore`] that keeps the whole log in memory.
///
/// All state sits behind one `std::sync::Mutex`; no lock is held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    log: Mutex<Log>,
}

impl InMemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in the whole log.
    pub fn len(&self) -> usize {
        self.lock().map(|log| log.messages.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Log>, StoreError> {
        self.log
            .lock()
            .map_err(|_| StoreError::backend("in-memory message store lock poisoned"))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn write_message(&self, message: WriteMessage) -> Result<u64, StoreError> {
        let mut log = self.lock()?;

        if log.ids.contains(&message.id) {
            return Err(StoreError::DuplicateMessageId { id: message.id });
        }

        let current = log.stream_version(&message.stream_name);
        if !message.expected_version.matches(current) {
            return Err(StoreError::WrongExpectedVersion {
                stream_name: message.stream_name,
                stream_version: current,
                expected_version: message.expected_version.as_i64().unwrap_or(-1),
            });
        }

        let position = current.map_or(0, |v| v + 1);
        let global_position = log.messages.len() as u64 + 1;
        let index = log.messages.len();
        log.ids.insert(message.id);
        log.streams
            .entry(message.stream_name.clone())
            .or_default()
            .push(index);
        log.messages.push(Message {
            id: message.id,
            stream_name: message.stream_name,
            message_type: message.message_type,
            position,
            global_position,
            data: message.data,
            metadata: message.metadata,
            time: SystemTime::now(),
        });

        Ok(position)
    }

    async fn get_stream_messages(
        &self,
        stream_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let log = self.lock()?;
        let Some(indices) = log.streams.get(stream_name) else {
            return Ok(Vec::new());
        };
        Ok(indices
            .iter()
            .map(|&i| &log.messages[i])
            .filter(|m| m.position >= options.start())
            .take(options.limit() as usize)
            .cloned()
            .collect())
    }

    async fn get_category_messages(
        &self,
        category_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let log = self.lock()?;
        Ok(log
            .messages
            .iter()
            .filter(|m| m.global_position >= options.start())
            .filter(|m| category(&m.stream_name) == category_name)
            .take(options.limit() as usize)
            .cloned()
            .collect())
    }

    async fn get_all_messages(&self, options: ReadOptions) -> Result<Vec<Message>, StoreError> {
        let log = self.lock()?;
        Ok(log
            .messages
            .iter()
            .filter(|m| m.global_position >= options.start())
            .take(options.limit() as usize)
            .cloned()
            .collect())
    }

    async fn get_last_stream_message(
        &self,
        stream_name: &str,
    ) -> Result<Option<Message>, StoreError> {
        let log = self.lock()?;
        Ok(log
            .streams
            .get(stream_name)
            .and_then(|indices| indices.last())
            .map(|&i| log.messages[i].clone()))
    }
}
