//! Message DB backend.
//!
//! Talks to a Postgres database with the Message DB schema installed, through
//! its stored functions (`write_message`, `get_stream_messages`,
//! `get_category_messages`, `get_last_stream_message`). Log-wide reads go
//! straight to the `messages` table. Write rejections raised by the functions
//! are mapped back onto [`StoreError`] variants from the Postgres error text.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Message, WriteMessage};
use crate::store::{MessageStore, ReadOptions};

/// Schema the Message DB installer creates its objects in.
pub const MESSAGE_STORE_SCHEMA: &str = "message_store";

/// Columns of a message row, normalised for decoding. `time` is stored
/// without a zone (UTC) and is read as microseconds since the epoch.
const COLUMNS: &str = "id::varchar AS id, stream_name::varchar AS stream_name, \
    type::varchar AS type, position::bigint AS position, \
    global_position::bigint AS global_position, data::varchar AS data, \
    metadata::varchar AS metadata, \
    (extract(epoch FROM time) * 1000000)::bigint AS time_micros";

const WRONG_EXPECTED_VERSION: &str = "Wrong expected version: ";
const INVALID_UUID: &str = "invalid input syntax for type uuid: ";
const DUPLICATE_MESSAGE_ID: &str = "duplicate key value violates unique constraint \"messages_id\"";

/// [`MessageStore`] over a Postgres pool with Message DB installed.
#[derive(Debug, Clone)]
pub struct MessageDbStore {
    pool: PgPool,
}

impl MessageDbStore {
    /// Wrap an existing pool.
    ///
    /// The pool's connections must resolve Message DB's functions, i.e. have
    /// `message_store` on their `search_path`. [`connect`](Self::connect)
    /// sets that up.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool to `database_url` with `search_path` set to
    /// `message_store, public`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the URL is malformed or the first
    /// connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(StoreError::backend)?
            .options([("search_path", format!("{MESSAGE_STORE_SCHEMA},public"))]);
        let pool = PgPool::connect_with(options)
            .await
            .map_err(StoreError::backend)?;
        tracing::info!(schema = MESSAGE_STORE_SCHEMA, "message store connected");
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(
        &self,
        sql: &str,
        name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(name)
            .bind(to_i64(options.start()))
            .bind(to_i64(options.limit()))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(decode_message).collect()
    }
}

#[async_trait]
impl MessageStore for MessageDbStore {
    async fn write_message(&self, message: WriteMessage) -> Result<u64, StoreError> {
        let id = message.id;
        let metadata = message.metadata.as_ref().map(Value::to_string);
        let position: i64 = sqlx::query_scalar(
            "SELECT write_message($1, $2, $3, $4::jsonb, $5::jsonb, $6)",
        )
        .bind(id.to_string())
        .bind(&message.stream_name)
        .bind(&message.message_type)
        .bind(message.data.to_string())
        .bind(metadata)
        .bind(message.expected_version.as_i64())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| write_error(err, id))?;

        tracing::debug!(
            stream_name = %message.stream_name,
            message_type = %message.message_type,
            position,
            "message written"
        );
        u64::try_from(position).map_err(StoreError::backend)
    }

    async fn get_stream_messages(
        &self,
        stream_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM get_stream_messages($1, $2, $3)");
        self.fetch(&sql, stream_name, options).await
    }

    async fn get_category_messages(
        &self,
        category_name: &str,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM get_category_messages($1, $2, $3)");
        self.fetch(&sql, category_name, options).await
    }

    async fn get_all_messages(&self, options: ReadOptions) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE global_position >= $1 \
             ORDER BY global_position LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(options.start()))
            .bind(to_i64(options.limit()))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(decode_message).collect()
    }

    async fn get_last_stream_message(
        &self,
        stream_name: &str,
    ) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM get_last_stream_message($1)");
        let row = sqlx::query(&sql)
            .bind(stream_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.as_ref().map(decode_message).transpose()
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn decode_message(row: &PgRow) -> Result<Message, StoreError> {
    let id: String = row.try_get("id").map_err(StoreError::backend)?;
    let data: String = row.try_get("data").map_err(StoreError::backend)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(StoreError::backend)?;
    let position: i64 = row.try_get("position").map_err(StoreError::backend)?;
    let global_position: i64 = row.try_get("global_position").map_err(StoreError::backend)?;
    let time_micros: i64 = row.try_get("time_micros").map_err(StoreError::backend)?;

    Ok(Message {
        id: Uuid::parse_str(&id).map_err(StoreError::backend)?,
        stream_name: row.try_get("stream_name").map_err(StoreError::backend)?,
        message_type: row.try_get("type").map_err(StoreError::backend)?,
        position: u64::try_from(position).map_err(StoreError::backend)?,
        global_position: u64::try_from(global_position).map_err(StoreError::backend)?,
        data: serde_json::from_str(&data).map_err(StoreError::backend)?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(StoreError::backend)?,
        time: time_from_micros(time_micros),
    })
}

fn time_from_micros(micros: i64) -> SystemTime {
    match u64::try_from(micros) {
        Ok(micros) => UNIX_EPOCH + Duration::from_micros(micros),
        Err(_) => UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs()),
    }
}

fn write_error(err: sqlx::Error, id: Uuid) -> StoreError {
    let known = match &err {
        sqlx::Error::Database(db) => parse_write_error(db.message(), id),
        _ => None,
    };
    known.unwrap_or_else(|| StoreError::backend(err))
}

/// Recognise the rejections `write_message` raises.
///
/// `id` is reported for duplicates, since Postgres names only the constraint.
fn parse_write_error(message: &str, id: Uuid) -> Option<StoreError> {
    if let Some(at) = message.find(WRONG_EXPECTED_VERSION) {
        // "<expected> (Stream: <stream>, Stream Version: <version>)"
        let rest = &message[at + WRONG_EXPECTED_VERSION.len()..];
        let (expected, rest) = rest.split_once(" (Stream: ")?;
        let (stream, rest) = rest.split_once(", Stream Version: ")?;
        let (version, _) = rest.split_once(')')?;
        let stream_version: i64 = version.trim().parse().ok()?;
        return Some(StoreError::WrongExpectedVersion {
            stream_name: stream.to_owned(),
            stream_version: u64::try_from(stream_version).ok(),
            expected_version: expected.trim().parse().ok()?,
        });
    }
    if let Some(at) = message.find(INVALID_UUID) {
        let rest = message[at + INVALID_UUID.len()..].strip_prefix('"')?;
        let (bad, _) = rest.split_once('"')?;
        return Some(StoreError::InvalidId { id: bad.to_owned() });
    }
    if message.contains(DUPLICATE_MESSAGE_ID) {
        return Some(StoreError::DuplicateMessageId { id });
    }
    None
}
