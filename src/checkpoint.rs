//! Durable subscription positions.
//!
//! A named subscription records its progress as ordinary messages in its own
//! stream, `subscriberPosition-<id>`. The latest message wins; older ones are
//! history.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::Error;
use crate::message::{Envelope, WriteMessage, stream_name};
use crate::store::MessageStore;

/// Category of every checkpoint stream.
pub const CHECKPOINT_CATEGORY: &str = "subscriberPosition";

/// Type tag of checkpoint messages.
pub const POSITION_UPDATED: &str = "$EventedSubscriptionPositionUpdated";

/// Stream holding the checkpoints of `subscription_id`.
///
/// ```
/// use eventfold_runtime::checkpoint::checkpoint_stream_name;
///
/// assert_eq!(checkpoint_stream_name("balances"), "subscriberPosition-balances");
/// ```
pub fn checkpoint_stream_name(subscription_id: &str) -> String {
    stream_name(CHECKPOINT_CATEGORY, subscription_id)
}

/// Read the last persisted position of `subscription_id`.
///
/// Returns `None` if the subscription has never checkpointed.
///
/// # Errors
///
/// Returns [`Error::Store`] if the read fails, or
/// [`Error::InvalidCheckpoint`] if the last message does not carry a position.
pub async fn load_position(
    store: &dyn MessageStore,
    subscription_id: &str,
) -> Result<Option<u64>, Error> {
    let stream = checkpoint_stream_name(subscription_id);
    let Some(message) = store.get_last_stream_message(&stream).await? else {
        return Ok(None);
    };
    let position = parse_position(&message.data).ok_or_else(|| Error::InvalidCheckpoint {
        stream_name: stream.clone(),
        reason: format!("no position in {} message", message.message_type),
    })?;
    tracing::debug!(stream_name = %stream, position, "checkpoint loaded");
    Ok(Some(position))
}

/// Append a checkpoint recording `position` for `subscription_id`.
///
/// Positions are stored as decimal strings so they survive any JSON reader
/// without precision loss.
///
/// # Errors
///
/// Returns [`Error::Store`] if the write fails.
pub async fn save_position(
    store: &dyn MessageStore,
    subscription_id: &str,
    position: u64,
) -> Result<(), Error> {
    let stream = checkpoint_stream_name(subscription_id);
    let envelope = Envelope::new(POSITION_UPDATED, json!({ "position": position.to_string() }));
    store
        .write_message(WriteMessage::new(Uuid::new_v4(), stream.clone(), envelope))
        .await?;
    tracing::debug!(stream_name = %stream, position, "checkpoint saved");
    Ok(())
}

fn parse_position(data: &Value) -> Option<u64> {
    match data.get("position")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
