//! Aggregates, command routing, and checkpointed polling subscriptions over a
//! Message DB style store.

mod aggregate;
mod application;
pub mod checkpoint;
mod error;
mod memory;
mod message;
#[cfg(feature = "message-db")]
mod message_db;
mod message_type;
mod store;
mod subscription;

pub use aggregate::{Aggregate, AggregateDispatcher, CommandOutcome, HydrationStrategy, SingleRead};
pub use application::{Application, ApplicationBuilder, StopHandle};
pub use error::{BoxError, Error, StoreError};
pub use memory::InMemoryMessageStore;
pub use message::{
    ALL_STREAMS, CATEGORY_SEPARATOR, Envelope, ExpectedVersion, Message, WriteMessage, category,
    is_category, stream_name,
};
#[cfg(feature = "message-db")]
pub use message_db::{MESSAGE_STORE_SCHEMA, MessageDbStore};
pub use message_type::MessageType;
pub use store::{DEFAULT_BATCH_SIZE, MessageStore, ReadOptions};
pub use subscription::{
    Subscription, SubscriptionConfig, SubscriptionIdentity, SubscriptionInfo, SubscriptionTarget,
    log_error,
};
