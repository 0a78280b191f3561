//! Aggregates: handler registries, folding, and single-command execution.
//!
//! An [`Aggregate`] owns the command and event handlers for one category of
//! streams. Executing a command reads the target stream, folds it into the
//! current state, asks the command handler for a decision, and writes at most
//! one event with an optimistic concurrency check.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{BoxError, Error, StoreError};
use crate::message::{CATEGORY_SEPARATOR, Envelope, ExpectedVersion, Message, WriteMessage};
use crate::message_type::MessageType;
use crate::store::{MessageStore, ReadOptions};

/// Decision returned by a command handler.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Accept the command without writing anything.
    NoOp,
    /// Accept the command and write this event.
    Emit(Envelope),
    /// Reject the command. Nothing is written and `dispatch` fails with
    /// [`Error::Rejected`] wrapping this error.
    Reject(BoxError),
}

impl CommandOutcome {
    /// Emit `data` as an event of type `event_type`.
    ///
    /// A payload that does not validate against `event_type` turns into a
    /// rejection rather than a write.
    pub fn emit<T: Serialize + DeserializeOwned>(event_type: &MessageType<T>, data: &T) -> Self {
        match event_type.envelope(data) {
            Ok(envelope) => Self::Emit(envelope),
            Err(err) => Self::Reject(Box::new(err)),
        }
    }

    /// Reject the command with `err`.
    pub fn reject(err: impl Into<BoxError>) -> Self {
        Self::Reject(err.into())
    }
}

/// How an aggregate loads the history it folds before running a command.
///
/// The shipped [`SingleRead`] strategy issues one stream read and folds
/// whatever it returns. A stream longer than the batch cap therefore folds
/// only its prefix; with expected-version checks enabled the subsequent
/// write fails with `WrongExpectedVersion` instead of deciding on stale state.
#[async_trait]
pub trait HydrationStrategy: Send + Sync + fmt::Debug {
    /// Load the messages of `stream_name` in ascending stream position.
    async fn load(
        &self,
        store: &dyn MessageStore,
        stream_name: &str,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Read the stream once, from the beginning, in a single batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleRead {
    /// Batch cap for the read. `None` uses the store's default.
    pub batch_size: Option<u64>,
}

#[async_trait]
impl HydrationStrategy for SingleRead {
    async fn load(
        &self,
        store: &dyn MessageStore,
        stream_name: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let options = ReadOptions {
            position: None,
            batch_size: self.batch_size,
        };
        store.get_stream_messages(stream_name, options).await
    }
}

/// A validated command, ready to be decided against the folded state.
type PreparedCommand<S> = Box<dyn FnOnce(&S) -> CommandOutcome + Send>;

type CommandHandlerFn<S> = Box<dyn Fn(&Value) -> Result<PreparedCommand<S>, Error> + Send + Sync>;

type EventHandlerFn<S> = Box<dyn Fn(S, &Value) -> Result<S, Error> + Send + Sync>;

/// An event-sourced entity: a named category of streams plus the handlers
/// that decide commands and fold events for it.
///
/// Handlers are registered with chained calls; registering the same type
/// twice replaces the earlier handler.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::{Aggregate, CommandOutcome, MessageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Open { account_id: String }
/// #[derive(Serialize, Deserialize)]
/// struct Opened { account_id: String }
///
/// #[derive(Clone, Default)]
/// struct Account { open: bool }
///
/// let open = MessageType::<Open>::new("Open");
/// let opened = MessageType::<Opened>::new("Opened");
///
/// let account = Aggregate::new("account", "account_id", Account::default())
///     .unwrap()
///     .command(&open, {
///         let opened = opened.clone();
///         move |state: &Account, cmd: Open| {
///             if state.open {
///                 return CommandOutcome::NoOp;
///             }
///             CommandOutcome::emit(&opened, &Opened { account_id: cmd.account_id })
///         }
///     })
///     .event(&opened, |_state, _event: Opened| Account { open: true });
///
/// assert_eq!(account.command_types(), vec!["Open".to_string()]);
/// ```
pub struct Aggregate<S> {
    name: String,
    identify_by: String,
    initial_value: S,
    commands: HashMap<String, CommandHandlerFn<S>>,
    events: HashMap<String, EventHandlerFn<S>>,
    hydration: Box<dyn HydrationStrategy>,
    check_expected_version: bool,
}

impl<S> fmt::Debug for Aggregate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        let mut events: Vec<_> = self.events.keys().collect();
        events.sort();
        f.debug_struct("Aggregate")
            .field("name", &self.name)
            .field("identify_by", &self.identify_by)
            .field("commands", &commands)
            .field("events", &events)
            .field("hydration", &self.hydration)
            .field("check_expected_version", &self.check_expected_version)
            .finish()
    }
}

impl<S> Aggregate<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create an aggregate for the `name` category.
    ///
    /// Streams are named `"<name>-<identity>"`, where the identity is read
    /// from the `identify_by` field of each command payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAggregateName`] if `name` contains `-`, since
    /// that would break category derivation for every stream it writes.
    pub fn new(
        name: impl Into<String>,
        identify_by: impl Into<String>,
        initial_value: S,
    ) -> Result<Self, Error> {
        let name = name.into();
        if name.contains(CATEGORY_SEPARATOR) {
            return Err(Error::InvalidAggregateName { name });
        }
        Ok(Self {
            name,
            identify_by: identify_by.into(),
            initial_value,
            commands: HashMap::new(),
            events: HashMap::new(),
            hydration: Box::new(SingleRead::default()),
            check_expected_version: true,
        })
    }

    /// Register the handler for `command_type`.
    ///
    /// The handler receives the folded state and the validated payload and
    /// returns a [`CommandOutcome`]. It must not perform I/O.
    pub fn command<C, F>(mut self, command_type: &MessageType<C>, handler: F) -> Self
    where
        C: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(&S, C) -> CommandOutcome + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let parser = command_type.clone();
        let prepare: CommandHandlerFn<S> = Box::new(move |data| {
            let command = parser.parse(data)?;
            let handler = Arc::clone(&handler);
            Ok(Box::new(move |state: &S| handler(state, command)) as PreparedCommand<S>)
        });
        if self
            .commands
            .insert(command_type.name().to_owned(), prepare)
            .is_some()
        {
            tracing::warn!(
                aggregate = %self.name,
                message_type = command_type.name(),
                "command handler replaced"
            );
        }
        self
    }

    /// Register the fold function for `event_type`.
    ///
    /// Must be pure and total: same state and event, same result.
    pub fn event<E, F>(mut self, event_type: &MessageType<E>, handler: F) -> Self
    where
        E: Serialize + DeserializeOwned + 'static,
        F: Fn(S, E) -> S + Send + Sync + 'static,
    {
        let parser = event_type.clone();
        let apply: EventHandlerFn<S> = Box::new(move |state, data| {
            let event = parser.parse(data)?;
            Ok(handler(state, event))
        });
        if self
            .events
            .insert(event_type.name().to_owned(), apply)
            .is_some()
        {
            tracing::warn!(
                aggregate = %self.name,
                message_type = event_type.name(),
                "event handler replaced"
            );
        }
        self
    }

    /// Replace the hydration strategy (default: [`SingleRead`]).
    pub fn hydration(mut self, strategy: impl HydrationStrategy + 'static) -> Self {
        self.hydration = Box::new(strategy);
        self
    }

    /// Enable or disable the expected-version check on command writes.
    ///
    /// Enabled by default. When disabled, events are written with
    /// [`ExpectedVersion::Any`] and concurrent commands on one stream can
    /// both succeed against the same folded state.
    pub fn expected_version(mut self, enabled: bool) -> Self {
        self.check_expected_version = enabled;
        self
    }

    /// Category name of this aggregate's streams.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload field commands are routed to streams by.
    pub fn identify_by(&self) -> &str {
        &self.identify_by
    }

    /// State every fold starts from.
    pub fn initial_value(&self) -> &S {
        &self.initial_value
    }

    /// Registered command type names, sorted.
    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.commands.keys().cloned().collect();
        types.sort();
        types
    }

    /// Fold `messages` starting from a fresh copy of the initial value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if a message of a handled type does
    /// not match its schema. Messages of unhandled types are skipped.
    pub fn fold(&self, messages: &[Message]) -> Result<S, Error> {
        self.fold_from(self.initial_value.clone(), messages)
    }

    /// Continue folding `messages` on top of `state`.
    ///
    /// `fold_from(fold(a)?, b)` equals `fold(a ++ b)`.
    pub fn fold_from(&self, state: S, messages: &[Message]) -> Result<S, Error> {
        messages.iter().try_fold(state, |state, message| {
            match self.events.get(&message.message_type) {
                Some(apply) => apply(state, &message.data),
                None => Ok(state),
            }
        })
    }

    /// Derive the target stream name from a command payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnableToIdentifyAggregateStream`] if the identity
    /// field is missing or empty.
    pub fn stream_name_for(&self, message_type: &str, data: &Value) -> Result<String, Error> {
        data.get(&self.identify_by)
            .and_then(identity_of)
            .map(|identity| crate::message::stream_name(&self.name, &identity))
            .ok_or_else(|| Error::UnableToIdentifyAggregateStream {
                message_type: message_type.to_owned(),
                aggregate: self.name.clone(),
                identify_by: self.identify_by.clone(),
            })
    }

    /// Execute one command against the stream its payload identifies.
    ///
    /// Returns the stream version of the written event, or `None` when the
    /// handler decided on [`CommandOutcome::NoOp`].
    ///
    /// # Errors
    ///
    /// - [`Error::UnhandledAggregateCommand`] if no handler is registered.
    /// - [`Error::UnableToIdentifyAggregateStream`] if the identity is missing.
    /// - [`Error::InvalidPayload`] if the payload or stored history does not validate.
    /// - [`Error::Rejected`] if the handler rejected the command.
    /// - [`Error::Store`] if the read or the write fails, including
    ///   `WrongExpectedVersion` when another writer got there first.
    pub async fn run_command(
        &self,
        message_id: Uuid,
        store: &dyn MessageStore,
        command: Envelope,
    ) -> Result<Option<u64>, Error> {
        let span = tracing::info_span!(
            "execute",
            aggregate = %self.name,
            message_type = %command.message_type,
            %message_id,
        );
        self.execute(message_id, store, command)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        message_id: Uuid,
        store: &dyn MessageStore,
        command: Envelope,
    ) -> Result<Option<u64>, Error> {
        let prepare = self.commands.get(&command.message_type).ok_or_else(|| {
            Error::UnhandledAggregateCommand {
                message_type: command.message_type.clone(),
                aggregate: self.name.clone(),
            }
        })?;
        let stream_name = self.stream_name_for(&command.message_type, &command.data)?;
        let decide = prepare(&command.data)?;

        let history = self.hydration.load(store, &stream_name).await?;
        let state = self.fold(&history)?;
        tracing::debug!(
            stream_name = %stream_name,
            events = history.len(),
            "aggregate hydrated"
        );

        let event = match decide(&state) {
            CommandOutcome::NoOp => {
                tracing::debug!(stream_name = %stream_name, "command accepted without write");
                return Ok(None);
            }
            CommandOutcome::Reject(err) => {
                tracing::debug!(stream_name = %stream_name, error = %err, "command rejected");
                return Err(Error::Rejected(err));
            }
            CommandOutcome::Emit(event) => event,
        };

        let expected = if self.check_expected_version {
            ExpectedVersion::from_last_position(history.last().map(|m| m.position))
        } else {
            ExpectedVersion::Any
        };
        let event_type = event.message_type.clone();
        let version = store
            .write_message(
                WriteMessage::new(message_id, stream_name.clone(), event)
                    .with_expected_version(expected),
            )
            .await?;
        tracing::debug!(
            stream_name = %stream_name,
            event_type = %event_type,
            version,
            "event written"
        );
        Ok(Some(version))
    }
}

/// Stream identity from a payload field: non-empty strings and non-zero numbers.
fn identity_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Type-erased view of an [`Aggregate`] used by the
/// [`Application`](crate::Application) router.
///
/// Lets one router hold aggregates with different state types.
#[async_trait]
pub trait AggregateDispatcher: Send + Sync {
    /// Category name of the aggregate.
    fn name(&self) -> &str;

    /// Command types this aggregate handles.
    fn command_types(&self) -> Vec<String>;

    /// Execute one command. See [`Aggregate::run_command`].
    async fn run_command(
        &self,
        message_id: Uuid,
        store: &dyn MessageStore,
        command: Envelope,
    ) -> Result<Option<u64>, Error>;
}

#[async_trait]
impl<S> AggregateDispatcher for Aggregate<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Aggregate::name(self)
    }

    fn command_types(&self) -> Vec<String> {
        Aggregate::command_types(self)
    }

    async fn run_command(
        &self,
        message_id: Uuid,
        store: &dyn MessageStore,
        command: Envelope,
    ) -> Result<Option<u64>, Error> {
        Aggregate::run_command(self, message_id, store, command).await
    }
}
