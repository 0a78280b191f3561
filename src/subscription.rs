//! Polling subscriptions.
//!
//! A [`Subscription`] reads a stream, a category, or the whole log in
//! batches, hands each message to the handler registered for its type, and
//! records how far it got. Each running subscription is one tokio task.
//!
//! The loop runs until [`Subscription::stop`] is called or an error occurs.
//! Errors are fatal to that subscription only: they are reported through the
//! callback given at construction and the task exits. Stop is observed
//! between messages and during the idle sleep, so a message whose handler
//! has started always finishes, along with any checkpoint it makes due.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkpoint;
use crate::error::{BoxError, Error, StoreError};
use crate::message::{ALL_STREAMS, Message, is_category};
use crate::message_type::MessageType;
use crate::store::{MessageStore, ReadOptions};

/// Tuning knobs for the polling loop.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_runtime::SubscriptionConfig;
///
/// let config = SubscriptionConfig {
///     poll_interval: Duration::from_millis(500),
///     ..SubscriptionConfig::default()
/// };
/// assert_eq!(config.batch_size, 100);
/// assert_eq!(config.position_update_interval, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Maximum messages fetched per read.
    ///
    /// Default: 100.
    pub batch_size: u64,

    /// Persist the position after this many processed messages.
    ///
    /// Only named subscriptions persist. The position is also saved when the
    /// subscription is stopped with unsaved progress. Values below 1 are
    /// treated as 1.
    ///
    /// Default: 100.
    pub position_update_interval: u64,

    /// How long to sleep after a read that returned nothing.
    ///
    /// Default: 100 milliseconds.
    pub poll_interval: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            position_update_interval: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Whether a subscription keeps a durable position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionIdentity {
    /// No checkpoints: every start replays from the beginning.
    Anonymous,
    /// Checkpoints are kept in `subscriberPosition-<id>` and every start
    /// resumes after the last saved position.
    Named(String),
}

impl SubscriptionIdentity {
    /// Shorthand for [`SubscriptionIdentity::Named`].
    pub fn named(id: impl Into<String>) -> Self {
        Self::Named(id.into())
    }

    /// The subscription id, if named.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Named(id) => Some(id),
        }
    }
}

/// What a subscription reads, derived from its stream name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// `"$all"`: the whole log, keyed by global position.
    All,
    /// A name without `-`: every stream in the category, keyed by global position.
    Category(String),
    /// Anything else: one stream, keyed by stream position.
    Stream(String),
}

impl SubscriptionTarget {
    /// Classify a subscription stream name.
    ///
    /// ```
    /// use eventfold_runtime::SubscriptionTarget;
    ///
    /// assert_eq!(SubscriptionTarget::parse("$all"), SubscriptionTarget::All);
    /// assert_eq!(
    ///     SubscriptionTarget::parse("account"),
    ///     SubscriptionTarget::Category("account".into())
    /// );
    /// assert_eq!(
    ///     SubscriptionTarget::parse("account-a1"),
    ///     SubscriptionTarget::Stream("account-a1".into())
    /// );
    /// ```
    pub fn parse(stream: &str) -> Self {
        if stream == ALL_STREAMS {
            Self::All
        } else if is_category(stream) {
            Self::Category(stream.to_owned())
        } else {
            Self::Stream(stream.to_owned())
        }
    }

    async fn read(
        &self,
        store: &dyn MessageStore,
        options: ReadOptions,
    ) -> Result<Vec<Message>, StoreError> {
        match self {
            Self::All => store.get_all_messages(options).await,
            Self::Category(category) => store.get_category_messages(category, options).await,
            Self::Stream(stream) => store.get_stream_messages(stream, options).await,
        }
    }

    /// The position this target's reads are keyed by.
    fn cursor_of(&self, message: &Message) -> u64 {
        match self {
            Self::All | Self::Category(_) => message.global_position,
            Self::Stream(_) => message.position,
        }
    }
}

/// Identifies the failing subscription to an error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Id of a named subscription; `None` when anonymous.
    pub subscription_id: Option<String>,
    /// Stream name the subscription was created with.
    pub stream: String,
}

/// Error callback that logs through `tracing::error!`.
///
/// Pass it to [`Subscription::new`] when logging is all you need.
pub fn log_error(err: &Error, info: &SubscriptionInfo) {
    tracing::error!(
        subscription_id = info.subscription_id.as_deref().unwrap_or("<anonymous>"),
        stream = %info.stream,
        code = err.code(),
        error = %err,
        "subscription stopped on error"
    );
}

type ErrorCallback = Arc<dyn Fn(&Error, &SubscriptionInfo) + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Validates the payload and starts the handler.
type MessageHandlerFn = Arc<dyn Fn(&Message) -> Result<HandlerFuture, Error> + Send + Sync>;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A checkpointed polling consumer of a stream, category, or the whole log.
///
/// Dropping a running subscription without calling [`stop`](Self::stop)
/// closes its stop channel; the loop notices at its next idle sleep and exits
/// as if stopped.
///
/// # Examples
///
/// ```no_run
/// use std::convert::Infallible;
/// use std::sync::Arc;
/// use eventfold_runtime::{
///     InMemoryMessageStore, Message, MessageType, Subscription, SubscriptionIdentity, log_error,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Deposited { account_id: String, amount: u64 }
///
/// # async fn run() {
/// let deposited = MessageType::<Deposited>::new("Deposited");
/// let subscription = Subscription::new("account", SubscriptionIdentity::named("balances"), log_error)
///     .handle(&deposited, |event: Deposited, _message: Message| async move {
///         println!("{} +{}", event.account_id, event.amount);
///         Ok::<_, Infallible>(())
///     });
///
/// subscription.start(Arc::new(InMemoryMessageStore::new())).await;
/// subscription.stop().await;
/// # }
/// ```
pub struct Subscription {
    stream: String,
    target: SubscriptionTarget,
    identity: SubscriptionIdentity,
    config: SubscriptionConfig,
    handlers: HashMap<String, MessageHandlerFn>,
    on_error: ErrorCallback,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Subscription")
            .field("stream", &self.stream)
            .field("target", &self.target)
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("handlers", &handlers)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Create a subscription on `stream`.
    ///
    /// `stream` is `"$all"`, a category name, or a full stream name.
    /// `on_error` is called once with the error that ended the loop; see
    /// [`log_error`] for a logging default.
    pub fn new<F>(stream: impl Into<String>, identity: SubscriptionIdentity, on_error: F) -> Self
    where
        F: Fn(&Error, &SubscriptionInfo) + Send + Sync + 'static,
    {
        let stream = stream.into();
        Self {
            target: SubscriptionTarget::parse(&stream),
            stream,
            identity,
            config: SubscriptionConfig::default(),
            handlers: HashMap::new(),
            on_error: Arc::new(on_error),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the loop configuration.
    pub fn config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for `event_type`.
    ///
    /// The handler receives the validated payload and the recorded message.
    /// Messages of types with no handler are skipped but still advance the
    /// position. A handler error stops the subscription.
    pub fn handle<T, F, Fut, E>(mut self, event_type: &MessageType<T>, handler: F) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(T, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let parser = event_type.clone();
        let dispatch: MessageHandlerFn = Arc::new(move |message: &Message| {
            let event = parser.parse(&message.data)?;
            let pending = handler(event, message.clone());
            Ok(Box::pin(async move { pending.await.map_err(Into::<BoxError>::into) }) as HandlerFuture)
        });
        if self
            .handlers
            .insert(event_type.name().to_owned(), dispatch)
            .is_some()
        {
            tracing::warn!(
                stream = %self.stream,
                message_type = event_type.name(),
                "subscription handler replaced"
            );
        }
        self
    }

    /// Stream name this subscription was created with.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// How the stream name was classified.
    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Named or anonymous.
    pub fn identity(&self) -> &SubscriptionIdentity {
        &self.identity
    }

    /// What error callbacks receive for this subscription.
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription_id: self.identity.id().map(str::to_owned),
            stream: self.stream.clone(),
        }
    }

    /// Returns `true` while the polling task is alive.
    ///
    /// Becomes `false` after [`stop`](Self::stop) completes or after the loop
    /// ended on an error. Waits for a concurrent `stop` to finish first.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Spawn the polling loop against `store`.
    ///
    /// Does nothing if the loop is already running. A subscription whose
    /// loop ended on an error, or was stopped, can be started again; a named
    /// one resumes from its last checkpoint. If a stop is still draining the
    /// previous loop, this waits for it before spawning, so at most one loop
    /// runs at a time.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self, store: Arc<dyn MessageStore>) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            if !previous.task.is_finished() && !previous.is_stopping() {
                *running = Some(previous);
                tracing::debug!(stream = %self.stream, "subscription already running");
                return;
            }
            join(previous.task, &self.stream).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            store,
            target: self.target.clone(),
            info: self.info(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            on_error: Arc::clone(&self.on_error),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));
        *running = Some(Running { shutdown_tx, task });
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// Returns once the in-flight message, and any checkpoint it made due,
    /// are done and a final checkpoint has been written for unsaved
    /// progress. Safe to call repeatedly, before `start`, or after the loop
    /// already failed.
    ///
    /// The subscription stays locked until the loop has exited: a
    /// concurrent [`start`](Self::start) or [`is_running`](Self::is_running)
    /// waits for the drain.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(current) = running.take() {
            // The loop may have exited on its own; nobody is listening then.
            let _ = current.shutdown_tx.send(true);
            join(current.task, &self.stream).await;
        }
    }

    /// Signal the loop to stop without waiting for it.
    ///
    /// The loop stays registered until [`stop`](Self::stop) or
    /// [`start`](Self::start) joins it. Returns `true` if there was a loop to
    /// signal.
    pub(crate) async fn signal_stop(&self) -> bool {
        match self.running.lock().await.as_ref() {
            Some(current) => {
                let _ = current.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }
}

impl Running {
    fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Await a subscription task, logging a panic.
async fn join(task: JoinHandle<()>, stream: &str) {
    if let Err(e) = task.await {
        tracing::error!(stream = %stream, error = %e, "subscription task panicked");
    }
}

/// Position bookkeeping for one run of the loop.
#[derive(Debug, Default)]
struct Progress {
    /// Last processed position, in the target's keying.
    cursor: Option<u64>,
    /// Counted messages processed since the last checkpoint.
    unsaved: u64,
}

impl Progress {
    fn read_options(&self, batch_size: u64) -> ReadOptions {
        ReadOptions {
            position: Some(self.cursor.map_or(0, |c| c + 1)),
            batch_size: Some(batch_size),
        }
    }
}

/// Everything the spawned loop owns.
struct Worker {
    store: Arc<dyn MessageStore>,
    target: SubscriptionTarget,
    info: SubscriptionInfo,
    config: SubscriptionConfig,
    handlers: HashMap<String, MessageHandlerFn>,
    on_error: ErrorCallback,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut progress = match self.resume().await {
            Ok(progress) => progress,
            Err(err) => {
                (self.on_error)(&err, &self.info);
                return;
            }
        };
        tracing::info!(
            subscription_id = ?self.info.subscription_id,
            stream = %self.info.stream,
            position = ?progress.cursor,
            "subscription started"
        );

        match self.poll(&mut progress, &mut shutdown_rx).await {
            Ok(()) => match self.save(&mut progress).await {
                Ok(()) => tracing::info!(
                    subscription_id = ?self.info.subscription_id,
                    stream = %self.info.stream,
                    position = ?progress.cursor,
                    "subscription stopped"
                ),
                Err(err) => (self.on_error)(&err, &self.info),
            },
            Err(err) => {
                (self.on_error)(&err, &self.info);
                if let Err(save_err) = self.save(&mut progress).await {
                    tracing::warn!(
                        stream = %self.info.stream,
                        error = %save_err,
                        "checkpoint after failure not saved"
                    );
                }
            }
        }
    }

    async fn resume(&self) -> Result<Progress, Error> {
        let cursor = match &self.info.subscription_id {
            Some(id) => checkpoint::load_position(self.store.as_ref(), id).await?,
            None => None,
        };
        Ok(Progress { cursor, unsaved: 0 })
    }

    async fn poll(
        &self,
        progress: &mut Progress,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), Error> {
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let options = progress.read_options(self.config.batch_size);
            let batch = self.target.read(self.store.as_ref(), options).await?;

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown_rx.changed() => {
                        // A closed channel means the Subscription was dropped.
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            for message in &batch {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
                self.process(message, progress).await?;
            }
        }
    }

    async fn process(&self, message: &Message, progress: &mut Progress) -> Result<(), Error> {
        if let Some(handler) = self.handlers.get(&message.message_type) {
            handler(message)?.await.map_err(Error::Rejected)?;
            tracing::debug!(
                stream = %self.info.stream,
                message_type = %message.message_type,
                global_position = message.global_position,
                "message handled"
            );
        }
        progress.cursor = Some(self.target.cursor_of(message));

        // Our own checkpoints show up under $all; counting them would make
        // every save schedule the next one.
        if self.is_own_checkpoint(message) {
            return Ok(());
        }
        progress.unsaved += 1;
        if progress.unsaved >= self.config.position_update_interval.max(1) {
            self.save(progress).await?;
        }
        Ok(())
    }

    fn is_own_checkpoint(&self, message: &Message) -> bool {
        self.info
            .subscription_id
            .as_deref()
            .is_some_and(|id| message.stream_name == checkpoint::checkpoint_stream_name(id))
    }

    /// Persist the cursor if named and there is unsaved progress.
    async fn save(&self, progress: &mut Progress) -> Result<(), Error> {
        if progress.unsaved == 0 {
            return Ok(());
        }
        if let (Some(id), Some(position)) = (&self.info.subscription_id, progress.cursor) {
            checkpoint::save_position(self.store.as_ref(), id, position).await?;
        }
        progress.unsaved = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::aggregate::test_fixtures::{Deposited, deposited};
    use crate::memory::InMemoryMessageStore;
    use crate::message::{Envelope, WriteMessage};

    /// In-memory store that counts polling reads.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryMessageStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageStore for CountingStore {
        async fn write_message(&self, message: WriteMessage) -> Result<u64, StoreError> {
            self.inner.write_message(message).await
        }

        async fn get_stream_messages(
            &self,
            stream_name: &str,
            options: ReadOptions,
        ) -> Result<Vec<Message>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_stream_messages(stream_name, options).await
        }

        async fn get_category_messages(
            &self,
            category_name: &str,
            options: ReadOptions,
        ) -> Result<Vec<Message>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_category_messages(category_name, options).await
        }

        async fn get_all_messages(&self, options: ReadOptions) -> Result<Vec<Message>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_all_messages(options).await
        }

        async fn get_last_stream_message(
            &self,
            stream_name: &str,
        ) -> Result<Option<Message>, StoreError> {
            self.inner.get_last_stream_message(stream_name).await
        }
    }

    /// Store whose every operation fails as if the backend were down.
    struct FailingStore;

    fn unreachable_backend() -> StoreError {
        StoreError::backend("connection refused")
    }

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn write_message(&self, _message: WriteMessage) -> Result<u64, StoreError> {
            Err(unreachable_backend())
        }

        async fn get_stream_messages(
            &self,
            _stream_name: &str,
            _options: ReadOptions,
        ) -> Result<Vec<Message>, StoreError> {
            Err(unreachable_backend())
        }

        async fn get_category_messages(
            &self,
            _category_name: &str,
            _options: ReadOptions,
        ) -> Result<Vec<Message>, StoreError> {
            Err(unreachable_backend())
        }

        async fn get_all_messages(&self, _options: ReadOptions) -> Result<Vec<Message>, StoreError> {
            Err(unreachable_backend())
        }

        async fn get_last_stream_message(
            &self,
            _stream_name: &str,
        ) -> Result<Option<Message>, StoreError> {
            Err(unreachable_backend())
        }
    }

    async fn write_deposit(store: &dyn MessageStore, stream: &str, amount: u64) {
        let envelope = deposited()
            .envelope(&Deposited {
                account_id: stream.to_owned(),
                amount,
            })
            .unwrap();
        store
            .write_message(WriteMessage::new(Uuid::new_v4(), stream, envelope))
            .await
            .unwrap();
    }

    type Seen = Arc<Mutex<Vec<u64>>>;

    /// Handler recording each deposit amount.
    fn record_amounts(
        seen: &Seen,
    ) -> impl Fn(Deposited, Message) -> std::future::Ready<Result<(), Infallible>> + Send + Sync + 'static
    {
        let seen = Arc::clone(seen);
        move |event: Deposited, _message: Message| {
            seen.lock().unwrap().push(event.amount);
            std::future::ready(Ok(()))
        }
    }

    async fn checkpoints(store: &dyn MessageStore, id: &str) -> Vec<String> {
        store
            .get_stream_messages(&checkpoint::checkpoint_stream_name(id), ReadOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.data["position"].as_str().unwrap().to_owned())
            .collect()
    }

    fn seen(seen: &Seen) -> Vec<u64> {
        seen.lock().unwrap().clone()
    }

    #[test]
    fn target_classification() {
        assert_eq!(SubscriptionTarget::parse("$all"), SubscriptionTarget::All);
        assert_eq!(
            SubscriptionTarget::parse("account"),
            SubscriptionTarget::Category("account".into())
        );
        assert_eq!(
            SubscriptionTarget::parse("account-a1"),
            SubscriptionTarget::Stream("account-a1".into())
        );
    }

    #[test]
    fn config_defaults() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.position_update_interval, 100);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn info_reflects_identity() {
        let named = Subscription::new("account", SubscriptionIdentity::named("balances"), log_error);
        assert_eq!(
            named.info(),
            SubscriptionInfo {
                subscription_id: Some("balances".into()),
                stream: "account".into()
            }
        );
        let anonymous = Subscription::new("$all", SubscriptionIdentity::Anonymous, log_error);
        assert_eq!(anonymous.info().subscription_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_every_interval_and_on_stop() {
        let store = Arc::new(CountingStore::default());
        for amount in 1..=5 {
            write_deposit(store.as_ref(), "account-a1", amount).await;
        }
        let amounts = Seen::default();
        let subscription =
            Subscription::new("account", SubscriptionIdentity::named("balances"), log_error)
                .config(SubscriptionConfig {
                    position_update_interval: 2,
                    ..SubscriptionConfig::default()
                })
                .handle(&deposited(), record_amounts(&amounts));

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen(&amounts), [1, 2, 3, 4, 5]);
        assert_eq!(checkpoints(store.as_ref(), "balances").await, ["2", "4"]);

        subscription.stop().await;
        assert_eq!(checkpoints(store.as_ref(), "balances").await, ["2", "4", "5"]);
        assert!(!subscription.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_sleeps_for_poll_interval() {
        let store = Arc::new(CountingStore::default());
        let subscription = Subscription::new(ALL_STREAMS, SubscriptionIdentity::Anonymous, log_error);

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Reads at 0, 100 and 200 ms.
        assert_eq!(store.reads(), 3);

        subscription.stop().await;
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_empty_batches_are_read_back_to_back() {
        let store = Arc::new(CountingStore::default());
        for amount in 1..=3 {
            write_deposit(store.as_ref(), "account-a1", amount).await;
        }
        let amounts = Seen::default();
        let subscription = Subscription::new("account", SubscriptionIdentity::Anonymous, log_error)
            .config(SubscriptionConfig {
                batch_size: 2,
                ..SubscriptionConfig::default()
            })
            .handle(&deposited(), record_amounts(&amounts));

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // [1, 2], [3], then one empty read before the first sleep.
        assert_eq!(store.reads(), 3);
        assert_eq!(seen(&amounts), [1, 2, 3]);
        subscription.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_message_and_its_checkpoint() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a1", 2).await;

        let amounts = Seen::default();
        let recorder = Arc::clone(&amounts);
        let subscription =
            Subscription::new("account", SubscriptionIdentity::named("slow"), log_error)
                .config(SubscriptionConfig {
                    position_update_interval: 1,
                    ..SubscriptionConfig::default()
                })
                .handle(&deposited(), move |event: Deposited, _: Message| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        recorder.lock().unwrap().push(event.amount);
                        Ok::<_, Infallible>(())
                    }
                });

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        subscription.stop().await;

        assert_eq!(seen(&amounts), [1]);
        assert_eq!(checkpoints(store.as_ref(), "slow").await, ["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_reaches_callback_and_stops_loop() {
        #[derive(Debug, thiserror::Error)]
        #[error("projection unavailable")]
        struct Unavailable;

        let store = Arc::new(InMemoryMessageStore::new());
        for amount in 1..=3 {
            write_deposit(store.as_ref(), "account-a1", amount).await;
        }

        let errors: Arc<Mutex<Vec<(String, SubscriptionInfo)>>> = Arc::default();
        let reported = Arc::clone(&errors);
        let amounts = Seen::default();
        let recorder = Arc::clone(&amounts);
        let subscription = Subscription::new(
            "account",
            SubscriptionIdentity::named("failing"),
            move |err: &Error, info: &SubscriptionInfo| {
                reported
                    .lock()
                    .unwrap()
                    .push((err.to_string(), info.clone()));
            },
        )
        .handle(&deposited(), move |event: Deposited, _: Message| {
            let recorder = Arc::clone(&recorder);
            async move {
                if event.amount == 2 {
                    return Err(Unavailable);
                }
                recorder.lock().unwrap().push(event.amount);
                Ok(())
            }
        });

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen(&amounts), [1]);
        assert_eq!(
            *errors.lock().unwrap(),
            [(
                "projection unavailable".to_string(),
                SubscriptionInfo {
                    subscription_id: Some("failing".into()),
                    stream: "account".into()
                }
            )]
        );
        assert!(!subscription.is_running().await);
        // Progress made before the failure is kept.
        assert_eq!(checkpoints(store.as_ref(), "failing").await, ["1"]);

        subscription.stop().await;
        subscription.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_fatal() {
        let store = Arc::new(InMemoryMessageStore::new());
        store
            .write_message(WriteMessage::new(
                Uuid::new_v4(),
                "account-a1",
                Envelope::new("Deposited", json!({ "amount": "lots" })),
            ))
            .await
            .unwrap();

        let codes: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let reported = Arc::clone(&codes);
        let amounts = Seen::default();
        let subscription = Subscription::new(
            "account",
            SubscriptionIdentity::Anonymous,
            move |err: &Error, _: &SubscriptionInfo| reported.lock().unwrap().push(err.code()),
        )
        .handle(&deposited(), record_amounts(&amounts));

        subscription.start(store).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*codes.lock().unwrap(), ["INVALID_PAYLOAD"]);
        assert!(seen(&amounts).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn named_subscription_resumes_after_checkpoint() {
        let store = Arc::new(InMemoryMessageStore::new());
        for amount in 1..=3 {
            write_deposit(store.as_ref(), "account-a1", amount).await;
        }

        let first = Seen::default();
        let subscription =
            Subscription::new("account", SubscriptionIdentity::named("resume"), log_error)
                .handle(&deposited(), record_amounts(&first));
        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.stop().await;
        assert_eq!(seen(&first), [1, 2, 3]);
        assert_eq!(checkpoints(store.as_ref(), "resume").await, ["3"]);

        write_deposit(store.as_ref(), "account-a1", 4).await;
        let second = Seen::default();
        let subscription =
            Subscription::new("account", SubscriptionIdentity::named("resume"), log_error)
                .handle(&deposited(), record_amounts(&second));
        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.stop().await;
        assert_eq!(seen(&second), [4]);
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_subscription_replays_on_every_start() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a2", 2).await;

        let amounts = Seen::default();
        let subscription = Subscription::new("account", SubscriptionIdentity::Anonymous, log_error)
            .handle(&deposited(), record_amounts(&amounts));

        for _ in 0..2 {
            subscription.start(store.clone()).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            subscription.stop().await;
        }
        assert_eq!(seen(&amounts), [1, 2, 1, 2]);
        assert_eq!(store.len(), 2, "anonymous subscriptions never checkpoint");
    }

    #[tokio::test(start_paused = true)]
    async fn stream_subscription_tracks_stream_position() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a2", 100).await;
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a1", 2).await;

        let amounts = Seen::default();
        let subscription =
            Subscription::new("account-a1", SubscriptionIdentity::named("a1"), log_error)
                .handle(&deposited(), record_amounts(&amounts));
        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.stop().await;

        assert_eq!(seen(&amounts), [1, 2]);
        assert_eq!(checkpoints(store.as_ref(), "a1").await, ["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn own_checkpoints_do_not_trigger_more_checkpoints() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a1", 2).await;

        let amounts = Seen::default();
        let subscription =
            Subscription::new(ALL_STREAMS, SubscriptionIdentity::named("everything"), log_error)
                .config(SubscriptionConfig {
                    position_update_interval: 1,
                    ..SubscriptionConfig::default()
                })
                .handle(&deposited(), record_amounts(&amounts));
        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        subscription.stop().await;

        assert_eq!(seen(&amounts), [1, 2]);
        assert_eq!(checkpoints(store.as_ref(), "everything").await, ["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;

        let amounts = Seen::default();
        let subscription = Subscription::new("account", SubscriptionIdentity::Anonymous, log_error)
            .handle(&deposited(), record_amounts(&amounts));
        subscription.start(store.clone()).await;
        subscription.start(store.clone()).await;
        assert!(subscription.is_running().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.stop().await;
        assert_eq!(seen(&amounts), [1]);
        assert!(!subscription.is_running().await);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let subscription = Subscription::new("account", SubscriptionIdentity::Anonymous, log_error);
        subscription.stop().await;
        assert!(!subscription.is_running().await);
    }

    type Reported = Arc<Mutex<Vec<(&'static str, SubscriptionInfo)>>>;

    fn report_into(
        reported: &Reported,
    ) -> impl Fn(&Error, &SubscriptionInfo) + Send + Sync + 'static {
        let reported = Arc::clone(reported);
        move |err: &Error, info: &SubscriptionInfo| {
            reported.lock().unwrap().push((err.code(), info.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_read_failure_is_fatal() {
        let reported = Reported::default();
        let subscription =
            Subscription::new("account", SubscriptionIdentity::Anonymous, report_into(&reported));

        subscription.start(Arc::new(FailingStore)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *reported.lock().unwrap(),
            [(
                "MESSAGE_STORE_FAILURE",
                SubscriptionInfo {
                    subscription_id: None,
                    stream: "account".into()
                }
            )]
        );
        assert!(!subscription.is_running().await);
        subscription.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_load_failure_is_fatal() {
        let reported = Reported::default();
        let subscription = Subscription::new(
            ALL_STREAMS,
            SubscriptionIdentity::named("balances"),
            report_into(&reported),
        );

        subscription.start(Arc::new(FailingStore)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *reported.lock().unwrap(),
            [(
                "MESSAGE_STORE_FAILURE",
                SubscriptionInfo {
                    subscription_id: Some("balances".into()),
                    stream: ALL_STREAMS.into()
                }
            )]
        );
        assert!(!subscription.is_running().await);
    }

    /// Subscription whose handler takes a second per message and tracks
    /// how many handlers run at once.
    fn slow_subscription(
        amounts: &Seen,
        in_flight: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> Subscription {
        let recorder = Arc::clone(amounts);
        let in_flight = Arc::clone(in_flight);
        let peak = Arc::clone(peak);
        Subscription::new("account", SubscriptionIdentity::named("restart"), log_error)
            .config(SubscriptionConfig {
                position_update_interval: 1,
                ..SubscriptionConfig::default()
            })
            .handle(&deposited(), move |event: Deposited, _: Message| {
                let recorder = Arc::clone(&recorder);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    recorder.lock().unwrap().push(event.amount);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(())
                }
            })
    }

    #[tokio::test(start_paused = true)]
    async fn start_during_stop_waits_for_the_drain() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a1", 2).await;

        let amounts = Seen::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let subscription = Arc::new(slow_subscription(&amounts, &in_flight, &peak));

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopping = {
            let subscription = Arc::clone(&subscription);
            tokio::spawn(async move { subscription.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        subscription.start(store.clone()).await;
        stopping.await.unwrap();
        assert!(subscription.is_running().await);

        tokio::time::sleep(Duration::from_secs(3)).await;
        subscription.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(seen(&amounts), [1, 2]);
        assert_eq!(checkpoints(store.as_ref(), "restart").await, ["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_signal_joins_the_old_loop() {
        let store = Arc::new(InMemoryMessageStore::new());
        write_deposit(store.as_ref(), "account-a1", 1).await;
        write_deposit(store.as_ref(), "account-a1", 2).await;

        let amounts = Seen::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let subscription = slow_subscription(&amounts, &in_flight, &peak);

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(subscription.signal_stop().await);

        subscription.start(store.clone()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        subscription.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(seen(&amounts), [1, 2]);
        assert_eq!(checkpoints(store.as_ref(), "restart").await, ["1", "2"]);
        assert!(!subscription.is_running().await);
    }
}
