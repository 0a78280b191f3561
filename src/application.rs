//! Command routing and subscription lifecycle.
//!
//! An [`Application`] binds aggregates and subscriptions to one
//! [`MessageStore`]. Commands are routed by type to the single aggregate that
//! claims them; the routing table is fixed at [`build`](ApplicationBuilder::build)
//! time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::AggregateDispatcher;
use crate::error::Error;
use crate::message::Envelope;
use crate::store::MessageStore;
use crate::subscription::Subscription;

/// Builder for [`Application`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_runtime::{ApplicationBuilder, InMemoryMessageStore};
///
/// let app = ApplicationBuilder::new(Arc::new(InMemoryMessageStore::new()))
///     .build()
///     .unwrap();
/// assert!(app.command_types().is_empty());
/// ```
pub struct ApplicationBuilder {
    store: Arc<dyn MessageStore>,
    aggregates: Vec<Arc<dyn AggregateDispatcher>>,
    subscriptions: Vec<Subscription>,
}

impl ApplicationBuilder {
    /// Start building an application over `store`.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            aggregates: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Register an aggregate.
    pub fn aggregate(mut self, aggregate: impl AggregateDispatcher + 'static) -> Self {
        self.aggregates.push(Arc::new(aggregate));
        self
    }

    /// Register a subscription, started by [`Application::start`].
    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Build the routing table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCommandHandler`] for the first command type
    /// claimed by two registered aggregates, naming both.
    pub fn build(self) -> Result<Application, Error> {
        let mut routes: HashMap<String, Arc<dyn AggregateDispatcher>> = HashMap::new();
        for aggregate in &self.aggregates {
            for message_type in aggregate.command_types() {
                if let Some(existing) = routes.get(&message_type) {
                    return Err(Error::DuplicateCommandHandler {
                        message_type,
                        first: existing.name().to_owned(),
                        second: aggregate.name().to_owned(),
                    });
                }
                routes.insert(message_type, Arc::clone(aggregate));
            }
        }
        tracing::debug!(
            aggregates = self.aggregates.len(),
            commands = routes.len(),
            subscriptions = self.subscriptions.len(),
            "application built"
        );
        Ok(Application {
            inner: Arc::new(Inner {
                store: self.store,
                routes,
                subscriptions: self.subscriptions,
            }),
        })
    }
}

struct Inner {
    store: Arc<dyn MessageStore>,
    routes: HashMap<String, Arc<dyn AggregateDispatcher>>,
    subscriptions: Vec<Subscription>,
}

/// A command router plus the subscriptions that run alongside it.
///
/// `Clone` is cheap and clones share the same subscriptions.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Inner>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("commands", &self.command_types())
            .field("subscriptions", &self.inner.subscriptions)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Shorthand for [`ApplicationBuilder::new`].
    pub fn builder(store: Arc<dyn MessageStore>) -> ApplicationBuilder {
        ApplicationBuilder::new(store)
    }

    /// The store commands and subscriptions run against.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.inner.store
    }

    /// Every routable command type, sorted.
    pub fn command_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.inner.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Registered subscriptions, in registration order.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.inner.subscriptions
    }

    /// Route `command` to the aggregate that owns its type and execute it.
    ///
    /// `message_id` becomes the id of the written event. Retrying a command
    /// with the same id after a write therefore fails with
    /// `DuplicateMessageId` instead of writing twice.
    ///
    /// # Returns
    ///
    /// The stream version of the written event, or `None` if the aggregate
    /// accepted the command without writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnhandledCommand`] if no aggregate claims the type,
    /// otherwise whatever [`Aggregate::run_command`](crate::Aggregate::run_command)
    /// returns.
    pub async fn dispatch(
        &self,
        message_id: Uuid,
        command: Envelope,
    ) -> Result<Option<u64>, Error> {
        let aggregate = self
            .inner
            .routes
            .get(&command.message_type)
            .ok_or_else(|| Error::UnhandledCommand {
                message_type: command.message_type.clone(),
            })?;
        tracing::debug!(
            aggregate = aggregate.name(),
            message_type = %command.message_type,
            %message_id,
            "dispatching command"
        );
        aggregate
            .run_command(message_id, self.inner.store.as_ref(), command)
            .await
    }

    /// Start every subscription's polling loop.
    ///
    /// Subscriptions already running are left alone. The returned handle
    /// stops them all; so does [`stop`](Self::stop).
    pub async fn start(&self) -> StopHandle {
        for subscription in &self.inner.subscriptions {
            subscription.start(Arc::clone(&self.inner.store)).await;
        }
        tracing::info!(
            subscriptions = self.inner.subscriptions.len(),
            "application started"
        );
        StopHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Stop every subscription and wait for all of them to drain.
    ///
    /// Idempotent, and safe when some loops already ended on errors.
    pub async fn stop(&self) {
        stop_all(&self.inner).await;
    }
}

/// Stops the subscriptions of a started [`Application`].
///
/// Dropping the handle does not stop anything.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl StopHandle {
    /// Signal every subscription and wait for all of them to drain.
    ///
    /// Calling it more than once is safe.
    pub async fn stop(&self) {
        stop_all(&self.inner).await;
    }
}

/// Signal all loops first so they drain concurrently, then wait for each.
async fn stop_all(inner: &Inner) {
    let mut stopped = 0usize;
    for subscription in &inner.subscriptions {
        if subscription.signal_stop().await {
            stopped += 1;
        }
    }
    for subscription in &inner.subscriptions {
        subscription.stop().await;
    }
    if stopped > 0 {
        tracing::info!(subscriptions = stopped, "application stopped");
    }
}
