//! A channel that exists only while it is needed.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use lime_core::{ChannelError, ClientChannel};

use crate::builder::EstablishedClientChannelBuilder;

const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observes channel lifecycle events.
#[async_trait]
pub trait ChannelEventHandler: Send + Sync {
    /// A channel was created and established.
    async fn channel_created(&self, channel: &ClientChannel) {
        let _ = channel;
    }

    /// The current channel was discarded.
    async fn channel_discarded(&self) {}
}

/// Decides whether a failure is recoverable.
///
/// All registered handlers run, in registration order; the failure counts
/// as handled when any of them returns `true`.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Inspect the failure; return `true` to retry, `false` to propagate.
    async fn handle(&self, error: &ChannelError) -> bool;
}

/// A lazily-built, self-healing client channel.
///
/// The wrapper holds at most one established channel. Operations create it
/// on first use and rebuild it after failures that the registered
/// [`FailureHandler`]s declare recoverable; timeouts always propagate so
/// caller deadlines stay meaningful.
pub struct OnDemandClientChannel {
    builder: EstablishedClientChannelBuilder,
    // Doubles as the creation gate: concurrent callers serialize here so
    // only one connection attempt runs at a time.
    slot: TokioMutex<Option<Arc<ClientChannel>>>,
    event_handlers: StdMutex<Vec<Arc<dyn ChannelEventHandler>>>,
    creation_failed_handlers: StdMutex<Vec<Arc<dyn FailureHandler>>>,
    operation_failed_handlers: StdMutex<Vec<Arc<dyn FailureHandler>>>,
}

impl OnDemandClientChannel {
    /// Wrap a builder; no channel is created until first use.
    pub fn new(builder: EstablishedClientChannelBuilder) -> Self {
        Self {
            builder,
            slot: TokioMutex::new(None),
            event_handlers: StdMutex::new(Vec::new()),
            creation_failed_handlers: StdMutex::new(Vec::new()),
            operation_failed_handlers: StdMutex::new(Vec::new()),
        }
    }

    /// Register a lifecycle observer.
    pub fn add_event_handler(&self, handler: Arc<dyn ChannelEventHandler>) {
        lock(&self.event_handlers).push(handler);
    }

    /// Register a handler consulted when a connection attempt fails.
    pub fn add_creation_failed_handler(&self, handler: Arc<dyn FailureHandler>) {
        lock(&self.creation_failed_handlers).push(handler);
    }

    /// Register a handler consulted when a channel operation fails.
    pub fn add_operation_failed_handler(&self, handler: Arc<dyn FailureHandler>) {
        lock(&self.operation_failed_handlers).push(handler);
    }

    /// Whether an established channel currently exists.
    pub async fn is_established(&self) -> bool {
        self.slot.lock().await.as_ref().is_some_and(|channel| channel.is_established())
    }

    /// Return the current channel, building one if necessary.
    ///
    /// A dead channel found in the slot is discarded first. Creation
    /// failures consult the creation handlers and retry while any of them
    /// accepts the failure.
    pub async fn get_channel(&self) -> Result<Arc<ClientChannel>, ChannelError> {
        loop {
            let mut slot = self.slot.lock().await;
            if let Some(channel) = slot.as_ref() {
                if channel.is_established() {
                    return Ok(channel.clone());
                }
                if let Some(stale) = slot.take() {
                    stale.close();
                    self.notify_discarded().await;
                }
            }

            match self.builder.build_and_establish().await {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    *slot = Some(channel.clone());
                    drop(slot);
                    self.notify_created(&channel).await;
                    return Ok(channel);
                },
                Err(error) => {
                    drop(slot);
                    tracing::warn!(%error, "channel creation failed");
                    if !self.raise(&self.creation_failed_handlers, &error).await {
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Run an operation against the channel, rebuilding it between
    /// attempts when the registered handlers declare the failure
    /// recoverable.
    ///
    /// [`ChannelError::Timeout`] is never retried.
    pub async fn with_channel<T, F, Fut>(&self, mut operation: F) -> Result<T, ChannelError>
    where
        F: FnMut(Arc<ClientChannel>) -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        loop {
            let channel = self.get_channel().await?;
            match operation(channel.clone()).await {
                Ok(value) => return Ok(value),
                Err(error @ ChannelError::Timeout(_)) => return Err(error),
                Err(error) => {
                    tracing::debug!(%error, "channel operation failed");
                    let handled = self.raise(&self.operation_failed_handlers, &error).await;
                    if !channel.is_established() || !channel.transport().is_connected() {
                        self.discard(&channel).await;
                    }
                    if !handled {
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Gracefully end the current session, if any, and drop the channel.
    pub async fn finish(&self) {
        let taken = self.slot.lock().await.take();
        let Some(channel) = taken else { return };
        if channel.is_established() {
            let farewell = async {
                channel.send_finishing_session().await?;
                channel.receive_finished_session().await
            };
            if let Err(error) =
                tokio::time::timeout(FINISH_TIMEOUT, farewell).await.unwrap_or_else(|_| {
                    Err(ChannelError::Timeout("finish"))
                })
            {
                tracing::debug!(%error, "graceful finish did not complete");
            }
        }
        channel.close();
        self.notify_discarded().await;
    }

    /// Discard `channel` if it is still the one in the slot. A replacement
    /// created by a concurrent caller is left alone.
    async fn discard(&self, channel: &Arc<ClientChannel>) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, channel)) {
            slot.take();
            drop(slot);
            channel.close();
            self.notify_discarded().await;
        }
    }

    async fn raise(
        &self,
        handlers: &StdMutex<Vec<Arc<dyn FailureHandler>>>,
        error: &ChannelError,
    ) -> bool {
        let handlers: Vec<_> = lock(handlers).clone();
        let mut handled = false;
        for handler in handlers {
            handled |= handler.handle(error).await;
        }
        handled
    }

    async fn notify_created(&self, channel: &Arc<ClientChannel>) {
        let handlers: Vec<_> = lock(&self.event_handlers).clone();
        for handler in handlers {
            handler.channel_created(channel).await;
        }
    }

    async fn notify_discarded(&self) {
        let handlers: Vec<_> = lock(&self.event_handlers).clone();
        for handler in handlers {
            handler.channel_discarded().await;
        }
    }
}
