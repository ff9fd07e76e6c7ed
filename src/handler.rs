//! Event handler runtime: ordered, deduplicated delivery from the global
//! event stream.
//!
//! A handler subscribes under a stable name; the runtime persists the
//! highest handled `event_id` as a store snapshot keyed by that name, so a
//! restarted (or duplicate) handler sharing the name resumes from the same
//! cursor. Redelivered events are acknowledged but never re-invoke the
//! user handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::SubscriptionError;
use crate::event::RecordedEvent;
use crate::store::{EventBatch, EventStore, Snapshot, StoreError, Subscription};

/// Snapshot `source_type` under which handler cursors are persisted.
const CURSOR_SOURCE_TYPE: &str = "event-handler";

/// A named consumer of the global event stream.
///
/// Handlers observe every recorded event, including types they do not care
/// about; they must ignore those (see
/// [`try_decode_event`](crate::try_decode_event)) and return `Ok` so the
/// runtime still acknowledges. Returning `Err` halts the subscription
/// without advancing the cursor.
#[async_trait]
pub trait EventHandler: Send + 'static {
    /// Subscription identity. Two handlers sharing a name share a cursor.
    const NAME: &'static str;

    /// Handle a single event. Invoked exactly once per distinct `event_id`,
    /// in ascending order, regardless of redelivery.
    async fn handle_event(&mut self, event: &RecordedEvent) -> anyhow::Result<()>;
}

/// Owning handle to a running subscription task.
///
/// Dropping the handle detaches the task; use [`abort`](Self::abort) to
/// stop it or [`join`](Self::join) to await its outcome.
#[derive(Debug)]
pub struct SubscriptionHandle {
    join: JoinHandle<Result<(), SubscriptionError>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(join: JoinHandle<Result<(), SubscriptionError>>) -> Self {
        Self { join }
    }

    /// Wait for the subscription to end.
    ///
    /// A subscription only ends when its upstream closes or a fatal error
    /// halts it; the error is the one that did.
    pub async fn join(self) -> Result<(), SubscriptionError> {
        self.join.await.unwrap_or(Err(SubscriptionError::Aborted))
    }

    /// Abort the subscription task.
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Whether the subscription task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Drives an [`EventHandler`] from the store's global subscription.
pub struct EventHandlerRunner<H: EventHandler> {
    store: Arc<dyn EventStore>,
    handler: H,
    last_seen: u64,
}

impl<H: EventHandler + Sync> EventHandlerRunner<H> {
    /// Load the handler's cursor, subscribe, and spawn the delivery loop.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Store`] if reading the persisted cursor
    /// fails.
    pub async fn start(
        store: Arc<dyn EventStore>,
        handler: H,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let last_seen = load_cursor(store.as_ref(), H::NAME).await?;
        let subscription = store.subscribe_all(H::NAME).await;
        let runner = Self {
            store,
            handler,
            last_seen,
        };
        Ok(SubscriptionHandle::new(tokio::spawn(
            runner.run(subscription),
        )))
    }

    async fn run(mut self, mut subscription: Subscription) -> Result<(), SubscriptionError> {
        while let Some(batch) = subscription.next().await {
            if let Err(e) = self.process_batch(&batch).await {
                tracing::error!(
                    subscription = H::NAME,
                    error = %e,
                    "event handler halted"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Process one delivered batch in `event_id` order.
    ///
    /// Already-seen events are acknowledged without invoking the handler;
    /// new events are handled, acknowledged, and the cursor persisted.
    async fn process_batch(&mut self, batch: &EventBatch) -> Result<(), SubscriptionError> {
        for event in &batch.events {
            if event.event_id <= self.last_seen {
                // Redelivery: the body was already handled. Ack so the
                // upstream can progress, but do not invoke the handler.
                batch.ack(event.event_id);
                continue;
            }

            self.handler
                .handle_event(event)
                .await
                .map_err(SubscriptionError::Handler)?;
            batch.ack(event.event_id);
            self.last_seen = event.event_id;
            self.persist_cursor().await?;
        }
        Ok(())
    }

    async fn persist_cursor(&self) -> Result<(), SubscriptionError> {
        self.store
            .record_snapshot(Snapshot {
                source_uuid: H::NAME.to_string(),
                source_version: self.last_seen,
                source_type: CURSOR_SOURCE_TYPE.to_string(),
                data: serde_json::Value::Null,
            })
            .await?;
        Ok(())
    }
}

/// Read the persisted cursor for a subscription name, defaulting to zero.
async fn load_cursor(store: &dyn EventStore, name: &str) -> Result<u64, SubscriptionError> {
    match store.read_snapshot(name).await {
        Ok(snapshot) => Ok(snapshot.source_version),
        Err(StoreError::SnapshotNotFound) => Ok(0),
        Err(e) => Err(e.into()),
    }
}
