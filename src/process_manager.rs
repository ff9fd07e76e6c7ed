//! Process managers: correlated state machines that react to events by
//! dispatching commands.
//!
//! A [`ProcessRouter`] subscribes to the global stream under the manager's
//! name. For each event it asks the manager module how the event correlates
//! ([`ProcessManager::interested_in`]) and routes it to the per-correlation
//! instance, creating or restoring the instance as needed. Each instance is
//! its own actor: it deduplicates against `last_seen_event_id`, decides
//! commands, dispatches them through the command router, evolves its state,
//! snapshots, and only then acknowledges -- which is what gates the
//! router's acknowledgement to the upstream subscription.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::command::CommandEnvelope;
use crate::error::SubscriptionError;
use crate::event::{MapError, RecordedEvent, decode_event};
use crate::handler::SubscriptionHandle;
use crate::router::CommandRouter;
use crate::store::{EventStore, Snapshot, StoreError, Subscription};

/// How an event correlates to a process manager's instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Ensure an instance keyed by the ID exists, then route the event to it.
    Start(String),
    /// Route to the existing instance; a missing instance is recreated from
    /// its snapshot if one exists, else started empty.
    Continue(String),
    /// Route the event, and terminate the instance once it is acknowledged.
    Stop(String),
    /// Not correlated: acknowledge upstream immediately.
    Ignore,
}

/// A long-running correlated state machine.
///
/// The implementing type is the instance's state, rebuilt from snapshots
/// rather than replay: [`apply`](ProcessManager::apply) evolves the state
/// that gets snapshotted, and [`handle`](ProcessManager::handle) decides
/// which commands to dispatch. Keeping the two separate means a restored
/// instance never re-decides commands for events it already processed.
pub trait ProcessManager:
    Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Subscription identity; also prefixes instance snapshot keys.
    const NAME: &'static str;

    /// The domain events this manager reacts to.
    type Event: DeserializeOwned + Send + Sync + 'static;

    /// Failure produced while deciding commands for an event.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Classify an event's correlation before any instance is involved.
    fn interested_in(event: &RecordedEvent) -> Interest;

    /// Decide which commands the event triggers, given the current state.
    fn handle(&self, event: &Self::Event) -> Result<Vec<CommandEnvelope>, Self::Error>;

    /// Evolve the state by one event.
    fn apply(self, event: &Self::Event) -> Self;
}

/// Message routed to a process manager instance: the event plus the reply
/// channel whose answer gates the upstream acknowledgement.
type InstanceMessage = (
    RecordedEvent,
    oneshot::Sender<Result<(), SubscriptionError>>,
);

/// Handle to a running process manager instance task.
struct InstanceHandle {
    tx: mpsc::Sender<InstanceMessage>,
}

impl InstanceHandle {
    /// Route an event and wait for the instance's acknowledgement.
    async fn process(&self, event: RecordedEvent) -> Result<(), SubscriptionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((event, reply_tx))
            .await
            .map_err(|_| SubscriptionError::InstanceGone)?;
        reply_rx.await.map_err(|_| SubscriptionError::InstanceGone)?
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A per-correlation process manager actor.
struct ProcessInstance<PM: ProcessManager> {
    source_uuid: String,
    state: PM,
    last_seen: u64,
    store: Arc<dyn EventStore>,
    command_router: CommandRouter,
}

impl<PM: ProcessManager> ProcessInstance<PM> {
    async fn run(mut self, mut rx: mpsc::Receiver<InstanceMessage>) {
        while let Some((event, reply)) = rx.recv().await {
            let result = self.process(event).await;
            let failed = result.is_err();
            let _ = reply.send(result);
            if failed {
                break;
            }
        }
    }

    /// Handle one routed event to completion: dedup, decide, dispatch,
    /// evolve, snapshot.
    async fn process(&mut self, event: RecordedEvent) -> Result<(), SubscriptionError> {
        if self.last_seen != 0 && event.event_id <= self.last_seen {
            // Redelivery of an already-processed event: acknowledge only.
            return Ok(());
        }

        let domain: PM::Event = decode_event(&event)?;

        let commands = self
            .state
            .handle(&domain)
            .map_err(|e| SubscriptionError::Process(Box::new(e)))?;
        for envelope in commands {
            // A failed dispatch halts here; commands already dispatched for
            // this event are not rolled back (at-least-once side effects).
            self.command_router.dispatch_envelope(envelope).await?;
        }

        self.state = std::mem::take(&mut self.state).apply(&domain);
        self.last_seen = event.event_id;

        let data = serde_json::to_value(&self.state).map_err(MapError::from)?;
        self.store
            .record_snapshot(Snapshot {
                source_uuid: self.source_uuid.clone(),
                source_version: event.event_id,
                source_type: std::any::type_name::<PM>().to_string(),
                data,
            })
            .await?;
        Ok(())
    }
}

/// Spawn an instance for `correlation_id`, restoring from its snapshot when
/// one exists.
async fn spawn_instance<PM: ProcessManager>(
    store: Arc<dyn EventStore>,
    command_router: CommandRouter,
    correlation_id: &str,
) -> Result<InstanceHandle, SubscriptionError> {
    let source_uuid = format!("{}-{}", PM::NAME, correlation_id);
    let (state, last_seen) = match store.read_snapshot(&source_uuid).await {
        Ok(snapshot) => match serde_json::from_value::<PM>(snapshot.data) {
            Ok(state) => (state, snapshot.source_version),
            Err(e) => {
                tracing::warn!(
                    source_uuid = %source_uuid,
                    error = %e,
                    "corrupt process manager snapshot, starting empty"
                );
                (PM::default(), 0)
            }
        },
        Err(StoreError::SnapshotNotFound) => (PM::default(), 0),
        Err(e) => return Err(e.into()),
    };

    tracing::debug!(
        process_manager = PM::NAME,
        correlation_id = %correlation_id,
        last_seen,
        "starting process manager instance"
    );

    let (tx, rx) = mpsc::channel::<InstanceMessage>(16);
    let instance = ProcessInstance::<PM> {
        source_uuid,
        state,
        last_seen,
        store,
        command_router,
    };
    tokio::spawn(instance.run(rx));
    Ok(InstanceHandle { tx })
}

/// Routes subscribed events to per-correlation process manager instances.
pub struct ProcessRouter<PM: ProcessManager> {
    store: Arc<dyn EventStore>,
    command_router: CommandRouter,
    instances: HashMap<String, InstanceHandle>,
    _marker: PhantomData<PM>,
}

impl<PM: ProcessManager> ProcessRouter<PM> {
    /// Subscribe under `PM::NAME` and spawn the routing loop.
    ///
    /// The returned handle surfaces the error that halted the router, if
    /// any; a supervised restart resumes from the instances' persisted
    /// snapshots.
    pub async fn start(
        store: Arc<dyn EventStore>,
        command_router: CommandRouter,
    ) -> SubscriptionHandle {
        let subscription = store.subscribe_all(PM::NAME).await;
        let router = Self {
            store,
            command_router,
            instances: HashMap::new(),
            _marker: PhantomData,
        };
        SubscriptionHandle::new(tokio::spawn(router.run(subscription)))
    }

    async fn run(mut self, mut subscription: Subscription) -> Result<(), SubscriptionError> {
        while let Some(batch) = subscription.next().await {
            for event in &batch.events {
                if let Err(e) = self.route(event).await {
                    tracing::error!(
                        process_manager = PM::NAME,
                        event_id = event.event_id,
                        error = %e,
                        "process router halted"
                    );
                    return Err(e);
                }
                // Upstream acknowledgement only after the routed instance
                // acknowledged (or the event was ignored).
                batch.ack(event.event_id);
            }
        }
        Ok(())
    }

    async fn route(&mut self, event: &RecordedEvent) -> Result<(), SubscriptionError> {
        match PM::interested_in(event) {
            Interest::Ignore => Ok(()),
            Interest::Start(id) | Interest::Continue(id) => {
                let instance = self.ensure_instance(&id).await?;
                instance.process(event.clone()).await
            }
            Interest::Stop(id) => {
                let instance = self.ensure_instance(&id).await?;
                instance.process(event.clone()).await?;
                self.instances.remove(&id);
                tracing::info!(
                    process_manager = PM::NAME,
                    correlation_id = %id,
                    "process manager instance stopped"
                );
                Ok(())
            }
        }
    }

    /// Get the live instance for a correlation ID, spawning (and restoring
    /// from snapshot) when missing or dead.
    async fn ensure_instance(
        &mut self,
        correlation_id: &str,
    ) -> Result<&InstanceHandle, SubscriptionError> {
        let stale = self
            .instances
            .get(correlation_id)
            .map(|handle| !handle.is_alive())
            .unwrap_or(true);
        if stale {
            let handle = spawn_instance::<PM>(
                self.store.clone(),
                self.command_router.clone(),
                correlation_id,
            )
            .await?;
            self.instances.insert(correlation_id.to_owned(), handle);
        }
        self.instances
            .get(correlation_id)
            .ok_or(SubscriptionError::InstanceGone)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::aggregate::Aggregate;
    use crate::command::CommandContext;
    use crate::event::try_decode_event;

    /// An aggregate whose stream a process manager tracks.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Publication {
        pub started: bool,
        pub stopped: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum PublicationCommand {
        Start {
            publication_id: String,
        },
        Publish {
            publication_id: String,
            interesting: u64,
            uninteresting: u64,
        },
        Stop {
            publication_id: String,
        },
    }

    impl PublicationCommand {
        pub(crate) fn publication_id(&self) -> String {
            match self {
                Self::Start { publication_id }
                | Self::Publish { publication_id, .. }
                | Self::Stop { publication_id } => publication_id.clone(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum PublicationEvent {
        Started { publication_id: String },
        Interested { publication_id: String, index: u64 },
        Uninterested { publication_id: String, index: u64 },
        Stopped { publication_id: String },
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum PublicationError {
        #[error("publication already started")]
        AlreadyStarted,
        #[error("publication not started")]
        NotStarted,
    }

    impl Aggregate for Publication {
        const AGGREGATE_TYPE: &'static str = "publication";

        type Command = PublicationCommand;
        type DomainEvent = PublicationEvent;
        type Error = PublicationError;

        fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
            match cmd {
                PublicationCommand::Start { publication_id } => {
                    if self.started {
                        return Err(PublicationError::AlreadyStarted);
                    }
                    Ok(vec![PublicationEvent::Started { publication_id }])
                }
                PublicationCommand::Publish {
                    publication_id,
                    interesting,
                    uninteresting,
                } => {
                    if !self.started {
                        return Err(PublicationError::NotStarted);
                    }
                    let mut events = Vec::new();
                    for index in 1..=interesting {
                        events.push(PublicationEvent::Interested {
                            publication_id: publication_id.clone(),
                            index,
                        });
                    }
                    for index in 1..=uninteresting {
                        events.push(PublicationEvent::Uninterested {
                            publication_id: publication_id.clone(),
                            index,
                        });
                    }
                    Ok(events)
                }
                PublicationCommand::Stop { publication_id } => {
                    if !self.started {
                        return Err(PublicationError::NotStarted);
                    }
                    Ok(vec![PublicationEvent::Stopped { publication_id }])
                }
            }
        }

        fn apply(mut self, event: &Self::DomainEvent) -> Self {
            match event {
                PublicationEvent::Started { .. } => self.started = true,
                PublicationEvent::Stopped { .. } => self.stopped = true,
                PublicationEvent::Interested { .. } | PublicationEvent::Uninterested { .. } => {}
            }
            self
        }
    }

    /// Collects interesting items and stops the publication at the tenth.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TrackingManager {
        pub items: Vec<u64>,
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum TrackingError {
        #[error(transparent)]
        Encode(#[from] serde_json::Error),
    }

    impl ProcessManager for TrackingManager {
        const NAME: &'static str = "tracking";

        type Event = PublicationEvent;
        type Error = TrackingError;

        fn interested_in(event: &RecordedEvent) -> Interest {
            match try_decode_event::<PublicationEvent>(event) {
                Some(PublicationEvent::Started { publication_id }) => {
                    Interest::Start(publication_id)
                }
                Some(PublicationEvent::Interested { publication_id, .. }) => {
                    Interest::Continue(publication_id)
                }
                Some(PublicationEvent::Stopped { publication_id }) => {
                    Interest::Continue(publication_id)
                }
                _ => Interest::Ignore,
            }
        }

        fn handle(&self, event: &Self::Event) -> Result<Vec<CommandEnvelope>, Self::Error> {
            match event {
                PublicationEvent::Interested {
                    publication_id,
                    index,
                } if *index == 10 => Ok(vec![CommandEnvelope::new(
                    PublicationCommand::Stop {
                        publication_id: publication_id.clone(),
                    },
                    CommandContext::default().with_correlation_id(format!(
                        "{}-{publication_id}",
                        TrackingManager::NAME
                    )),
                )?]),
                _ => Ok(vec![]),
            }
        }

        fn apply(mut self, event: &Self::Event) -> Self {
            if let PublicationEvent::Interested { index, .. } = event {
                self.items.push(*index);
            }
            self
        }
    }

    /// Counts handled events; terminates its instance on `Stopped`.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TerminatorManager {
        pub seen: u64,
    }

    impl ProcessManager for TerminatorManager {
        const NAME: &'static str = "terminator";

        type Event = PublicationEvent;
        type Error = std::convert::Infallible;

        fn interested_in(event: &RecordedEvent) -> Interest {
            match try_decode_event::<PublicationEvent>(event) {
                Some(PublicationEvent::Started { publication_id }) => {
                    Interest::Start(publication_id)
                }
                Some(PublicationEvent::Interested { publication_id, .. }) => {
                    Interest::Continue(publication_id)
                }
                Some(PublicationEvent::Stopped { publication_id }) => {
                    Interest::Stop(publication_id)
                }
                _ => Interest::Ignore,
            }
        }

        fn handle(&self, _event: &Self::Event) -> Result<Vec<CommandEnvelope>, Self::Error> {
            Ok(vec![])
        }

        fn apply(mut self, _event: &Self::Event) -> Self {
            self.seen += 1;
            self
        }
    }
}
