//! Runtime core for CQRS/event-sourced domain systems.
//!
//! `helmsman` provides three tightly-coupled subsystems: a command dispatch
//! pipeline that routes commands to per-aggregate singleton actors, the
//! aggregate actor itself (rebuild from the stream, execute a handler,
//! append with optimistic concurrency), and an event-reaction runtime of
//! subscription-based event handlers and process managers. The event store
//! is external, consumed through the [`EventStore`] trait; an
//! [`InMemoryEventStore`] ships for tests and embedded use.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aggregate`] | Domain model: handles commands, emits events, folds state |
//! | [`CommandRouter`] | Typed command router keyed by `TypeId`, with middleware |
//! | [`AggregateRegistry`] | Locate-or-spawn registry of singleton aggregate actors |
//! | [`AggregateHandle`] | Async handle to a running aggregate actor |
//! | [`EventHandler`] | Named consumer of the global event stream |
//! | [`ProcessManager`] | Correlated state machine reacting to events with commands |
//! | [`EventStore`] | External append-only store contract |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use helmsman::{
//!     Aggregate, AggregateHandler, CommandRouter, InMemoryEventStore,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! // 1. Define your aggregate.
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Counter { value: u64 }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Increment { counter_id: String }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterEvent { Incremented }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum CounterError {}
//!
//! impl Aggregate for Counter {
//!     const AGGREGATE_TYPE: &'static str = "counter";
//!     type Command = Increment;
//!     type DomainEvent = CounterEvent;
//!     type Error = CounterError;
//!
//!     fn handle(&self, _cmd: Increment) -> Result<Vec<CounterEvent>, CounterError> {
//!         Ok(vec![CounterEvent::Incremented])
//!     }
//!     fn apply(mut self, _event: &CounterEvent) -> Self {
//!         self.value += 1;
//!         self
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 2. Build a router and dispatch commands.
//! let router = CommandRouter::builder()
//!     .route::<Counter, _, _, _>(|c: &Increment| c.counter_id.clone(), AggregateHandler)
//!     .build(Arc::new(InMemoryEventStore::new()));
//!
//! router.dispatch(Increment { counter_id: "c-1".into() }).await?;
//! # Ok(())
//! # }
//! ```

mod actor;
pub use actor::{AggregateHandle, spawn_actor};
mod aggregate;
pub use aggregate::{Aggregate, AggregateHandler, AggregateState, CommandHandler};
mod command;
pub use command::{CommandContext, CommandEnvelope};
mod error;
pub use error::{
    DispatchError, ExecuteError, SpawnError, StateError, SubscriptionError,
};
mod event;
pub use event::{
    MapError, ProposedEvent, RecordedEvent, decode_event, encode_event, stream_uuid,
    try_decode_event,
};
mod handler;
pub use handler::{EventHandler, EventHandlerRunner, SubscriptionHandle};
mod process_manager;
pub use process_manager::{Interest, ProcessManager, ProcessRouter};
mod registry;
pub use registry::AggregateRegistry;
mod router;
pub use router::{
    CommandInfo, CommandRouter, DEFAULT_COMMAND_TIMEOUT, Middleware, RouterBuilder,
};
mod store;
pub use store::{
    EventBatch, EventStore, InMemoryEventStore, Snapshot, StoreError, Subscription,
};
