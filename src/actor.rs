//! Actor loop that owns an aggregate and serializes command execution.
//!
//! Each aggregate instance is a tokio task that processes messages from an
//! `mpsc` inbox one at a time, to completion. The actor exclusively owns the
//! [`AggregateState`], so command execution is strictly serialized: no
//! second command is observed by a handler until the previous one has either
//! committed or failed.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_actor`] (factory that recovers state from the stream and starts
//! the actor task).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateHandler, AggregateState, CommandHandler};
use crate::command::CommandContext;
use crate::error::{ExecuteError, SpawnError, StateError};
use crate::event::{RecordedEvent, decode_event, encode_event, stream_uuid};
use crate::store::{EventStore, StoreError};

/// Number of events read per page while rebuilding an aggregate from its
/// stream. Affects recovery latency and peak memory, not behavior.
pub(crate) const READ_BATCH_SIZE: usize = 100;

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> = Result<Vec<RecordedEvent>, ExecuteError<<A as Aggregate>::Error>>;

/// A command handler invocation, captured as a closure so the actor stays
/// generic over the aggregate only, not over each routed command type.
type ExecuteFn<A> = Box<
    dyn FnOnce(
            AggregateState<A>,
        ) -> Result<AggregateState<A>, <A as Aggregate>::Error>
        + Send,
>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        /// The captured handler invocation.
        run: ExecuteFn<A>,
        /// Cross-cutting metadata stamped onto produced events.
        context: CommandContext,
        /// Channel to send back the recorded events or an error.
        ///
        /// If the dispatcher timed out and dropped the receiver, the send
        /// fails silently; the command's outcome still stands.
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve a clone of the current aggregate state.
    GetState {
        reply: oneshot::Sender<AggregateState<A>>,
    },

    /// Gracefully shut down the actor loop.
    Stop,
}

/// Runs the aggregate actor loop.
///
/// Receives messages from `AggregateHandle` via the mpsc channel and
/// processes them sequentially. The loop exits when the channel closes (all
/// senders dropped) or a `Stop` message is received.
async fn run_actor<A: Aggregate>(
    store: Arc<dyn EventStore>,
    stream_id: Uuid,
    mut state: AggregateState<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ActorMessage::Execute {
                run,
                context,
                reply,
            } => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id = state.instance_id(),
                );
                let result = execute_command::<A>(store.as_ref(), stream_id, &mut state, run, &context)
                    .instrument(span)
                    .await;
                let _ = reply.send(result);
            }

            ActorMessage::GetState { reply } => {
                let _ = reply.send(state.clone());
            }

            ActorMessage::Stop => break,
        }
    }
}

/// Execute a single command: run the handler, persist produced events with
/// optimistic concurrency, commit on success.
async fn execute_command<A: Aggregate>(
    store: &dyn EventStore,
    stream_id: Uuid,
    state: &mut AggregateState<A>,
    run: ExecuteFn<A>,
    ctx: &CommandContext,
) -> ExecuteResult<A> {
    // 1. Capture the version the append will be conditioned on.
    let expected_version = state.version();

    // 2. Run the handler against a working copy. On rejection the copy is
    //    dropped, discarding any events it emitted; the actor's state is
    //    untouched.
    let working = state.clone();
    let mut next = run(working).map_err(ExecuteError::Domain)?;

    // 3. No-op commands produce no events and skip the store entirely.
    if next.pending().is_empty() {
        *state = next;
        return Ok(Vec::new());
    }

    // 4. Encode and append atomically under the captured version.
    let mut proposed = Vec::with_capacity(next.pending().len());
    for event in next.pending() {
        proposed.push(encode_event(event, ctx)?);
    }
    let recorded = store
        .append_to_stream(stream_id, expected_version, proposed)
        .await
        .map_err(|e| match e {
            StoreError::WrongExpectedVersion { expected, actual } => {
                ExecuteError::Conflict { expected, actual }
            }
            other => ExecuteError::Store(other),
        })?;

    // 5. Fold the events into the domain state and publish the new state.
    next.commit();
    *state = next;

    tracing::info!(count = recorded.len(), "events appended");

    Ok(recorded)
}

/// Rebuild an aggregate's state by paging through its stream.
///
/// Reads [`READ_BATCH_SIZE`] events at a time until a short page arrives.
/// A `StreamNotFound` on the first page means a fresh aggregate.
async fn load_aggregate<A: Aggregate>(
    store: &dyn EventStore,
    instance_id: &str,
) -> Result<AggregateState<A>, SpawnError> {
    let stream_id = stream_uuid(A::AGGREGATE_TYPE, instance_id);
    let mut events: Vec<A::DomainEvent> = Vec::new();
    let mut from_version: u64 = 1;

    loop {
        let page = match store
            .read_stream_forward(stream_id, from_version, READ_BATCH_SIZE)
            .await
        {
            Ok(page) => page,
            Err(StoreError::StreamNotFound) if from_version == 1 => {
                return Ok(AggregateState::new(instance_id));
            }
            Err(e) => return Err(SpawnError::Store(e)),
        };

        let short_page = page.len() < READ_BATCH_SIZE;
        from_version += page.len() as u64;
        for record in &page {
            events.push(decode_event::<A::DomainEvent>(record)?);
        }
        if short_page {
            break;
        }
    }

    Ok(AggregateState::load(instance_id, events))
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the actor
/// task over a bounded channel.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

// Manual `Clone`: only the `Sender` is cloned, so no bound beyond the
// `Aggregate` one on the struct itself is introduced.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Execute a command through the aggregate's conventional handler
    /// ([`Aggregate::handle`]) and wait for the result.
    ///
    /// Returns the recorded events produced by the command.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the handler rejected the command.
    /// * [`ExecuteError::Conflict`] -- the stream advanced concurrently.
    /// * [`ExecuteError::Store`] / [`ExecuteError::Event`] -- persistence or
    ///   encoding failed.
    /// * [`ExecuteError::ActorGone`] -- the actor task has exited.
    pub async fn execute(
        &self,
        command: A::Command,
        ctx: CommandContext,
    ) -> Result<Vec<RecordedEvent>, ExecuteError<A::Error>> {
        self.execute_with(command, Arc::new(AggregateHandler), ctx)
            .await
    }

    /// Execute a command through an explicit handler.
    ///
    /// This is the entry point the router uses: the handler registered on
    /// the route decides the command, and the actor persists whatever it
    /// emitted.
    pub async fn execute_with<C: Send + 'static>(
        &self,
        command: C,
        handler: Arc<dyn CommandHandler<A, C>>,
        ctx: CommandContext,
    ) -> Result<Vec<RecordedEvent>, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        let run: ExecuteFn<A> = Box::new(move |state| handler.handle(state, command));
        self.sender
            .send(ActorMessage::Execute {
                run,
                context: ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read a clone of the current aggregate state.
    pub async fn state(&self) -> Result<AggregateState<A>, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// Gracefully stop the actor after it finishes the current message.
    ///
    /// Queued messages behind the stop are answered with
    /// [`ExecuteError::ActorGone`] as their reply channels close.
    pub async fn stop(&self) {
        let _ = self.sender.send(ActorMessage::Stop).await;
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// The registry uses this to evict stale handles and re-spawn the actor
    /// on the next request.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a new aggregate actor for `instance_id`.
///
/// Rebuilds the aggregate's state from its stream *before* the actor task
/// starts, so a handle is only ever returned for a fully recovered
/// aggregate and commands cannot observe a partially loaded state.
///
/// # Errors
///
/// Returns [`SpawnError`] if the stream cannot be read or a stored event
/// does not decode into the aggregate's event type.
pub async fn spawn_actor<A: Aggregate>(
    store: Arc<dyn EventStore>,
    instance_id: &str,
) -> Result<AggregateHandle<A>, SpawnError> {
    let state = load_aggregate::<A>(store.as_ref(), instance_id).await?;
    let stream_id = stream_uuid(A::AGGREGATE_TYPE, instance_id);
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(32);

    tokio::spawn(run_actor::<A>(store, stream_id, state, rx));

    Ok(AggregateHandle { sender: tx })
}
