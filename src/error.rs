//! Crate-level error types for command dispatch, execution, and subscriptions.

use std::time::Duration;

use crate::event::MapError;
use crate::store::StoreError;

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "insufficient funds").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the command handler,
    /// forwarding its `Display` and `Error` impls. No events were persisted.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency clash.
    ///
    /// The stream advanced between loading the aggregate and appending the
    /// produced events. Retryable by the caller.
    #[error("optimistic concurrency conflict: expected version {expected}, stream at {actual}")]
    Conflict {
        /// Stream version the actor captured before running the handler.
        expected: u64,
        /// Stream version the store reported at append time.
        actual: u64,
    },

    /// A produced event could not be encoded into a stored record.
    #[error(transparent)]
    Event(#[from] MapError),

    /// The event store rejected or failed the operation.
    #[error(transparent)]
    Store(StoreError),

    /// The actor task has exited and can process no further commands.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when reading the current state of an aggregate fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The actor task has exited, so its state can no longer be queried.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned when spawning an aggregate actor fails during recovery.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Reading the aggregate's stream from the event store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored event could not be decoded into the aggregate's event type.
    #[error(transparent)]
    Event(#[from] MapError),
}

/// Error returned by [`CommandRouter::dispatch`](crate::CommandRouter::dispatch)
/// and its envelope variant.
///
/// Type-erased: the domain error from a rejected command is boxed so that
/// callers which do not know the aggregate's error type (process managers,
/// middleware) can still observe and report it.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No route is registered for the command's type.
    #[error("no route registered for command type `{0}`")]
    UnregisteredCommand(String),

    /// The route's identity function produced an empty aggregate identity.
    #[error("command carries a missing or empty aggregate identity")]
    InvalidAggregateIdentity,

    /// The aggregate did not reply within the dispatch deadline.
    ///
    /// The handler may still complete in the background; the aggregate's
    /// state is either fully committed or untouched, never partial. Callers
    /// should treat the outcome as indeterminate.
    #[error("aggregate execution exceeded its {0:?} deadline")]
    ExecutionTimeout(Duration),

    /// Optimistic concurrency clash while appending produced events.
    #[error("optimistic concurrency conflict: expected version {expected}, stream at {actual}")]
    Conflict {
        /// Stream version the actor captured before running the handler.
        expected: u64,
        /// Stream version the store reported at append time.
        actual: u64,
    },

    /// The command handler rejected the command. No events were persisted.
    #[error(transparent)]
    Domain(Box<dyn std::error::Error + Send + Sync>),

    /// A middleware layer short-circuited the dispatch.
    #[error("dispatch rejected by middleware: {0}")]
    Rejected(String),

    /// Encoding or decoding an event failed.
    #[error(transparent)]
    Event(#[from] MapError),

    /// The event store rejected or failed an operation.
    #[error(transparent)]
    Store(StoreError),

    /// A command envelope carried a payload that does not deserialize into
    /// the registered command type.
    #[error("malformed command envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The aggregate actor exited before replying.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

impl From<SpawnError> for DispatchError {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::Store(e) => DispatchError::Store(e),
            SpawnError::Event(e) => DispatchError::Event(e),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<ExecuteError<E>> for DispatchError {
    fn from(err: ExecuteError<E>) -> Self {
        match err {
            ExecuteError::Domain(e) => DispatchError::Domain(Box::new(e)),
            ExecuteError::Conflict { expected, actual } => {
                DispatchError::Conflict { expected, actual }
            }
            ExecuteError::Event(e) => DispatchError::Event(e),
            ExecuteError::Store(e) => DispatchError::Store(e),
            ExecuteError::ActorGone => DispatchError::ActorGone,
        }
    }
}

/// Error that halts an event-handler or process-manager subscription.
///
/// Subscriptions do not recover in place: a halted subscription surfaces its
/// error through [`SubscriptionHandle::join`](crate::SubscriptionHandle::join)
/// and must be restarted by a supervisor, resuming from the persisted cursor.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The user event handler returned an error. The cursor was not advanced.
    #[error("event handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// A delivered event's type tag is unknown to the consumer.
    #[error(transparent)]
    Event(#[from] MapError),

    /// A store interaction (cursor or snapshot persistence) failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A command emitted by a process manager failed to dispatch.
    ///
    /// Commands dispatched before the failure are not rolled back.
    #[error("process manager command dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The process manager module rejected the event.
    #[error("process manager failed to handle event: {0}")]
    Process(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A process manager instance exited before acknowledging.
    #[error("process manager instance is no longer running")]
    InstanceGone,

    /// The subscription task terminated abnormally.
    #[error("subscription task terminated abnormally")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_conflict_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Conflict {
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "optimistic concurrency conflict: expected version 3, stream at 5"
        );
    }

    #[test]
    fn dispatch_error_from_execute_preserves_conflict() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Conflict {
            expected: 1,
            actual: 2,
        };
        let dispatch: DispatchError = err.into();
        assert!(matches!(
            dispatch,
            DispatchError::Conflict {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn dispatch_error_from_execute_boxes_domain() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        let dispatch: DispatchError = err.into();
        assert_eq!(dispatch.to_string(), "test domain error");
    }

    #[test]
    fn dispatch_error_from_spawn_maps_store() {
        let err = SpawnError::Store(StoreError::StreamNotFound);
        let dispatch: DispatchError = err.into();
        assert!(matches!(dispatch, DispatchError::Store(_)));
    }

    #[test]
    fn unregistered_command_names_the_type() {
        let err = DispatchError::UnregisteredCommand("my_app::OpenAccount".to_string());
        assert!(err.to_string().contains("my_app::OpenAccount"));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries, which is required for use with `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<SubscriptionError>();
        }
    };
}
