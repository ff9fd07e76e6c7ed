//! Aggregate trait, replayable aggregate state, and the command handler
//! contract.

use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's domain state.
/// State is built by folding domain events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "account"). Combined with the
    /// instance ID to derive the stream identity.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate conventionally handles.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use `#[serde(tag = "type", content = "data")]` adjacently
    /// tagged serialization.
    type DomainEvent: Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug
        + Send
        + Sync
        + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// An aggregate's replayable state: identity, stream position, events
/// pending commit, and the domain state itself.
///
/// `version` equals the number of events applied from the store. `pending`
/// holds events produced by the current command and not yet appended; it is
/// empty whenever the owning actor is idle.
#[derive(Debug, Clone)]
pub struct AggregateState<A: Aggregate> {
    instance_id: String,
    version: u64,
    pending: Vec<A::DomainEvent>,
    /// The aggregate's domain state.
    pub state: A,
}

impl<A: Aggregate> AggregateState<A> {
    /// Fresh state for an aggregate whose stream does not exist yet.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            version: 0,
            pending: Vec::new(),
            state: A::default(),
        }
    }

    /// Rebuild state by folding the aggregate's full event history.
    ///
    /// `version` is set to the number of events folded; `pending` is empty.
    pub fn load(instance_id: impl Into<String>, events: Vec<A::DomainEvent>) -> Self {
        let version = events.len() as u64;
        let state = events
            .iter()
            .fold(A::default(), |state, event| state.apply(event));
        Self {
            instance_id: instance_id.into(),
            version,
            pending: Vec::new(),
            state,
        }
    }

    /// The aggregate instance identifier.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Number of events committed to the store for this aggregate.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Events produced by the current command and not yet appended.
    pub fn pending(&self) -> &[A::DomainEvent] {
        &self.pending
    }

    /// Queue an event for appending.
    ///
    /// The event is NOT folded into `state` here: domain state changes only
    /// when the actor commits, after the append succeeds. A handler that
    /// emits several events therefore observes the pre-command state
    /// throughout.
    pub fn emit(&mut self, event: A::DomainEvent) {
        self.pending.push(event);
    }

    /// Fold all pending events into the domain state and advance the
    /// version. Called by the actor once the append has succeeded.
    pub(crate) fn commit(&mut self) {
        let state = std::mem::take(&mut self.state);
        self.state = self
            .pending
            .iter()
            .fold(state, |state, event| state.apply(event));
        self.version += self.pending.len() as u64;
        self.pending.clear();
    }
}

/// A registered command handler for aggregate `A` and command type `C`.
///
/// # Contract
///
/// Pure with respect to external state: no store calls, no side effects.
/// All state mutation is expressed via events queued on the returned state
/// with [`AggregateState::emit`]. On `Err`, any events emitted during the
/// call are discarded by the actor.
pub trait CommandHandler<A: Aggregate, C>: Send + Sync + 'static {
    /// Decide the command against the current state.
    fn handle(&self, state: AggregateState<A>, command: C) -> Result<AggregateState<A>, A::Error>;
}

impl<A, C, F> CommandHandler<A, C> for F
where
    A: Aggregate,
    F: Fn(AggregateState<A>, C) -> Result<AggregateState<A>, A::Error> + Send + Sync + 'static,
{
    fn handle(&self, state: AggregateState<A>, command: C) -> Result<AggregateState<A>, A::Error> {
        self(state, command)
    }
}

/// Adapter that routes a command to the aggregate's own
/// [`Aggregate::handle`] and queues the produced events.
///
/// This is the conventional handler: register it for routes whose decision
/// logic lives on the aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateHandler;

impl<A: Aggregate> CommandHandler<A, A::Command> for AggregateHandler {
    fn handle(
        &self,
        mut state: AggregateState<A>,
        command: A::Command,
    ) -> Result<AggregateState<A>, A::Error> {
        let events = state.state.handle(command)?;
        for event in events {
            state.emit(event);
        }
        Ok(state)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{BankAccount, BankAccountCommand, BankAccountError, BankAccountEvent};
    use super::*;

    #[test]
    fn handle_open_produces_opened_event() {
        let account = BankAccount::default();
        let events = account
            .handle(BankAccountCommand::Open {
                account_id: "a-1".into(),
                initial_balance: 1000,
            })
            .unwrap();
        assert_eq!(
            events,
            vec![BankAccountEvent::BankAccountOpened {
                initial_balance: 1000
            }]
        );
    }

    #[test]
    fn handle_deposit_on_unopened_account_is_rejected() {
        let account = BankAccount::default();
        let result = account.handle(BankAccountCommand::Deposit {
            account_id: "a-1".into(),
            amount: 50,
        });
        assert!(matches!(result, Err(BankAccountError::NotOpened)));
    }

    #[test]
    fn handle_withdraw_beyond_balance_is_rejected() {
        let account = BankAccount {
            opened: true,
            balance: 10,
        };
        let result = account.handle(BankAccountCommand::Withdraw {
            account_id: "a-1".into(),
            amount: 50,
        });
        assert!(matches!(
            result,
            Err(BankAccountError::InsufficientFunds {
                balance: 10,
                requested: 50
            })
        ));
    }

    #[test]
    fn apply_folds_deposits_onto_balance() {
        let account = BankAccount::default()
            .apply(&BankAccountEvent::BankAccountOpened {
                initial_balance: 1000,
            })
            .apply(&BankAccountEvent::MoneyDeposited {
                amount: 50,
                balance: 1050,
            });
        assert!(account.opened);
        assert_eq!(account.balance, 1050);
    }

    #[test]
    fn new_state_starts_at_version_zero_with_no_pending() {
        let state = AggregateState::<BankAccount>::new("a-1");
        assert_eq!(state.instance_id(), "a-1");
        assert_eq!(state.version(), 0);
        assert!(state.pending().is_empty());
        assert_eq!(state.state, BankAccount::default());
    }

    #[test]
    fn load_folds_history_and_sets_version() {
        let state = AggregateState::<BankAccount>::load(
            "a-1",
            vec![
                BankAccountEvent::BankAccountOpened {
                    initial_balance: 1000,
                },
                BankAccountEvent::MoneyDeposited {
                    amount: 50,
                    balance: 1050,
                },
            ],
        );
        assert_eq!(state.version(), 2);
        assert!(state.pending().is_empty());
        assert_eq!(state.state.balance, 1050);
    }

    #[test]
    fn emit_queues_without_touching_domain_state() {
        let mut state = AggregateState::<BankAccount>::new("a-1");
        state.emit(BankAccountEvent::BankAccountOpened {
            initial_balance: 1000,
        });

        assert_eq!(state.pending().len(), 1);
        assert_eq!(state.version(), 0);
        // Not applied until commit.
        assert!(!state.state.opened);
    }

    #[test]
    fn commit_folds_pending_and_advances_version() {
        let mut state = AggregateState::<BankAccount>::new("a-1");
        state.emit(BankAccountEvent::BankAccountOpened {
            initial_balance: 1000,
        });
        state.emit(BankAccountEvent::MoneyDeposited {
            amount: 50,
            balance: 1050,
        });
        state.commit();

        assert_eq!(state.version(), 2);
        assert!(state.pending().is_empty());
        assert_eq!(state.state.balance, 1050);
    }

    #[test]
    fn aggregate_handler_emits_produced_events() {
        let state = AggregateState::<BankAccount>::new("a-1");
        let state = AggregateHandler
            .handle(
                state,
                BankAccountCommand::Open {
                    account_id: "a-1".into(),
                    initial_balance: 500,
                },
            )
            .unwrap();

        assert_eq!(
            state.pending(),
            &[BankAccountEvent::BankAccountOpened {
                initial_balance: 500
            }]
        );
    }

    #[test]
    fn aggregate_handler_propagates_rejection() {
        let state = AggregateState::<BankAccount>::new("a-1");
        let result = AggregateHandler.handle(
            state,
            BankAccountCommand::Deposit {
                account_id: "a-1".into(),
                amount: 1,
            },
        );
        assert!(matches!(result, Err(BankAccountError::NotOpened)));
    }

    #[test]
    fn closure_implements_command_handler() {
        let handler = |mut state: AggregateState<BankAccount>,
                       _cmd: ()|
         -> Result<AggregateState<BankAccount>, BankAccountError> {
            state.emit(BankAccountEvent::BankAccountOpened { initial_balance: 1 });
            Ok(state)
        };
        let state = CommandHandler::<BankAccount, ()>::handle(
            &handler,
            AggregateState::new("a-1"),
            (),
        )
        .unwrap();
        assert_eq!(state.pending().len(), 1);
    }
}
