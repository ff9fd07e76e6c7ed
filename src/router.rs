//! Typed command router: route registration, middleware, and bounded
//! dispatch to aggregate actors.
//!
//! Routes are keyed by the command's `TypeId` for typed dispatch and by its
//! type name for [`CommandEnvelope`] dispatch (the path process managers
//! use). Both paths run the same pipeline: identity extraction, middleware,
//! registry lookup, and a timeout-bounded actor execution.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::aggregate::{Aggregate, CommandHandler};
use crate::command::{CommandContext, CommandEnvelope};
use crate::error::DispatchError;
use crate::registry::AggregateRegistry;
use crate::store::EventStore;

/// Timeout applied to dispatches whose route does not override it.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// What a middleware layer gets to observe about a dispatch.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Erased command type name.
    pub command_type: &'static str,
    /// Target aggregate type.
    pub aggregate_type: &'static str,
    /// Extracted aggregate identity.
    pub aggregate_id: String,
    /// Correlation ID from the command context, if any.
    pub correlation_id: Option<String>,
}

/// A layer wrapping every dispatch.
///
/// Layers run in registration order before the aggregate executes and in
/// reverse order afterwards. A `before_dispatch` error short-circuits the
/// dispatch: the command never reaches the aggregate, and only the layers
/// that already ran observe the result.
pub trait Middleware: Send + Sync {
    /// Observe (and possibly reject) a command before it executes.
    fn before_dispatch(&self, command: &CommandInfo) -> Result<(), DispatchError> {
        let _ = command;
        Ok(())
    }

    /// Observe the outcome of a dispatch this layer saw begin.
    fn after_dispatch(&self, command: &CommandInfo, result: &Result<(), DispatchError>) {
        let _ = (command, result);
    }
}

/// A registered route: handler, identity extraction, and timeout override.
struct RouteEntry<A: Aggregate, C> {
    handler: Arc<dyn CommandHandler<A, C>>,
    identity: Box<dyn Fn(&C) -> String + Send + Sync>,
    timeout: Option<Duration>,
}

/// Dispatch interface erasing the aggregate type but keeping the command
/// type, for the typed [`CommandRouter::dispatch`] path.
trait TypedDispatch<C>: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        router: &'a CommandRouter,
        command: C,
        ctx: CommandContext,
        timeout_override: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// Fully erased dispatch interface for the envelope path.
trait ErasedDispatch: Send + Sync {
    fn dispatch_value<'a>(
        &'a self,
        router: &'a CommandRouter,
        command: serde_json::Value,
        ctx: CommandContext,
        timeout_override: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

impl<A, C> TypedDispatch<C> for RouteEntry<A, C>
where
    A: Aggregate,
    C: Send + 'static,
{
    fn dispatch<'a>(
        &'a self,
        router: &'a CommandRouter,
        command: C,
        ctx: CommandContext,
        timeout_override: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let aggregate_id = (self.identity)(&command);
            if aggregate_id.is_empty() {
                return Err(DispatchError::InvalidAggregateIdentity);
            }
            let info = CommandInfo {
                command_type: std::any::type_name::<C>(),
                aggregate_type: A::AGGREGATE_TYPE,
                aggregate_id: aggregate_id.clone(),
                correlation_id: ctx.correlation_id.clone(),
            };

            let actor = router
                .registry
                .get_or_start::<A>(&aggregate_id)
                .await
                .map_err(DispatchError::from)?;

            // Middleware chain around the actor execution: `before` in
            // order, `after` in reverse for every layer whose `before` ran.
            let middleware = &router.middleware;
            let mut ran = middleware.len();
            let mut result: Result<(), DispatchError> = Ok(());
            for (index, layer) in middleware.iter().enumerate() {
                if let Err(e) = layer.before_dispatch(&info) {
                    result = Err(e);
                    ran = index;
                    break;
                }
            }

            if result.is_ok() {
                let timeout = timeout_override
                    .or(self.timeout)
                    .unwrap_or(router.default_timeout);
                let execution = actor.execute_with(command, self.handler.clone(), ctx);
                result = match tokio::time::timeout(timeout, execution).await {
                    Ok(outcome) => outcome.map(|_| ()).map_err(DispatchError::from),
                    // Dropping the execution future releases only the reply
                    // channel; the actor finishes the command in the
                    // background and its state stays
                    // fully-committed-or-untouched.
                    Err(_elapsed) => {
                        tracing::warn!(
                            command_type = info.command_type,
                            aggregate_id = %info.aggregate_id,
                            ?timeout,
                            "aggregate execution timed out"
                        );
                        Err(DispatchError::ExecutionTimeout(timeout))
                    }
                };
            }

            for layer in middleware[..ran].iter().rev() {
                layer.after_dispatch(&info, &result);
            }
            result
        })
    }
}

impl<A, C> ErasedDispatch for RouteEntry<A, C>
where
    A: Aggregate,
    C: DeserializeOwned + Send + 'static,
{
    fn dispatch_value<'a>(
        &'a self,
        router: &'a CommandRouter,
        command: serde_json::Value,
        ctx: CommandContext,
        timeout_override: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let command: C = serde_json::from_value(command)?;
            TypedDispatch::dispatch(self, router, command, ctx, timeout_override).await
        })
    }
}

/// Routes commands to per-aggregate singleton actors.
///
/// Built once via [`CommandRouter::builder`]; cloning shares the routing
/// table and the aggregate registry, so clones can be handed to process
/// managers and other dispatching components freely. See the crate-level
/// quick start for an end-to-end example.
#[derive(Clone)]
pub struct CommandRouter {
    routes: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    by_name: Arc<HashMap<&'static str, Arc<dyn ErasedDispatch>>>,
    middleware: Arc<Vec<Arc<dyn Middleware>>>,
    registry: AggregateRegistry,
    default_timeout: Duration,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("routes", &self.routes.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl CommandRouter {
    /// Start building a router.
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            routes: HashMap::new(),
            by_name: HashMap::new(),
            middleware: Vec::new(),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Dispatch a command with the default context and the route's timeout.
    pub async fn dispatch<C: Send + 'static>(&self, command: C) -> Result<(), DispatchError> {
        self.dispatch_opts(command, CommandContext::default(), None)
            .await
    }

    /// Dispatch a command with an explicit per-dispatch timeout, overriding
    /// the route's.
    pub async fn dispatch_timeout<C: Send + 'static>(
        &self,
        command: C,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        self.dispatch_opts(command, CommandContext::default(), Some(timeout))
            .await
    }

    /// Dispatch a command carrying an explicit [`CommandContext`].
    pub async fn dispatch_context<C: Send + 'static>(
        &self,
        command: C,
        ctx: CommandContext,
    ) -> Result<(), DispatchError> {
        self.dispatch_opts(command, ctx, None).await
    }

    async fn dispatch_opts<C: Send + 'static>(
        &self,
        command: C,
        ctx: CommandContext,
        timeout_override: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let route = self
            .routes
            .get(&TypeId::of::<C>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn TypedDispatch<C>>>())
            .ok_or_else(|| {
                DispatchError::UnregisteredCommand(std::any::type_name::<C>().to_string())
            })?;
        route.dispatch(self, command, ctx, timeout_override).await
    }

    /// Dispatch a type-erased [`CommandEnvelope`], resolving its recorded
    /// command type back to the registered route.
    pub async fn dispatch_envelope(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<(), DispatchError> {
        let CommandEnvelope {
            command_type,
            command,
            context,
        } = envelope;
        let route = self
            .by_name
            .get(command_type.as_str())
            .ok_or(DispatchError::UnregisteredCommand(command_type))?;
        route.dispatch_value(self, command, context, None).await
    }

    /// The aggregate registry backing this router.
    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }
}

/// Builder for a [`CommandRouter`].
///
/// Register routes with [`route`](RouterBuilder::route) /
/// [`route_with_timeout`](RouterBuilder::route_with_timeout), middleware with
/// [`middleware`](RouterBuilder::middleware), then call
/// [`build`](RouterBuilder::build) with the event store.
pub struct RouterBuilder {
    routes: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    by_name: HashMap<&'static str, Arc<dyn ErasedDispatch>>,
    middleware: Vec<Arc<dyn Middleware>>,
    default_timeout: Duration,
}

impl RouterBuilder {
    /// Register a route from command type `C` to aggregate type `A`.
    ///
    /// `identity` extracts the aggregate identity from the command; an empty
    /// result fails dispatch with
    /// [`DispatchError::InvalidAggregateIdentity`]. Several command types
    /// may route to the same aggregate type, each with its own entry.
    pub fn route<A, C, H, I>(self, identity: I, handler: H) -> Self
    where
        A: Aggregate,
        C: DeserializeOwned + Send + 'static,
        H: CommandHandler<A, C>,
        I: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.route_entry::<A, C>(Box::new(identity), Arc::new(handler), None)
    }

    /// Register a route with a per-route execution timeout.
    pub fn route_with_timeout<A, C, H, I>(self, identity: I, handler: H, timeout: Duration) -> Self
    where
        A: Aggregate,
        C: DeserializeOwned + Send + 'static,
        H: CommandHandler<A, C>,
        I: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.route_entry::<A, C>(Box::new(identity), Arc::new(handler), Some(timeout))
    }

    fn route_entry<A, C>(
        mut self,
        identity: Box<dyn Fn(&C) -> String + Send + Sync>,
        handler: Arc<dyn CommandHandler<A, C>>,
        timeout: Option<Duration>,
    ) -> Self
    where
        A: Aggregate,
        C: DeserializeOwned + Send + 'static,
    {
        let entry = Arc::new(RouteEntry::<A, C> {
            handler,
            identity,
            timeout,
        });
        let typed: Arc<dyn TypedDispatch<C>> = entry.clone();
        let erased: Arc<dyn ErasedDispatch> = entry;
        self.routes.insert(TypeId::of::<C>(), Box::new(typed));
        self.by_name.insert(std::any::type_name::<C>(), erased);
        self
    }

    /// Append a middleware layer. Layers run in registration order.
    pub fn middleware(mut self, layer: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(layer));
        self
    }

    /// Override the default timeout applied to routes without their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Finalize the router against an event store.
    pub fn build(self, store: Arc<dyn EventStore>) -> CommandRouter {
        CommandRouter {
            routes: Arc::new(self.routes),
            by_name: Arc::new(self.by_name),
            middleware: Arc::new(self.middleware),
            registry: AggregateRegistry::new(store),
            default_timeout: self.default_timeout,
        }
    }
}
