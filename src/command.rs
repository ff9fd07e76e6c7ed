//! Command context and the type-erased command envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and correlation information without polluting the
/// command or domain event types. Fields are mapped onto event metadata when
/// the produced events are appended.
///
/// # Examples
///
/// ```
/// use helmsman::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata forwarded to event metadata.
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata forwarded to the metadata of produced events.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}

/// A type-erased command for cross-aggregate dispatch.
///
/// Produced by process managers when reacting to events. The `command` field
/// is a `serde_json::Value` because the process manager does not know the
/// concrete command type of the target aggregate at compile time; the router
/// resolves `command_type` back to the registered route and deserializes the
/// payload into the route's command type at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Erased command type tag, as produced by [`CommandEnvelope::new`].
    pub command_type: String,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Cross-cutting metadata forwarded to the command handler.
    pub context: CommandContext,
}

impl CommandEnvelope {
    /// Wrap a typed command into an envelope.
    ///
    /// The command type tag is `std::any::type_name::<C>()`, the same tag
    /// the router records at registration, so an envelope built in-process
    /// always resolves back to its route.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn new<C: serde::Serialize>(
        command: C,
        context: CommandContext,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command_type: std::any::type_name::<C>().to_string(),
            command: serde_json::to_value(command)?,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_metadata(json!({"source": "test"}));

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn command_context_serde_roundtrip() {
        let ctx = CommandContext::default()
            .with_actor("user-1")
            .with_correlation_id("corr-1")
            .with_metadata(json!({"key": "value"}));

        let encoded = serde_json::to_string(&ctx).expect("serialization should succeed");
        let decoded: CommandContext =
            serde_json::from_str(&encoded).expect("deserialization should succeed");

        assert_eq!(decoded.actor, ctx.actor);
        assert_eq!(decoded.correlation_id, ctx.correlation_id);
        assert_eq!(decoded.metadata, ctx.metadata);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        target: String,
    }

    #[test]
    fn envelope_records_the_command_type_name() {
        let envelope = CommandEnvelope::new(
            Ping {
                target: "a-1".into(),
            },
            CommandContext::default(),
        )
        .expect("envelope should build");

        assert_eq!(envelope.command_type, std::any::type_name::<Ping>());
        assert_eq!(envelope.command["target"], "a-1");
    }

    #[test]
    fn envelope_payload_deserializes_back() {
        let envelope = CommandEnvelope::new(
            Ping {
                target: "a-2".into(),
            },
            CommandContext::default().with_correlation_id("saga-1"),
        )
        .expect("envelope should build");

        let decoded: Ping =
            serde_json::from_value(envelope.command).expect("payload should deserialize");
        assert_eq!(
            decoded,
            Ping {
                target: "a-2".into()
            }
        );
        assert_eq!(envelope.context.correlation_id.as_deref(), Some("saga-1"));
    }
}
