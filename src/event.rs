//! Recorded events, the domain-event mapper, and stream identity.
//!
//! This module provides the foundational data types and pure functions that
//! the actor, event handler, and process manager modules all depend on. No
//! store I/O occurs here.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandContext;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// All stream IDs are UUID v5 values derived from this namespace and the
/// `"{aggregate_type}/{instance_id}"` string, so the same aggregate identity
/// always maps to the same stream UUID regardless of which process performs
/// the mapping.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5e, 0x2b, 0x91, 0x7a, 0x0c, 0x44, 0x4d, 0x1f, 0x8a, 0x37, 0x6b, 0xd2, 0x4e, 0x05, 0x9c, 0xe8,
]);

/// Derive a deterministic stream UUID from aggregate type and instance ID.
///
/// Uses UUID v5 (SHA-1 based) with [`STREAM_NAMESPACE`] to produce a stable,
/// collision-resistant stream identifier.
///
/// # Examples
///
/// ```
/// use helmsman::stream_uuid;
/// let id = stream_uuid("account", "acc-1");
/// assert_eq!(id, stream_uuid("account", "acc-1")); // deterministic
/// assert_ne!(id, stream_uuid("account", "acc-2"));
/// ```
pub fn stream_uuid(aggregate_type: &str, instance_id: &str) -> Uuid {
    Uuid::new_v5(
        &STREAM_NAMESPACE,
        format!("{aggregate_type}/{instance_id}").as_bytes(),
    )
}

/// An event as stored: the domain payload plus store-assigned metadata.
///
/// `event_id` is globally monotonic across all streams; `stream_version` is
/// 1-based within the event's stream. Both are assigned by the store at
/// append time, as is `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Globally monotonic event number across all streams.
    pub event_id: u64,
    /// The stream this event belongs to.
    pub stream_id: Uuid,
    /// 1-based position within the stream.
    pub stream_version: u64,
    /// Correlation ID carried from the originating command, if any.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata stamped from the originating command context.
    pub metadata: Option<serde_json::Value>,
    /// Store-assigned append timestamp.
    pub created_at: DateTime<Utc>,
    /// Domain event type tag.
    pub event_type: String,
    /// Domain event payload.
    pub data: serde_json::Value,
}

/// An event proposed for appending: everything the producer knows before the
/// store assigns identity, position, and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Domain event type tag.
    pub event_type: String,
    /// Domain event payload.
    pub data: serde_json::Value,
    /// Correlation ID carried from the originating command, if any.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata stamped from the originating command context.
    pub metadata: Option<serde_json::Value>,
}

/// Error translating between domain events and stored records.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The stored event's type tag is not a variant of the target event type.
    ///
    /// Fatal to the affected subscription: the consumer cannot make progress
    /// past an event it cannot interpret.
    #[error("unknown event type `{event_type}`")]
    UnknownEventType {
        /// The unrecognized type tag.
        event_type: String,
    },

    /// The event value did not serialize to the expected tagged object form.
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a domain event into a [`ProposedEvent`] ready for appending.
///
/// The domain event type must use `#[serde(tag = "type", content = "data")]`
/// adjacently tagged serialization. The `"type"` field becomes the record's
/// type tag and the `"data"` payload (absent for fieldless variants) becomes
/// its body. Correlation ID and metadata are taken from the command context.
///
/// # Errors
///
/// Returns [`MapError::Malformed`] if the event does not serialize to a
/// tagged JSON object.
pub fn encode_event<E: Serialize>(
    event: &E,
    ctx: &CommandContext,
) -> Result<ProposedEvent, MapError> {
    let value = serde_json::to_value(event)?;
    let obj = value.as_object().ok_or_else(|| {
        MapError::Malformed(serde::ser::Error::custom(
            "domain event must serialize to an adjacently tagged JSON object",
        ))
    })?;
    let event_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| {
            MapError::Malformed(serde::ser::Error::custom(
                "domain event is missing its string `type` tag",
            ))
        })?
        .to_owned();

    // Data may be absent for fieldless variants.
    let data = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

    // Build metadata: start from ctx.metadata (if an object), then merge the
    // actor identity. Only attach if non-empty.
    let mut meta_map = match ctx.metadata {
        Some(serde_json::Value::Object(ref map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Some(ref actor) = ctx.actor {
        meta_map.insert(
            "actor".to_string(),
            serde_json::Value::String(actor.clone()),
        );
    }
    let metadata = if meta_map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(meta_map))
    };

    Ok(ProposedEvent {
        event_type,
        data,
        correlation_id: ctx.correlation_id.clone(),
        metadata,
    })
}

/// Decode a stored record back into a domain event.
///
/// Reconstructs the adjacently tagged JSON form from the record's type tag
/// and payload, then deserializes into `E`.
///
/// # Errors
///
/// Returns [`MapError::UnknownEventType`] when the record's tag does not
/// match any variant of `E` (or its payload does not fit that variant).
/// Consumers that observe foreign event types should use
/// [`try_decode_event`] instead.
pub fn decode_event<E: DeserializeOwned>(recorded: &RecordedEvent) -> Result<E, MapError> {
    let tagged = if recorded.data.is_null() {
        serde_json::json!({ "type": recorded.event_type })
    } else {
        serde_json::json!({
            "type": recorded.event_type,
            "data": recorded.data,
        })
    };

    serde_json::from_value::<E>(tagged).map_err(|_| MapError::UnknownEventType {
        event_type: recorded.event_type.clone(),
    })
}

/// Decode a stored record, returning `None` for unrecognized event types.
///
/// The forward-compatible companion to [`decode_event`]: event handlers that
/// subscribe to the global stream observe events of types they do not care
/// about, and must ignore them while still acknowledging.
pub fn try_decode_event<E: DeserializeOwned>(recorded: &RecordedEvent) -> Option<E> {
    decode_event(recorded).ok()
}
