//! Persisted event records, the dashboard wire envelope, and subscription
//! scopes.
//!
//! Two shapes live here. [`StoredEvent`] is one line of an order's event log
//! and keeps the domain event in its adjacently tagged `type` + `data` form.
//! [`EventEnvelope`] is what the broadcaster hands to dashboards:
//!
//! ```text
//! {eventId, type, orderId, shopId, customerId, version, payload, serverTimestamp}
//! ```
//!
//! No I/O happens in this module.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::auth::{Principal, Role};
use crate::command::CommandContext;
use crate::conversation::{Message, Party};
use crate::order::{CustomerId, FileRef, MessageId, Order, OrderId, OrderStatus, ShopId};

/// Current wall-clock time in Unix epoch milliseconds.
///
/// A clock set before the epoch reads as `0`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Audit metadata stamped on every persisted event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<&CommandContext> for EventMetadata {
    fn from(ctx: &CommandContext) -> Self {
        Self {
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
        }
    }
}

/// One committed event, exactly as written to the stream's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Fresh UUID v4 assigned at commit.
    pub event_id: Uuid,
    /// Aggregate type name (e.g. "order").
    pub aggregate_type: String,
    /// Instance id within the aggregate type.
    pub instance_id: String,
    /// One-based position within the stream.
    pub stream_version: u64,
    /// Event type tag (e.g. "StatusAdvanced").
    pub event_type: String,
    /// The `"data"` half of the adjacently tagged domain event.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Commit timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

fn invalid(msg: &str) -> serde_json::Error {
    <serde_json::Error as serde::ser::Error>::custom(msg)
}

/// Split an adjacently tagged JSON object into its tag and content.
///
/// Fieldless variants have no content key; their content reads as `null`.
pub(crate) fn split_tagged(value: Value, content_key: &str) -> serde_json::Result<(String, Value)> {
    let Value::Object(mut obj) = value else {
        return Err(invalid("adjacently tagged enum must serialize to a JSON object"));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => return Err(invalid("adjacently tagged enum must have a string 'type' field")),
    };
    let content = obj.remove(content_key).unwrap_or(Value::Null);
    Ok((event_type, content))
}

/// Rebuild the adjacently tagged JSON object from its tag and content.
pub(crate) fn join_tagged(event_type: &str, content: &Value, content_key: &str) -> Value {
    if content.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(event_type.to_string()));
        obj.insert(content_key.to_string(), content.clone());
        Value::Object(obj)
    }
}

/// Encode a domain event into the [`StoredEvent`] that will be appended.
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`.
///
/// # Arguments
///
/// * `event` - Reference to the domain event to encode.
/// * `ctx` - Command context carrying actor and correlation id.
/// * `instance_id` - The aggregate instance identifier.
/// * `stream_version` - The version this event will occupy in its stream.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized, or
/// does not serialize to an adjacently tagged object.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    instance_id: &str,
    stream_version: u64,
) -> serde_json::Result<StoredEvent> {
    let (event_type, data) = split_tagged(serde_json::to_value(event)?, "data")?;
    Ok(StoredEvent {
        event_id: Uuid::new_v4(),
        aggregate_type: A::AGGREGATE_TYPE.to_string(),
        instance_id: instance_id.to_string(),
        stream_version,
        event_type,
        data,
        metadata: EventMetadata::from(ctx),
        recorded_at: now_millis(),
    })
}

/// Typed payload of a dashboard event.
///
/// Serialized adjacently tagged as `type` + `payload`, with
/// `SCREAMING_SNAKE_CASE` tags and camelCase field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventBody {
    OrderCreated {
        order: Order,
    },
    OrderStatusUpdated {
        old_status: OrderStatus,
        new_status: OrderStatus,
        /// The order as committed by this transition.
        order: Order,
    },
    MessageSent {
        message: Message,
    },
    MessageRead {
        reader_role: Party,
        message_ids: Vec<MessageId>,
        read_at: u64,
    },
    FilesAttached {
        files: Vec<FileRef>,
        order: Order,
    },
    OrderDiscarded {
        discarded_at: u64,
    },
}

impl EventBody {
    /// Wire tag for this body, e.g. `ORDER_STATUS_UPDATED`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderCreated { .. } => "ORDER_CREATED",
            Self::OrderStatusUpdated { .. } => "ORDER_STATUS_UPDATED",
            Self::MessageSent { .. } => "MESSAGE_SENT",
            Self::MessageRead { .. } => "MESSAGE_READ",
            Self::FilesAttached { .. } => "FILES_ATTACHED",
            Self::OrderDiscarded { .. } => "ORDER_DISCARDED",
        }
    }
}

/// A committed order event as delivered to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub order_id: OrderId,
    pub shop_id: ShopId,
    pub customer_id: CustomerId,
    /// Per-order stream version of the commit this envelope describes.
    pub version: u64,
    #[serde(default)]
    pub payload: Value,
    pub server_timestamp: u64,
}

impl EventEnvelope {
    /// Wrap `body` for the order it concerns.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the body cannot be serialized.
    pub fn new(
        event_id: Uuid,
        order: &Order,
        version: u64,
        server_timestamp: u64,
        body: &EventBody,
    ) -> serde_json::Result<Self> {
        let (event_type, payload) = split_tagged(serde_json::to_value(body)?, "payload")?;
        Ok(Self {
            event_id,
            event_type,
            order_id: order.id,
            shop_id: order.shop_id,
            customer_id: order.customer_id,
            version,
            payload,
            server_timestamp,
        })
    }

    /// Decode the typed body.
    ///
    /// Returns `None` for event types this build does not know, so newer
    /// servers can add types without breaking older dashboards.
    pub fn body(&self) -> Option<EventBody> {
        let tagged = join_tagged(&self.event_type, &self.payload, "payload");
        serde_json::from_value(tagged).ok()
    }
}

/// A dashboard's subscription scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Shop(ShopId),
    Customer(CustomerId),
}

impl Scope {
    /// The scope a principal's dashboard is allowed to watch.
    ///
    /// Admins have no dashboard scope.
    pub fn for_principal(principal: &Principal) -> Option<Self> {
        match principal.role {
            Role::Customer => Some(Self::Customer(CustomerId(principal.scope_id))),
            Role::ShopOwner => Some(Self::Shop(ShopId(principal.scope_id))),
            Role::Admin => None,
        }
    }

    /// Cache key, e.g. `orders:shop:7`.
    pub fn key(&self) -> String {
        match self {
            Self::Shop(id) => format!("orders:shop:{id}"),
            Self::Customer(id) => format!("orders:customer:{id}"),
        }
    }

    /// The conversation side whose unread counts this scope shows.
    pub fn viewer(&self) -> Party {
        match self {
            Self::Shop(_) => Party::ShopOwner,
            Self::Customer(_) => Party::Customer,
        }
    }

    pub fn covers(&self, order: &Order) -> bool {
        match self {
            Self::Shop(id) => order.shop_id == *id,
            Self::Customer(id) => order.customer_id == *id,
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match self {
            Self::Shop(id) => envelope.shop_id == *id,
            Self::Customer(id) => envelope.customer_id == *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderPayload, OrderType, UserId};

    fn order() -> Order {
        Order::new(
            OrderId(11),
            CustomerId(3),
            ShopId(5),
            OrderType::Walkin,
            OrderPayload::default(),
            100,
        )
    }

    #[test]
    fn event_metadata_skips_none_fields_in_serialization() {
        let json = serde_json::to_string(&EventMetadata::default()).expect("serialize");
        assert_eq!(json, "{}");
    }

    #[test]
    fn split_tagged_handles_fieldless_variants() {
        let (tag, content) =
            split_tagged(serde_json::json!({"type": "Ping"}), "data").expect("split");
        assert_eq!(tag, "Ping");
        assert!(content.is_null());
        assert_eq!(join_tagged("Ping", &content, "data"), serde_json::json!({"type": "Ping"}));
    }

    #[test]
    fn split_tagged_rejects_non_objects() {
        assert!(split_tagged(serde_json::json!("Ping"), "data").is_err());
        assert!(split_tagged(serde_json::json!({"data": 1}), "data").is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let order = order();
        let body = EventBody::OrderStatusUpdated {
            old_status: OrderStatus::New,
            new_status: OrderStatus::Processing,
            order: order.clone(),
        };
        let envelope =
            EventEnvelope::new(Uuid::new_v4(), &order, 2, 999, &body).expect("envelope");
        let value = serde_json::to_value(&envelope).expect("serialize");

        assert_eq!(value["type"], "ORDER_STATUS_UPDATED");
        assert_eq!(value["orderId"], 11);
        assert_eq!(value["shopId"], 5);
        assert_eq!(value["customerId"], 3);
        assert_eq!(value["version"], 2);
        assert_eq!(value["serverTimestamp"], 999);
        assert_eq!(value["payload"]["oldStatus"], "new");
        assert_eq!(value["payload"]["newStatus"], "processing");
        assert_eq!(envelope.body(), Some(body));
    }

    #[test]
    fn message_read_payload_uses_camel_case() {
        let body = EventBody::MessageRead {
            reader_role: Party::ShopOwner,
            message_ids: vec![MessageId(1), MessageId(2)],
            read_at: 42,
        };
        let envelope =
            EventEnvelope::new(Uuid::new_v4(), &order(), 4, 42, &body).expect("envelope");
        assert_eq!(envelope.event_type, "MESSAGE_READ");
        assert_eq!(envelope.payload["readerRole"], "shop_owner");
        assert_eq!(envelope.payload["messageIds"], serde_json::json!([1, 2]));
    }

    #[test]
    fn unknown_envelope_type_decodes_to_none() {
        let mut envelope = EventEnvelope::new(
            Uuid::new_v4(),
            &order(),
            1,
            0,
            &EventBody::OrderDiscarded { discarded_at: 0 },
        )
        .expect("envelope");
        envelope.event_type = "ORDER_REFUNDED".to_string();
        assert_eq!(envelope.body(), None);
    }

    #[test]
    fn scope_matches_by_shop_or_customer() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            &order(),
            1,
            0,
            &EventBody::OrderCreated { order: order() },
        )
        .expect("envelope");

        assert!(Scope::Shop(ShopId(5)).matches(&envelope));
        assert!(!Scope::Shop(ShopId(6)).matches(&envelope));
        assert!(Scope::Customer(CustomerId(3)).matches(&envelope));
        assert!(!Scope::Customer(CustomerId(5)).matches(&envelope));
    }

    #[test]
    fn scope_key_and_viewer() {
        assert_eq!(Scope::Shop(ShopId(7)).key(), "orders:shop:7");
        assert_eq!(Scope::Customer(CustomerId(2)).key(), "orders:customer:2");
        assert_eq!(Scope::Shop(ShopId(7)).viewer(), Party::ShopOwner);
        assert_eq!(Scope::Customer(CustomerId(2)).viewer(), Party::Customer);
    }

    #[test]
    fn principal_scopes() {
        let owner = Principal {
            user_id: UserId(1),
            role: Role::ShopOwner,
            scope_id: 4,
        };
        assert_eq!(Scope::for_principal(&owner), Some(Scope::Shop(ShopId(4))));
        assert_eq!(Scope::for_principal(&Principal::admin(1)), None);
    }

    #[test]
    fn stored_event_line_roundtrip() {
        let stored = StoredEvent {
            event_id: Uuid::new_v4(),
            aggregate_type: "order".to_string(),
            instance_id: "11".to_string(),
            stream_version: 1,
            event_type: "Discarded".to_string(),
            data: serde_json::json!({"at": 5}),
            metadata: EventMetadata {
                actor: Some("admin:1".to_string()),
                correlation_id: None,
            },
            recorded_at: 5,
        };
        let line = serde_json::to_string(&stored).expect("serialize");
        assert!(!line.contains('\n'));
        let parsed: StoredEvent = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(parsed, stored);
    }
}
