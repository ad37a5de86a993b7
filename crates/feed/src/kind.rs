//! Per-feed policy: ordering, wire mapping and optimistic effects.
//!
//! One [FeedKind] implementation exists per screen of the admin console
//! ([Chat], [Notifications], [SignupRequests]); the reconciler and the
//! transport are generic over it.

use crate::api::ApiRequest;
use crate::error::FeedError;
use crate::item::{FeedItem, ItemId, TransportEvent};
use crate::packet::Packet;
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt::Debug;

/// Where new arrivals go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Newest first (notifications, signup requests).
    Prepend,
    /// Chronological (chat).
    Append,
}

/// How a user action reaches the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Written to the push channel; requires a live connection.
    Emit(Packet),
    /// Issued as an HTTP request in the background.
    Http(ApiRequest),
}

impl Outbound {
    pub fn needs_stream(&self) -> bool {
        matches!(self, Outbound::Emit(_))
    }
}

/// Local effect applied before the server confirms an action.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimistic<P> {
    None,
    Insert(FeedItem<P>),
    Remove(ItemId),
}

pub trait FeedKind: Send + Sync + 'static {
    type Payload: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Action: Clone + Debug + Send + Sync + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn placement(&self) -> Placement;

    /// Whether a strict increase of the visible count raises [crate::FeedSignal::NewItem].
    fn alerts_on_arrival(&self) -> bool {
        true
    }

    fn snapshot_request(&self) -> ApiRequest;

    fn parse_snapshot(&self, body: Value) -> Result<Vec<FeedItem<Self::Payload>>, FeedError>;

    /// Room join sent right after the handshake ack, if the feed needs one.
    fn join(&self, _session: &Session) -> Option<Packet> {
        None
    }

    /// Map a server event; `Ok(None)` for events this feed does not consume.
    fn decode_event(
        &self,
        name: &str,
        data: Value,
    ) -> Result<Option<TransportEvent<Self::Payload>>, FeedError>;

    fn outbound(&self, action: &Self::Action, session: &Session) -> Outbound;

    fn optimistic(&self, action: &Self::Action) -> Optimistic<Self::Payload>;

    /// Item an action refers to; used to roll back when the action fails.
    fn target(&self, action: &Self::Action) -> Option<ItemId>;

    /// Whether `stored` is the server's copy of the local insert `local`, for
    /// servers that assign their own id to what the client created.
    fn is_echo(&self, _local: &Self::Payload, _stored: &Self::Payload) -> bool {
        false
    }

    /// Event synthesized when an HTTP-backed action succeeds.
    fn confirmation(&self, _action: &Self::Action) -> Option<TransportEvent<Self::Payload>> {
        None
    }
}

/// Parse one item: id from `id` (or `fallback_id` when absent), `created_at` if RFC 3339.
pub fn parse_item<P: DeserializeOwned>(
    value: Value,
    fallback_id: Option<&str>,
) -> Result<FeedItem<P>, FeedError> {
    let id = value
        .get("id")
        .and_then(ItemId::from_json)
        .or_else(|| {
            fallback_id
                .and_then(|field| value.get(field))
                .and_then(ItemId::from_json)
        })
        .ok_or_else(|| FeedError::Decode(format!("item without id: {value}")))?;
    let created_at = value
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let payload = serde_json::from_value(value)?;
    Ok(FeedItem::confirmed(id, payload).with_created_at(created_at))
}

/// Id carried by an event: either the bare value or one of `keys` in an object.
fn event_id(data: &Value, keys: &[&str]) -> Result<ItemId, FeedError> {
    ItemId::from_json(data)
        .or_else(|| keys.iter().find_map(|k| data.get(*k).and_then(ItemId::from_json)))
        .ok_or_else(|| FeedError::Decode(format!("event without id: {data}")))
}

/// Subject id as sent to the server: numeric subjects go out as numbers.
fn subject_value(session: &Session) -> Value {
    match session.subject().parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(session.subject().to_string()),
    }
}

fn items<P: DeserializeOwned>(
    list: Value,
    fallback_id: Option<&str>,
) -> Result<Vec<FeedItem<P>>, FeedError> {
    match list {
        Value::Array(values) => values
            .into_iter()
            .map(|v| parse_item(v, fallback_id))
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(FeedError::Decode(format!("expected array, got {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Chat

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    Send { id: ItemId, text: String },
}

impl ChatAction {
    /// Send `text` under a fresh client-generated id.
    pub fn send(text: impl Into<String>) -> Self {
        ChatAction::Send {
            id: ItemId::Text(uuid::Uuid::new_v4().to_string()),
            text: text.into(),
        }
    }
}

/// Two-party chat with the owner of one product key. Chronological.
#[derive(Debug, Clone)]
pub struct Chat {
    pub product_key: String,
}

impl Chat {
    pub fn new(product_key: impl Into<String>) -> Self {
        Self {
            product_key: product_key.into(),
        }
    }
}

impl FeedKind for Chat {
    type Payload = ChatMessage;
    type Action = ChatAction;

    fn name(&self) -> &'static str {
        "chat"
    }

    fn placement(&self) -> Placement {
        Placement::Append
    }

    fn snapshot_request(&self) -> ApiRequest {
        ApiRequest::get("/chat/history").with_query("product_key", self.product_key.clone())
    }

    fn parse_snapshot(&self, body: Value) -> Result<Vec<FeedItem<ChatMessage>>, FeedError> {
        let list = match body {
            Value::Array(_) => body,
            Value::Object(mut map) => map.remove("messages").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        // Rows without an id are keyed by timestamp.
        items(list, Some("created_at"))
    }

    fn decode_event(
        &self,
        name: &str,
        data: Value,
    ) -> Result<Option<TransportEvent<ChatMessage>>, FeedError> {
        match name {
            "receiveMessage" => Ok(Some(TransportEvent::ItemAdded(parse_item(
                data,
                Some("created_at"),
            )?))),
            _ => Ok(None),
        }
    }

    fn outbound(&self, action: &ChatAction, _session: &Session) -> Outbound {
        match action {
            ChatAction::Send { text, .. } => Outbound::Http(ApiRequest::post(
                "/chat/send",
                json!({"product_key": self.product_key, "message": text}),
            )),
        }
    }

    fn optimistic(&self, action: &ChatAction) -> Optimistic<ChatMessage> {
        match action {
            ChatAction::Send { id, text } => {
                let mut extra = Map::new();
                extra.insert("product_key".into(), Value::String(self.product_key.clone()));
                let payload = ChatMessage {
                    message: text.clone(),
                    is_admin: true,
                    extra,
                };
                Optimistic::Insert(
                    FeedItem::pending_local(id.clone(), payload).with_created_at(Some(Utc::now())),
                )
            }
        }
    }

    fn target(&self, action: &ChatAction) -> Option<ItemId> {
        match action {
            ChatAction::Send { id, .. } => Some(id.clone()),
        }
    }

    /// The server keys stored messages itself; its echo of our own message
    /// carries the same text, sent as admin.
    fn is_echo(&self, local: &ChatMessage, stored: &ChatMessage) -> bool {
        local.is_admin && stored.is_admin && local.message == stored.message
    }
}

// ---------------------------------------------------------------------------
// Notifications

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationAction {
    MarkRead(ItemId),
    Delete(ItemId),
}

/// Admin notifications, newest first.
#[derive(Debug, Clone, Default)]
pub struct Notifications;

impl FeedKind for Notifications {
    type Payload = Notification;
    type Action = NotificationAction;

    fn name(&self) -> &'static str {
        "notifications"
    }

    fn placement(&self) -> Placement {
        Placement::Prepend
    }

    fn snapshot_request(&self) -> ApiRequest {
        ApiRequest::get("/notifications")
    }

    fn parse_snapshot(&self, body: Value) -> Result<Vec<FeedItem<Notification>>, FeedError> {
        let list = body.get("notifications").cloned().unwrap_or(Value::Null);
        items(list, None).map_err(|e| FeedError::Decode(format!("invalid notifications data: {e}")))
    }

    fn join(&self, session: &Session) -> Option<Packet> {
        Some(Packet::event("join", subject_value(session)))
    }

    fn decode_event(
        &self,
        name: &str,
        data: Value,
    ) -> Result<Option<TransportEvent<Notification>>, FeedError> {
        let event = match name {
            "new-notification" => TransportEvent::ItemAdded(parse_item(data, None)?),
            "notification-marked-as-read" => TransportEvent::ItemUpdated {
                id: event_id(&data, &["id"])?,
                patch: json!({"is_read": true}),
            },
            "notification-deleted" => TransportEvent::ItemRemoved {
                id: event_id(&data, &["id"])?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn outbound(&self, action: &NotificationAction, _session: &Session) -> Outbound {
        match action {
            NotificationAction::MarkRead(id) => {
                Outbound::Http(ApiRequest::put(format!("/notifications/{id}/mark")))
            }
            NotificationAction::Delete(id) => {
                Outbound::Http(ApiRequest::delete(format!("/notifications/{id}")))
            }
        }
    }

    fn optimistic(&self, action: &NotificationAction) -> Optimistic<Notification> {
        match action {
            NotificationAction::MarkRead(_) => Optimistic::None,
            NotificationAction::Delete(id) => Optimistic::Remove(id.clone()),
        }
    }

    fn target(&self, action: &NotificationAction) -> Option<ItemId> {
        match action {
            NotificationAction::MarkRead(id) | NotificationAction::Delete(id) => Some(id.clone()),
        }
    }

    fn confirmation(&self, action: &NotificationAction) -> Option<TransportEvent<Notification>> {
        Some(match action {
            NotificationAction::MarkRead(id) => TransportEvent::ItemUpdated {
                id: id.clone(),
                patch: json!({"is_read": true}),
            },
            NotificationAction::Delete(id) => TransportEvent::ItemRemoved { id: id.clone() },
        })
    }
}

// ---------------------------------------------------------------------------
// Signup requests

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub processed_at: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignupAction {
    Accept(ItemId),
    Reject(ItemId),
}

/// Pending signup requests awaiting an admin decision, newest first.
#[derive(Debug, Clone, Default)]
pub struct SignupRequests;

impl FeedKind for SignupRequests {
    type Payload = SignupRequest;
    type Action = SignupAction;

    fn name(&self) -> &'static str {
        "signup-requests"
    }

    fn placement(&self) -> Placement {
        Placement::Prepend
    }

    fn snapshot_request(&self) -> ApiRequest {
        ApiRequest::get("/Requests")
    }

    fn parse_snapshot(&self, body: Value) -> Result<Vec<FeedItem<SignupRequest>>, FeedError> {
        let list = match body {
            Value::Object(mut map) => map.remove("requests").unwrap_or(Value::Null),
            other => other,
        };
        items(list, None)
    }

    fn join(&self, session: &Session) -> Option<Packet> {
        Some(Packet::event(
            "join-admin",
            json!({"adminId": subject_value(session), "role": "admin"}),
        ))
    }

    fn decode_event(
        &self,
        name: &str,
        data: Value,
    ) -> Result<Option<TransportEvent<SignupRequest>>, FeedError> {
        let event = match name {
            "signup-request" => TransportEvent::ItemAdded(parse_item(data, None)?),
            // Accepted or rejected, the request leaves the pending list.
            "signup-request-updated" => TransportEvent::ItemRemoved {
                id: event_id(&data, &["id", "requestId"])?,
            },
            "signup-request-error" => TransportEvent::ActionError {
                id: event_id(&data, &["requestId", "id"]).ok(),
                message: data
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("signup request action failed")
                    .to_string(),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn outbound(&self, action: &SignupAction, session: &Session) -> Outbound {
        let (event, id) = match action {
            SignupAction::Accept(id) => ("accept-signup-request", id),
            SignupAction::Reject(id) => ("reject-signup-request", id),
        };
        Outbound::Emit(Packet::event(
            event,
            json!({"requestId": id.to_json(), "adminId": subject_value(session)}),
        ))
    }

    fn optimistic(&self, action: &SignupAction) -> Optimistic<SignupRequest> {
        match action {
            SignupAction::Accept(id) | SignupAction::Reject(id) => Optimistic::Remove(id.clone()),
        }
    }

    fn target(&self, action: &SignupAction) -> Option<ItemId> {
        match action {
            SignupAction::Accept(id) | SignupAction::Reject(id) => Some(id.clone()),
        }
    }
}
