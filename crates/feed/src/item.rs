//! Feed items, connection status and the events a transport delivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Item identifier, unique within one feed. Numeric ids stay numeric on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Num(u64),
    Text(String),
}

impl ItemId {
    /// Read an id from a JSON string or non-negative integer.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(ItemId::Num),
            Value::String(s) if !s.is_empty() => Some(ItemId::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ItemId::Num(n) => Value::from(*n),
            ItemId::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Num(n) => write!(f, "{n}"),
            ItemId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ItemId {
    fn from(n: u64) -> Self {
        ItemId::Num(n)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId::Text(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId::Text(s)
    }
}

/// Reconciliation status of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Confirmed,
    /// Created locally, not yet acknowledged by the server.
    PendingLocal,
    /// Hidden from the view until the server confirms the removal or it is rolled back.
    PendingRemoval,
}

/// One realtime-backed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem<P> {
    pub id: ItemId,
    pub created_at: Option<DateTime<Utc>>,
    pub payload: P,
    pub status: ItemStatus,
}

impl<P> FeedItem<P> {
    pub fn confirmed(id: impl Into<ItemId>, payload: P) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            payload,
            status: ItemStatus::Confirmed,
        }
    }

    pub fn pending_local(id: impl Into<ItemId>, payload: P) -> Self {
        Self {
            status: ItemStatus::PendingLocal,
            ..Self::confirmed(id, payload)
        }
    }

    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_visible(&self) -> bool {
        self.status != ItemStatus::PendingRemoval
    }
}

/// Push channel connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Event delivered by a transport to its reconciler, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent<P> {
    ItemAdded(FeedItem<P>),
    /// Field changes merged into the payload of the matching item.
    ItemUpdated { id: ItemId, patch: Value },
    ItemRemoved { id: ItemId },
    /// The server (or an HTTP-backed action) rejected a mutation.
    ActionError { id: Option<ItemId>, message: String },
    Status(ConnectionStatus),
    /// Reconnection attempts exhausted; the stream stays down until re-opened.
    GaveUp { attempts: u32 },
    /// The credential was refused by the push channel or an action request.
    SessionRejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_from_json() {
        assert_eq!(ItemId::from_json(&json!(7)), Some(ItemId::Num(7)));
        assert_eq!(ItemId::from_json(&json!("a1")), Some(ItemId::from("a1")));
        assert_eq!(ItemId::from_json(&json!("")), None);
        assert_eq!(ItemId::from_json(&json!(-1)), None);
        assert_eq!(ItemId::from_json(&json!(null)), None);
    }

    #[test]
    fn numeric_ids_stay_numeric() {
        assert_eq!(ItemId::Num(3).to_json(), json!(3));
        assert_eq!(serde_json::to_value(ItemId::from("x")).unwrap(), json!("x"));
        assert_eq!(ItemId::Num(3).to_string(), "3");
    }

    #[test]
    fn pending_removal_is_hidden() {
        let mut item = FeedItem::confirmed(1u64, ());
        assert!(item.is_visible());
        item.status = ItemStatus::PendingRemoval;
        assert!(!item.is_visible());
    }
}
